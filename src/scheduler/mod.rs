//! GPU command scheduler
//!
//! This module provides the multi-engine request scheduler. Every engine
//! runs its own priority scheduler with a ready queue, a fixed number of
//! execution ports, preemption and timeslicing. Requests are linked across
//! engines and contexts by fences.
//!
//! ## Key Features:
//! - **Priority queues**: effective priority desc, semaphore waiters last,
//!   FIFO within a priority
//! - **Execution ports**: port 0 executes, the rest hold the next requests
//! - **Preemption**: strictly higher priority work evicts the active
//!   request; a preempt timeout resets the engine
//! - **Timeslicing**: equal priority contenders share the engine
//! - **Priority inheritance**: waiters promote the work they depend on
//!
//! ## Per-Engine Architecture
//!
//! Each engine's state sits behind its own mutex and no code path holds two
//! engine locks. Engines talk to each other through one-way inbox messages
//! (fence signaled, signaler started, promote), the way CPUs exchange IPIs.
//!
//! ## Module Organization
//!
//! - `types`: Engine states and tunables, submission records
//! - `table`: Request and fence tables
//! - `queue`: Ready queue ordering
//! - `engine`: Per-engine state, submission and dependency resolution
//! - `core`: Dispatch loop, execution and completion
//! - `preempt`: Preemption, cancellation and engine reset
//! - `timeslice`: Timeslicing and semaphore yields
//! - `priority`: Priority inheritance
//! - `notify`: Cross-engine inbox messages
//! - `stats`: Counters and event history

mod core;
mod engine;
mod notify;
mod preempt;
mod priority;
mod queue;
mod stats;
mod table;
mod timeslice;
mod types;

pub use stats::{log_summary, EngineEvent, EngineStats, EventKind};
pub use types::{EngineProperty, EngineProps, EngineState, ExecBuffer, Submission};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::batch::Cursor;
use crate::buffer::{BufferBusy, BufferTable};
use crate::clock::{duration_to_ns, Clock};
use crate::config::SchedulerConfig;
use crate::context::{validate_ring_size, ContextParams, ContextRuntime, ContextShared, ContextTable};
use crate::error::{SchedError, SchedResult};
use crate::fence::{Fence, FenceError, FenceState};
use crate::request::{DepKind, Dependency, Request, RequestShared, Slot, Status};
use crate::types::{
    BufferId, ContextId, EngineClass, EngineId, EngineSelector, FenceId, Nanos, Priority, RequestId,
    Target, VmId,
};
use crate::wait::Interrupt;

use engine::EngineSched;
use notify::{EngineLinks, EngineMsg};
use table::{FenceTable, RequestTable};

/// Passes over all engines when flushing cross-engine messages
const SETTLE_PASSES: usize = 16;

/// State shared by all engines, guarded by leaf locks
pub(crate) struct Shared {
    pub buffers: BufferTable,
    pub fences: FenceTable,
    pub requests: RequestTable,
    pub contexts: ContextTable,
    pub links: EngineLinks,
}

struct EngineSlot {
    id: EngineId,
    sched: Mutex<EngineSched>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    clock: Clock,
    tick_ns: Nanos,
    engines: Vec<EngineSlot>,
    shared: Shared,
    context_defaults: ContextParams,
}

impl Scheduler {
    /// Scheduler on a virtual clock, advanced with [`Scheduler::advance`]
    pub fn new(config: SchedulerConfig) -> SchedResult<Self> {
        Self::with_clock(config, Clock::new_virtual())
    }

    /// Scheduler on the monotonic clock, driven by a `SchedulerRuntime`
    pub fn new_monotonic(config: SchedulerConfig) -> SchedResult<Self> {
        Self::with_clock(config, Clock::new_monotonic())
    }

    pub fn with_clock(config: SchedulerConfig, clock: Clock) -> SchedResult<Self> {
        config.validate()?;
        let context_defaults = ContextParams::from_defaults(&config.context_defaults)?;

        let ids = config.engine_ids();
        let (links, inboxes) = EngineLinks::new(&ids);
        let engines = config
            .engines
            .iter()
            .zip(inboxes)
            .map(|(engine, inbox)| {
                let props = engine.resolve(&config.engine_defaults)?;
                Ok(EngineSlot {
                    id: engine.id(),
                    sched: Mutex::new(EngineSched::new(
                        engine.id(),
                        props,
                        inbox,
                        config.semaphores,
                        config.event_history,
                    )),
                })
            })
            .collect::<SchedResult<Vec<_>>>()?;

        log::info!(
            "Scheduler initialized: engines=[{}] tick={}us semaphores={}",
            ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
            config.tick_us,
            config.semaphores
        );

        Ok(Self {
            tick_ns: config.tick_us * crate::types::NSEC_PER_USEC,
            config,
            clock,
            engines,
            shared: Shared {
                buffers: BufferTable::new(),
                fences: FenceTable::new(),
                requests: RequestTable::new(),
                contexts: ContextTable::new(),
                links,
            },
            context_defaults,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn now(&self) -> Nanos {
        self.clock.now()
    }

    pub fn engines(&self) -> Vec<EngineId> {
        self.engines.iter().map(|slot| slot.id).collect()
    }

    fn slot(&self, engine: EngineId) -> SchedResult<&EngineSlot> {
        self.engines
            .iter()
            .find(|slot| slot.id == engine)
            .ok_or_else(|| SchedError::InvalidEngine(engine.to_string()))
    }

    // ========================================================================
    // Contexts and address spaces
    // ========================================================================

    /// Context parameters from the configured defaults
    pub fn default_context_params(&self) -> ContextParams {
        self.context_defaults.clone()
    }

    pub fn create_context(&self, params: ContextParams) -> SchedResult<ContextId> {
        if let Some(map) = &params.engines {
            self.validate_engine_map(map)?;
        }
        let ctx = self.shared.contexts.create(&params)?;
        log::info!(
            "Created {} prio={} vm={} persistent={} ring={}",
            ctx.id,
            ctx.priority(),
            ctx.vm,
            ctx.is_persistent(),
            ctx.ring_size()
        );
        Ok(ctx.id)
    }

    /// Context with the configured default parameters
    pub fn create_default_context(&self) -> SchedResult<ContextId> {
        self.create_context(self.default_context_params())
    }

    /// New context inheriting every parameter, including the address space
    pub fn clone_context(&self, ctx: ContextId) -> SchedResult<ContextId> {
        let params = self.shared.contexts.get(ctx)?.params();
        self.create_context(params)
    }

    /// Refuse further submissions; work already submitted is untouched
    pub fn cancel_context(&self, ctx: ContextId) -> SchedResult<()> {
        let ctx = self.shared.contexts.get(ctx)?;
        ctx.close();
        log::info!("Closed {} for submission", ctx.id);
        Ok(())
    }

    /// Destroy a context. Outstanding work of a non-persistent context is
    /// cancelled; a persistent context's work runs to completion.
    pub fn destroy_context(&self, ctx: ContextId) -> SchedResult<()> {
        let ctx = self.shared.contexts.remove(ctx)?;
        ctx.close();
        if !ctx.is_persistent() {
            for slot in &self.engines {
                let mut sched = slot.sched.lock();
                if sched.requests.values().any(|req| req.shared.ctx == ctx.id) {
                    sched.cancel_context(ctx.id, FenceError::Cancelled, &self.shared);
                }
            }
        }
        log::info!("Destroyed {} (persistent={})", ctx.id, ctx.is_persistent());
        self.settle();
        Ok(())
    }

    pub fn context_priority(&self, ctx: ContextId) -> SchedResult<Priority> {
        Ok(self.shared.contexts.get(ctx)?.priority())
    }

    /// Change the context priority. Applies to future submissions and to
    /// requests not yet resident on an engine.
    pub fn set_priority(&self, ctx: ContextId, priority: i32) -> SchedResult<()> {
        let prio = Priority::new(priority)?;
        let ctx = self.shared.contexts.get(ctx)?;
        ctx.set_priority(prio);
        for slot in &self.engines {
            slot.sched.lock().reprioritize(&ctx, prio, &self.shared);
        }
        log::debug!("{} priority set to {}", ctx.id, prio);
        self.settle();
        Ok(())
    }

    pub fn set_persistence(&self, ctx: ContextId, persistent: bool) -> SchedResult<()> {
        self.shared.contexts.get(ctx)?.set_persistent(persistent);
        Ok(())
    }

    pub fn set_bannable(&self, ctx: ContextId, bannable: bool) -> SchedResult<()> {
        self.shared.contexts.get(ctx)?.set_bannable(bannable);
        Ok(())
    }

    pub fn set_ring_size(&self, ctx: ContextId, bytes: u64) -> SchedResult<()> {
        let bytes = validate_ring_size(bytes)?;
        self.shared.contexts.get(ctx)?.set_ring_size(bytes);
        Ok(())
    }

    pub fn ring_size(&self, ctx: ContextId) -> SchedResult<u32> {
        Ok(self.shared.contexts.get(ctx)?.ring_size())
    }

    pub fn set_engine_map(&self, ctx: ContextId, engines: Vec<EngineId>) -> SchedResult<()> {
        self.validate_engine_map(&engines)?;
        self.shared.contexts.get(ctx)?.set_engines(Some(engines));
        Ok(())
    }

    fn validate_engine_map(&self, engines: &[EngineId]) -> SchedResult<()> {
        if engines.is_empty() {
            return Err(SchedError::InvalidEngine("empty engine map".into()));
        }
        for engine in engines {
            self.slot(*engine)?;
        }
        Ok(())
    }

    pub fn is_banned(&self, ctx: ContextId) -> SchedResult<bool> {
        Ok(self.shared.contexts.get(ctx)?.is_banned())
    }

    pub fn context_vm(&self, ctx: ContextId) -> SchedResult<VmId> {
        Ok(self.shared.contexts.get(ctx)?.vm)
    }

    /// Busy time per engine class; never decreases
    pub fn context_runtime(&self, ctx: ContextId) -> SchedResult<ContextRuntime> {
        Ok(self.shared.contexts.get(ctx)?.runtime())
    }

    pub fn create_vm(&self) -> VmId {
        self.shared.contexts.create_vm()
    }

    pub fn destroy_vm(&self, vm: VmId) -> SchedResult<()> {
        self.shared.contexts.destroy_vm(vm)
    }

    // ========================================================================
    // Buffers
    // ========================================================================

    pub fn create_buffer(&self, size: u64) -> SchedResult<BufferId> {
        self.shared.buffers.create(size)
    }

    pub fn close_buffer(&self, buffer: BufferId) -> SchedResult<()> {
        self.shared.buffers.close(buffer)
    }

    pub fn read_buffer(&self, buffer: BufferId, offset: u32) -> SchedResult<u32> {
        self.shared.buffers.read(buffer, offset)
    }

    pub fn write_buffer(&self, buffer: BufferId, offset: u32, value: u32) -> SchedResult<()> {
        self.shared.buffers.write(buffer, offset, value)
    }

    pub fn buffer_contents(&self, buffer: BufferId) -> SchedResult<Vec<u32>> {
        self.shared.buffers.contents(buffer)
    }

    pub fn buffer_vms(&self, buffer: BufferId) -> SchedResult<Vec<VmId>> {
        self.shared.buffers.bound_vms(buffer)
    }

    pub fn query_buffer_busy(&self, buffer: BufferId) -> SchedResult<BufferBusy> {
        self.shared.buffers.busy(buffer)
    }

    // ========================================================================
    // Fences
    // ========================================================================

    /// Unsignaled user fence, typically used to hold back submissions
    pub fn create_fence(&self) -> FenceId {
        self.shared.fences.create(None).id()
    }

    /// Returns false if the fence had already signaled
    pub fn signal_fence(&self, fence: FenceId) -> SchedResult<bool> {
        self.signal(fence, Ok(()))
    }

    pub fn signal_fence_error(&self, fence: FenceId, error: FenceError) -> SchedResult<bool> {
        self.signal(fence, Err(error))
    }

    fn signal(&self, fence: FenceId, result: Result<(), FenceError>) -> SchedResult<bool> {
        let fence = self.shared.fences.get(fence)?;
        let Some(waiters) = fence.signal(result, self.now()) else {
            return Ok(false);
        };
        for waiter in waiters {
            self.shared.links.send(
                waiter.engine,
                EngineMsg::FenceSignaled {
                    request: waiter.request,
                    fence: fence.id(),
                    error: result.err(),
                },
            );
        }
        self.settle();
        Ok(true)
    }

    /// Drop a fence handle. An unsignaled user fence is signaled with
    /// `Cancelled` so its waiters are released.
    pub fn close_fence(&self, fence: FenceId) -> SchedResult<()> {
        let handle = self.shared.fences.get(fence)?;
        if handle.signaler().is_none() && !handle.is_signaled() {
            self.signal(fence, Err(FenceError::Cancelled))?;
        }
        self.shared.fences.remove(fence)?;
        Ok(())
    }

    pub fn fence_state(&self, fence: FenceId) -> SchedResult<FenceState> {
        Ok(self.shared.fences.get(fence)?.state())
    }

    /// Block the calling thread until the fence signals
    pub fn wait_fence(
        &self,
        fence: FenceId,
        timeout: Option<Duration>,
        interrupt: Option<&Interrupt>,
    ) -> SchedResult<FenceState> {
        let fence = self.shared.fences.get(fence)?;
        fence.wait(timeout, interrupt)
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Submit a batch. Fails with `RingFull` when the context ring has no
    /// room on the target engine.
    pub fn submit(&self, exec: ExecBuffer) -> SchedResult<Submission> {
        self.submit_with(exec, |ctx, engine| ctx.try_reserve(engine))
    }

    /// Submit a batch, waiting for ring space if needed
    pub fn submit_blocking(
        &self,
        exec: ExecBuffer,
        timeout: Option<Duration>,
        interrupt: Option<&Interrupt>,
    ) -> SchedResult<Submission> {
        self.submit_with(exec, |ctx, engine| ctx.reserve_blocking(engine, timeout, interrupt))
    }

    fn submit_with<F>(&self, exec: ExecBuffer, reserve: F) -> SchedResult<Submission>
    where
        F: FnOnce(&ContextShared, EngineId) -> SchedResult<()>,
    {
        let ctx = self.shared.contexts.get(exec.ctx)?;
        check_open(&ctx)?;
        let engine = self.resolve_engine(&ctx, exec.engine)?;

        if exec.batch.is_empty() {
            return Err(SchedError::EmptyBatch);
        }
        for buffer in exec.batch.buffers().chain(exec.buffers.iter().map(|b| b.buffer)) {
            if !self.shared.buffers.contains(buffer) {
                return Err(SchedError::BufferNotFound(buffer));
            }
        }
        let explicit: Vec<Arc<Fence>> = exec
            .fences_in
            .iter()
            .map(|id| self.shared.fences.get(*id))
            .collect::<SchedResult<_>>()?;
        let submit_fences: Vec<Arc<Fence>> = exec
            .submit_fences
            .iter()
            .map(|id| self.shared.fences.get(*id))
            .collect::<SchedResult<_>>()?;

        reserve(&ctx, engine)?;
        // the context may have been closed or banned while we waited
        if let Err(err) = check_open(&ctx) {
            ctx.release(engine);
            return Err(err);
        }

        let id = self.shared.requests.alloc_id();
        let fence = self.shared.fences.create(Some(id));
        let base = exec.priority.unwrap_or_else(|| ctx.priority());
        let shared_rq = Arc::new(RequestShared::new(id, ctx.id, engine, Arc::clone(&fence), base, self.now()));

        let implicit = match self.shared.buffers.track(&shared_rq, &exec.buffers, ctx.vm) {
            Ok(deps) => deps,
            Err(err) => {
                ctx.release(engine);
                let _ = self.shared.fences.remove(fence.id());
                return Err(err);
            }
        };

        let mut deps: Vec<Dependency> = Vec::new();
        let mut seen: HashSet<FenceId> = HashSet::new();
        // one edge per fence; the strongest kind wins
        let mut add = |fence: Arc<Fence>, signaler: Option<Arc<RequestShared>>, kind: DepKind| {
            if seen.insert(fence.id()) {
                deps.push(Dependency {
                    fence,
                    signaler,
                    signaled: false,
                    kind,
                });
            } else if let Some(dep) = deps.iter_mut().find(|dep| dep.fence.id() == fence.id()) {
                dep.kind = dep.kind.max(kind);
            }
        };
        if let Some(prev) = ctx.swap_timeline(engine, &shared_rq) {
            add(Arc::clone(&prev.fence), Some(prev), DepKind::Timeline);
        }
        for rq in implicit {
            add(Arc::clone(&rq.fence), Some(rq), DepKind::Signal);
        }
        for fence in explicit {
            let signaler = fence.signaler().and_then(|rid| self.shared.requests.get(rid).ok());
            add(fence, signaler, DepKind::Signal);
        }
        for fence in submit_fences {
            let signaler = fence.signaler().and_then(|rid| self.shared.requests.get(rid).ok());
            let kind = if signaler.is_some() { DepKind::Submit } else { DepKind::Signal };
            add(fence, signaler, kind);
        }

        self.shared.requests.insert(Arc::clone(&shared_rq));

        let request = Request {
            shared: Arc::clone(&shared_rq),
            context: Arc::clone(&ctx),
            base,
            pinned: exec.priority.is_some(),
            inherited: Priority::MIN,
            seq: self.shared.requests.next_seq(),
            deps,
            unsignaled: 0,
            dep_error: false,
            semaphore: false,
            batch: exec.batch,
            cursor: Cursor::default(),
            slot: Slot::Pending,
            executing: false,
            first_start: None,
            cancel: None,
        };

        self.slot(engine)?.sched.lock().insert(request, &self.shared);
        self.settle();

        Ok(Submission {
            request: id,
            fence: fence.id(),
            engine,
        })
    }

    fn resolve_engine(&self, ctx: &ContextShared, selector: EngineSelector) -> SchedResult<EngineId> {
        match selector {
            EngineSelector::Physical(id) => self.slot(id).map(|slot| slot.id),
            EngineSelector::Index(idx) => match ctx.engines() {
                Some(_) => ctx
                    .engine_at(idx)
                    .ok_or_else(|| SchedError::InvalidEngine(format!("index {} not in engine map", idx))),
                None => self
                    .engines
                    .get(idx)
                    .map(|slot| slot.id)
                    .ok_or_else(|| SchedError::InvalidEngine(format!("index {}", idx))),
            },
            EngineSelector::Class(class) => self.least_loaded(ctx, class),
        }
    }

    /// Balanced submission: the instance of `class` with the fewest requests
    fn least_loaded(&self, ctx: &ContextShared, class: EngineClass) -> SchedResult<EngineId> {
        let map = ctx.engines();
        self.engines
            .iter()
            .filter(|slot| slot.id.class == class)
            .filter(|slot| map.as_ref().map_or(true, |m| m.contains(&slot.id)))
            .map(|slot| (slot.sched.lock().load(), slot.id))
            .min()
            .map(|(_, id)| id)
            .ok_or_else(|| SchedError::InvalidEngine(format!("no {} engine", class)))
    }

    /// Release a spinning batch
    pub fn end_spin(&self, request: RequestId) -> SchedResult<()> {
        self.shared.requests.get(request)?.end_spin();
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn query_status(&self, target: Target) -> SchedResult<Status> {
        match target {
            Target::Request(id) => Ok(self.shared.requests.get(id)?.status()),
            Target::Fence(id) => {
                let fence = self.shared.fences.get(id)?;
                let state = fence.state();
                if state.is_signaled() {
                    return Ok(state.into());
                }
                Ok(fence
                    .signaler()
                    .and_then(|rid| self.shared.requests.get(rid).ok())
                    .map_or(Status::Pending, |rq| rq.status()))
            }
        }
    }

    /// Any request resident on the engine
    pub fn query_engine_busy(&self, engine: EngineId) -> SchedResult<bool> {
        Ok(self.slot(engine)?.sched.lock().is_busy())
    }

    pub fn engine_state(&self, engine: EngineId) -> SchedResult<EngineState> {
        Ok(self.slot(engine)?.sched.lock().state)
    }

    /// Current effective priority of a request
    pub fn request_priority(&self, request: RequestId) -> SchedResult<Priority> {
        Ok(self.shared.requests.get(request)?.effective_priority())
    }

    pub fn request_runtime(&self, request: RequestId) -> SchedResult<Duration> {
        Ok(Duration::from_nanos(self.shared.requests.get(request)?.runtime_ns()))
    }

    pub fn engine_stats(&self, engine: EngineId) -> SchedResult<EngineStats> {
        Ok(self.slot(engine)?.sched.lock().stats)
    }

    pub fn engine_events(&self, engine: EngineId) -> SchedResult<Vec<EngineEvent>> {
        Ok(self.slot(engine)?.sched.lock().events())
    }

    /// Requests in the order they left the engine, from the event history
    pub fn execution_order(&self, engine: EngineId) -> SchedResult<Vec<RequestId>> {
        Ok(self
            .engine_events(engine)?
            .into_iter()
            .filter(|ev| matches!(ev.kind, EventKind::Completed | EventKind::Errored(_)))
            .filter_map(|ev| ev.request)
            .collect())
    }

    pub fn log_stats(&self) {
        for slot in &self.engines {
            let stats = slot.sched.lock().stats;
            log_summary(slot.id, &stats);
        }
    }

    // ========================================================================
    // Engine control
    // ========================================================================

    /// Set an engine property, returning its previous value
    pub fn set_engine_property(&self, engine: EngineId, prop: EngineProperty) -> SchedResult<EngineProperty> {
        let old = self.slot(engine)?.sched.lock().set_property(prop, &self.shared);
        self.settle();
        Ok(old)
    }

    pub fn engine_props(&self, engine: EngineId) -> SchedResult<EngineProps> {
        Ok(self.slot(engine)?.sched.lock().props)
    }

    /// Report a hang: resident requests are errored with `Reset`, the guilty
    /// context is banned if bannable, other engines carry on
    pub fn notify_hang(&self, engine: EngineId) -> SchedResult<()> {
        self.slot(engine)?.sched.lock().notify_hang(&self.shared);
        self.settle();
        Ok(())
    }

    /// Drop completed requests and their out-fences
    pub fn retire(&self) -> usize {
        let fences = self.shared.requests.retire();
        self.shared.fences.remove_all(&fences);
        self.shared.buffers.purge();
        log::debug!(
            "retired {} request(s), {} request(s) and {} fence(s) live",
            fences.len(),
            self.shared.requests.len(),
            self.shared.fences.len()
        );
        fences.len()
    }

    // ========================================================================
    // Time
    // ========================================================================

    /// Advance a virtual clock by `dt`, stepping every engine tick by tick.
    /// On a monotonic clock this only polls the engines.
    pub fn advance(&self, dt: Duration) {
        if !self.clock.is_virtual() {
            self.poll();
            return;
        }
        let target = self.now().saturating_add(duration_to_ns(dt));
        self.run_to(target);
    }

    /// Step every engine to the current clock time
    pub fn poll(&self) {
        let now = self.now();
        for idx in 0..self.engines.len() {
            self.step_engine(idx, now);
        }
        self.settle();
    }

    /// Step one engine; used by the runtime threads
    pub(crate) fn step_engine(&self, idx: usize, until: Nanos) {
        if let Some(slot) = self.engines.get(idx) {
            slot.sched.lock().advance(until, &self.shared);
        }
    }

    pub(crate) fn engine_count(&self) -> usize {
        self.engines.len()
    }

    fn run_to(&self, target: Nanos) {
        let mut now = self.now();
        loop {
            let next = now.saturating_add(self.tick_ns).min(target);
            self.clock.set(next);
            for idx in 0..self.engines.len() {
                self.step_engine(idx, next);
            }
            self.settle();
            now = next;
            if now >= target {
                break;
            }
        }
    }

    /// Advance until every engine has drained its requests, or `max` time
    /// has passed. Returns true when idle.
    pub fn run_until_idle(&self, max: Duration) -> bool {
        self.run_until(|sched| sched.is_idle(), max)
    }

    /// Advance tick by tick until `done` holds or `max` time has passed
    pub fn run_until<F>(&self, mut done: F, max: Duration) -> bool
    where
        F: FnMut(&Scheduler) -> bool,
    {
        let deadline = self.now().saturating_add(duration_to_ns(max));
        loop {
            if done(self) {
                return true;
            }
            let now = self.now();
            if now >= deadline {
                return false;
            }
            if self.clock.is_virtual() {
                self.run_to(now.saturating_add(self.tick_ns).min(deadline));
            } else {
                std::thread::sleep(Duration::from_nanos(self.tick_ns));
            }
        }
    }

    /// No engine holds a live request
    pub fn is_idle(&self) -> bool {
        self.shared.links.backlog() == 0 && self.engines.iter().all(|slot| slot.sched.lock().is_idle())
    }

    /// Deliver queued cross-engine messages without advancing time
    fn settle(&self) {
        for _ in 0..SETTLE_PASSES {
            for slot in &self.engines {
                slot.sched.lock().kick(&self.shared);
            }
            if self.shared.links.backlog() == 0 {
                break;
            }
        }
    }
}

fn check_open(ctx: &ContextShared) -> SchedResult<()> {
    if ctx.is_closed() {
        return Err(SchedError::ContextClosed(ctx.id));
    }
    if ctx.is_banned() {
        return Err(SchedError::ContextBanned(ctx.id));
    }
    Ok(())
}
