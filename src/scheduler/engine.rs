//! Per-engine scheduler state
//!
//! One [`EngineSched`] exists per physical engine and lives behind that
//! engine's mutex. It owns every live request targeting the engine, split
//! between the pending set (waiting on fences), the ready queue and the
//! execution ports.
//!
//! ## Key invariants
//! - At most `props.ports` requests are resident.
//! - Only port 0 executes; the other ports hold the next requests in
//!   dispatch order.
//! - A request lives in exactly one of pending, queue or ports.

use std::collections::HashMap;

use crossbeam_channel::Receiver;

use crate::context::ContextShared;
use crate::fence::{FenceError, Waiter};
use crate::request::{DepKind, Request, RequestState, Slot};
use crate::types::{ContextId, EngineId, FenceId, Nanos, Priority, RequestId};

use super::notify::EngineMsg;
use super::queue::{QueueKey, ReadyQueue};
use super::stats::{EngineEvent, EngineStats, EventKind, EventLog};
use super::types::{EngineProperty, EngineProps, EngineState};
use super::Shared;

pub(crate) struct EngineSched {
    pub id: EngineId,
    pub props: EngineProps,
    pub state: EngineState,
    /// Engine local time; never ahead of the scheduler clock
    pub now: Nanos,
    pub(super) requests: HashMap<RequestId, Request>,
    pub(super) queue: ReadyQueue,
    pub(super) ports: Vec<RequestId>,
    pub(super) slice_deadline: Option<Nanos>,
    pub(super) preempt_deadline: Option<Nanos>,
    /// Bumped whenever time passes or a command completes
    pub(super) epoch: u64,
    /// Epoch of the last semaphore yield
    pub(super) yield_epoch: Option<u64>,
    pub(super) last_active: Option<RequestId>,
    /// Early queueing behind remote signalers
    pub(super) semaphores: bool,
    inbox: Receiver<EngineMsg>,
    pub stats: EngineStats,
    pub(super) events: EventLog,
}

impl EngineSched {
    pub fn new(
        id: EngineId,
        props: EngineProps,
        inbox: Receiver<EngineMsg>,
        semaphores: bool,
        history: usize,
    ) -> Self {
        Self {
            id,
            props,
            state: EngineState::Idle,
            now: 0,
            requests: HashMap::new(),
            queue: ReadyQueue::new(),
            ports: Vec::with_capacity(props.ports),
            slice_deadline: None,
            preempt_deadline: None,
            epoch: 0,
            yield_epoch: None,
            last_active: None,
            semaphores,
            inbox,
            stats: EngineStats::default(),
            events: EventLog::new(history),
        }
    }

    /// Requests not yet retired from this engine
    pub fn load(&self) -> usize {
        self.requests.len()
    }

    pub fn is_busy(&self) -> bool {
        !self.ports.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.snapshot()
    }

    pub fn set_property(&mut self, prop: EngineProperty, shared: &Shared) -> EngineProperty {
        let old = prop.apply(&mut self.props);
        log::debug!("{}: property {:?} (was {:?})", self.id, prop, old);
        if matches!(prop, EngineProperty::Timeslice(_)) {
            self.slice_deadline = None;
        }
        self.kick(shared);
        old
    }

    pub(super) fn record(&mut self, request: Option<RequestId>, kind: EventKind) {
        self.events.push(self.now, request, kind);
    }

    pub(super) fn key(&self, id: RequestId) -> Option<QueueKey> {
        self.requests.get(&id).map(|req| QueueKey {
            priority: req.effective(),
            semaphore: req.semaphore,
            seq: req.seq,
            id,
        })
    }

    /// Apply pending inbox messages, then refill the ports
    pub fn kick(&mut self, shared: &Shared) {
        self.drain_inbox(shared);
        self.dequeue();
    }

    fn drain_inbox(&mut self, shared: &Shared) {
        while let Ok(msg) = self.inbox.try_recv() {
            match msg {
                EngineMsg::FenceSignaled { request, fence, error } => {
                    self.fence_signaled(request, fence, error, shared)
                }
                EngineMsg::SignalerStarted { request, fence } => {
                    self.signaler_started(request, fence, shared)
                }
                EngineMsg::Promote { request, priority } => self.promote(request, priority, shared),
            }
        }
    }

    // ========================================================================
    // Submission and dependency resolution
    // ========================================================================

    /// Take ownership of a freshly submitted request
    pub fn insert(&mut self, mut req: Request, shared: &Shared) {
        let id = req.id();
        let waiter = Waiter {
            engine: self.id,
            request: id,
        };
        for dep in req.deps.iter_mut() {
            if let Err(state) = dep.fence.add_waiter(waiter) {
                dep.signaled = true;
                req.dep_error |= state.error().is_some() && dep.inherits_error();
            } else if dep.satisfied_by_start() {
                // the start notice went out before we registered
                dep.signaled = true;
            }
        }
        req.unsignaled = req.deps.iter().filter(|dep| !dep.signaled).count();
        req.slot = Slot::Pending;
        req.shared.set_state(RequestState::Pending);
        req.shared.publish_priority(req.effective());

        log::debug!(
            "{}: submit {} ctx={} prio={} deps={}/{}",
            self.id,
            id,
            req.shared.ctx,
            req.effective(),
            req.unsignaled,
            req.deps.len()
        );

        let ready = req.is_ready();
        self.requests.insert(id, req);
        self.stats.submitted += 1;
        self.record(Some(id), EventKind::Submitted);

        if ready {
            self.resolve_ready(id, shared);
        } else {
            self.try_semaphore(id);
        }
        self.propagate(id, shared);
        self.kick(shared);
    }

    fn fence_signaled(&mut self, id: RequestId, fence: FenceId, error: Option<FenceError>, shared: &Shared) {
        let Some(req) = self.requests.get_mut(&id) else { return };
        let Some(dep) = req
            .deps
            .iter_mut()
            .find(|dep| !dep.signaled && dep.fence.id() == fence)
        else {
            return;
        };
        dep.signaled = true;
        req.unsignaled = req.unsignaled.saturating_sub(1);
        req.dep_error |= error.is_some() && dep.inherits_error();

        if req.is_ready() {
            self.resolve_ready(id, shared);
        } else {
            self.try_semaphore(id);
        }
    }

    /// The request behind `fence` began executing. That satisfies a submit
    /// fence and may let a blocked request queue as a semaphore waiter.
    fn signaler_started(&mut self, id: RequestId, fence: FenceId, shared: &Shared) {
        let Some(req) = self.requests.get_mut(&id) else { return };
        let submit = req
            .deps
            .iter_mut()
            .find(|dep| !dep.signaled && dep.kind == DepKind::Submit && dep.fence.id() == fence);
        let released = match submit {
            Some(dep) => {
                dep.signaled = true;
                req.unsignaled = req.unsignaled.saturating_sub(1);
                true
            }
            None => false,
        };

        let (pending, ready) = (req.slot == Slot::Pending, req.is_ready());
        if released {
            log::trace!("{}: {} released by start of {}", self.id, id, fence);
        }
        if released && ready {
            self.resolve_ready(id, shared);
        } else if pending && !ready {
            self.try_semaphore(id);
        }
    }

    /// All inputs have signaled
    fn resolve_ready(&mut self, id: RequestId, shared: &Shared) {
        let Some(req) = self.requests.get_mut(&id) else { return };
        if req.dep_error {
            log::debug!("{}: {} inherits dependency error", self.id, id);
            self.complete(id, Err(FenceError::Dependency), shared);
            return;
        }
        let was_semaphore = std::mem::replace(&mut req.semaphore, false);
        let slot = req.slot;
        match slot {
            Slot::Pending => self.enqueue(id),
            Slot::Queued if was_semaphore => {
                if let Some(key) = self.key(id) {
                    self.queue.insert(key);
                }
            }
            _ => {}
        }
    }

    /// Queue a blocked request early if every blocker already runs remotely
    fn try_semaphore(&mut self, id: RequestId) {
        let engine = self.id;
        let Some(req) = self.requests.get_mut(&id) else { return };
        if !self.semaphores || req.slot != Slot::Pending || req.dep_error {
            return;
        }
        let eligible = req.blockers().all(|dep| {
            dep.signaler
                .as_ref()
                .map_or(false, |s| s.engine != engine && s.is_started())
        });
        if eligible {
            req.semaphore = true;
            log::trace!("{}: {} queued as semaphore waiter", engine, id);
            self.enqueue(id);
        }
    }

    pub(super) fn enqueue(&mut self, id: RequestId) {
        let Some(req) = self.requests.get_mut(&id) else { return };
        req.slot = Slot::Queued;
        req.executing = false;
        req.shared.set_state(RequestState::Ready);
        if let Some(key) = self.key(id) {
            self.queue.insert(key);
        }
        self.record(Some(id), EventKind::Queued);
    }

    // ========================================================================
    // Context level operations
    // ========================================================================

    /// New base priority for the context's pending and queued requests
    pub fn reprioritize(&mut self, ctx: &ContextShared, prio: Priority, shared: &Shared) {
        let ids: Vec<RequestId> = self
            .requests
            .values()
            .filter(|req| req.shared.ctx == ctx.id && req.slot != Slot::Port && !req.pinned)
            .map(Request::id)
            .collect();

        for id in ids {
            let Some(req) = self.requests.get_mut(&id) else { continue };
            let before = req.effective();
            req.base = prio;
            req.shared.publish_priority(req.effective());
            let raised = req.effective() > before;
            if req.slot == Slot::Queued {
                if let Some(key) = self.key(id) {
                    self.queue.insert(key);
                }
            }
            if raised {
                self.propagate(id, shared);
            }
        }
        self.kick(shared);
    }

    /// Cancel everything the context has on this engine
    pub fn cancel_context(&mut self, ctx: ContextId, error: FenceError, shared: &Shared) {
        let mut ids: Vec<RequestId> = self
            .requests
            .values()
            .filter(|req| req.shared.ctx == ctx)
            .map(Request::id)
            .collect();
        ids.sort();
        log::info!("{}: cancelling {} request(s) of {} ({})", self.id, ids.len(), ctx, error);

        for id in ids {
            let active = self.ports.first() == Some(&id)
                && self.requests.get(&id).map_or(false, |req| req.executing);
            if active {
                self.cancel_active(error);
            } else {
                self.complete(id, Err(error), shared);
            }
        }
        self.kick(shared);
    }
}
