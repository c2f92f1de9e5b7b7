//! Dispatch and execution loop
//!
//! [`EngineSched::advance`] runs an engine up to a point in time. Each
//! iteration applies inbox messages, refills the execution ports
//! (`dequeue`) and gives port 0 a slice of time bounded by the next timer:
//! timeslice expiry, watchdog expiry or preempt timeout.

use crate::batch::{CommandEnv, Halt, RunResult};
use crate::buffer::BufferTable;
use crate::fence::FenceError;
use crate::request::{RequestShared, RequestState, Slot};
use crate::types::{BufferId, Nanos, RequestId};

use super::engine::EngineSched;
use super::notify::EngineMsg;
use super::stats::EventKind;
use super::types::EngineState;
use super::Shared;

/// What port 0 sees while executing
struct ExecEnv<'a> {
    buffers: &'a BufferTable,
    request: &'a RequestShared,
}

impl CommandEnv for ExecEnv<'_> {
    fn load(&self, buffer: BufferId, offset: u32) -> Option<u32> {
        self.buffers.gpu_load(buffer, offset)
    }

    fn store(&self, buffer: BufferId, offset: u32, value: u32) -> bool {
        self.buffers.gpu_store(buffer, offset, value)
    }

    fn spin_ended(&self) -> bool {
        self.request.spin_ended()
    }
}

impl EngineSched {
    /// Run the engine until its local time reaches `until`
    pub fn advance(&mut self, until: Nanos, shared: &Shared) {
        loop {
            self.kick(shared);
            if self.now >= until {
                break;
            }
            let budget = until - self.now;
            if self.ports.is_empty() {
                self.stats.idle_ns += budget;
                self.now = until;
                self.epoch += 1;
                continue;
            }
            self.run_active(budget, shared);
        }
    }

    /// Fill the execution ports from the ready queue.
    ///
    /// Resident requests that have not started are put back whenever the
    /// queue holds something that should run before them; that is free
    /// and does not count as a preemption.
    pub(super) fn dequeue(&mut self) {
        if self.state == EngineState::Preempting {
            return;
        }

        if let Some(from) = self.first_misordered_port() {
            let unwind: Vec<RequestId> = self.ports[from..].to_vec();
            for id in unwind {
                self.unwind(id);
            }
        }

        if let Some(&active) = self.ports.first() {
            if self.need_preempt(active) {
                self.begin_preempt(active);
                return;
            }
        }

        while self.ports.len() < self.props.ports {
            let Some(key) = self.queue.pop() else { break };
            let Some(req) = self.requests.get_mut(&key.id) else { continue };
            req.slot = Slot::Port;
            req.executing = false;
            req.shared.set_state(RequestState::Resident);
            let port = self.ports.len();
            self.ports.push(key.id);
            self.record(Some(key.id), EventKind::Dispatched { port });
        }

        self.update_timeslice();
        self.update_state();
    }

    /// First port holding an unstarted request that is out of dispatch
    /// order, either against the next port or against the queue head
    fn first_misordered_port(&self) -> Option<usize> {
        let head = self.queue.peek();
        let keys: Vec<_> = self.ports.iter().filter_map(|id| self.key(*id)).collect();
        for (idx, key) in keys.iter().enumerate() {
            let started = self
                .requests
                .get(&key.id)
                .map_or(true, |req| req.executing);
            if started {
                continue;
            }
            let behind_next = keys.get(idx + 1).map_or(false, |next| next < key);
            let behind_head = head.map_or(false, |head| head < *key);
            if behind_next || behind_head {
                return Some(idx);
            }
        }
        None
    }

    /// Return a resident request to the queue, keeping its sequence
    pub(super) fn unwind(&mut self, id: RequestId) {
        if let Some(pos) = self.ports.iter().position(|p| *p == id) {
            self.ports.remove(pos);
            if pos == 0 {
                self.slice_deadline = None;
            }
        }
        self.enqueue(id);
    }

    pub(super) fn update_state(&mut self) {
        if self.state == EngineState::Preempting {
            return;
        }
        self.state = match self.ports.first().and_then(|id| self.requests.get(id)) {
            None => EngineState::Idle,
            Some(req) if req.executing => EngineState::Running,
            Some(_) => EngineState::Loaded,
        };
    }

    /// Give port 0 up to `budget` of time
    fn run_active(&mut self, budget: Nanos, shared: &Shared) {
        let Some(&id) = self.ports.first() else { return };
        let mut step = budget;

        if self.state == EngineState::Preempting {
            if self.requests.get(&id).map_or(true, |req| !req.batch.no_preempt) {
                self.complete_preemption(shared);
                return;
            }
            let deadline = self.preempt_deadline.unwrap_or(self.now);
            if self.now >= deadline {
                self.preempt_timeout(id, shared);
                return;
            }
            step = step.min(deadline - self.now);
        }

        self.activate(id, shared);

        if let Some(deadline) = self.slice_deadline {
            if self.now >= deadline {
                self.expire_timeslice(shared);
                return;
            }
            step = step.min(deadline - self.now);
        }

        if let (Some(limit), Some(started)) = (
            self.props.watchdog_ns,
            self.requests.get(&id).and_then(|req| req.first_start),
        ) {
            let expiry = started.saturating_add(limit);
            if self.now >= expiry {
                let cancelling = self.requests.get(&id).map_or(true, |req| req.cancel.is_some());
                if !cancelling {
                    log::warn!("{}: watchdog expired for {}", self.id, id);
                    self.stats.watchdog_expiries += 1;
                    self.cancel_active(FenceError::Watchdog);
                    return;
                }
            } else {
                step = step.min(expiry - self.now);
            }
        }

        let Some(req) = self.requests.get_mut(&id) else { return };
        let result = if req.is_ready() {
            let env = ExecEnv {
                buffers: &shared.buffers,
                request: &req.shared,
            };
            req.cursor.run(&req.batch, step, &env)
        } else {
            // waiting on inputs from a semaphore queue slot
            RunResult {
                consumed: 0,
                halt: Halt::Blocked,
                progressed: false,
            }
        };

        self.charge(id, result.consumed);
        if result.consumed > 0 || result.progressed {
            self.epoch += 1;
        }

        match result.halt {
            Halt::Done => self.complete(id, Ok(()), shared),
            Halt::Exhausted => {}
            Halt::Fault => {
                log::warn!("{}: {} faulted, resetting", self.id, id);
                self.reset(Some(id), FenceError::Fault, false, shared);
            }
            Halt::Blocked if self.may_semaphore_yield(id) => self.semaphore_yield(shared),
            Halt::Blocked | Halt::Spinning => {
                let rest = step - result.consumed;
                if rest > 0 {
                    self.charge(id, rest);
                    self.epoch += 1;
                }
            }
        }
    }

    /// First run time of a request in its current residency
    fn activate(&mut self, id: RequestId, shared: &Shared) {
        let now = self.now;
        let Some(req) = self.requests.get_mut(&id) else { return };
        if req.executing {
            return;
        }
        req.executing = true;
        req.first_start.get_or_insert(now);
        req.shared.set_state(RequestState::Running);
        let first_run = req.shared.mark_started();
        let fence = req.shared.fence_id();
        let waiters = if first_run {
            req.shared.fence.waiters()
        } else {
            Vec::new()
        };

        // local waiters only care about submit fences, remote ones may also
        // queue as semaphore waiters
        for waiter in waiters {
            shared.links.send(
                waiter.engine,
                EngineMsg::SignalerStarted {
                    request: waiter.request,
                    fence,
                },
            );
        }

        if self.last_active != Some(id) {
            self.stats.context_switches += 1;
            self.last_active = Some(id);
        }
        self.record(Some(id), EventKind::Started);
        self.update_timeslice();
        self.update_state();
    }

    /// Account `ns` of engine time to the active request
    fn charge(&mut self, id: RequestId, ns: Nanos) {
        if ns == 0 {
            return;
        }
        if let Some(req) = self.requests.get(&id) {
            req.shared.add_runtime(ns);
            req.context.add_runtime(self.id.class, ns);
        }
        self.stats.busy_ns += ns;
        self.now += ns;
    }

    /// Retire a request, signal its fence and wake its dependents
    pub(super) fn complete(&mut self, id: RequestId, result: Result<(), FenceError>, shared: &Shared) {
        let Some(req) = self.requests.remove(&id) else { return };

        match req.slot {
            Slot::Port => {
                if let Some(pos) = self.ports.iter().position(|p| *p == id) {
                    self.ports.remove(pos);
                    if pos == 0 {
                        self.slice_deadline = None;
                        if self.state == EngineState::Preempting {
                            self.preempt_deadline = None;
                        }
                        self.state = EngineState::Completing;
                    }
                }
            }
            Slot::Queued => {
                self.queue.remove(id);
            }
            Slot::Pending => {}
        }

        req.shared.set_state(match result {
            Ok(()) => RequestState::Completed,
            Err(_) => RequestState::Error,
        });

        let fence = req.shared.fence_id();
        if let Some(waiters) = req.shared.fence.signal(result, self.now) {
            for waiter in waiters {
                shared.links.send(
                    waiter.engine,
                    EngineMsg::FenceSignaled {
                        request: waiter.request,
                        fence,
                        error: result.err(),
                    },
                );
            }
        }

        req.context.release(self.id);
        req.context.clear_timeline(self.id, id);

        match result {
            Ok(()) => {
                self.stats.completed += 1;
                self.record(Some(id), EventKind::Completed);
                log::trace!("{}: {} completed at {}", self.id, id, self.now);
            }
            Err(err) => {
                self.stats.errored += 1;
                self.record(Some(id), EventKind::Errored(err));
                log::debug!("{}: {} completed with error {}", self.id, id, err);
            }
        }

        if self.state == EngineState::Completing {
            self.state = EngineState::Idle;
            self.update_state();
        }
    }
}
