//! Preemption and engine reset
//!
//! A strictly higher priority arrival preempts the active request at its
//! next arbitration point. Batches that disabled arbitration cannot be
//! preempted; if one still holds the engine when the preempt timeout
//! expires, the engine is reset and the request is blamed.
//!
//! Cancellation (context destruction, watchdog) reuses the same path: the
//! active request is preempted to idle and completed with an error instead
//! of being requeued.

use crate::fence::FenceError;
use crate::request::Request;
use crate::types::RequestId;

use super::engine::EngineSched;
use super::stats::EventKind;
use super::types::EngineState;
use super::Shared;

impl EngineSched {
    /// The queue head outranks the executing request
    pub(super) fn need_preempt(&self, active: RequestId) -> bool {
        if !self.props.preemption {
            return false;
        }
        let (Some(head), Some(req)) = (self.queue.peek(), self.requests.get(&active)) else {
            return false;
        };
        req.executing && head.priority > req.effective() && !self.within_grace(req)
    }

    /// Nearly finished requests are left to complete
    fn within_grace(&self, req: &Request) -> bool {
        self.props.grace_ns > 0
            && req.is_ready()
            && req
                .cursor
                .remaining_compute(&req.batch)
                .map_or(false, |left| left <= self.props.grace_ns)
    }

    pub(super) fn begin_preempt(&mut self, active: RequestId) {
        log::debug!("{}: preempting {} at {}", self.id, active, self.now);
        self.state = EngineState::Preempting;
        self.preempt_deadline = Some(self.now.saturating_add(self.props.preempt_timeout_ns));
        self.slice_deadline = None;
    }

    /// Cancel the executing request with `error` once it is off the engine
    pub(super) fn cancel_active(&mut self, error: FenceError) {
        let Some(&active) = self.ports.first() else { return };
        if let Some(req) = self.requests.get_mut(&active) {
            req.cancel.get_or_insert(error);
        }
        if self.state != EngineState::Preempting {
            self.begin_preempt(active);
        }
    }

    /// The active request reached an arbitration point: evict every
    /// resident request
    pub(super) fn complete_preemption(&mut self, shared: &Shared) {
        self.state = EngineState::Idle;
        self.preempt_deadline = None;
        self.slice_deadline = None;

        let resident: Vec<RequestId> = self.ports.clone();
        for (port, id) in resident.into_iter().enumerate() {
            let cancel = self.requests.get(&id).and_then(|req| req.cancel);
            match cancel {
                Some(err) => self.complete(id, Err(err), shared),
                None => {
                    let started = port == 0 && self.requests.get(&id).map_or(false, |req| req.executing);
                    self.unwind(id);
                    if started {
                        self.stats.preemptions += 1;
                        self.record(Some(id), EventKind::Preempted);
                    }
                }
            }
        }
        self.update_state();
    }

    /// The active request ignored the preemption for too long
    pub(super) fn preempt_timeout(&mut self, active: RequestId, shared: &Shared) {
        log::warn!(
            "{}: preempt timeout ({} ms) on {}, resetting",
            self.id,
            self.props.preempt_timeout_ns / 1_000_000,
            active
        );
        self.stats.preempt_timeouts += 1;
        self.reset(Some(active), FenceError::Reset, false, shared);
    }

    /// Reset the engine.
    ///
    /// The guilty request completes with its pending cancellation error, or
    /// `error`. Innocent resident requests are errored with `Reset` when
    /// `error_innocent` is set and requeued otherwise. A bannable guilty
    /// context is banned and loses its queued work on this engine.
    pub(super) fn reset(
        &mut self,
        guilty: Option<RequestId>,
        error: FenceError,
        error_innocent: bool,
        shared: &Shared,
    ) {
        self.stats.resets += 1;
        self.record(guilty, EventKind::Reset);
        self.state = EngineState::Idle;
        self.preempt_deadline = None;
        self.slice_deadline = None;

        let guilty_ctx = guilty
            .and_then(|id| self.requests.get(&id))
            .map(|req| std::sync::Arc::clone(&req.context));

        let resident: Vec<RequestId> = self.ports.clone();
        for id in resident {
            if Some(id) == guilty {
                let err = self.requests.get(&id).and_then(|req| req.cancel).unwrap_or(error);
                self.complete(id, Err(err), shared);
            } else if error_innocent {
                self.complete(id, Err(FenceError::Reset), shared);
            } else {
                self.unwind(id);
            }
        }

        if let Some(ctx) = guilty_ctx {
            if ctx.mark_guilty() {
                log::warn!("{}: banning {} after hang", self.id, ctx.id);
                let queued: Vec<RequestId> = self
                    .requests
                    .values()
                    .filter(|req| req.shared.ctx == ctx.id)
                    .map(Request::id)
                    .collect();
                for id in queued {
                    self.complete(id, Err(FenceError::Cancelled), shared);
                }
            } else {
                log::info!("{}: {} guilty of hang (not bannable)", self.id, ctx.id);
            }
        }

        self.update_state();
    }

    /// Externally detected hang
    pub fn notify_hang(&mut self, shared: &Shared) {
        let guilty = self
            .ports
            .first()
            .copied()
            .filter(|id| self.requests.get(id).map_or(false, |req| req.executing));
        log::warn!("{}: hang reported, guilty {:?}", self.id, guilty);
        self.reset(guilty, FenceError::Reset, true, shared);
        self.kick(shared);
    }
}
