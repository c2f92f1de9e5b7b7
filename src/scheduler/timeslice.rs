//! Timeslicing and semaphore yields
//!
//! Equal priority requests share the engine in quanta. The slice timer only
//! runs while a contender (a resident or queued request of at least the
//! active priority) exists; on expiry the active request goes behind its
//! peers with a fresh sequence number.
//!
//! A request stalled on a semaphore hands the engine to its contenders
//! straight away, at most once per progress epoch so that two stalled
//! requests cannot bounce the engine between them without time passing.

use crate::types::RequestId;

use super::engine::EngineSched;
use super::stats::EventKind;
use super::Shared;

impl EngineSched {
    /// Some other request could use the engine at the active priority
    pub(super) fn has_contender(&self, active: RequestId) -> bool {
        let Some(prio) = self.requests.get(&active).map(|req| req.effective()) else {
            return false;
        };
        let resident = self
            .ports
            .iter()
            .skip(1)
            .filter_map(|id| self.requests.get(id))
            .any(|req| req.effective() >= prio);
        resident || self.queue.peek().map_or(false, |head| head.priority >= prio)
    }

    /// Arm or disarm the slice timer for the current port 0
    pub(super) fn update_timeslice(&mut self) {
        let Some(&active) = self.ports.first() else {
            self.slice_deadline = None;
            return;
        };
        let executing = self.requests.get(&active).map_or(false, |req| req.executing);
        if self.props.timeslice_ns == 0 || !executing || !self.has_contender(active) {
            self.slice_deadline = None;
            return;
        }
        if self.slice_deadline.is_none() {
            self.slice_deadline = Some(self.now.saturating_add(self.props.timeslice_ns));
            log::trace!("{}: timeslice armed for {}", self.id, active);
        }
    }

    pub(super) fn expire_timeslice(&mut self, shared: &Shared) {
        let Some(&active) = self.ports.first() else { return };
        log::trace!("{}: timeslice expired for {}", self.id, active);
        self.stats.timeslices += 1;
        self.record(Some(active), EventKind::Timesliced);
        self.rotate(active, shared);
    }

    pub(super) fn may_semaphore_yield(&self, active: RequestId) -> bool {
        self.yield_epoch != Some(self.epoch) && self.has_contender(active)
    }

    pub(super) fn semaphore_yield(&mut self, shared: &Shared) {
        let Some(&active) = self.ports.first() else { return };
        log::trace!("{}: {} yields on semaphore", self.id, active);
        self.yield_epoch = Some(self.epoch);
        self.stats.semaphore_yields += 1;
        self.record(Some(active), EventKind::SemaphoreYield);
        self.rotate(active, shared);
    }

    /// Requeue the active request behind its equal priority peers
    fn rotate(&mut self, active: RequestId, shared: &Shared) {
        if let Some(req) = self.requests.get_mut(&active) {
            req.seq = shared.requests.next_seq();
        }
        self.unwind(active);
        self.kick(shared);
    }
}
