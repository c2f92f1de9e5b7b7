//! Engine statistics and event history
//!
//! Counters are cumulative for the lifetime of the scheduler. The event
//! history is a bounded ring; the oldest entries are dropped first.

use std::collections::VecDeque;

use crate::fence::FenceError;
use crate::types::{EngineId, Nanos, Priority, RequestId};

/// Per-engine scheduling counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub submitted: u64,
    pub completed: u64,
    pub errored: u64,
    /// Port 0 switched to a different request
    pub context_switches: u64,
    pub preemptions: u64,
    pub preempt_timeouts: u64,
    pub timeslices: u64,
    pub semaphore_yields: u64,
    pub promotions: u64,
    pub resets: u64,
    pub watchdog_expiries: u64,
    pub busy_ns: Nanos,
    pub idle_ns: Nanos,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Submitted,
    /// Moved into the ready queue
    Queued,
    /// Placed into an execution port
    Dispatched { port: usize },
    /// First run time in this residency
    Started,
    Completed,
    Errored(FenceError),
    Preempted,
    Timesliced,
    SemaphoreYield,
    Promoted(Priority),
    Reset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineEvent {
    pub at: Nanos,
    pub request: Option<RequestId>,
    pub kind: EventKind,
}

#[derive(Debug)]
pub(crate) struct EventLog {
    events: VecDeque<EngineEvent>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn push(&mut self, at: Nanos, request: Option<RequestId>, kind: EventKind) {
        if self.capacity == 0 {
            return;
        }
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(EngineEvent { at, request, kind });
    }

    pub fn snapshot(&self) -> Vec<EngineEvent> {
        self.events.iter().copied().collect()
    }
}

/// Log a one-line summary of an engine's counters
pub fn log_summary(engine: EngineId, stats: &EngineStats) {
    log::info!(
        "{:<6} submitted={:<6} completed={:<6} errored={:<4} switches={:<6} preempt={:<4} slices={:<6} sema={:<4} resets={:<3} busy={}us idle={}us",
        engine.to_string(),
        stats.submitted,
        stats.completed,
        stats.errored,
        stats.context_switches,
        stats.preemptions,
        stats.timeslices,
        stats.semaphore_yields,
        stats.resets,
        stats.busy_ns / 1_000,
        stats.idle_ns / 1_000,
    );
}
