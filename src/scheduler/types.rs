//! Scheduler type definitions
//!
//! Engine states and tunables, and the submission records exchanged with
//! clients.

use std::time::Duration;

use crate::batch::Batch;
use crate::clock::duration_to_ns;
use crate::types::{
    BufferAccess, BufferId, ContextId, EngineId, EngineSelector, FenceId, Nanos, Priority, RequestId,
};

/// Engine execution state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// No resident requests
    Idle,
    /// Ports occupied, port 0 has not run yet
    Loaded,
    /// Port 0 executing
    Running,
    /// Waiting for the active request to reach an arbitration point
    Preempting,
    /// Retiring the active request
    Completing,
}

/// Per-engine tunables
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineProps {
    /// Execution port depth
    pub ports: usize,
    /// 0 disables timeslicing
    pub timeslice_ns: Nanos,
    pub preempt_timeout_ns: Nanos,
    pub preemption: bool,
    pub watchdog_ns: Option<Nanos>,
    /// Remaining compute under which an active request is left to finish
    pub grace_ns: Nanos,
}

/// Runtime adjustable engine property, carrying its value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineProperty {
    Timeslice(Duration),
    PreemptTimeout(Duration),
    Preemption(bool),
    Watchdog(Option<Duration>),
    PreemptGrace(Duration),
}

impl EngineProperty {
    /// Store the new value into `props`, returning the previous one
    pub(crate) fn apply(self, props: &mut EngineProps) -> EngineProperty {
        match self {
            EngineProperty::Timeslice(d) => {
                let old = Duration::from_nanos(props.timeslice_ns);
                props.timeslice_ns = duration_to_ns(d);
                EngineProperty::Timeslice(old)
            }
            EngineProperty::PreemptTimeout(d) => {
                let old = Duration::from_nanos(props.preempt_timeout_ns);
                props.preempt_timeout_ns = duration_to_ns(d);
                EngineProperty::PreemptTimeout(old)
            }
            EngineProperty::Preemption(enabled) => {
                let old = props.preemption;
                props.preemption = enabled;
                EngineProperty::Preemption(old)
            }
            EngineProperty::Watchdog(d) => {
                let old = props.watchdog_ns.map(Duration::from_nanos);
                props.watchdog_ns = d.map(duration_to_ns).filter(|ns| *ns > 0);
                EngineProperty::Watchdog(old)
            }
            EngineProperty::PreemptGrace(d) => {
                let old = Duration::from_nanos(props.grace_ns);
                props.grace_ns = duration_to_ns(d);
                EngineProperty::PreemptGrace(old)
            }
        }
    }
}

/// A batch submission
#[derive(Clone, Debug)]
pub struct ExecBuffer {
    pub ctx: ContextId,
    pub engine: EngineSelector,
    /// Overrides the context priority for this request only
    pub priority: Option<Priority>,
    pub fences_in: Vec<FenceId>,
    /// Fences of requests that only need to have started executing
    pub submit_fences: Vec<FenceId>,
    pub buffers: Vec<BufferAccess>,
    pub batch: Batch,
}

impl ExecBuffer {
    pub fn new(ctx: ContextId, engine: impl Into<EngineSelector>, batch: Batch) -> Self {
        Self {
            ctx,
            engine: engine.into(),
            priority: None,
            fences_in: Vec::new(),
            submit_fences: Vec::new(),
            buffers: Vec::new(),
            batch,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn fence_in(mut self, fence: FenceId) -> Self {
        self.fences_in.push(fence);
        self
    }

    /// Hold the request until the request behind `fence` starts, rather
    /// than until it completes. A user fence gates on its signal.
    pub fn submit_fence(mut self, fence: FenceId) -> Self {
        self.submit_fences.push(fence);
        self
    }

    pub fn read(mut self, buffer: BufferId) -> Self {
        self.buffers.push(BufferAccess::read(buffer));
        self
    }

    pub fn write(mut self, buffer: BufferId) -> Self {
        self.buffers.push(BufferAccess::write(buffer));
        self
    }
}

/// Handle returned by a successful submission
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Submission {
    pub request: RequestId,
    pub fence: FenceId,
    pub engine: EngineId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NSEC_PER_MSEC;

    #[test]
    fn test_property_apply_returns_old() {
        let mut props = EngineProps {
            ports: 2,
            timeslice_ns: NSEC_PER_MSEC,
            preempt_timeout_ns: 640 * NSEC_PER_MSEC,
            preemption: true,
            watchdog_ns: None,
            grace_ns: 0,
        };

        let old = EngineProperty::Timeslice(Duration::ZERO).apply(&mut props);
        assert_eq!(old, EngineProperty::Timeslice(Duration::from_millis(1)));
        assert_eq!(props.timeslice_ns, 0);

        let old = EngineProperty::Watchdog(Some(Duration::from_millis(5))).apply(&mut props);
        assert_eq!(old, EngineProperty::Watchdog(None));
        assert_eq!(props.watchdog_ns, Some(5 * NSEC_PER_MSEC));

        // a zero watchdog means disabled
        EngineProperty::Watchdog(Some(Duration::ZERO)).apply(&mut props);
        assert_eq!(props.watchdog_ns, None);
    }
}
