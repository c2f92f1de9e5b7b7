//! Requests
//!
//! A request is split in two: [`RequestShared`] is the reference counted
//! handle visible to clients, buffers and other engines, while [`Request`]
//! is the scheduling record owned exclusively by its engine.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::batch::{Batch, Cursor};
use crate::context::ContextShared;
use crate::fence::{Fence, FenceError, FenceState};
use crate::types::{ContextId, EngineId, FenceId, Nanos, Priority, RequestId};

/// Request lifecycle as seen by its engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestState {
    /// Waiting for input fences
    Pending = 0,
    /// In the ready queue
    Ready = 1,
    /// Occupying an execution port without having run in this residency
    Resident = 2,
    /// Executing on port 0
    Running = 3,
    Completed = 4,
    Error = 5,
}

impl RequestState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RequestState::Pending,
            1 => RequestState::Ready,
            2 => RequestState::Resident,
            3 => RequestState::Running,
            4 => RequestState::Completed,
            _ => RequestState::Error,
        }
    }
}

/// Result of a status query
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Pending,
    Ready,
    Running,
    Completed,
    Error(FenceError),
}

impl Status {
    pub fn is_complete(self) -> bool {
        matches!(self, Status::Completed | Status::Error(_))
    }
}

impl From<FenceState> for Status {
    fn from(state: FenceState) -> Self {
        match state {
            FenceState::Unsignaled => Status::Pending,
            FenceState::Signaled => Status::Completed,
            FenceState::Error(err) => Status::Error(err),
        }
    }
}

/// Client visible half of a request
pub struct RequestShared {
    pub id: RequestId,
    pub ctx: ContextId,
    pub engine: EngineId,
    pub fence: Arc<Fence>,
    pub submitted_at: Nanos,
    state: AtomicU8,
    /// Has executed at least once
    started: AtomicBool,
    spin_ended: AtomicBool,
    effective: AtomicI32,
    runtime_ns: AtomicU64,
}

impl RequestShared {
    pub fn new(
        id: RequestId,
        ctx: ContextId,
        engine: EngineId,
        fence: Arc<Fence>,
        priority: Priority,
        now: Nanos,
    ) -> Self {
        Self {
            id,
            ctx,
            engine,
            fence,
            submitted_at: now,
            state: AtomicU8::new(RequestState::Pending as u8),
            started: AtomicBool::new(false),
            spin_ended: AtomicBool::new(false),
            effective: AtomicI32::new(priority.get()),
            runtime_ns: AtomicU64::new(0),
        }
    }

    pub fn fence_id(&self) -> FenceId {
        self.fence.id()
    }

    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: RequestState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Returns true on the first call only
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    pub fn is_complete(&self) -> bool {
        self.fence.is_signaled()
    }

    pub fn end_spin(&self) {
        self.spin_ended.store(true, Ordering::Release);
    }

    pub fn spin_ended(&self) -> bool {
        self.spin_ended.load(Ordering::Acquire)
    }

    /// Effective priority last published by the owning engine
    pub fn effective_priority(&self) -> Priority {
        Priority::new(self.effective.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub(crate) fn publish_priority(&self, prio: Priority) {
        self.effective.store(prio.get(), Ordering::Release);
    }

    pub fn runtime_ns(&self) -> Nanos {
        self.runtime_ns.load(Ordering::Relaxed)
    }

    pub(crate) fn add_runtime(&self, ns: Nanos) {
        self.runtime_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn status(&self) -> Status {
        match self.fence.state() {
            FenceState::Signaled => return Status::Completed,
            FenceState::Error(err) => return Status::Error(err),
            FenceState::Unsignaled => {}
        }
        match self.state() {
            RequestState::Pending => Status::Pending,
            RequestState::Ready | RequestState::Resident => Status::Ready,
            RequestState::Running => Status::Running,
            // completion publishes the fence before the state
            RequestState::Completed | RequestState::Error => Status::Running,
        }
    }
}

impl fmt::Debug for RequestShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestShared")
            .field("id", &self.id)
            .field("ctx", &self.ctx)
            .field("engine", &self.engine)
            .field("state", &self.state())
            .finish()
    }
}

/// How a dependency gates its request, weakest first
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum DepKind {
    /// Satisfied once the signaler begins executing
    Submit,
    /// Previous request on the timeline: orders execution, errors are not
    /// inherited
    Timeline,
    /// Waits for the fence; an error completes the request with `Dependency`
    Signal,
}

/// Input dependency of a request
pub(crate) struct Dependency {
    pub fence: Arc<Fence>,
    /// Request signaling the fence, when it is a request out-fence
    pub signaler: Option<Arc<RequestShared>>,
    pub signaled: bool,
    pub kind: DepKind,
}

impl Dependency {
    pub fn inherits_error(&self) -> bool {
        self.kind != DepKind::Timeline
    }

    /// The signaler already started, which is all a submit fence needs
    pub fn satisfied_by_start(&self) -> bool {
        self.kind == DepKind::Submit && self.signaler.as_ref().map_or(false, |s| s.is_started())
    }
}

/// Where the engine currently keeps a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Slot {
    Pending,
    Queued,
    Port,
}

/// Engine-owned scheduling record
pub(crate) struct Request {
    pub shared: Arc<RequestShared>,
    pub context: Arc<ContextShared>,
    pub base: Priority,
    /// Submission carried its own priority; context changes leave it alone
    pub pinned: bool,
    /// Floor raised by waiters; never lowered while the request lives
    pub inherited: Priority,
    pub seq: u64,
    pub deps: Vec<Dependency>,
    pub unsignaled: usize,
    pub dep_error: bool,
    /// Queued before its dependencies signaled
    pub semaphore: bool,
    pub batch: Batch,
    pub cursor: Cursor,
    pub slot: Slot,
    /// Has received run time in the current residency
    pub executing: bool,
    pub first_start: Option<Nanos>,
    /// Error to complete with once evicted from the engine
    pub cancel: Option<FenceError>,
}

impl Request {
    pub fn id(&self) -> RequestId {
        self.shared.id
    }

    pub fn effective(&self) -> Priority {
        self.base.max(self.inherited)
    }

    pub fn is_ready(&self) -> bool {
        self.unsignaled == 0
    }

    /// Unsignaled dependencies that prevent execution
    pub fn blockers(&self) -> impl Iterator<Item = &Dependency> + '_ {
        self.deps.iter().filter(|dep| !dep.signaled)
    }
}
