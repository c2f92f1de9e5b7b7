//! Completion fences
//!
//! A fence is signaled exactly once, either cleanly or with an error, and
//! never reverts. Engines register as waiters to be told about the
//! transition; client threads block in [`Fence::wait`].
//!
//! ## Key invariants
//! - The first signal wins; later signals are no-ops and report `false`.
//! - Each registered waiter is handed out by exactly one successful signal.
//! - A waiter registering after the transition is refused, so the caller
//!   observes the final state directly instead of waiting for a message.

use std::fmt;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{SchedResult, EINTR, EIO};
use crate::types::{EngineId, FenceId, Nanos, RequestId};
use crate::wait::{wait_while, Interrupt};

/// Reason a fence was signaled with an error
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FenceError {
    /// Engine reset while the request was resident
    Reset,
    /// Owning context was destroyed or banned
    Cancelled,
    /// Request exceeded the engine watchdog
    Watchdog,
    /// An input dependency completed with an error
    Dependency,
    /// The batch contained an invalid command
    Fault,
}

impl FenceError {
    /// Negative errno reported in the fence status
    pub fn errno(self) -> i32 {
        match self {
            FenceError::Watchdog => -EINTR,
            FenceError::Reset
            | FenceError::Cancelled
            | FenceError::Dependency
            | FenceError::Fault => -EIO,
        }
    }
}

impl fmt::Display for FenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FenceError::Reset => "reset",
            FenceError::Cancelled => "cancelled",
            FenceError::Watchdog => "watchdog",
            FenceError::Dependency => "dependency",
            FenceError::Fault => "fault",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceState {
    Unsignaled,
    Signaled,
    Error(FenceError),
}

impl FenceState {
    pub fn is_signaled(self) -> bool {
        !matches!(self, FenceState::Unsignaled)
    }

    pub fn error(self) -> Option<FenceError> {
        match self {
            FenceState::Error(err) => Some(err),
            _ => None,
        }
    }

    /// sync_file style status: 0 pending, 1 signaled, negative errno
    pub fn status(self) -> i32 {
        match self {
            FenceState::Unsignaled => 0,
            FenceState::Signaled => 1,
            FenceState::Error(err) => err.errno(),
        }
    }
}

/// Engine inbox registration on a fence
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Waiter {
    pub engine: EngineId,
    pub request: RequestId,
}

struct FenceInner {
    state: FenceState,
    signaled_at: Option<Nanos>,
    waiters: Vec<Waiter>,
}

pub struct Fence {
    id: FenceId,
    /// Request whose completion signals this fence; `None` for user fences
    signaler: Option<RequestId>,
    inner: Mutex<FenceInner>,
    cond: Condvar,
}

impl Fence {
    pub fn new(id: FenceId, signaler: Option<RequestId>) -> Self {
        Self {
            id,
            signaler,
            inner: Mutex::new(FenceInner {
                state: FenceState::Unsignaled,
                signaled_at: None,
                waiters: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn id(&self) -> FenceId {
        self.id
    }

    pub fn signaler(&self) -> Option<RequestId> {
        self.signaler
    }

    pub fn state(&self) -> FenceState {
        self.inner.lock().state
    }

    pub fn is_signaled(&self) -> bool {
        self.state().is_signaled()
    }

    pub fn signaled_at(&self) -> Option<Nanos> {
        self.inner.lock().signaled_at
    }

    /// Register an engine waiter.
    ///
    /// Returns the final state instead if the fence has already signaled.
    pub fn add_waiter(&self, waiter: Waiter) -> Result<(), FenceState> {
        let mut inner = self.inner.lock();
        if inner.state.is_signaled() {
            return Err(inner.state);
        }
        inner.waiters.push(waiter);
        Ok(())
    }

    /// Snapshot of registered waiters
    pub fn waiters(&self) -> Vec<Waiter> {
        self.inner.lock().waiters.clone()
    }

    /// Signal the fence at time `now`.
    ///
    /// Returns the waiters to notify, or `None` if the fence was already
    /// signaled.
    pub fn signal(&self, result: Result<(), FenceError>, now: Nanos) -> Option<Vec<Waiter>> {
        let mut inner = self.inner.lock();
        if inner.state.is_signaled() {
            return None;
        }
        inner.state = match result {
            Ok(()) => FenceState::Signaled,
            Err(err) => FenceState::Error(err),
        };
        inner.signaled_at = Some(now);
        let waiters = std::mem::take(&mut inner.waiters);
        drop(inner);
        self.cond.notify_all();
        Some(waiters)
    }

    /// Block until the fence signals
    pub fn wait(&self, timeout: Option<Duration>, interrupt: Option<&Interrupt>) -> SchedResult<FenceState> {
        let mut inner = self.inner.lock();
        wait_while(&self.cond, &mut inner, timeout, interrupt, |inner| {
            inner.state.is_signaled()
        })?;
        Ok(inner.state)
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("id", &self.id)
            .field("signaler", &self.signaler)
            .field("state", &self.state())
            .finish()
    }
}
