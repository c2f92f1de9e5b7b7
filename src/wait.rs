//! Interruptible blocking waits
//!
//! Clients block in two places only: waiting for ring space and waiting on
//! a fence. Both waits are bounded by an optional timeout and can be broken
//! by an [`Interrupt`] token from another thread, which stands in for a
//! signal delivered to a blocked ioctl.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, MutexGuard};

use crate::error::{SchedError, SchedResult};

/// Poll interval used to notice interrupts while parked on a condvar
const INTERRUPT_POLL: Duration = Duration::from_millis(5);

/// Cancellation token shared between a waiter and its interrupter
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Block on `cond` until `done` holds, the timeout elapses or the interrupt
/// fires. `done` is evaluated with the lock held.
pub(crate) fn wait_while<T, F>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    timeout: Option<Duration>,
    interrupt: Option<&Interrupt>,
    mut done: F,
) -> SchedResult<()>
where
    F: FnMut(&mut T) -> bool,
{
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if done(&mut **guard) {
            return Ok(());
        }
        if interrupt.map_or(false, Interrupt::is_triggered) {
            return Err(SchedError::Interrupted);
        }
        let mut park = INTERRUPT_POLL;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Err(SchedError::TimedOut);
            }
            park = park.min(deadline - now);
        }
        cond.wait_for(guard, park);
    }
}
