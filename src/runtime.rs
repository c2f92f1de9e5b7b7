//! Threaded scheduler runtime
//!
//! Drives a monotonic-clock [`Scheduler`] with one worker thread per engine.
//! Each worker repeatedly steps its engine to the current wall time and
//! sleeps for one tick, so engines progress concurrently and only meet
//! through fences and the shared tables.
//!
//! ```text
//!   client threads             engine workers
//!   ┌────────────┐             ┌──────────────┐
//!   │ submit()   │──lock──────▶│ rcs0 step    │
//!   │ wait_fence │             ├──────────────┤
//!   │ ...        │──lock──────▶│ bcs0 step    │──inbox msgs──▶ other engines
//!   └────────────┘             └──────────────┘
//! ```
//!
//! Completed requests stay queryable until [`Scheduler::retire`] drops
//! them. Long running clients either call it themselves or start the
//! runtime with [`SchedulerRuntime::start_with_retire`], which adds a
//! housekeeping thread retiring on a fixed period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{SchedError, SchedResult};
use crate::scheduler::Scheduler;
use crate::types::NSEC_PER_USEC;

pub struct SchedulerRuntime {
    sched: Arc<Scheduler>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for SchedulerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerRuntime")
            .field("workers", &self.workers.len())
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl SchedulerRuntime {
    /// Spawn the engine workers. The scheduler must run on the monotonic
    /// clock; a virtual clock never moves on its own.
    pub fn start(sched: Arc<Scheduler>) -> SchedResult<Self> {
        Self::spawn(sched, None)
    }

    /// Like [`SchedulerRuntime::start`], also retiring completed requests
    /// every `period`
    pub fn start_with_retire(sched: Arc<Scheduler>, period: Duration) -> SchedResult<Self> {
        if period.is_zero() {
            return Err(SchedError::Config("retire period must be non-zero".into()));
        }
        Self::spawn(sched, Some(period))
    }

    fn spawn(sched: Arc<Scheduler>, retire_every: Option<Duration>) -> SchedResult<Self> {
        if sched.clock().is_virtual() {
            return Err(SchedError::Config(
                "threaded runtime requires a monotonic clock".into(),
            ));
        }

        let tick = Duration::from_nanos(sched.config().tick_us * NSEC_PER_USEC);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(sched.engine_count());

        log::info!(
            "Starting scheduler runtime with {} engine workers{}",
            sched.engine_count(),
            if retire_every.is_some() { " and periodic retire" } else { "" }
        );

        let mut jobs: Vec<(String, Box<dyn FnMut() + Send>, Duration)> = Vec::new();
        for (idx, engine) in sched.engines().into_iter().enumerate() {
            let worker_sched = Arc::clone(&sched);
            jobs.push((
                format!("gpusched-{}", engine),
                Box::new(move || worker_sched.step_engine(idx, worker_sched.now())),
                tick,
            ));
        }
        if let Some(period) = retire_every {
            let retire_sched = Arc::clone(&sched);
            jobs.push((
                "gpusched-retire".to_string(),
                Box::new(move || {
                    retire_sched.retire();
                }),
                period,
            ));
        }

        for (name, mut job, period) in jobs {
            let worker_shutdown = Arc::clone(&shutdown);
            let spawned = thread::Builder::new().name(name).spawn(move || {
                while !worker_shutdown.load(Ordering::Acquire) {
                    job();
                    thread::sleep(period);
                }
                log::debug!("{} exiting", thread::current().name().unwrap_or("worker"));
            });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    shutdown.store(true, Ordering::Release);
                    for handle in workers.drain(..) {
                        let _ = handle.join();
                    }
                    return Err(err.into());
                }
            }
        }

        Ok(Self {
            sched,
            workers,
            shutdown,
        })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire)
    }

    /// Stop and join every worker
    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        log::info!("Scheduler runtime stopped");
        self.sched.log_stats();
    }
}

impl Drop for SchedulerRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;

    #[test]
    fn test_rejects_virtual_clock() {
        let sched = Arc::new(Scheduler::new(SchedulerConfig::default()).unwrap());
        assert!(matches!(SchedulerRuntime::start(sched), Err(SchedError::Config(_))));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let sched = Arc::new(Scheduler::new_monotonic(SchedulerConfig::default()).unwrap());
        let mut rt = SchedulerRuntime::start(sched).unwrap();
        assert!(rt.is_running());
        rt.shutdown();
        rt.shutdown();
        assert!(!rt.is_running());
    }
}
