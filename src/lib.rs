//! NexaOS GPU Scheduler
//!
//! A model of a multi-engine GPU command-submission scheduler. Clients
//! create contexts, submit batches to engines and synchronize through
//! fences; the scheduler decides which request each engine runs, and when.
//!
//! Batches are executed by a small command interpreter (compute, dword
//! stores, semaphore waits, spins) against shared buffer objects, so the
//! observable effect of a schedule is the final buffer contents and the
//! fence states.
//!
//! ## Overview
//!
//! - [`Scheduler`]: the engines, contexts, buffers and fences
//! - [`SchedulerRuntime`]: one thread per engine on the monotonic clock
//! - [`ContextGuard`], [`EnginePropertyGuard`]: scoped cleanup
//! - [`scenario`]: declarative TOML scenarios (feature `scenario`)
//!
//! Time is virtual by default: nothing moves until [`Scheduler::advance`]
//! or [`Scheduler::run_until_idle`] is called, which makes every run
//! deterministic.

pub mod batch;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod fence;
pub mod guard;
pub mod logger;
pub mod request;
pub mod runtime;
#[cfg(feature = "scenario")]
pub mod scenario;
pub mod scheduler;
pub mod types;
pub mod wait;

pub use batch::{Batch, Command};
pub use buffer::BufferBusy;
pub use clock::Clock;
pub use config::{ContextDefaults, EngineConfig, EngineDefaults, SchedulerConfig};
pub use context::{ContextParams, ContextRuntime};
pub use error::{SchedError, SchedResult};
pub use fence::{FenceError, FenceState};
pub use guard::{ContextGuard, EnginePropertyGuard};
pub use request::{RequestState, Status};
pub use runtime::SchedulerRuntime;
pub use scheduler::{
    EngineEvent, EngineProperty, EngineProps, EngineState, EngineStats, EventKind, ExecBuffer,
    Scheduler, Submission,
};
pub use types::{
    Access, BufferAccess, BufferId, ContextId, EngineClass, EngineId, EngineSelector, FenceId,
    Nanos, Priority, RequestId, Target, VmId,
};
pub use wait::Interrupt;
