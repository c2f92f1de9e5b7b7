//! Scheduler error types
//!
//! Every rejected API call returns a [`SchedError`] and leaves the scheduler
//! state untouched. GPU hangs and cancellations are not API errors; they are
//! reported through fence error states (see [`crate::fence::FenceError`]).

use crate::types::{BufferId, ContextId, EngineId, FenceId, RequestId, VmId};

// errno values reported by the driver ABI
pub const ENOENT: i32 = 2;
pub const EINTR: i32 = 4;
pub const EIO: i32 = 5;
pub const EAGAIN: i32 = 11;
pub const EFAULT: i32 = 14;
pub const EINVAL: i32 = 22;
pub const ETIME: i32 = 62;

/// Scheduler API errors
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error("Context not found: {0}")]
    ContextNotFound(ContextId),

    #[error("Context {0} is closed")]
    ContextClosed(ContextId),

    #[error("Context {0} is banned")]
    ContextBanned(ContextId),

    #[error("Invalid engine: {0}")]
    InvalidEngine(String),

    #[error("Priority {0} out of range")]
    InvalidPriority(i32),

    #[error("Invalid buffer size: {0} bytes")]
    InvalidBuffer(u64),

    #[error("Buffer not found: {0}")]
    BufferNotFound(BufferId),

    #[error("Offset {offset} out of bounds for {buffer}")]
    BufferOutOfBounds { buffer: BufferId, offset: u32 },

    #[error("Fence not found: {0}")]
    FenceNotFound(FenceId),

    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("VM not found: {0}")]
    VmNotFound(VmId),

    #[error("Batch contains no commands")]
    EmptyBatch,

    #[error("Invalid ring size: {0} bytes")]
    InvalidRingSize(u64),

    #[error("Ring full for {ctx} on {engine}")]
    RingFull { ctx: ContextId, engine: EngineId },

    #[error("Wait interrupted")]
    Interrupted,

    #[error("Wait timed out")]
    TimedOut,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl SchedError {
    /// Negative errno as the driver ABI would report it
    pub fn errno(&self) -> i32 {
        let errno = match self {
            SchedError::ContextNotFound(_)
            | SchedError::BufferNotFound(_)
            | SchedError::FenceNotFound(_)
            | SchedError::RequestNotFound(_)
            | SchedError::VmNotFound(_) => ENOENT,
            SchedError::ContextClosed(_) => ENOENT,
            SchedError::ContextBanned(_) => EIO,
            SchedError::BufferOutOfBounds { .. } => EFAULT,
            SchedError::RingFull { .. } => EAGAIN,
            SchedError::Interrupted => EINTR,
            SchedError::TimedOut => ETIME,
            SchedError::Io(_) => EIO,
            SchedError::InvalidEngine(_)
            | SchedError::InvalidPriority(_)
            | SchedError::InvalidBuffer(_)
            | SchedError::EmptyBatch
            | SchedError::InvalidRingSize(_)
            | SchedError::Config(_)
            | SchedError::Toml(_) => EINVAL,
        };
        -errno
    }

    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedError::RingFull { .. } | SchedError::Interrupted | SchedError::TimedOut
        )
    }
}

pub type SchedResult<T> = Result<T, SchedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(SchedError::InvalidPriority(2000).errno(), -EINVAL);
        assert_eq!(SchedError::ContextBanned(ContextId(1)).errno(), -EIO);
        assert_eq!(SchedError::Interrupted.errno(), -EINTR);
        let full = SchedError::RingFull {
            ctx: ContextId(1),
            engine: EngineId::RCS0,
        };
        assert_eq!(full.errno(), -EAGAIN);
        assert!(full.is_retryable());
        assert!(!SchedError::EmptyBatch.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = SchedError::RingFull {
            ctx: ContextId(3),
            engine: EngineId::VCS1,
        };
        assert_eq!(err.to_string(), "Ring full for ctx3 on vcs1");
    }
}
