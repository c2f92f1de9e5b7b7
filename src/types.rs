//! Core type definitions
//!
//! Identifiers, priorities and engine naming shared by every subsystem of
//! the scheduler.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};

/// Virtual or monotonic time in nanoseconds
pub type Nanos = u64;

pub const NSEC_PER_USEC: Nanos = 1_000;
pub const NSEC_PER_MSEC: Nanos = 1_000_000;
pub const NSEC_PER_SEC: Nanos = 1_000_000_000;

/// Lowest user priority (I915_CONTEXT_MIN_USER_PRIORITY)
pub const MIN_PRIORITY: i32 = -1023;
/// Highest user priority (I915_CONTEXT_MAX_USER_PRIORITY)
pub const MAX_PRIORITY: i32 = 1023;
pub const DEFAULT_PRIORITY: i32 = 0;

/// Hardware submission ports per engine (ELSP depth)
pub const DEFAULT_EXEC_PORTS: usize = 2;
pub const MAX_EXEC_PORTS: usize = 8;

pub const DEFAULT_TIMESLICE_US: u64 = 1_000;
pub const DEFAULT_PREEMPT_TIMEOUT_MS: u64 = 640;

/// Ring sizes are accepted in 4KiB steps between 4KiB and 512KiB
pub const RING_SIZE_GRANULE: u32 = 4 << 10;
pub const RING_SIZE_MIN: u32 = 4 << 10;
pub const RING_SIZE_MAX: u32 = 512 << 10;
pub const DEFAULT_RING_SIZE: u32 = 16 << 10;
/// Clients are throttled once they reach the last page of the ring
pub const RING_RESERVE_BYTES: u32 = 4 << 10;
/// Ring footprint of a single request (breadcrumbs, arbitration, batch start)
pub const REQUEST_RING_BYTES: u32 = 128;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub $inner);

        impl $name {
            pub const fn new(raw: $inner) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Client scheduling/timeline identity
    ContextId(u32),
    "ctx"
);
define_id!(
    /// A single submitted batch
    RequestId(u64),
    "rq"
);
define_id!(
    /// Completion signal, either a request out-fence or a user fence
    FenceId(u64),
    "fence"
);
define_id!(
    /// GPU buffer object
    BufferId(u32),
    "bo"
);
define_id!(
    /// GPU address space
    VmId(u32),
    "vm"
);

// ============================================================================
// Priority
// ============================================================================

/// Scheduling priority, higher runs first
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(i32);

impl Priority {
    pub const MIN: Priority = Priority(MIN_PRIORITY);
    pub const MAX: Priority = Priority(MAX_PRIORITY);
    pub const DEFAULT: Priority = Priority(DEFAULT_PRIORITY);

    /// Validate a user supplied priority
    pub fn new(value: i32) -> SchedResult<Self> {
        if (MIN_PRIORITY..=MAX_PRIORITY).contains(&value) {
            Ok(Self(value))
        } else {
            Err(SchedError::InvalidPriority(value))
        }
    }

    pub const fn get(self) -> i32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Engines
// ============================================================================

/// Hardware engine class
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineClass {
    Render,
    Copy,
    Video,
    VideoEnhance,
    Compute,
}

impl EngineClass {
    pub const COUNT: usize = 5;
    pub const ALL: [EngineClass; Self::COUNT] = [
        EngineClass::Render,
        EngineClass::Copy,
        EngineClass::Video,
        EngineClass::VideoEnhance,
        EngineClass::Compute,
    ];

    /// Short engine name prefix as exposed by the driver
    pub const fn as_str(self) -> &'static str {
        match self {
            EngineClass::Render => "rcs",
            EngineClass::Copy => "bcs",
            EngineClass::Video => "vcs",
            EngineClass::VideoEnhance => "vecs",
            EngineClass::Compute => "ccs",
        }
    }

    pub const fn index(self) -> usize {
        match self {
            EngineClass::Render => 0,
            EngineClass::Copy => 1,
            EngineClass::Video => 2,
            EngineClass::VideoEnhance => 3,
            EngineClass::Compute => 4,
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|class| class.as_str() == prefix)
    }
}

impl fmt::Display for EngineClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical engine: class x instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineId {
    pub class: EngineClass,
    pub instance: u8,
}

impl EngineId {
    pub const fn new(class: EngineClass, instance: u8) -> Self {
        Self { class, instance }
    }

    pub const RCS0: EngineId = EngineId::new(EngineClass::Render, 0);
    pub const BCS0: EngineId = EngineId::new(EngineClass::Copy, 0);
    pub const VCS0: EngineId = EngineId::new(EngineClass::Video, 0);
    pub const VCS1: EngineId = EngineId::new(EngineClass::Video, 1);
    pub const VECS0: EngineId = EngineId::new(EngineClass::VideoEnhance, 0);
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.class.as_str(), self.instance)
    }
}

impl FromStr for EngineId {
    type Err = SchedError;

    /// Parse driver style names such as `rcs0` or `vcs1`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let split = s
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| SchedError::InvalidEngine(s.to_string()))?;
        let (prefix, instance) = s.split_at(split);
        let class = EngineClass::from_prefix(prefix)
            .ok_or_else(|| SchedError::InvalidEngine(s.to_string()))?;
        let instance = instance
            .parse::<u8>()
            .map_err(|_| SchedError::InvalidEngine(s.to_string()))?;
        Ok(EngineId::new(class, instance))
    }
}

/// How a submission names its target engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineSelector {
    /// A specific physical engine
    Physical(EngineId),
    /// Index into the context's engine map
    Index(usize),
    /// Any instance of the class; the least loaded one is chosen at submit
    Class(EngineClass),
}

impl From<EngineId> for EngineSelector {
    fn from(id: EngineId) -> Self {
        EngineSelector::Physical(id)
    }
}

// ============================================================================
// Buffer hazards and status queries
// ============================================================================

/// Declared access to a buffer for implicit dependency tracking
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Read,
    Write,
}

/// One entry of a submission's buffer hazard list
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferAccess {
    pub buffer: BufferId,
    pub access: Access,
}

impl BufferAccess {
    pub const fn read(buffer: BufferId) -> Self {
        Self { buffer, access: Access::Read }
    }

    pub const fn write(buffer: BufferId) -> Self {
        Self { buffer, access: Access::Write }
    }
}

/// Object of a status query
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Request(RequestId),
    Fence(FenceId),
}
