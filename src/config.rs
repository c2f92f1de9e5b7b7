//! Scheduler configuration
//!
//! Loaded from TOML. Every field has a default, so an empty document gives
//! the stock topology: rcs0, bcs0, vcs0, vcs1 and vecs0 with two execution
//! ports, a 1ms timeslice and a 640ms preempt timeout.
//!
//! ```toml
//! tick_us = 100
//! semaphores = true
//!
//! [engine_defaults]
//! timeslice_us = 1000
//! preempt_timeout_ms = 640
//!
//! [[engines]]
//! class = "render"
//! instance = 0
//! watchdog_ms = 200
//!
//! [context_defaults]
//! priority = 0
//! persistent = true
//! ```

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::context::validate_ring_size;
use crate::error::{SchedError, SchedResult};
use crate::scheduler::EngineProps;
use crate::types::{
    EngineClass, EngineId, Nanos, Priority, DEFAULT_EXEC_PORTS, DEFAULT_PREEMPT_TIMEOUT_MS, DEFAULT_RING_SIZE,
    DEFAULT_TIMESLICE_US, MAX_EXEC_PORTS, NSEC_PER_MSEC, NSEC_PER_USEC,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Granularity of virtual time stepping across engines
    pub tick_us: u64,
    /// Allow early queueing of requests behind remote signalers
    pub semaphores: bool,
    /// Events kept per engine
    pub event_history: usize,
    pub engine_defaults: EngineDefaults,
    pub engines: Vec<EngineConfig>,
    pub context_defaults: ContextDefaults,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let engines = [
            EngineId::RCS0,
            EngineId::BCS0,
            EngineId::VCS0,
            EngineId::VCS1,
            EngineId::VECS0,
        ]
        .into_iter()
        .map(EngineConfig::new)
        .collect();

        Self {
            tick_us: 100,
            semaphores: true,
            event_history: 1024,
            engine_defaults: EngineDefaults::default(),
            engines,
            context_defaults: ContextDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineDefaults {
    pub ports: usize,
    /// 0 disables timeslicing
    pub timeslice_us: u64,
    pub preempt_timeout_ms: u64,
    pub preemption: bool,
    /// 0 disables the watchdog
    pub watchdog_ms: u64,
    /// Let an active request finish instead of preempting when this close
    pub preempt_grace_us: u64,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            ports: DEFAULT_EXEC_PORTS,
            timeslice_us: DEFAULT_TIMESLICE_US,
            preempt_timeout_ms: DEFAULT_PREEMPT_TIMEOUT_MS,
            preemption: true,
            watchdog_ms: 0,
            preempt_grace_us: 0,
        }
    }
}

/// One physical engine, with optional overrides of the defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub class: EngineClass,
    #[serde(default)]
    pub instance: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeslice_us: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preempt_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preemption: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preempt_grace_us: Option<u64>,
}

impl EngineConfig {
    pub fn new(id: EngineId) -> Self {
        Self {
            class: id.class,
            instance: id.instance,
            ports: None,
            timeslice_us: None,
            preempt_timeout_ms: None,
            preemption: None,
            watchdog_ms: None,
            preempt_grace_us: None,
        }
    }

    pub fn id(&self) -> EngineId {
        EngineId::new(self.class, self.instance)
    }

    /// Merge overrides onto the defaults
    pub fn resolve(&self, defaults: &EngineDefaults) -> SchedResult<EngineProps> {
        let id = self.id();
        let watchdog_ms = self.watchdog_ms.unwrap_or(defaults.watchdog_ms);
        Ok(EngineProps {
            ports: self.ports.unwrap_or(defaults.ports),
            timeslice_ns: to_ns(
                id,
                "timeslice_us",
                self.timeslice_us.unwrap_or(defaults.timeslice_us),
                NSEC_PER_USEC,
            )?,
            preempt_timeout_ns: to_ns(
                id,
                "preempt_timeout_ms",
                self.preempt_timeout_ms.unwrap_or(defaults.preempt_timeout_ms),
                NSEC_PER_MSEC,
            )?,
            preemption: self.preemption.unwrap_or(defaults.preemption),
            watchdog_ns: match watchdog_ms {
                0 => None,
                ms => Some(to_ns(id, "watchdog_ms", ms, NSEC_PER_MSEC)?),
            },
            grace_ns: to_ns(
                id,
                "preempt_grace_us",
                self.preempt_grace_us.unwrap_or(defaults.preempt_grace_us),
                NSEC_PER_USEC,
            )?,
        })
    }
}

/// Scale a configured duration to nanoseconds, refusing values that overflow
fn to_ns(engine: impl fmt::Display, field: &str, value: u64, unit: Nanos) -> SchedResult<Nanos> {
    value
        .checked_mul(unit)
        .ok_or_else(|| SchedError::Config(format!("{}: {} = {} is out of range", engine, field, value)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextDefaults {
    pub priority: i32,
    pub persistent: bool,
    pub bannable: bool,
    pub ring_size: u32,
}

impl Default for ContextDefaults {
    fn default() -> Self {
        Self {
            priority: Priority::DEFAULT.get(),
            persistent: true,
            bannable: true,
            ring_size: DEFAULT_RING_SIZE,
        }
    }
}

impl SchedulerConfig {
    pub fn from_toml_str(s: &str) -> SchedResult<Self> {
        let config: SchedulerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> SchedResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        log::info!("Loaded scheduler config from {}", path.display());
        Ok(config)
    }

    pub fn to_toml_string(&self) -> SchedResult<String> {
        toml::to_string_pretty(self).map_err(|e| SchedError::Config(e.to_string()))
    }

    pub fn validate(&self) -> SchedResult<()> {
        if self.tick_us == 0 {
            return Err(SchedError::Config("tick_us must be non-zero".into()));
        }
        to_ns("scheduler", "tick_us", self.tick_us, NSEC_PER_USEC)?;
        if self.engines.is_empty() {
            return Err(SchedError::Config("at least one engine is required".into()));
        }

        let mut seen = HashSet::new();
        for engine in &self.engines {
            let id = engine.id();
            if !seen.insert(id) {
                return Err(SchedError::Config(format!("duplicate engine {}", id)));
            }
            let ports = engine.ports.unwrap_or(self.engine_defaults.ports);
            if ports == 0 || ports > MAX_EXEC_PORTS {
                return Err(SchedError::Config(format!(
                    "{}: ports must be within 1..={}",
                    id, MAX_EXEC_PORTS
                )));
            }
            engine.resolve(&self.engine_defaults)?;
        }

        Priority::new(self.context_defaults.priority)?;
        validate_ring_size(self.context_defaults.ring_size as u64)?;
        Ok(())
    }

    pub fn engine_ids(&self) -> Vec<EngineId> {
        self.engines.iter().map(EngineConfig::id).collect()
    }

    /// Single engine topology, convenient for focused tests
    pub fn single(id: EngineId) -> Self {
        Self {
            engines: vec![EngineConfig::new(id)],
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config = SchedulerConfig::from_toml_str("").unwrap();
        assert_eq!(config, SchedulerConfig::default());
        assert_eq!(config.engines.len(), 5);
    }

    #[test]
    fn test_engine_overrides() {
        let config = SchedulerConfig::from_toml_str(
            r#"
            tick_us = 50

            [engine_defaults]
            timeslice_us = 2000

            [[engines]]
            class = "render"
            watchdog_ms = 100
            preemption = false

            [[engines]]
            class = "video"
            instance = 1
            ports = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.engine_ids(), vec![EngineId::RCS0, EngineId::VCS1]);
        let rcs = config.engines[0].resolve(&config.engine_defaults).unwrap();
        assert_eq!(rcs.timeslice_ns, 2 * NSEC_PER_MSEC);
        assert_eq!(rcs.watchdog_ns, Some(100 * NSEC_PER_MSEC));
        assert!(!rcs.preemption);
        let vcs = config.engines[1].resolve(&config.engine_defaults).unwrap();
        assert_eq!(vcs.ports, 1);
        assert_eq!(vcs.watchdog_ns, None);
    }

    #[test]
    fn test_validation_errors() {
        let dup = r#"
            [[engines]]
            class = "copy"
            [[engines]]
            class = "copy"
        "#;
        assert!(matches!(SchedulerConfig::from_toml_str(dup), Err(SchedError::Config(_))));

        let ring = "[context_defaults]\nring_size = 1000\n";
        assert!(matches!(
            SchedulerConfig::from_toml_str(ring),
            Err(SchedError::InvalidRingSize(1000))
        ));

        assert!(matches!(
            SchedulerConfig::from_toml_str("tick_us = 'x'"),
            Err(SchedError::Toml(_))
        ));

        for huge in [
            "tick_us = 18446744073709551",
            "[engine_defaults]\npreempt_timeout_ms = 18446744073709551",
            "[engine_defaults]\ntimeslice_us = 18446744073709551",
            "[engine_defaults]\npreempt_grace_us = 18446744073709551",
            "[[engines]]\nclass = \"render\"\nwatchdog_ms = 18446744073709551",
        ] {
            assert!(
                matches!(SchedulerConfig::from_toml_str(huge), Err(SchedError::Config(_))),
                "accepted {:?}",
                huge
            );
        }
    }

    #[test]
    fn test_out_of_range_duration_refused_by_scheduler() {
        let mut config = SchedulerConfig::default();
        config.engine_defaults.preempt_timeout_ms = u64::MAX / 1000;
        assert!(matches!(
            crate::scheduler::Scheduler::new(config),
            Err(SchedError::Config(_))
        ));
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = SchedulerConfig::single(EngineId::VECS0);
        let text = config.to_toml_string().unwrap();
        assert_eq!(SchedulerConfig::from_toml_str(&text).unwrap(), config);
    }
}
