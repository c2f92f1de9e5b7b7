//! Declarative scheduling scenarios
//!
//! A scenario is a TOML document naming contexts, buffers and user fences,
//! a list of steps (submissions, fence signals, time advances, priority
//! changes, hangs...) and a list of expectations checked once the steps
//! have run. Scenarios always run on a virtual clock, so their outcome is
//! reproducible.
//!
//! ```toml
//! name = "fifo"
//!
//! [[contexts]]
//! name = "a"
//!
//! [[buffers]]
//! name = "out"
//!
//! [[steps]]
//! op = "submit"
//! label = "first"
//! ctx = "a"
//! engine = "rcs0"
//! writes = ["out"]
//! batch = [{ op = "store", buffer = "out", value = 1 }]
//!
//! [[steps]]
//! op = "run_until_idle"
//! max_ms = 10
//!
//! [[expect]]
//! kind = "buffer"
//! buffer = "out"
//! value = 1
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::batch::Batch;
use crate::config::SchedulerConfig;
use crate::context::ContextParams;
use crate::error::{SchedError, SchedResult};
use crate::fence::FenceError;
use crate::request::Status;
use crate::scheduler::{EngineProperty, EngineStats, ExecBuffer, Scheduler, Submission};
use crate::types::{
    BufferId, ContextId, EngineClass, EngineId, EngineSelector, FenceId, Nanos, Priority, Target,
    NSEC_PER_USEC,
};

fn default_buffer_size() -> u64 {
    4096
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: SchedulerConfig,
    #[serde(default)]
    pub contexts: Vec<ContextSpec>,
    #[serde(default)]
    pub buffers: Vec<BufferSpec>,
    /// User fences, by name
    #[serde(default)]
    pub fences: Vec<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub expect: Vec<Expect>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextSpec {
    pub name: String,
    pub priority: Option<i32>,
    pub persistent: Option<bool>,
    pub bannable: Option<bool>,
    pub ring_size: Option<u32>,
    /// Engine map, e.g. `["vcs0", "vcs1"]`
    pub engines: Option<Vec<String>>,
    /// Share the address space of an earlier context
    pub share_vm_with: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferSpec {
    pub name: String,
    #[serde(default = "default_buffer_size")]
    pub size: u64,
    /// Initial dword values from offset 0, written from the CPU
    #[serde(default)]
    pub init: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum CommandSpec {
    Compute {
        us: u64,
    },
    Store {
        buffer: String,
        #[serde(default)]
        offset: u32,
        value: u32,
    },
    WaitEq {
        buffer: String,
        #[serde(default)]
        offset: u32,
        value: u32,
    },
    Spin,
    Invalid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    Submit {
        label: Option<String>,
        ctx: String,
        /// `rcs0` for a physical engine, `vcs` for balanced submission to a
        /// class, or an engine map index
        engine: String,
        priority: Option<i32>,
        #[serde(default)]
        fences_in: Vec<String>,
        /// Fences of earlier submissions, by label
        #[serde(default)]
        after: Vec<String>,
        /// Earlier submissions, by label, that must have started
        #[serde(default)]
        submit_after: Vec<String>,
        #[serde(default)]
        reads: Vec<String>,
        #[serde(default)]
        writes: Vec<String>,
        batch: Vec<CommandSpec>,
        #[serde(default)]
        no_preempt: bool,
    },
    Signal {
        fence: String,
        error: Option<FenceError>,
    },
    Advance {
        us: u64,
    },
    RunUntilIdle {
        max_ms: u64,
    },
    SetPriority {
        ctx: String,
        priority: i32,
    },
    DestroyContext {
        ctx: String,
    },
    CancelContext {
        ctx: String,
    },
    Hang {
        engine: String,
    },
    EndSpin {
        request: String,
    },
    SetProperty {
        engine: String,
        timeslice_us: Option<u64>,
        preempt_timeout_ms: Option<u64>,
        preemption: Option<bool>,
        watchdog_ms: Option<u64>,
    },
    Retire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSpec {
    Pending,
    Ready,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Expect {
    Buffer {
        buffer: String,
        #[serde(default)]
        offset: u32,
        value: u32,
    },
    Status {
        request: String,
        status: StatusSpec,
        error: Option<FenceError>,
    },
    /// Labels completed on `engine` in this relative order
    Order {
        engine: String,
        requests: Vec<String>,
    },
    Banned {
        ctx: String,
        banned: bool,
    },
    /// Submission was refused
    Rejected {
        request: String,
    },
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub description: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub name: String,
    /// Virtual time consumed by the run
    pub elapsed: Nanos,
    pub checks: Vec<CheckResult>,
    pub stats: Vec<(EngineId, EngineStats)>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> + '_ {
        self.checks.iter().filter(|check| !check.passed)
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "scenario '{}': {} ({} checks, {}.{:06}s virtual)",
            self.name,
            if self.passed() { "PASS" } else { "FAIL" },
            self.checks.len(),
            self.elapsed / 1_000_000_000,
            (self.elapsed % 1_000_000_000) / 1_000
        )?;
        for check in &self.checks {
            let mark = if check.passed { "ok  " } else { "FAIL" };
            writeln!(f, "  [{}] {}: {}", mark, check.description, check.detail)?;
        }
        for (engine, stats) in &self.stats {
            if stats.submitted == 0 {
                continue;
            }
            writeln!(
                f,
                "  {}: submitted={} completed={} errored={} preemptions={} timeslices={} resets={}",
                engine,
                stats.submitted,
                stats.completed,
                stats.errored,
                stats.preemptions,
                stats.timeslices,
                stats.resets
            )?;
        }
        Ok(())
    }
}

/// Parse an engine name: physical (`rcs0`), class (`rcs`) or map index
pub fn parse_engine_selector(s: &str) -> SchedResult<EngineSelector> {
    if let Ok(id) = s.parse::<EngineId>() {
        return Ok(EngineSelector::Physical(id));
    }
    if let Some(class) = EngineClass::ALL.iter().find(|c| c.as_str() == s) {
        return Ok(EngineSelector::Class(*class));
    }
    s.parse::<usize>()
        .map(EngineSelector::Index)
        .map_err(|_| SchedError::InvalidEngine(s.to_string()))
}

fn unknown(what: &str, name: &str) -> SchedError {
    SchedError::Config(format!("unknown {} '{}'", what, name))
}

/// Name tables built while the scenario runs
struct World {
    sched: Scheduler,
    contexts: HashMap<String, ContextId>,
    buffers: HashMap<String, BufferId>,
    fences: HashMap<String, FenceId>,
    requests: HashMap<String, Submission>,
    rejected: HashMap<String, SchedError>,
}

impl World {
    fn ctx(&self, name: &str) -> SchedResult<ContextId> {
        self.contexts.get(name).copied().ok_or_else(|| unknown("context", name))
    }

    fn buffer(&self, name: &str) -> SchedResult<BufferId> {
        self.buffers.get(name).copied().ok_or_else(|| unknown("buffer", name))
    }

    fn fence(&self, name: &str) -> SchedResult<FenceId> {
        self.fences.get(name).copied().ok_or_else(|| unknown("fence", name))
    }

    fn request(&self, label: &str) -> SchedResult<Submission> {
        self.requests.get(label).copied().ok_or_else(|| unknown("request", label))
    }

    fn engine(&self, name: &str) -> SchedResult<EngineId> {
        match parse_engine_selector(name)? {
            EngineSelector::Physical(id) => Ok(id),
            _ => Err(SchedError::InvalidEngine(format!("{} is not a physical engine", name))),
        }
    }

    fn batch(&self, commands: &[CommandSpec], no_preempt: bool) -> SchedResult<Batch> {
        let mut batch = Batch::new();
        for cmd in commands {
            batch = match cmd {
                CommandSpec::Compute { us } => batch.compute(us * NSEC_PER_USEC),
                CommandSpec::Store { buffer, offset, value } => {
                    batch.store(self.buffer(buffer)?, *offset, *value)
                }
                CommandSpec::WaitEq { buffer, offset, value } => {
                    batch.wait_eq(self.buffer(buffer)?, *offset, *value)
                }
                CommandSpec::Spin => batch.spin(),
                CommandSpec::Invalid => batch.invalid(),
            };
        }
        Ok(if no_preempt { batch.no_preempt() } else { batch })
    }

    fn setup(&mut self, scenario: &Scenario) -> SchedResult<()> {
        for spec in &scenario.contexts {
            let mut params = self.sched.default_context_params();
            if let Some(prio) = spec.priority {
                params = params.priority(Priority::new(prio)?);
            }
            if let Some(persistent) = spec.persistent {
                params = params.persistent(persistent);
            }
            if let Some(bannable) = spec.bannable {
                params = params.bannable(bannable);
            }
            if let Some(ring) = spec.ring_size {
                params = params.ring_size(ring);
            }
            if let Some(names) = &spec.engines {
                let map = names.iter().map(|n| self.engine(n)).collect::<SchedResult<Vec<_>>>()?;
                params = params.engines(map);
            }
            if let Some(other) = &spec.share_vm_with {
                params = params.shared_vm(self.sched.context_vm(self.ctx(other)?)?);
            }
            let id = self.sched.create_context(params)?;
            self.contexts.insert(spec.name.clone(), id);
        }

        for spec in &scenario.buffers {
            let id = self.sched.create_buffer(spec.size)?;
            for (idx, value) in spec.init.iter().enumerate() {
                self.sched.write_buffer(id, idx as u32, *value)?;
            }
            self.buffers.insert(spec.name.clone(), id);
        }

        for name in &scenario.fences {
            let id = self.sched.create_fence();
            self.fences.insert(name.clone(), id);
        }
        Ok(())
    }

    fn step(&mut self, idx: usize, step: &Step) -> SchedResult<()> {
        log::debug!("scenario step {}: {:?}", idx, step);
        match step {
            Step::Submit {
                label,
                ctx,
                engine,
                priority,
                fences_in,
                after,
                submit_after,
                reads,
                writes,
                batch,
                no_preempt,
            } => {
                let label = label.clone().unwrap_or_else(|| format!("#{}", idx));
                let mut exec = ExecBuffer::new(
                    self.ctx(ctx)?,
                    parse_engine_selector(engine)?,
                    self.batch(batch, *no_preempt)?,
                );
                if let Some(prio) = priority {
                    exec = exec.priority(Priority::new(*prio)?);
                }
                for name in fences_in {
                    exec = exec.fence_in(self.fence(name)?);
                }
                for name in after {
                    exec = exec.fence_in(self.request(name)?.fence);
                }
                for name in submit_after {
                    exec = exec.submit_fence(self.request(name)?.fence);
                }
                for name in reads {
                    exec = exec.read(self.buffer(name)?);
                }
                for name in writes {
                    exec = exec.write(self.buffer(name)?);
                }
                match self.sched.submit(exec) {
                    Ok(sub) => {
                        self.requests.insert(label, sub);
                    }
                    Err(err) => {
                        log::info!("scenario submission '{}' rejected: {}", label, err);
                        self.rejected.insert(label, err);
                    }
                }
            }
            Step::Signal { fence, error } => {
                let id = self.fence(fence)?;
                match error {
                    Some(err) => self.sched.signal_fence_error(id, *err)?,
                    None => self.sched.signal_fence(id)?,
                };
            }
            Step::Advance { us } => self.sched.advance(Duration::from_micros(*us)),
            Step::RunUntilIdle { max_ms } => {
                if !self.sched.run_until_idle(Duration::from_millis(*max_ms)) {
                    log::warn!("scenario: engines still busy after {}ms", max_ms);
                }
            }
            Step::SetPriority { ctx, priority } => self.sched.set_priority(self.ctx(ctx)?, *priority)?,
            Step::DestroyContext { ctx } => self.sched.destroy_context(self.ctx(ctx)?)?,
            Step::CancelContext { ctx } => self.sched.cancel_context(self.ctx(ctx)?)?,
            Step::Hang { engine } => self.sched.notify_hang(self.engine(engine)?)?,
            Step::EndSpin { request } => self.sched.end_spin(self.request(request)?.request)?,
            Step::SetProperty {
                engine,
                timeslice_us,
                preempt_timeout_ms,
                preemption,
                watchdog_ms,
            } => {
                let engine = self.engine(engine)?;
                let mut props = Vec::new();
                if let Some(us) = timeslice_us {
                    props.push(EngineProperty::Timeslice(Duration::from_micros(*us)));
                }
                if let Some(ms) = preempt_timeout_ms {
                    props.push(EngineProperty::PreemptTimeout(Duration::from_millis(*ms)));
                }
                if let Some(enabled) = preemption {
                    props.push(EngineProperty::Preemption(*enabled));
                }
                if let Some(ms) = watchdog_ms {
                    props.push(EngineProperty::Watchdog(
                        (*ms > 0).then(|| Duration::from_millis(*ms)),
                    ));
                }
                for prop in props {
                    self.sched.set_engine_property(engine, prop)?;
                }
            }
            Step::Retire => {
                self.sched.retire();
            }
        }
        Ok(())
    }

    fn check(&self, expect: &Expect) -> CheckResult {
        match self.evaluate(expect) {
            Ok((description, passed, detail)) => CheckResult {
                description,
                passed,
                detail,
            },
            Err(err) => CheckResult {
                description: format!("{:?}", expect),
                passed: false,
                detail: err.to_string(),
            },
        }
    }

    fn evaluate(&self, expect: &Expect) -> SchedResult<(String, bool, String)> {
        Ok(match expect {
            Expect::Buffer { buffer, offset, value } => {
                let actual = self.sched.read_buffer(self.buffer(buffer)?, *offset)?;
                (
                    format!("{}[{:#x}] == {:#x}", buffer, offset, value),
                    actual == *value,
                    format!("found {:#x}", actual),
                )
            }
            Expect::Status { request, status, error } => {
                let sub = self.request(request)?;
                let actual = self.sched.query_status(Target::Request(sub.request))?;
                let passed = match (status, actual) {
                    (StatusSpec::Pending, Status::Pending)
                    | (StatusSpec::Ready, Status::Ready)
                    | (StatusSpec::Running, Status::Running)
                    | (StatusSpec::Completed, Status::Completed) => true,
                    (StatusSpec::Error, Status::Error(err)) => error.map_or(true, |want| want == err),
                    _ => false,
                };
                (
                    format!("{} is {:?}", request, status),
                    passed,
                    format!("found {:?}", actual),
                )
            }
            Expect::Order { engine, requests } => {
                let order = self.sched.execution_order(self.engine(engine)?)?;
                let wanted = requests
                    .iter()
                    .map(|label| self.request(label).map(|sub| sub.request))
                    .collect::<SchedResult<Vec<_>>>()?;
                let positions: Vec<Option<usize>> = wanted
                    .iter()
                    .map(|id| order.iter().position(|done| done == id))
                    .collect();
                let passed = positions.iter().all(Option::is_some)
                    && positions.windows(2).all(|pair| pair[0] < pair[1]);
                (
                    format!("{} completes {}", engine, requests.join(" < ")),
                    passed,
                    format!("positions {:?}", positions),
                )
            }
            Expect::Banned { ctx, banned } => {
                let actual = self.sched.is_banned(self.ctx(ctx)?)?;
                (
                    format!("{} banned == {}", ctx, banned),
                    actual == *banned,
                    format!("found {}", actual),
                )
            }
            Expect::Rejected { request } => {
                let found = self.rejected.get(request);
                (
                    format!("{} rejected", request),
                    found.is_some(),
                    found.map_or_else(|| "accepted".to_string(), ToString::to_string),
                )
            }
        })
    }
}

impl Scenario {
    pub fn from_toml_str(s: &str) -> SchedResult<Self> {
        let scenario: Scenario = toml::from_str(s)?;
        scenario.config.validate()?;
        Ok(scenario)
    }

    pub fn load(path: impl AsRef<Path>) -> SchedResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Run every step on a fresh virtual-clock scheduler, then evaluate the
    /// expectations. Setup and step errors abort the run; rejected
    /// submissions do not.
    pub fn run(&self) -> SchedResult<ScenarioReport> {
        log::info!("Running scenario '{}'", self.name);
        let mut world = World {
            sched: Scheduler::new(self.config.clone())?,
            contexts: HashMap::new(),
            buffers: HashMap::new(),
            fences: HashMap::new(),
            requests: HashMap::new(),
            rejected: HashMap::new(),
        };
        world.setup(self)?;
        for (idx, step) in self.steps.iter().enumerate() {
            world.step(idx, step)?;
        }

        let checks = self.expect.iter().map(|e| world.check(e)).collect();
        let stats = world
            .sched
            .engines()
            .into_iter()
            .filter_map(|id| world.sched.engine_stats(id).ok().map(|s| (id, s)))
            .collect();

        let report = ScenarioReport {
            name: self.name.clone(),
            elapsed: world.sched.now(),
            checks,
            stats,
        };
        world.sched.log_stats();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIFO: &str = r#"
name = "fifo"

[config]
engines = [{ class = "render" }]

[[contexts]]
name = "a"

[[buffers]]
name = "out"

[[steps]]
op = "submit"
label = "first"
ctx = "a"
engine = "rcs0"
writes = ["out"]
batch = [{ op = "compute", us = 50 }, { op = "store", buffer = "out", value = 1 }]

[[steps]]
op = "submit"
label = "second"
ctx = "a"
engine = "rcs0"
writes = ["out"]
batch = [{ op = "store", buffer = "out", value = 2 }]

[[steps]]
op = "run_until_idle"
max_ms = 10

[[expect]]
kind = "buffer"
buffer = "out"
value = 2

[[expect]]
kind = "order"
engine = "rcs0"
requests = ["first", "second"]

[[expect]]
kind = "status"
request = "second"
status = "completed"
"#;

    #[test]
    fn test_parse_engine_selector() {
        assert_eq!(parse_engine_selector("vcs1").unwrap(), EngineSelector::Physical(EngineId::VCS1));
        assert_eq!(parse_engine_selector("bcs").unwrap(), EngineSelector::Class(EngineClass::Copy));
        assert_eq!(parse_engine_selector("2").unwrap(), EngineSelector::Index(2));
        assert!(parse_engine_selector("gpu").is_err());
    }

    #[test]
    fn test_fifo_scenario_passes() {
        let scenario = Scenario::from_toml_str(FIFO).unwrap();
        let report = scenario.run().unwrap();
        assert!(report.passed(), "{}", report);
        assert_eq!(report.checks.len(), 3);
    }

    #[test]
    fn test_failed_expectation_reported() {
        let text = FIFO.replace("value = 2\n\n[[expect]]", "value = 7\n\n[[expect]]");
        let report = Scenario::from_toml_str(&text).unwrap().run().unwrap();
        assert!(!report.passed());
        assert_eq!(report.failures().count(), 1);
        assert!(report.to_string().contains("FAIL"));
    }

    #[test]
    fn test_unknown_name_aborts() {
        let text = FIFO.replace("ctx = \"a\"\nengine = \"rcs0\"\nwrites = [\"out\"]\nbatch = [{ op = \"store\"", "ctx = \"zzz\"\nengine = \"rcs0\"\nwrites = [\"out\"]\nbatch = [{ op = \"store\"");
        let scenario = Scenario::from_toml_str(&text).unwrap();
        assert!(matches!(scenario.run(), Err(SchedError::Config(_))));
    }

    #[test]
    fn test_misplaced_key_rejected() {
        // `fences` after a `[[buffers]]` header belongs to that buffer
        let text = FIFO.replace("[[buffers]]\nname = \"out\"\n", "[[buffers]]\nname = \"out\"\nfences = [\"cork\"]\n");
        assert!(matches!(Scenario::from_toml_str(&text), Err(SchedError::Toml(_))));

        let text = FIFO.replace("max_ms = 10", "max_ms = 10\nmax_us = 10");
        assert!(matches!(Scenario::from_toml_str(&text), Err(SchedError::Toml(_))));

        let text = FIFO.replace("{ op = \"compute\", us = 50 }", "{ op = \"compute\", ms = 50 }");
        assert!(matches!(Scenario::from_toml_str(&text), Err(SchedError::Toml(_))));
    }

    #[test]
    fn test_submit_after_runs_beside_spinner() {
        let text = r#"
name = "submit-after"

[[contexts]]
name = "a"

[[buffers]]
name = "out"

[[steps]]
op = "submit"
label = "spin"
ctx = "a"
engine = "bcs0"
batch = [{ op = "spin" }]

[[steps]]
op = "submit"
label = "store"
ctx = "a"
engine = "rcs0"
submit_after = ["spin"]
writes = ["out"]
batch = [{ op = "store", buffer = "out", value = 5 }]

[[steps]]
op = "advance"
us = 1000

[[expect]]
kind = "buffer"
buffer = "out"
value = 5

[[expect]]
kind = "status"
request = "spin"
status = "running"
"#;
        let report = Scenario::from_toml_str(text).unwrap().run().unwrap();
        assert!(report.passed(), "{}", report);
    }
}
