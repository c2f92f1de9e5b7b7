//! Command streams and the simulated command streamer
//!
//! A [`Batch`] is a short program interpreted on an engine's active port.
//! Only compute, spinning and semaphore polling consume engine time; stores
//! land instantly and are visible to every other engine at once.

use crate::types::{BufferId, Nanos, NSEC_PER_USEC};

/// Duration given to the compute prefix of the store-only helpers
pub const DEFAULT_BATCH_NS: Nanos = NSEC_PER_USEC;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Occupy the engine for the given time
    Compute(Nanos),
    /// MI_STORE_DWORD_IMM into a buffer dword
    Store { buffer: BufferId, offset: u32, value: u32 },
    /// MI_SEMAPHORE_WAIT polling for equality
    SemaphoreWait { buffer: BufferId, offset: u32, value: u32 },
    /// Busy loop until the request's spin is ended by the client
    Spin,
    /// Unparseable command; faults the engine
    Invalid,
}

impl Command {
    pub(crate) fn buffer(&self) -> Option<BufferId> {
        match self {
            Command::Store { buffer, .. } | Command::SemaphoreWait { buffer, .. } => Some(*buffer),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    pub commands: Vec<Command>,
    /// Arbitration disabled: the batch cannot be preempted mid-flight
    pub no_preempt: bool,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute(mut self, ns: Nanos) -> Self {
        self.commands.push(Command::Compute(ns));
        self
    }

    pub fn store(mut self, buffer: BufferId, offset: u32, value: u32) -> Self {
        self.commands.push(Command::Store { buffer, offset, value });
        self
    }

    pub fn wait_eq(mut self, buffer: BufferId, offset: u32, value: u32) -> Self {
        self.commands.push(Command::SemaphoreWait { buffer, offset, value });
        self
    }

    pub fn spin(mut self) -> Self {
        self.commands.push(Command::Spin);
        self
    }

    pub fn invalid(mut self) -> Self {
        self.commands.push(Command::Invalid);
        self
    }

    pub fn no_preempt(mut self) -> Self {
        self.no_preempt = true;
        self
    }

    /// Single dword write preceded by a short compute
    pub fn store_dword(buffer: BufferId, offset: u32, value: u32) -> Self {
        Self::new().compute(DEFAULT_BATCH_NS).store(buffer, offset, value)
    }

    /// Endless spinner, stopped with `Scheduler::end_spin`
    pub fn spinner() -> Self {
        Self::new().spin()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub(crate) fn buffers(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.commands.iter().filter_map(Command::buffer)
    }
}

/// Memory and client state seen by the interpreter
pub(crate) trait CommandEnv {
    fn load(&self, buffer: BufferId, offset: u32) -> Option<u32>;
    fn store(&self, buffer: BufferId, offset: u32, value: u32) -> bool;
    fn spin_ended(&self) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Halt {
    /// Batch finished
    Done,
    /// Budget consumed mid-command
    Exhausted,
    /// Stalled on a semaphore poll that has not been satisfied
    Blocked,
    /// Stalled in a spin loop
    Spinning,
    /// Invalid command or out of bounds access
    Fault,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RunResult {
    pub consumed: Nanos,
    pub halt: Halt,
    /// At least one command made forward progress
    pub progressed: bool,
}

/// Execution position inside a batch; survives preemption
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Cursor {
    pc: usize,
    /// Compute time already spent on the command at `pc`
    spent: Nanos,
}

impl Cursor {
    pub fn is_done(&self, batch: &Batch) -> bool {
        self.pc >= batch.commands.len()
    }

    /// Remaining compute time, if the rest of the batch is pure compute and
    /// stores. `None` when a spin, semaphore or invalid command is ahead.
    pub fn remaining_compute(&self, batch: &Batch) -> Option<Nanos> {
        let mut total: Nanos = 0;
        for (idx, cmd) in batch.commands.iter().enumerate().skip(self.pc) {
            match cmd {
                Command::Compute(ns) => {
                    let spent = if idx == self.pc { self.spent } else { 0 };
                    total = total.saturating_add(ns.saturating_sub(spent));
                }
                Command::Store { .. } => {}
                Command::SemaphoreWait { .. } | Command::Spin | Command::Invalid => return None,
            }
        }
        Some(total)
    }

    /// Interpret commands until the batch ends, stalls or `budget` runs out.
    ///
    /// Stalls return immediately without consuming the rest of the budget;
    /// the engine decides whether to spin or yield.
    pub fn run(&mut self, batch: &Batch, budget: Nanos, env: &dyn CommandEnv) -> RunResult {
        let mut consumed: Nanos = 0;
        let mut progressed = false;

        while let Some(cmd) = batch.commands.get(self.pc) {
            match *cmd {
                Command::Compute(ns) => {
                    let left = ns.saturating_sub(self.spent);
                    let avail = budget - consumed;
                    if left > avail {
                        self.spent += avail;
                        consumed = budget;
                        progressed |= avail > 0;
                        return RunResult { consumed, halt: Halt::Exhausted, progressed };
                    }
                    consumed += left;
                    progressed |= left > 0;
                    self.advance();
                }
                Command::Store { buffer, offset, value } => {
                    if !env.store(buffer, offset, value) {
                        return RunResult { consumed, halt: Halt::Fault, progressed };
                    }
                    progressed = true;
                    self.advance();
                }
                Command::SemaphoreWait { buffer, offset, value } => match env.load(buffer, offset) {
                    None => return RunResult { consumed, halt: Halt::Fault, progressed },
                    Some(v) if v == value => {
                        progressed = true;
                        self.advance();
                    }
                    Some(_) => return RunResult { consumed, halt: Halt::Blocked, progressed },
                },
                Command::Spin => {
                    if !env.spin_ended() {
                        return RunResult { consumed, halt: Halt::Spinning, progressed };
                    }
                    progressed = true;
                    self.advance();
                }
                Command::Invalid => return RunResult { consumed, halt: Halt::Fault, progressed },
            }
        }

        RunResult { consumed, halt: Halt::Done, progressed }
    }

    fn advance(&mut self) {
        self.pc += 1;
        self.spent = 0;
    }
}
