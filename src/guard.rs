//! Scoped cleanup helpers
//!
//! [`ContextGuard`] destroys its context when dropped; [`EnginePropertyGuard`]
//! restores an engine property to the value it had before the guard was
//! taken. Both log instead of panicking if the cleanup fails.

use std::ops::Deref;

use crate::context::ContextParams;
use crate::error::SchedResult;
use crate::scheduler::{EngineProperty, Scheduler};
use crate::types::{ContextId, EngineId};

pub struct ContextGuard<'a> {
    sched: &'a Scheduler,
    id: ContextId,
}

impl<'a> ContextGuard<'a> {
    pub fn new(sched: &'a Scheduler, params: ContextParams) -> SchedResult<Self> {
        let id = sched.create_context(params)?;
        Ok(Self { sched, id })
    }

    /// Take ownership of an existing context
    pub fn adopt(sched: &'a Scheduler, id: ContextId) -> Self {
        Self { sched, id }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }
}

impl Deref for ContextGuard<'_> {
    type Target = ContextId;

    fn deref(&self) -> &ContextId {
        &self.id
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.sched.destroy_context(self.id) {
            log::debug!("context guard: {} already gone ({})", self.id, err);
        }
    }
}

pub struct EnginePropertyGuard<'a> {
    sched: &'a Scheduler,
    engine: EngineId,
    saved: EngineProperty,
}

impl<'a> EnginePropertyGuard<'a> {
    /// Apply `prop` to `engine`, remembering the previous value
    pub fn set(sched: &'a Scheduler, engine: EngineId, prop: EngineProperty) -> SchedResult<Self> {
        let saved = sched.set_engine_property(engine, prop)?;
        Ok(Self { sched, engine, saved })
    }

    pub fn saved(&self) -> EngineProperty {
        self.saved
    }
}

impl Drop for EnginePropertyGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.sched.set_engine_property(self.engine, self.saved) {
            log::warn!("failed to restore {:?} on {}: {}", self.saved, self.engine, err);
        }
    }
}
