//! Client contexts
//!
//! A context carries a client's scheduling parameters, its per-engine
//! timelines and ring occupancy, and the busy time it has accumulated on
//! each engine class.
//!
//! ## Key Concepts:
//! - **Timeline**: each request waits on the previous request the same
//!   context submitted to the same engine
//! - **Ring**: bounded number of in-flight requests per engine; a full ring
//!   throttles the submitter
//! - **Persistence**: requests of a persistent context outlive the context
//!   handle, those of a non-persistent one are cancelled with it
//! - **Ban**: a bannable context found guilty of a hang loses the right to
//!   submit

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::ContextDefaults;
use crate::error::{SchedError, SchedResult};
use crate::request::RequestShared;
use crate::types::{
    ContextId, EngineClass, EngineId, Nanos, Priority, RequestId, VmId, DEFAULT_RING_SIZE,
    REQUEST_RING_BYTES, RING_RESERVE_BYTES, RING_SIZE_GRANULE, RING_SIZE_MAX, RING_SIZE_MIN,
};
use crate::wait::{wait_while, Interrupt};

/// Check a ring size in bytes
pub fn validate_ring_size(bytes: u64) -> SchedResult<u32> {
    let ok = bytes >= RING_SIZE_MIN as u64
        && bytes <= RING_SIZE_MAX as u64
        && bytes % RING_SIZE_GRANULE as u64 == 0;
    if ok {
        Ok(bytes as u32)
    } else {
        Err(SchedError::InvalidRingSize(bytes))
    }
}

/// In-flight requests a ring of `ring_size` bytes can hold per engine
pub fn ring_capacity(ring_size: u32) -> usize {
    (ring_size.saturating_sub(RING_RESERVE_BYTES) / REQUEST_RING_BYTES).max(1) as usize
}

/// Creation parameters of a context
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextParams {
    pub priority: Priority,
    pub persistent: bool,
    pub bannable: bool,
    pub ring_size: u32,
    /// Engine map addressed by `EngineSelector::Index`
    pub engines: Option<Vec<EngineId>>,
    /// Share an existing address space instead of creating a private one
    pub vm: Option<VmId>,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            priority: Priority::DEFAULT,
            persistent: true,
            bannable: true,
            ring_size: DEFAULT_RING_SIZE,
            engines: None,
            vm: None,
        }
    }
}

impl ContextParams {
    pub fn from_defaults(defaults: &ContextDefaults) -> SchedResult<Self> {
        Ok(Self {
            priority: Priority::new(defaults.priority)?,
            persistent: defaults.persistent,
            bannable: defaults.bannable,
            ring_size: validate_ring_size(defaults.ring_size as u64)?,
            engines: None,
            vm: None,
        })
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn bannable(mut self, bannable: bool) -> Self {
        self.bannable = bannable;
        self
    }

    pub fn ring_size(mut self, bytes: u32) -> Self {
        self.ring_size = bytes;
        self
    }

    pub fn engines(mut self, engines: Vec<EngineId>) -> Self {
        self.engines = Some(engines);
        self
    }

    pub fn shared_vm(mut self, vm: VmId) -> Self {
        self.vm = Some(vm);
        self
    }
}

/// Busy time per engine class
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextRuntime {
    per_class: [Nanos; EngineClass::COUNT],
}

impl ContextRuntime {
    pub fn get(&self, class: EngineClass) -> Nanos {
        self.per_class[class.index()]
    }

    pub fn total(&self) -> Nanos {
        self.per_class.iter().sum()
    }
}

pub struct ContextShared {
    pub id: ContextId,
    pub vm: VmId,
    priority: AtomicI32,
    persistent: AtomicBool,
    bannable: AtomicBool,
    closed: AtomicBool,
    banned: AtomicBool,
    ring_size: AtomicU32,
    engines: RwLock<Option<Vec<EngineId>>>,
    /// In-flight requests per engine
    ring: Mutex<HashMap<EngineId, usize>>,
    ring_cond: Condvar,
    timelines: Mutex<HashMap<EngineId, Arc<RequestShared>>>,
    runtime: [AtomicU64; EngineClass::COUNT],
    guilty: AtomicU32,
}

impl ContextShared {
    fn new(id: ContextId, vm: VmId, params: &ContextParams) -> Self {
        Self {
            id,
            vm,
            priority: AtomicI32::new(params.priority.get()),
            persistent: AtomicBool::new(params.persistent),
            bannable: AtomicBool::new(params.bannable),
            closed: AtomicBool::new(false),
            banned: AtomicBool::new(false),
            ring_size: AtomicU32::new(params.ring_size),
            engines: RwLock::new(params.engines.clone()),
            ring: Mutex::new(HashMap::new()),
            ring_cond: Condvar::new(),
            timelines: Mutex::new(HashMap::new()),
            runtime: Default::default(),
            guilty: AtomicU32::new(0),
        }
    }

    /// Current parameters, for cloning
    pub fn params(&self) -> ContextParams {
        ContextParams {
            priority: self.priority(),
            persistent: self.is_persistent(),
            bannable: self.is_bannable(),
            ring_size: self.ring_size(),
            engines: self.engines(),
            vm: Some(self.vm),
        }
    }

    pub fn priority(&self) -> Priority {
        Priority::new(self.priority.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub(crate) fn set_priority(&self, prio: Priority) {
        self.priority.store(prio.get(), Ordering::Release);
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    pub(crate) fn set_persistent(&self, persistent: bool) {
        self.persistent.store(persistent, Ordering::Release);
    }

    pub fn is_bannable(&self) -> bool {
        self.bannable.load(Ordering::Acquire)
    }

    pub(crate) fn set_bannable(&self, bannable: bool) {
        self.bannable.store(bannable, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting submissions and release throttled submitters
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ring = self.ring.lock();
        self.ring_cond.notify_all();
    }

    pub fn is_banned(&self) -> bool {
        self.banned.load(Ordering::Acquire)
    }

    /// Record a hang blamed on this context. Returns true if it got banned.
    pub(crate) fn mark_guilty(&self) -> bool {
        self.guilty.fetch_add(1, Ordering::AcqRel);
        if self.is_bannable() {
            self.banned.store(true, Ordering::Release);
            let _ring = self.ring.lock();
            self.ring_cond.notify_all();
            true
        } else {
            false
        }
    }

    pub fn guilty_count(&self) -> u32 {
        self.guilty.load(Ordering::Acquire)
    }

    pub fn ring_size(&self) -> u32 {
        self.ring_size.load(Ordering::Acquire)
    }

    pub(crate) fn set_ring_size(&self, bytes: u32) {
        self.ring_size.store(bytes, Ordering::Release);
        let _ring = self.ring.lock();
        self.ring_cond.notify_all();
    }

    pub fn ring_capacity(&self) -> usize {
        ring_capacity(self.ring_size())
    }

    pub fn engines(&self) -> Option<Vec<EngineId>> {
        self.engines.read().clone()
    }

    pub(crate) fn set_engines(&self, engines: Option<Vec<EngineId>>) {
        *self.engines.write() = engines;
    }

    /// Resolve an engine map index
    pub fn engine_at(&self, index: usize) -> Option<EngineId> {
        self.engines.read().as_ref().and_then(|map| map.get(index).copied())
    }

    /// Take a ring slot without blocking
    pub(crate) fn try_reserve(&self, engine: EngineId) -> SchedResult<()> {
        let mut ring = self.ring.lock();
        let used = ring.entry(engine).or_insert(0);
        if *used >= ring_capacity(self.ring_size()) {
            return Err(SchedError::RingFull { ctx: self.id, engine });
        }
        *used += 1;
        Ok(())
    }

    /// Take a ring slot, waiting for the engine to retire requests
    pub(crate) fn reserve_blocking(
        &self,
        engine: EngineId,
        timeout: Option<Duration>,
        interrupt: Option<&Interrupt>,
    ) -> SchedResult<()> {
        let mut ring = self.ring.lock();
        wait_while(&self.ring_cond, &mut ring, timeout, interrupt, |ring| {
            self.is_closed()
                || self.is_banned()
                || ring.get(&engine).copied().unwrap_or(0) < ring_capacity(self.ring_size())
        })?;
        if self.is_closed() {
            return Err(SchedError::ContextClosed(self.id));
        }
        if self.is_banned() {
            return Err(SchedError::ContextBanned(self.id));
        }
        *ring.entry(engine).or_insert(0) += 1;
        Ok(())
    }

    /// Return a ring slot when a request leaves the engine
    pub(crate) fn release(&self, engine: EngineId) {
        let mut ring = self.ring.lock();
        if let Some(used) = ring.get_mut(&engine) {
            *used = used.saturating_sub(1);
        }
        self.ring_cond.notify_all();
    }

    /// Install `request` as the tail of the engine timeline, returning the
    /// previous tail if it is still outstanding
    pub(crate) fn swap_timeline(
        &self,
        engine: EngineId,
        request: &Arc<RequestShared>,
    ) -> Option<Arc<RequestShared>> {
        self.timelines
            .lock()
            .insert(engine, Arc::clone(request))
            .filter(|prev| !prev.is_complete())
    }

    pub(crate) fn clear_timeline(&self, engine: EngineId, request: RequestId) {
        let mut timelines = self.timelines.lock();
        if timelines.get(&engine).map_or(false, |tail| tail.id == request) {
            timelines.remove(&engine);
        }
    }

    pub(crate) fn add_runtime(&self, class: EngineClass, ns: Nanos) {
        self.runtime[class.index()].fetch_add(ns, Ordering::Relaxed);
    }

    pub fn runtime(&self) -> ContextRuntime {
        let mut rt = ContextRuntime::default();
        for class in EngineClass::ALL {
            rt.per_class[class.index()] = self.runtime[class.index()].load(Ordering::Relaxed);
        }
        rt
    }
}

impl std::fmt::Debug for ContextShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextShared")
            .field("id", &self.id)
            .field("vm", &self.vm)
            .field("priority", &self.priority())
            .field("closed", &self.is_closed())
            .field("banned", &self.is_banned())
            .finish()
    }
}

// ============================================================================
// Context table
// ============================================================================

pub struct ContextTable {
    contexts: RwLock<HashMap<ContextId, Arc<ContextShared>>>,
    /// Address spaces and the number of contexts bound to each
    vms: Mutex<HashMap<VmId, usize>>,
    next_ctx: AtomicU32,
    next_vm: AtomicU32,
}

impl Default for ContextTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextTable {
    pub fn new() -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            vms: Mutex::new(HashMap::new()),
            next_ctx: AtomicU32::new(1),
            next_vm: AtomicU32::new(1),
        }
    }

    pub fn create_vm(&self) -> VmId {
        let vm = VmId(self.next_vm.fetch_add(1, Ordering::Relaxed));
        self.vms.lock().insert(vm, 0);
        vm
    }

    /// Forget an address space; contexts already bound to it keep it
    pub fn destroy_vm(&self, vm: VmId) -> SchedResult<()> {
        self.vms.lock().remove(&vm).map(|_| ()).ok_or(SchedError::VmNotFound(vm))
    }

    pub fn vm_users(&self, vm: VmId) -> SchedResult<usize> {
        self.vms.lock().get(&vm).copied().ok_or(SchedError::VmNotFound(vm))
    }

    pub fn create(&self, params: &ContextParams) -> SchedResult<Arc<ContextShared>> {
        validate_ring_size(params.ring_size as u64)?;

        let vm = {
            let mut vms = self.vms.lock();
            let vm = match params.vm {
                Some(vm) if vms.contains_key(&vm) => vm,
                Some(vm) => return Err(SchedError::VmNotFound(vm)),
                None => {
                    let vm = VmId(self.next_vm.fetch_add(1, Ordering::Relaxed));
                    vms.insert(vm, 0);
                    vm
                }
            };
            if let Some(users) = vms.get_mut(&vm) {
                *users += 1;
            }
            vm
        };

        let id = ContextId(self.next_ctx.fetch_add(1, Ordering::Relaxed));
        let ctx = Arc::new(ContextShared::new(id, vm, params));
        self.contexts.write().insert(id, Arc::clone(&ctx));
        Ok(ctx)
    }

    pub fn get(&self, id: ContextId) -> SchedResult<Arc<ContextShared>> {
        self.contexts
            .read()
            .get(&id)
            .cloned()
            .ok_or(SchedError::ContextNotFound(id))
    }

    pub fn remove(&self, id: ContextId) -> SchedResult<Arc<ContextShared>> {
        let ctx = self
            .contexts
            .write()
            .remove(&id)
            .ok_or(SchedError::ContextNotFound(id))?;
        if let Some(users) = self.vms.lock().get_mut(&ctx.vm) {
            *users = users.saturating_sub(1);
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_size_validation() {
        assert!(validate_ring_size(4096).is_ok());
        assert!(validate_ring_size(512 << 10).is_ok());
        assert!(validate_ring_size(0).is_err());
        assert!(validate_ring_size(4097).is_err());
        assert!(validate_ring_size((512 << 10) + 4096).is_err());
    }

    #[test]
    fn test_ring_capacity() {
        assert_eq!(ring_capacity(4096), 1);
        assert_eq!(ring_capacity(16 << 10), 96);
        assert_eq!(ring_capacity(8192), 32);
    }

    #[test]
    fn test_ring_reservation() {
        let table = ContextTable::new();
        let ctx = table.create(&ContextParams::default().ring_size(4096)).unwrap();
        ctx.try_reserve(EngineId::RCS0).unwrap();
        assert!(matches!(
            ctx.try_reserve(EngineId::RCS0),
            Err(SchedError::RingFull { .. })
        ));
        // rings are per engine
        ctx.try_reserve(EngineId::BCS0).unwrap();
        ctx.release(EngineId::RCS0);
        ctx.try_reserve(EngineId::RCS0).unwrap();
    }

    #[test]
    fn test_blocking_reserve_interrupted() {
        let table = ContextTable::new();
        let ctx = table.create(&ContextParams::default().ring_size(4096)).unwrap();
        ctx.try_reserve(EngineId::RCS0).unwrap();

        let interrupt = Interrupt::new();
        interrupt.trigger();
        let err = ctx
            .reserve_blocking(EngineId::RCS0, None, Some(&interrupt))
            .unwrap_err();
        assert!(matches!(err, SchedError::Interrupted));

        let err = ctx
            .reserve_blocking(EngineId::RCS0, Some(Duration::from_millis(5)), None)
            .unwrap_err();
        assert!(matches!(err, SchedError::TimedOut));
    }

    #[test]
    fn test_private_and_shared_vm() {
        let table = ContextTable::new();
        let a = table.create(&ContextParams::default()).unwrap();
        let b = table.create(&ContextParams::default()).unwrap();
        assert_ne!(a.vm, b.vm);

        let c = table.create(&ContextParams::default().shared_vm(a.vm)).unwrap();
        assert_eq!(c.vm, a.vm);
        assert_eq!(table.vm_users(a.vm).unwrap(), 2);

        assert!(matches!(
            table.create(&ContextParams::default().shared_vm(VmId(99))),
            Err(SchedError::VmNotFound(VmId(99)))
        ));
    }

    #[test]
    fn test_ban_only_when_bannable() {
        let table = ContextTable::new();
        let ctx = table.create(&ContextParams::default().bannable(false)).unwrap();
        assert!(!ctx.mark_guilty());
        assert!(!ctx.is_banned());
        ctx.set_bannable(true);
        assert!(ctx.mark_guilty());
        assert!(ctx.is_banned());
        assert_eq!(ctx.guilty_count(), 2);
    }
}
