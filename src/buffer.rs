//! Buffer objects and implicit hazard tracking
//!
//! Every buffer remembers its last writer and the readers since that write.
//! A new writer depends on all of them, a new reader only on the writer.
//! Tracking is per buffer, whichever context or address space the
//! submitting client uses.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{SchedError, SchedResult};
use crate::request::RequestShared;
use crate::types::{Access, BufferAccess, BufferId, EngineClass, RequestId, VmId};

struct BufferObject {
    size: u64,
    data: Vec<u32>,
    last_writer: Option<Arc<RequestShared>>,
    readers: Vec<Arc<RequestShared>>,
    vms: BTreeSet<VmId>,
    /// Handle closed by the client; kept while the GPU may still touch it
    closed: bool,
}

impl BufferObject {
    fn prune(&mut self) {
        if self.last_writer.as_ref().map_or(false, |w| w.is_complete()) {
            self.last_writer = None;
        }
        self.readers.retain(|r| !r.is_complete());
    }

    fn is_idle(&mut self) -> bool {
        self.prune();
        self.last_writer.is_none() && self.readers.is_empty()
    }
}

/// Result of a buffer busy query
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferBusy {
    pub busy: bool,
    /// Engine class of the outstanding writer
    pub writer: Option<EngineClass>,
    /// Engine classes with outstanding readers
    pub readers: Vec<EngineClass>,
}

pub struct BufferTable {
    objects: Mutex<HashMap<BufferId, BufferObject>>,
    next_id: AtomicU32,
}

impl Default for BufferTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferTable {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Allocate a zeroed buffer; sizes round up to whole dwords
    pub fn create(&self, size: u64) -> SchedResult<BufferId> {
        if size == 0 {
            return Err(SchedError::InvalidBuffer(size));
        }
        let dwords = usize::try_from(size.div_ceil(4)).map_err(|_| SchedError::InvalidBuffer(size))?;
        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.objects.lock().insert(
            id,
            BufferObject {
                size: dwords as u64 * 4,
                data: vec![0; dwords],
                last_writer: None,
                readers: Vec::new(),
                vms: BTreeSet::new(),
                closed: false,
            },
        );
        log::trace!("buffer: created {} ({} bytes)", id, size);
        Ok(id)
    }

    pub fn close(&self, id: BufferId) -> SchedResult<()> {
        let mut objects = self.objects.lock();
        let obj = open_mut(&mut objects, id)?;
        obj.closed = true;
        if obj.is_idle() {
            objects.remove(&id);
        }
        Ok(())
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.objects.lock().get(&id).map_or(false, |obj| !obj.closed)
    }

    pub fn size(&self, id: BufferId) -> SchedResult<u64> {
        let mut objects = self.objects.lock();
        Ok(open_mut(&mut objects, id)?.size)
    }

    /// CPU read of a dword
    pub fn read(&self, id: BufferId, offset: u32) -> SchedResult<u32> {
        let mut objects = self.objects.lock();
        let obj = open_mut(&mut objects, id)?;
        obj.data
            .get(offset as usize)
            .copied()
            .ok_or(SchedError::BufferOutOfBounds { buffer: id, offset })
    }

    /// CPU write of a dword, bypassing hazard tracking
    pub fn write(&self, id: BufferId, offset: u32, value: u32) -> SchedResult<()> {
        let mut objects = self.objects.lock();
        let obj = open_mut(&mut objects, id)?;
        let slot = obj
            .data
            .get_mut(offset as usize)
            .ok_or(SchedError::BufferOutOfBounds { buffer: id, offset })?;
        *slot = value;
        Ok(())
    }

    /// Snapshot of the whole buffer contents
    pub fn contents(&self, id: BufferId) -> SchedResult<Vec<u32>> {
        let mut objects = self.objects.lock();
        Ok(open_mut(&mut objects, id)?.data.clone())
    }

    /// VMs the buffer has been bound into by submissions
    pub fn bound_vms(&self, id: BufferId) -> SchedResult<Vec<VmId>> {
        let mut objects = self.objects.lock();
        Ok(open_mut(&mut objects, id)?.vms.iter().copied().collect())
    }

    /// Record `request`'s accesses and return the requests it must wait on.
    ///
    /// All buffers are validated before any hazard state changes.
    pub(crate) fn track(
        &self,
        request: &Arc<RequestShared>,
        accesses: &[BufferAccess],
        vm: VmId,
    ) -> SchedResult<Vec<Arc<RequestShared>>> {
        let mut merged: BTreeMap<BufferId, Access> = BTreeMap::new();
        for entry in accesses {
            let slot = merged.entry(entry.buffer).or_insert(entry.access);
            if entry.access == Access::Write {
                *slot = Access::Write;
            }
        }

        let mut objects = self.objects.lock();
        for id in merged.keys() {
            open_mut(&mut objects, *id)?;
        }

        let mut deps: Vec<Arc<RequestShared>> = Vec::new();
        let mut seen: BTreeSet<RequestId> = BTreeSet::new();
        let mut push = |rq: &Arc<RequestShared>, deps: &mut Vec<Arc<RequestShared>>| {
            if rq.id != request.id && seen.insert(rq.id) {
                deps.push(Arc::clone(rq));
            }
        };

        for (id, access) in merged {
            let Some(obj) = objects.get_mut(&id) else { continue };
            obj.prune();
            obj.vms.insert(vm);
            if let Some(writer) = &obj.last_writer {
                push(writer, &mut deps);
            }
            match access {
                Access::Write => {
                    for reader in &obj.readers {
                        push(reader, &mut deps);
                    }
                    obj.readers.clear();
                    obj.last_writer = Some(Arc::clone(request));
                }
                Access::Read => obj.readers.push(Arc::clone(request)),
            }
        }
        Ok(deps)
    }

    pub fn busy(&self, id: BufferId) -> SchedResult<BufferBusy> {
        let mut objects = self.objects.lock();
        let obj = open_mut(&mut objects, id)?;
        obj.prune();
        let writer = obj.last_writer.as_ref().map(|w| w.engine.class);
        let mut readers: Vec<EngineClass> = obj.readers.iter().map(|r| r.engine.class).collect();
        readers.sort();
        readers.dedup();
        Ok(BufferBusy {
            busy: writer.is_some() || !readers.is_empty(),
            writer,
            readers,
        })
    }

    /// GPU side load; closed buffers stay reachable for in-flight work
    pub(crate) fn gpu_load(&self, id: BufferId, offset: u32) -> Option<u32> {
        self.objects.lock().get(&id)?.data.get(offset as usize).copied()
    }

    pub(crate) fn gpu_store(&self, id: BufferId, offset: u32, value: u32) -> bool {
        let mut objects = self.objects.lock();
        match objects.get_mut(&id).and_then(|obj| obj.data.get_mut(offset as usize)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Drop closed buffers no request references any more
    pub(crate) fn purge(&self) -> usize {
        let mut objects = self.objects.lock();
        let before = objects.len();
        objects.retain(|_, obj| !(obj.closed && obj.is_idle()));
        before - objects.len()
    }
}

fn open_mut(objects: &mut HashMap<BufferId, BufferObject>, id: BufferId) -> SchedResult<&mut BufferObject> {
    match objects.get_mut(&id) {
        Some(obj) if !obj.closed => Ok(obj),
        _ => Err(SchedError::BufferNotFound(id)),
    }
}
