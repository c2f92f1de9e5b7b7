//! Global request and fence tables
//!
//! Engines own the scheduling records; these tables only map ids to the
//! shared halves so clients can query, wait on and retire them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{SchedError, SchedResult};
use crate::fence::Fence;
use crate::request::RequestShared;
use crate::types::{FenceId, RequestId};

pub(crate) struct RequestTable {
    requests: RwLock<HashMap<RequestId, Arc<RequestShared>>>,
    next_id: AtomicU64,
    /// Submission order, shared by every engine so FIFO holds across contexts
    next_seq: AtomicU64,
}

impl RequestTable {
    pub fn new() -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn alloc_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, request: Arc<RequestShared>) {
        self.requests.write().insert(request.id, request);
    }

    pub fn get(&self, id: RequestId) -> SchedResult<Arc<RequestShared>> {
        self.requests
            .read()
            .get(&id)
            .cloned()
            .ok_or(SchedError::RequestNotFound(id))
    }

    /// Drop completed requests, returning their out-fences
    pub fn retire(&self) -> Vec<FenceId> {
        let mut retired = Vec::new();
        self.requests.write().retain(|_, rq| {
            let done = rq.is_complete();
            if done {
                retired.push(rq.fence_id());
            }
            !done
        });
        retired
    }

    pub fn len(&self) -> usize {
        self.requests.read().len()
    }
}

pub(crate) struct FenceTable {
    fences: RwLock<HashMap<FenceId, Arc<Fence>>>,
    next_id: AtomicU64,
}

impl FenceTable {
    pub fn new() -> Self {
        Self {
            fences: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate and register a fence
    pub fn create(&self, signaler: Option<RequestId>) -> Arc<Fence> {
        let id = FenceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let fence = Arc::new(Fence::new(id, signaler));
        self.fences.write().insert(id, Arc::clone(&fence));
        fence
    }

    pub fn get(&self, id: FenceId) -> SchedResult<Arc<Fence>> {
        self.fences
            .read()
            .get(&id)
            .cloned()
            .ok_or(SchedError::FenceNotFound(id))
    }

    pub fn remove(&self, id: FenceId) -> SchedResult<Arc<Fence>> {
        self.fences.write().remove(&id).ok_or(SchedError::FenceNotFound(id))
    }

    pub fn remove_all(&self, ids: &[FenceId]) {
        let mut fences = self.fences.write();
        for id in ids {
            fences.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.fences.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContextId, EngineId, Priority};

    #[test]
    fn test_retire_drops_completed_only() {
        let fences = FenceTable::new();
        let requests = RequestTable::new();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let id = requests.alloc_id();
            let fence = fences.create(Some(id));
            let rq = Arc::new(RequestShared::new(id, ContextId(1), EngineId::RCS0, fence, Priority::DEFAULT, 0));
            requests.insert(Arc::clone(&rq));
            handles.push(rq);
        }
        handles[0].fence.signal(Ok(()), 1);

        let retired = requests.retire();
        assert_eq!(retired, vec![handles[0].fence_id()]);
        fences.remove_all(&retired);

        assert_eq!(requests.len(), 1);
        assert_eq!(fences.len(), 1);
        assert!(matches!(requests.get(handles[0].id), Err(SchedError::RequestNotFound(_))));
        assert!(matches!(fences.get(handles[0].fence_id()), Err(SchedError::FenceNotFound(_))));
    }
}
