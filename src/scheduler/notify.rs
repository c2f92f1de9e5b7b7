//! Cross-engine notifications
//!
//! Engines never lock each other. Anything one engine must tell another
//! (a fence it signaled, a signaler that started, a priority bump) goes
//! through the target engine's inbox and is applied the next time that
//! engine runs its dispatch loop.

use crossbeam_channel::{Receiver, Sender};

use crate::fence::FenceError;
use crate::types::{EngineId, FenceId, Priority, RequestId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EngineMsg {
    /// An input fence of `request` signaled
    FenceSignaled {
        request: RequestId,
        fence: FenceId,
        error: Option<FenceError>,
    },
    /// The request behind input `fence` of `request` began executing
    SignalerStarted { request: RequestId, fence: FenceId },
    /// Raise the inherited priority of `request`
    Promote { request: RequestId, priority: Priority },
}

/// Senders into every engine inbox, indexed like the engine list
pub(crate) struct EngineLinks {
    ids: Vec<EngineId>,
    senders: Vec<Sender<EngineMsg>>,
}

impl EngineLinks {
    /// Create one inbox per engine, returning the links and the receivers
    pub fn new(ids: &[EngineId]) -> (Self, Vec<Receiver<EngineMsg>>) {
        let (senders, receivers): (Vec<Sender<EngineMsg>>, Vec<Receiver<EngineMsg>>) =
            ids.iter().map(|_| crossbeam_channel::unbounded()).unzip();
        (
            Self {
                ids: ids.to_vec(),
                senders,
            },
            receivers,
        )
    }

    pub fn send(&self, engine: EngineId, msg: EngineMsg) {
        let Some(idx) = self.ids.iter().position(|id| *id == engine) else {
            log::error!("notify: no inbox for {}", engine);
            return;
        };
        // receivers live as long as the scheduler
        if self.senders[idx].send(msg).is_err() {
            log::error!("notify: inbox of {} disconnected", engine);
        }
    }

    /// Messages waiting across all inboxes
    pub fn backlog(&self) -> usize {
        self.senders.iter().map(Sender::len).sum()
    }
}
