//! Priority inheritance
//!
//! A request waiting on lower priority work lends its priority to that
//! work so the chain completes as if it ran at the waiter's priority.
//!
//! ## Algorithm:
//! 1. On submission or priority increase, each unsignaled signaler of the
//!    request is promoted to the request's effective priority.
//! 2. Promotion raises the inherited floor, re-sorts the request if queued
//!    and walks on to its own signalers.
//! 3. Signalers on other engines are promoted through their engine inbox.
//!
//! Inherited priority only ever rises; completion ends it.

use crate::types::{EngineId, Priority, RequestId};

use super::engine::EngineSched;
use super::notify::EngineMsg;
use super::stats::EventKind;
use super::Shared;

impl EngineSched {
    /// Lend `id`'s effective priority to its signalers
    pub(super) fn propagate(&mut self, id: RequestId, shared: &Shared) {
        let Some(req) = self.requests.get(&id) else { return };
        let prio = req.effective();
        let targets: Vec<(EngineId, RequestId)> = req
            .blockers()
            .filter_map(|dep| dep.signaler.as_ref())
            .filter(|signaler| !signaler.is_complete() && signaler.effective_priority() < prio)
            .map(|signaler| (signaler.engine, signaler.id))
            .collect();

        for (engine, signaler) in targets {
            if engine == self.id {
                self.promote(signaler, prio, shared);
            } else {
                shared.links.send(
                    engine,
                    EngineMsg::Promote {
                        request: signaler,
                        priority: prio,
                    },
                );
            }
        }
    }

    /// Raise the inherited priority of `id` and, transitively, of the
    /// requests it waits on
    pub(super) fn promote(&mut self, id: RequestId, prio: Priority, shared: &Shared) {
        let mut work = vec![id];

        while let Some(id) = work.pop() {
            let Some(req) = self.requests.get_mut(&id) else { continue };
            if req.effective() >= prio {
                continue;
            }
            req.inherited = prio;
            req.shared.publish_priority(req.effective());

            let mut remote = Vec::new();
            for dep in req.blockers() {
                let Some(signaler) = dep.signaler.as_ref() else { continue };
                if signaler.engine == self.id {
                    work.push(signaler.id);
                } else {
                    remote.push((signaler.engine, signaler.id));
                }
            }

            if self.queue.contains(id) {
                if let Some(key) = self.key(id) {
                    self.queue.insert(key);
                }
            }
            self.stats.promotions += 1;
            self.record(Some(id), EventKind::Promoted(prio));
            log::debug!("{}: promoted {} to {}", self.id, id, prio);

            for (engine, request) in remote {
                shared.links.send(engine, EngineMsg::Promote { request, priority: prio });
            }
        }
    }
}
