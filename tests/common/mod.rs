//! Shared helpers for the integration tests
#![allow(dead_code)]

use std::time::Duration;

use nexa_gpusched::{
    Batch, BufferId, ContextId, ContextParams, EngineId, EventKind, ExecBuffer, Nanos, Priority,
    RequestId, Scheduler, SchedulerConfig, Submission,
};

pub const US: Nanos = 1_000;
pub const MS: Nanos = 1_000_000;

/// Scheduler with the stock five engine topology
pub fn stock() -> Scheduler {
    nexa_gpusched::logger::init_for_tests();
    Scheduler::new(SchedulerConfig::default()).expect("default config is valid")
}

/// Scheduler with a single render engine
pub fn render_only() -> Scheduler {
    nexa_gpusched::logger::init_for_tests();
    Scheduler::new(SchedulerConfig::single(EngineId::RCS0)).expect("single engine config is valid")
}

pub fn context(sched: &Scheduler, priority: i32) -> ContextId {
    let params = ContextParams::default().priority(Priority::new(priority).unwrap());
    sched.create_context(params).unwrap()
}

pub fn buffer(sched: &Scheduler) -> BufferId {
    sched.create_buffer(4096).unwrap()
}

/// `ns` of compute followed by a store of `value` to `buf[offset]`
pub fn compute_store(ns: Nanos, buf: BufferId, offset: u32, value: u32) -> Batch {
    Batch::new().compute(ns).store(buf, offset, value)
}

pub fn submit(sched: &Scheduler, ctx: ContextId, engine: EngineId, batch: Batch) -> Submission {
    sched.submit(ExecBuffer::new(ctx, engine, batch)).unwrap()
}

pub fn run_idle(sched: &Scheduler) {
    assert!(sched.run_until_idle(Duration::from_secs(5)), "engines did not drain");
}

/// Time at which `request` left `engine`, from the event history
pub fn completed_at(sched: &Scheduler, engine: EngineId, request: RequestId) -> Nanos {
    sched
        .engine_events(engine)
        .unwrap()
        .into_iter()
        .find(|ev| {
            ev.request == Some(request)
                && matches!(ev.kind, EventKind::Completed | EventKind::Errored(_))
        })
        .map(|ev| ev.at)
        .expect("request never completed")
}

pub fn started_at(sched: &Scheduler, engine: EngineId, request: RequestId) -> Nanos {
    sched
        .engine_events(engine)
        .unwrap()
        .into_iter()
        .find(|ev| ev.request == Some(request) && ev.kind == EventKind::Started)
        .map(|ev| ev.at)
        .expect("request never started")
}
