//! Priority Ordering Tests
//!
//! Dispatch order between contexts of different priorities, FIFO order
//! within a priority level and priority inheritance along dependencies.

mod common;

use common::*;
use nexa_gpusched::{Batch, EngineId, ExecBuffer, Priority, SchedError, Status, Target};

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_fifo_within_context() {
    let sched = render_only();
    let ctx = context(&sched, 0);
    let buf = buffer(&sched);

    let subs: Vec<_> = (0..5)
        .map(|i| {
            sched
                .submit(ExecBuffer::new(ctx, EngineId::RCS0, compute_store(10 * US, buf, 0, i)).write(buf))
                .unwrap()
        })
        .collect();
    run_idle(&sched);

    assert_eq!(sched.read_buffer(buf, 0).unwrap(), 4);
    let order = sched.execution_order(EngineId::RCS0).unwrap();
    let expected: Vec<_> = subs.iter().map(|s| s.request).collect();
    assert_eq!(order, expected);
}

#[test]
fn test_higher_priority_runs_first() {
    let sched = render_only();
    let lo = context(&sched, -10);
    let hi = context(&sched, 10);
    let buf = buffer(&sched);
    let cork = sched.create_fence();

    let lo_sub = sched
        .submit(ExecBuffer::new(lo, EngineId::RCS0, compute_store(US, buf, 0, 1)).fence_in(cork))
        .unwrap();
    let hi_sub = sched
        .submit(ExecBuffer::new(hi, EngineId::RCS0, compute_store(US, buf, 4, 2)).fence_in(cork))
        .unwrap();

    sched.signal_fence(cork).unwrap();
    run_idle(&sched);

    assert_eq!(
        sched.execution_order(EngineId::RCS0).unwrap(),
        vec![hi_sub.request, lo_sub.request]
    );
}

#[test]
fn test_equal_priority_keeps_submission_order() {
    let sched = render_only();
    let a = context(&sched, 0);
    let b = context(&sched, 0);
    let buf = buffer(&sched);
    let cork = sched.create_fence();

    let first = sched
        .submit(ExecBuffer::new(a, EngineId::RCS0, compute_store(US, buf, 0, 1)).fence_in(cork))
        .unwrap();
    let second = sched
        .submit(ExecBuffer::new(b, EngineId::RCS0, compute_store(US, buf, 4, 2)).fence_in(cork))
        .unwrap();
    sched.signal_fence(cork).unwrap();
    run_idle(&sched);

    assert_eq!(
        sched.execution_order(EngineId::RCS0).unwrap(),
        vec![first.request, second.request]
    );
}

// ============================================================================
// Priority changes
// ============================================================================

#[test]
fn test_set_priority_reorders_queued_work() {
    let sched = render_only();
    let a = context(&sched, 0);
    let b = context(&sched, 0);
    let buf = buffer(&sched);
    let cork = sched.create_fence();

    let a_sub = sched
        .submit(ExecBuffer::new(a, EngineId::RCS0, compute_store(US, buf, 0, 1)).fence_in(cork))
        .unwrap();
    let b_sub = sched
        .submit(ExecBuffer::new(b, EngineId::RCS0, compute_store(US, buf, 4, 2)).fence_in(cork))
        .unwrap();

    sched.set_priority(a, -100).unwrap();
    assert_eq!(sched.request_priority(a_sub.request).unwrap(), Priority::new(-100).unwrap());

    sched.signal_fence(cork).unwrap();
    run_idle(&sched);
    assert_eq!(
        sched.execution_order(EngineId::RCS0).unwrap(),
        vec![b_sub.request, a_sub.request]
    );
}

#[test]
fn test_set_priority_rejects_out_of_range() {
    let sched = render_only();
    let ctx = context(&sched, 0);

    let err = sched.set_priority(ctx, 5000).unwrap_err();
    assert!(matches!(err, SchedError::InvalidPriority(5000)));
    assert_eq!(err.errno(), -22);
    assert_eq!(sched.context_priority(ctx).unwrap(), Priority::DEFAULT);
}

#[test]
fn test_submission_priority_override_is_pinned() {
    let sched = render_only();
    let ctx = context(&sched, 0);
    let buf = buffer(&sched);
    let cork = sched.create_fence();

    let pinned = sched
        .submit(
            ExecBuffer::new(ctx, EngineId::RCS0, compute_store(US, buf, 0, 1))
                .fence_in(cork)
                .priority(Priority::new(50).unwrap()),
        )
        .unwrap();
    sched.set_priority(ctx, -100).unwrap();

    assert_eq!(sched.request_priority(pinned.request).unwrap(), Priority::new(50).unwrap());
}

// ============================================================================
// Priority inheritance
// ============================================================================

#[test]
fn test_promotion_through_implicit_dependency() {
    let sched = render_only();
    let lo = context(&sched, Priority::MIN.get());
    let hi = context(&sched, 0);
    let noise = context(&sched, Priority::MIN.get() / 2);
    let result = buffer(&sched);
    let dep = buffer(&sched);
    let cork = sched.create_fence();

    let store = |ctx, buf, value, corked: bool, write: bool| {
        let mut exec = ExecBuffer::new(ctx, EngineId::RCS0, compute_store(10 * US, buf, 0, value));
        exec = if write { exec.write(buf) } else { exec.read(buf) };
        if corked {
            exec = exec.fence_in(cork);
        }
        sched.submit(exec).unwrap()
    };

    let noise_res = store(noise, result, 3, true, false);
    let lo_res = store(lo, result, 1, true, false);
    let lo_dep = store(lo, dep, 1, false, true);
    let hi_dep = store(hi, dep, 2, false, false);
    let _hi_res = store(hi, result, 2, false, false);

    // the high priority reader lends its priority down the low chain
    assert_eq!(sched.request_priority(lo_dep.request).unwrap(), Priority::DEFAULT);
    assert_eq!(sched.request_priority(lo_res.request).unwrap(), Priority::DEFAULT);
    assert_eq!(
        sched.request_priority(noise_res.request).unwrap(),
        Priority::new(Priority::MIN.get() / 2).unwrap()
    );

    sched.signal_fence(cork).unwrap();
    run_idle(&sched);

    assert_eq!(sched.read_buffer(dep, 0).unwrap(), 2);
    assert_eq!(sched.read_buffer(result, 0).unwrap(), 3);
    let order = sched.execution_order(EngineId::RCS0).unwrap();
    let pos = |id| order.iter().position(|r| *r == id).unwrap();
    assert!(pos(lo_dep.request) < pos(hi_dep.request));
    assert!(pos(hi_dep.request) < pos(noise_res.request));
}

#[test]
fn test_promotion_crosses_engines() {
    let sched = stock();
    let lo = context(&sched, -500);
    let hi = context(&sched, 200);
    let buf = buffer(&sched);
    let cork = sched.create_fence();

    let producer = sched
        .submit(ExecBuffer::new(lo, EngineId::BCS0, compute_store(US, buf, 0, 1)).fence_in(cork))
        .unwrap();
    let consumer = sched
        .submit(
            ExecBuffer::new(hi, EngineId::RCS0, Batch::new().compute(US)).fence_in(producer.fence),
        )
        .unwrap();

    assert_eq!(sched.request_priority(producer.request).unwrap(), Priority::new(200).unwrap());
    assert_eq!(sched.query_status(Target::Request(consumer.request)).unwrap(), Status::Pending);

    sched.signal_fence(cork).unwrap();
    run_idle(&sched);
    assert_eq!(sched.query_status(Target::Request(consumer.request)).unwrap(), Status::Completed);
    assert!(
        completed_at(&sched, EngineId::BCS0, producer.request)
            <= completed_at(&sched, EngineId::RCS0, consumer.request)
    );
}

#[test]
fn test_promotion_is_not_lowered_by_context_change() {
    let sched = render_only();
    let lo = context(&sched, -100);
    let hi = context(&sched, 100);
    let cork = sched.create_fence();

    let producer = sched
        .submit(ExecBuffer::new(lo, EngineId::RCS0, Batch::new().compute(US)).fence_in(cork))
        .unwrap();
    sched
        .submit(ExecBuffer::new(hi, EngineId::RCS0, Batch::new().compute(US)).fence_in(producer.fence))
        .unwrap();

    sched.set_priority(lo, -200).unwrap();
    assert_eq!(sched.request_priority(producer.request).unwrap(), Priority::new(100).unwrap());
}
