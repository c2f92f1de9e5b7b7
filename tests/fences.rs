//! Fence and Dependency Tests
//!
//! User fences gate submissions, request fences chain work across engines,
//! and an error on any input propagates to the dependent request.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use nexa_gpusched::{
    Batch, EngineId, ExecBuffer, FenceError, FenceState, Interrupt, SchedError, Scheduler,
    SchedulerConfig, Status, Target,
};

// ============================================================================
// User fences
// ============================================================================

#[test]
fn test_user_fence_gates_submission() {
    let sched = render_only();
    let ctx = context(&sched, 0);
    let buf = buffer(&sched);
    let cork = sched.create_fence();

    let sub = sched
        .submit(ExecBuffer::new(ctx, EngineId::RCS0, compute_store(US, buf, 0, 9)).fence_in(cork))
        .unwrap();
    sched.advance(Duration::from_millis(5));
    assert_eq!(sched.query_status(Target::Request(sub.request)).unwrap(), Status::Pending);
    assert_eq!(sched.read_buffer(buf, 0).unwrap(), 0);
    assert!(!sched.query_engine_busy(EngineId::RCS0).unwrap());

    assert!(sched.signal_fence(cork).unwrap());
    run_idle(&sched);
    assert_eq!(sched.query_status(Target::Fence(sub.fence)).unwrap(), Status::Completed);
    assert_eq!(sched.read_buffer(buf, 0).unwrap(), 9);
}

#[test]
fn test_signal_is_idempotent() {
    let sched = render_only();
    let fence = sched.create_fence();

    assert!(sched.signal_fence(fence).unwrap());
    assert!(!sched.signal_fence(fence).unwrap());
    assert!(!sched.signal_fence_error(fence, FenceError::Reset).unwrap());
    assert_eq!(sched.fence_state(fence).unwrap(), FenceState::Signaled);
}

#[test]
fn test_already_signaled_fence_does_not_block() {
    let sched = render_only();
    let ctx = context(&sched, 0);
    let fence = sched.create_fence();
    sched.signal_fence(fence).unwrap();

    let sub = sched
        .submit(ExecBuffer::new(ctx, EngineId::RCS0, Batch::new().compute(US)).fence_in(fence))
        .unwrap();
    run_idle(&sched);
    assert_eq!(sched.query_status(Target::Request(sub.request)).unwrap(), Status::Completed);
}

#[test]
fn test_unknown_fence_rejected() {
    let sched = render_only();
    let ctx = context(&sched, 0);
    let fence = sched.create_fence();
    sched.close_fence(fence).unwrap();

    let err = sched
        .submit(ExecBuffer::new(ctx, EngineId::RCS0, Batch::new().compute(US)).fence_in(fence))
        .unwrap_err();
    assert!(matches!(err, SchedError::FenceNotFound(_)));
    assert_eq!(err.errno(), -2);
}

// ============================================================================
// Error propagation
// ============================================================================

#[test]
fn test_input_error_propagates_down_the_chain() {
    let sched = stock();
    let ctx = context(&sched, 0);
    let other = context(&sched, 0);
    let buf = buffer(&sched);
    let cork = sched.create_fence();

    let first = sched
        .submit(ExecBuffer::new(ctx, EngineId::RCS0, compute_store(US, buf, 0, 1)).fence_in(cork))
        .unwrap();
    let second = sched
        .submit(
            ExecBuffer::new(other, EngineId::BCS0, compute_store(US, buf, 4, 2)).fence_in(first.fence),
        )
        .unwrap();

    sched.signal_fence_error(cork, FenceError::Reset).unwrap();
    run_idle(&sched);

    assert_eq!(
        sched.query_status(Target::Request(first.request)).unwrap(),
        Status::Error(FenceError::Dependency)
    );
    assert_eq!(
        sched.query_status(Target::Request(second.request)).unwrap(),
        Status::Error(FenceError::Dependency)
    );
    let contents = sched.buffer_contents(buf).unwrap();
    assert_eq!((contents[0], contents[4]), (0, 0));
    assert_eq!(sched.fence_state(second.fence).unwrap().status(), -5);
}

#[test]
fn test_close_fence_releases_waiters_with_error() {
    let sched = render_only();
    let ctx = context(&sched, 0);
    let cork = sched.create_fence();

    let sub = sched
        .submit(ExecBuffer::new(ctx, EngineId::RCS0, Batch::new().compute(US)).fence_in(cork))
        .unwrap();
    sched.close_fence(cork).unwrap();
    run_idle(&sched);

    assert_eq!(
        sched.query_status(Target::Request(sub.request)).unwrap(),
        Status::Error(FenceError::Dependency)
    );
}

// ============================================================================
// Cross-engine dependencies
// ============================================================================

#[test]
fn test_cross_engine_chain_orders_completion() {
    let sched = stock();
    let ctx = context(&sched, 0);
    let buf = buffer(&sched);

    let producer = sched
        .submit(ExecBuffer::new(ctx, EngineId::BCS0, compute_store(2 * MS, buf, 0, 5)).write(buf))
        .unwrap();
    let consumer = sched
        .submit(
            ExecBuffer::new(ctx, EngineId::VCS0, Batch::new().wait_eq(buf, 0, 5).store(buf, 4, 6))
                .fence_in(producer.fence),
        )
        .unwrap();
    run_idle(&sched);

    assert_eq!(sched.read_buffer(buf, 4).unwrap(), 6);
    assert!(
        completed_at(&sched, EngineId::BCS0, producer.request)
            <= completed_at(&sched, EngineId::VCS0, consumer.request)
    );
}

#[test]
fn test_semaphore_waiter_queued_early() {
    let sched = stock();
    let ctx = context(&sched, 0);

    let producer = submit(&sched, ctx, EngineId::BCS0, Batch::new().compute(5 * MS));
    let consumer = sched
        .submit(ExecBuffer::new(ctx, EngineId::RCS0, Batch::new().compute(US)).fence_in(producer.fence))
        .unwrap();
    sched.advance(Duration::from_millis(1));

    // the producer is running remotely, so the consumer sits on its engine
    assert_ne!(sched.query_status(Target::Request(consumer.request)).unwrap(), Status::Pending);
    assert!(sched.query_engine_busy(EngineId::RCS0).unwrap());

    run_idle(&sched);
    assert!(
        completed_at(&sched, EngineId::BCS0, producer.request)
            <= completed_at(&sched, EngineId::RCS0, consumer.request)
    );
}

#[test]
fn test_semaphores_disabled_keeps_waiter_pending() {
    nexa_gpusched::logger::init_for_tests();
    let config = SchedulerConfig {
        semaphores: false,
        ..SchedulerConfig::default()
    };
    let sched = Scheduler::new(config).unwrap();
    let ctx = context(&sched, 0);

    let producer = submit(&sched, ctx, EngineId::BCS0, Batch::new().compute(5 * MS));
    let consumer = sched
        .submit(ExecBuffer::new(ctx, EngineId::RCS0, Batch::new().compute(US)).fence_in(producer.fence))
        .unwrap();
    sched.advance(Duration::from_millis(1));

    assert_eq!(sched.query_status(Target::Request(consumer.request)).unwrap(), Status::Pending);
    assert!(!sched.query_engine_busy(EngineId::RCS0).unwrap());
    run_idle(&sched);
    assert_eq!(sched.query_status(Target::Request(consumer.request)).unwrap(), Status::Completed);
}

// ============================================================================
// Submit fences
// ============================================================================

#[test]
fn test_submit_fence_runs_beside_spinning_signaler() {
    let sched = stock();
    let ctx = context(&sched, 0);
    let buf = buffer(&sched);

    let spinner = submit(&sched, ctx, EngineId::BCS0, Batch::spinner());
    let dependent = sched
        .submit(
            ExecBuffer::new(ctx, EngineId::RCS0, compute_store(MS, buf, 0, 5))
                .submit_fence(spinner.fence),
        )
        .unwrap();
    sched.advance(Duration::from_millis(2));

    assert_eq!(sched.query_status(Target::Request(dependent.request)).unwrap(), Status::Completed);
    assert_eq!(sched.query_status(Target::Request(spinner.request)).unwrap(), Status::Running);
    assert_eq!(sched.read_buffer(buf, 0).unwrap(), 5);

    sched.end_spin(spinner.request).unwrap();
    run_idle(&sched);
    assert!(
        completed_at(&sched, EngineId::RCS0, dependent.request)
            < completed_at(&sched, EngineId::BCS0, spinner.request)
    );
}

#[test]
fn test_fence_in_waits_for_spinning_signaler() {
    let sched = stock();
    let ctx = context(&sched, 0);
    let buf = buffer(&sched);

    let spinner = submit(&sched, ctx, EngineId::BCS0, Batch::spinner());
    let dependent = sched
        .submit(ExecBuffer::new(ctx, EngineId::RCS0, compute_store(MS, buf, 0, 5)).fence_in(spinner.fence))
        .unwrap();
    sched.advance(Duration::from_millis(2));

    assert_ne!(sched.query_status(Target::Request(dependent.request)).unwrap(), Status::Completed);
    assert_eq!(sched.read_buffer(buf, 0).unwrap(), 0);

    sched.end_spin(spinner.request).unwrap();
    run_idle(&sched);
    assert_eq!(sched.read_buffer(buf, 0).unwrap(), 5);
}

#[test]
fn test_submit_fence_waits_for_signaler_start() {
    let sched = stock();
    let ctx = context(&sched, 0);
    let buf = buffer(&sched);
    let cork = sched.create_fence();

    let producer = sched
        .submit(ExecBuffer::new(ctx, EngineId::BCS0, Batch::spinner()).fence_in(cork))
        .unwrap();
    let dependent = sched
        .submit(
            ExecBuffer::new(ctx, EngineId::RCS0, compute_store(US, buf, 0, 3))
                .submit_fence(producer.fence),
        )
        .unwrap();
    sched.advance(Duration::from_millis(2));
    assert_eq!(sched.query_status(Target::Request(dependent.request)).unwrap(), Status::Pending);

    sched.signal_fence(cork).unwrap();
    sched.advance(Duration::from_millis(1));
    assert_eq!(sched.query_status(Target::Request(dependent.request)).unwrap(), Status::Completed);
    assert_eq!(sched.query_status(Target::Request(producer.request)).unwrap(), Status::Running);

    sched.end_spin(producer.request).unwrap();
    run_idle(&sched);
}

#[test]
fn test_submit_fence_error_before_start_propagates() {
    let sched = stock();
    let ctx = context(&sched, 0);
    let cork = sched.create_fence();

    let producer = sched
        .submit(ExecBuffer::new(ctx, EngineId::BCS0, Batch::new().compute(MS)).fence_in(cork))
        .unwrap();
    let dependent = sched
        .submit(
            ExecBuffer::new(ctx, EngineId::RCS0, Batch::new().compute(MS))
                .submit_fence(producer.fence),
        )
        .unwrap();
    sched.signal_fence_error(cork, FenceError::Reset).unwrap();
    run_idle(&sched);

    assert_eq!(
        sched.query_status(Target::Request(producer.request)).unwrap(),
        Status::Error(FenceError::Dependency)
    );
    assert_eq!(
        sched.query_status(Target::Request(dependent.request)).unwrap(),
        Status::Error(FenceError::Dependency)
    );
}

// ============================================================================
// Blocking waits
// ============================================================================

#[test]
fn test_wait_fence_wakes_on_signal() {
    let sched = Arc::new(render_only());
    let fence = sched.create_fence();

    let signaler = {
        let sched = Arc::clone(&sched);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sched.signal_fence(fence).unwrap();
        })
    };

    let state = sched.wait_fence(fence, Some(Duration::from_secs(5)), None).unwrap();
    assert_eq!(state, FenceState::Signaled);
    signaler.join().unwrap();
}

#[test]
fn test_wait_fence_timeout_and_interrupt() {
    let sched = render_only();
    let fence = sched.create_fence();

    let err = sched.wait_fence(fence, Some(Duration::from_millis(10)), None).unwrap_err();
    assert!(matches!(err, SchedError::TimedOut));

    let interrupt = Interrupt::new();
    interrupt.trigger();
    let err = sched.wait_fence(fence, None, Some(&interrupt)).unwrap_err();
    assert!(matches!(err, SchedError::Interrupted));
    assert_eq!(err.errno(), -4);
}
