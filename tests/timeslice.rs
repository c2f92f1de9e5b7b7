//! Timeslice Tests
//!
//! Equal priority requests share an engine in quanta; lower priority work
//! never receives a slice while higher priority work is runnable. Requests
//! stalled on a semaphore yield to their contenders.

mod common;

use std::time::Duration;

use common::*;
use nexa_gpusched::{Batch, EngineId, EngineProperty, ExecBuffer};

#[test]
fn test_equal_priority_requests_interleave() {
    let sched = render_only();
    let a = context(&sched, 0);
    let b = context(&sched, 0);

    let first = submit(&sched, a, EngineId::RCS0, Batch::new().compute(10 * MS));
    let second = submit(&sched, b, EngineId::RCS0, Batch::new().compute(10 * MS));
    run_idle(&sched);

    // with 1ms slices the first request cannot finish before ~19ms
    let first_done = completed_at(&sched, EngineId::RCS0, first.request);
    let second_done = completed_at(&sched, EngineId::RCS0, second.request);
    assert!(first_done >= 18 * MS, "first done at {}", first_done);
    assert!(second_done >= first_done);
    assert!(started_at(&sched, EngineId::RCS0, second.request) <= MS + 100 * US);

    let stats = sched.engine_stats(EngineId::RCS0).unwrap();
    assert!(stats.timeslices >= 18, "only {} timeslices", stats.timeslices);
    assert_eq!(stats.preemptions, 0);
}

#[test]
fn test_timeslice_disabled_runs_in_order() {
    let sched = render_only();
    let a = context(&sched, 0);
    let b = context(&sched, 0);
    sched
        .set_engine_property(EngineId::RCS0, EngineProperty::Timeslice(Duration::ZERO))
        .unwrap();

    let first = submit(&sched, a, EngineId::RCS0, Batch::new().compute(10 * MS));
    let second = submit(&sched, b, EngineId::RCS0, Batch::new().compute(10 * MS));
    run_idle(&sched);

    assert_eq!(completed_at(&sched, EngineId::RCS0, first.request), 10 * MS);
    assert_eq!(completed_at(&sched, EngineId::RCS0, second.request), 20 * MS);
    assert_eq!(sched.engine_stats(EngineId::RCS0).unwrap().timeslices, 0);
}

#[test]
fn test_lower_priority_gets_no_slice() {
    let sched = render_only();
    let hi = context(&sched, 10);
    let lo = context(&sched, -10);

    let first = submit(&sched, hi, EngineId::RCS0, Batch::new().compute(5 * MS));
    let second = submit(&sched, lo, EngineId::RCS0, Batch::new().compute(5 * MS));
    run_idle(&sched);

    assert_eq!(completed_at(&sched, EngineId::RCS0, first.request), 5 * MS);
    assert_eq!(completed_at(&sched, EngineId::RCS0, second.request), 10 * MS);
    assert_eq!(sched.engine_stats(EngineId::RCS0).unwrap().timeslices, 0);
}

#[test]
fn test_semaphore_wait_yields_to_contender() {
    let sched = render_only();
    let a = context(&sched, 0);
    let b = context(&sched, 0);
    let buf = buffer(&sched);

    // the waiter is submitted first and would spin for a whole slice
    let waiter = sched
        .submit(
            ExecBuffer::new(a, EngineId::RCS0, Batch::new().wait_eq(buf, 0, 1).store(buf, 4, 2))
                .read(buf),
        )
        .unwrap();
    let signaler = submit(&sched, b, EngineId::RCS0, compute_store(100 * US, buf, 0, 1));
    run_idle(&sched);

    assert_eq!(sched.read_buffer(buf, 4).unwrap(), 2);
    assert!(completed_at(&sched, EngineId::RCS0, signaler.request) <= 100 * US);
    assert!(completed_at(&sched, EngineId::RCS0, waiter.request) < MS);

    let stats = sched.engine_stats(EngineId::RCS0).unwrap();
    assert!(stats.semaphore_yields >= 1);
    assert_eq!(stats.timeslices, 0);
}

#[test]
fn test_runtime_is_split_between_contenders() {
    let sched = render_only();
    let a = context(&sched, 0);
    let b = context(&sched, 0);

    submit(&sched, a, EngineId::RCS0, Batch::new().compute(4 * MS));
    submit(&sched, b, EngineId::RCS0, Batch::new().compute(4 * MS));
    sched.advance(Duration::from_millis(4));

    // both contexts received engine time before either finished
    let ra = sched.context_runtime(a).unwrap().total();
    let rb = sched.context_runtime(b).unwrap().total();
    assert_eq!(ra + rb, 4 * MS);
    assert_eq!(ra, 2 * MS);
    assert_eq!(rb, 2 * MS);
}

#[test]
fn test_spinners_share_engine_fairly() {
    let sched = render_only();
    let spinners: Vec<_> = (0..3)
        .map(|_| {
            let ctx = context(&sched, 0);
            submit(&sched, ctx, EngineId::RCS0, Batch::spinner())
        })
        .collect();
    sched.advance(Duration::from_millis(300));

    // three contenders over two ports still rotate through every one
    let runtimes: Vec<Duration> = spinners
        .iter()
        .map(|s| sched.request_runtime(s.request).unwrap())
        .collect();
    let tolerance = Duration::from_millis(17);
    for runtime in &runtimes {
        let fair = Duration::from_millis(100);
        let drift = if *runtime > fair { *runtime - fair } else { fair - *runtime };
        assert!(drift <= tolerance, "runtimes {:?}", runtimes);
    }
    assert_eq!(runtimes.iter().sum::<Duration>(), Duration::from_millis(300));

    for spinner in &spinners {
        sched.end_spin(spinner.request).unwrap();
    }
    run_idle(&sched);
}
