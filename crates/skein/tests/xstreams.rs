//! Execution stream integration tests
//!
//! # Running Tests
//! ```bash
//! cargo test --test xstreams
//! ```

use parking_lot::Mutex;
use skein::{
    BasicScheduler, Error, ExecutionStream, Pool, Runtime, SchedConfig, SchedState, Scheduler,
    StreamState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_streams_get_distinct_ranks() {
    let rt = Runtime::init().unwrap();
    let streams: Vec<_> = (0..3)
        .map(|_| rt.create_execution_stream_basic().unwrap())
        .collect();

    let ranks: Vec<_> = streams.iter().map(ExecutionStream::rank).collect();
    assert_eq!(ranks, vec![1, 2, 3]);
    assert_eq!(rt.streams().len(), 4);
    assert!(rt.stream(2).unwrap().ptr_eq(&streams[1]));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let units: Vec<_> = streams
        .iter()
        .map(|stream| {
            let seen = seen.clone();
            let pool = stream.main_pools()[0].clone();
            rt.spawn(&pool, move || {
                let here = ExecutionStream::current().unwrap();
                seen.lock().push((here.rank(), skein::current_rank()));
            })
            .unwrap()
        })
        .collect();
    for unit in units {
        unit.free().unwrap();
    }

    let mut seen = seen.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![(1, Some(1)), (2, Some(2)), (3, Some(3))]);

    for stream in &streams {
        stream.join().unwrap();
        assert_eq!(stream.state(), StreamState::Terminated);
        stream.free().unwrap();
    }
    assert_eq!(rt.streams().len(), 1);
    rt.finalize().unwrap();
}

#[test]
fn test_free_requires_join() {
    let rt = Runtime::init().unwrap();
    let stream = rt.create_execution_stream_basic().unwrap();

    assert!(matches!(stream.free(), Err(Error::InvalidState(_))));
    stream.join().unwrap();
    // A second join returns right away
    stream.join().unwrap();
    stream.free().unwrap();
    assert!(matches!(stream.free(), Err(Error::InvalidState(_))));
    assert!(matches!(stream.join(), Err(Error::InvalidState(_))));
    rt.finalize().unwrap();
}

#[test]
fn test_stream_cannot_join_itself() {
    let rt = Runtime::init().unwrap();
    let stream = rt.create_execution_stream_basic().unwrap();
    let pool = stream.main_pools()[0].clone();

    let result = Arc::new(Mutex::new(None));
    let (r, target) = (result.clone(), stream.clone());
    let unit = rt
        .spawn(&pool, move || *r.lock() = Some(target.join()))
        .unwrap();
    unit.free().unwrap();

    assert!(matches!(*result.lock(), Some(Err(Error::InvalidState(_)))));
    assert_eq!(stream.state(), StreamState::Running);
    stream.join().unwrap();
    stream.free().unwrap();
    rt.finalize().unwrap();
}

#[test]
fn test_unit_joins_stream() {
    let rt = Runtime::init().unwrap();
    let stream = rt.create_execution_stream_basic().unwrap();
    let remote = stream.main_pools()[0].clone();
    let pool = rt.main_pool().unwrap();

    let work = Arc::new(AtomicUsize::new(0));
    let remote_units: Vec<_> = (0..4)
        .map(|_| {
            let w = work.clone();
            rt.spawn(&remote, move || {
                w.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();

    // The joining unit suspends instead of blocking the primary stream
    let target = stream.clone();
    let joiner = rt.spawn(&pool, move || target.join().unwrap()).unwrap();
    joiner.free().unwrap();

    assert_eq!(stream.state(), StreamState::Terminated);
    assert_eq!(work.load(Ordering::SeqCst), 4);
    for unit in remote_units {
        unit.free().unwrap();
    }
    stream.free().unwrap();
    rt.finalize().unwrap();
}

#[test]
fn test_event_hook_runs_on_stream() {
    let rt = Runtime::init().unwrap();
    let pool = Pool::fifo();
    let config = SchedConfig {
        event_freq: 1,
        ..SchedConfig::default()
    };
    let sched = Scheduler::new(BasicScheduler::default(), vec![pool.clone()], config).unwrap();
    let checks = Arc::new(AtomicUsize::new(0));
    let c = checks.clone();
    sched.set_event_hook(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });

    let stream = rt.create_execution_stream(&sched).unwrap();
    let units: Vec<_> = (0..5).map(|_| rt.spawn(&pool, || {}).unwrap()).collect();
    for unit in units {
        unit.free().unwrap();
    }
    assert!(checks.load(Ordering::SeqCst) >= 5);

    sched.clear_event_hook();
    stream.join().unwrap();
    stream.free().unwrap();
    sched.free().unwrap();
    rt.finalize().unwrap();
}

#[test]
fn test_deferred_scheduler_swap() {
    let rt = Runtime::init().unwrap();
    let first_pool = Pool::fifo();
    let second_pool = Pool::fifo();
    let first = Scheduler::basic(vec![first_pool.clone()]).unwrap();
    let second = Scheduler::basic(vec![second_pool.clone()]).unwrap();

    let stream = rt.create_execution_stream(&first).unwrap();
    let before = rt.spawn(&first_pool, || {}).unwrap();
    before.free().unwrap();

    stream.set_main_scheduler(&second).unwrap();
    assert_eq!(second.bound_rank(), Some(stream.rank()));

    let rank = Arc::new(Mutex::new(None));
    let r = rank.clone();
    let after = rt
        .spawn(&second_pool, move || *r.lock() = skein::current_rank())
        .unwrap();
    after.free().unwrap();

    assert_eq!(*rank.lock(), Some(stream.rank()));
    assert!(stream.scheduler().ptr_eq(&second));
    assert_eq!(first.state(), SchedState::Finalized);
    assert_eq!(first.bound_rank(), None);
    first.free().unwrap();

    stream.join().unwrap();
    stream.free().unwrap();
    second.free().unwrap();
    rt.finalize().unwrap();
}

#[test]
fn test_swap_rejects_bound_scheduler() {
    let rt = Runtime::init().unwrap();
    let a = rt.create_execution_stream_basic().unwrap();
    let b = rt.create_execution_stream_basic().unwrap();

    assert!(matches!(
        a.set_main_scheduler(&b.scheduler()),
        Err(Error::InvalidState(_))
    ));
    // Installing the running scheduler again is a no-op
    a.set_main_scheduler(&a.scheduler()).unwrap();

    for stream in [a, b] {
        stream.join().unwrap();
        stream.free().unwrap();
    }
    rt.finalize().unwrap();
}

#[test]
fn test_finalize_joins_remaining_streams() {
    let rt = Runtime::init().unwrap();
    let stream = rt.create_execution_stream_basic().unwrap();
    let pool = stream.main_pools()[0].clone();

    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let r = ran.clone();
        rt.spawn(&pool, move || {
            skein::yield_now().unwrap();
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    rt.finalize().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 8);
    assert_eq!(stream.state(), StreamState::Terminated);
}

#[test]
fn test_info_lists_streams() {
    let rt = Runtime::init().unwrap();
    let streams = rt.create_work_stealing_streams(3).unwrap();

    let info = rt.info();
    assert_eq!(info.streams.len(), 3);
    assert!(info.streams.iter().all(|s| s.pools.len() == 3));
    let text = info.to_string();
    assert!(text.contains("stream 0 (primary)"));
    assert!(text.contains("stream 2"));

    for stream in &streams[1..] {
        stream.join().unwrap();
        stream.free().unwrap();
    }
    rt.finalize().unwrap();
}

#[test]
fn test_work_stealing_swap_keeps_queued_units() {
    let rt = Runtime::init().unwrap();
    let pool = rt.main_pool().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let units: Vec<_> = (0..3)
        .map(|_| {
            let r = ran.clone();
            rt.spawn(&pool, move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();

    let streams = rt.create_work_stealing_streams(2).unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    for unit in units {
        unit.join().unwrap();
        unit.free().unwrap();
    }

    for stream in &streams[1..] {
        stream.join().unwrap();
        stream.free().unwrap();
    }
    rt.finalize().unwrap();
}
