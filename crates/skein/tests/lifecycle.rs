//! Work unit lifecycle integration tests
//!
//! Tests validate:
//! - join/free/revive and context reuse
//! - Cooperative yielding and its error cases
//! - Attribute and pool validation
//! - Migration between streams
//!
//! # Running Tests
//! ```bash
//! cargo test --test lifecycle
//! ```

use parking_lot::Mutex;
use skein::sync::Eventual;
use skein::{Error, Pool, Runtime, UnitAttr, UnitKind, UnitState, WorkUnit};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ===== Join / Free / Revive =====

#[test]
fn test_join_then_free() {
    let rt = Runtime::init().unwrap();
    let pool = rt.main_pool().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    let unit = rt
        .spawn(&pool, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(unit.kind(), UnitKind::Stackful);

    unit.join().unwrap();
    assert_eq!(unit.state(), UnitState::Terminated);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(!unit.panicked());

    // Joining a terminated unit returns immediately
    unit.join().unwrap();
    unit.free().unwrap();
    assert!(unit.is_freed());
    assert!(matches!(unit.join(), Err(Error::InvalidState(_))));
    assert!(matches!(unit.free(), Err(Error::InvalidState(_))));

    let stats = rt.stats();
    assert_eq!(stats.units_spawned, 1);
    assert_eq!(stats.units_terminated, 1);
    assert!(rt.live_units().is_empty());
    rt.finalize().unwrap();
}

#[test]
fn test_revive_reuses_context() {
    let rt = Runtime::init().unwrap();
    let pool = rt.main_pool().unwrap();
    let total = Arc::new(AtomicUsize::new(0));

    let t = total.clone();
    let unit = rt
        .spawn(&pool, move || {
            t.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    unit.join().unwrap();
    let context = unit.context_id();
    assert!(context.is_some());

    for add in [10, 100] {
        let t = total.clone();
        rt.revive(&pool, &unit, move || {
            t.fetch_add(add, Ordering::SeqCst);
        })
        .unwrap();
        unit.join().unwrap();
        assert_eq!(unit.context_id(), context);
    }

    assert_eq!(total.load(Ordering::SeqCst), 111);
    assert_eq!(unit.revivals(), 2);
    let stats = rt.stats();
    assert_eq!(stats.units_revived, 2);
    assert_eq!(stats.contexts_created, 1);
    assert_eq!(stats.units_terminated, 3);

    unit.free().unwrap();
    assert!(matches!(
        rt.revive(&pool, &unit, || {}),
        Err(Error::InvalidState(_))
    ));
    rt.finalize().unwrap();
}

#[test]
fn test_revive_requires_termination() {
    let rt = Runtime::init().unwrap();
    let pool = rt.main_pool().unwrap();

    let unit = rt.spawn(&pool, || {}).unwrap();
    // Still queued: the primary stream has not run it yet
    assert_eq!(unit.state(), UnitState::Ready);
    assert!(matches!(
        rt.revive(&pool, &unit, || {}),
        Err(Error::InvalidState(_))
    ));
    unit.free().unwrap();

    let tasklet = rt.spawn_tasklet(&pool, || {}).unwrap();
    tasklet.join().unwrap();
    assert!(matches!(
        rt.revive(&pool, &tasklet, || {}),
        Err(Error::InvalidState(_))
    ));
    tasklet.free().unwrap();
    rt.finalize().unwrap();
}

#[test]
fn test_contexts_recycled_after_free() {
    let rt = Runtime::init().unwrap();
    let pool = rt.main_pool().unwrap();

    for _ in 0..5 {
        rt.spawn(&pool, || {}).unwrap().free().unwrap();
    }
    let stats = rt.stats();
    assert_eq!(stats.units_spawned, 5);
    assert_eq!(stats.contexts_created, 1);
    assert_eq!(stats.contexts_reused, 4);
    rt.finalize().unwrap();
}

#[test]
fn test_panicking_unit_does_not_take_down_stream() {
    let rt = Runtime::init().unwrap();
    let stream = rt.create_execution_stream_basic().unwrap();
    let pool = stream.main_pools()[0].clone();

    let bad = rt.spawn(&pool, || panic!("boom")).unwrap();
    bad.join().unwrap();
    assert!(bad.panicked());

    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    let good = rt
        .spawn(&pool, move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    good.free().unwrap();
    bad.free().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    stream.join().unwrap();
    stream.free().unwrap();
    rt.finalize().unwrap();
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_finalize_releases_blocked_units() {
    let rt = Runtime::init().unwrap();
    let pool = rt.main_pool().unwrap();
    let never: Arc<Eventual<u32>> = Arc::new(Eventual::new());
    let dropped = Arc::new(AtomicBool::new(false));

    let (e, flag) = (never.clone(), DropFlag(dropped.clone()));
    let blocked = rt
        .spawn(&pool, move || {
            let _flag = flag;
            e.wait().unwrap();
        })
        .unwrap();
    // Running the next unit lets the first one reach its wait
    rt.spawn(&pool, || {}).unwrap().free().unwrap();
    assert_eq!(blocked.state(), UnitState::Blocked);

    let orphan_pool = Pool::fifo();
    let orphan = rt.spawn(&orphan_pool, || {}).unwrap();

    rt.finalize().unwrap();
    assert_eq!(blocked.state(), UnitState::Terminated);
    assert_eq!(orphan.state(), UnitState::Terminated);
    assert_eq!(orphan_pool.size(), 0);
    blocked.join().unwrap();
    orphan.join().unwrap();

    // The context thread unwinds the suspended closure
    let deadline = Instant::now() + Duration::from_secs(2);
    while !dropped.load(Ordering::SeqCst) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(dropped.load(Ordering::SeqCst));
}

// ===== Yielding =====

#[test]
fn test_yield_interleaves_units() {
    let rt = Runtime::init().unwrap();
    let pool = rt.main_pool().unwrap();
    let trace = Arc::new(Mutex::new(Vec::new()));

    let units: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|name| {
            let trace = trace.clone();
            rt.spawn(&pool, move || {
                for step in 0..3 {
                    trace.lock().push(format!("{}{}", name, step));
                    skein::yield_now().unwrap();
                }
            })
            .unwrap()
        })
        .collect();
    for unit in units {
        unit.free().unwrap();
    }

    assert_eq!(*trace.lock(), vec!["a0", "b0", "a1", "b1", "a2", "b2"]);
    rt.finalize().unwrap();
}

#[test]
fn test_yield_errors() {
    let rt = Runtime::init().unwrap();
    let pool = rt.main_pool().unwrap();

    assert!(matches!(skein::yield_now(), Err(Error::InvalidState(_))));

    let result = Arc::new(Mutex::new(None));
    let r = result.clone();
    let tasklet = rt
        .spawn_tasklet(&pool, move || {
            *r.lock() = Some(skein::yield_now());
        })
        .unwrap();
    tasklet.free().unwrap();
    assert!(matches!(*result.lock(), Some(Err(Error::Unsupported(_)))));
    rt.finalize().unwrap();
}

#[test]
fn test_self_join_rejected() {
    let rt = Runtime::init().unwrap();
    let pool = rt.main_pool().unwrap();
    let slot: Arc<Mutex<Option<WorkUnit>>> = Arc::new(Mutex::new(None));
    let result = Arc::new(Mutex::new(None));

    let (s, r) = (slot.clone(), result.clone());
    let unit = rt
        .spawn(&pool, move || {
            let me = skein::unit::current().unwrap();
            assert_eq!(s.lock().as_ref().map(WorkUnit::id), Some(me.id()));
            *r.lock() = Some(me.join());
        })
        .unwrap();
    *slot.lock() = Some(unit.clone());

    unit.free().unwrap();
    assert!(matches!(*result.lock(), Some(Err(Error::InvalidState(_)))));
    rt.finalize().unwrap();
}

#[test]
fn test_unit_joins_another_unit() {
    let rt = Runtime::init().unwrap();
    let pool = rt.main_pool().unwrap();
    let trace = Arc::new(Mutex::new(Vec::new()));

    let t = trace.clone();
    let child = rt
        .spawn(&pool, move || {
            skein::yield_now().unwrap();
            t.lock().push("child");
        })
        .unwrap();

    let (t, c) = (trace.clone(), child.clone());
    let parent = rt
        .spawn(&pool, move || {
            c.join().unwrap();
            t.lock().push("parent");
        })
        .unwrap();

    parent.free().unwrap();
    child.free().unwrap();
    assert_eq!(*trace.lock(), vec!["child", "parent"]);
    rt.finalize().unwrap();
}

// ===== Validation =====

#[test]
fn test_invalid_attributes_rejected() {
    let rt = Runtime::init().unwrap();
    let pool = rt.main_pool().unwrap();

    let tiny = UnitAttr::default().with_stack_size(1024);
    assert!(matches!(
        rt.spawn_with(&pool, tiny, || {}),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(rt.stats().units_spawned, 0);
    rt.finalize().unwrap();
}

#[test]
fn test_spawn_into_destroyed_pool() {
    let rt = Runtime::init().unwrap();
    let pool = Pool::fifo();
    pool.destroy().unwrap();

    assert!(matches!(rt.spawn(&pool, || {}), Err(Error::InvalidArgument(_))));
    assert!(matches!(
        rt.spawn_tasklet(&pool, || {}),
        Err(Error::InvalidArgument(_))
    ));
    rt.finalize().unwrap();
}

// ===== Migration =====

#[test]
fn test_migrate_queued_unit_to_stream() {
    let rt = Runtime::init().unwrap();
    let stream = rt.create_execution_stream_basic().unwrap();
    let pool = rt.main_pool().unwrap();

    let rank = Arc::new(Mutex::new(None));
    let r = rank.clone();
    let unit = rt
        .spawn(&pool, move || *r.lock() = skein::current_rank())
        .unwrap();
    stream.migrate_unit(&unit).unwrap();
    assert!(unit.last_pool().unwrap().ptr_eq(&stream.main_pools()[0]));

    unit.free().unwrap();
    assert_eq!(*rank.lock(), Some(stream.rank()));

    stream.join().unwrap();
    stream.free().unwrap();
    rt.finalize().unwrap();
}

#[test]
fn test_running_unit_migrates_itself() {
    let rt = Runtime::init().unwrap();
    let stream = rt.create_execution_stream_basic().unwrap();
    let pool = rt.main_pool().unwrap();

    let ranks = Arc::new(Mutex::new(Vec::new()));
    let (r, target) = (ranks.clone(), stream.clone());
    let unit = rt
        .spawn(&pool, move || {
            r.lock().push(skein::current_rank());
            let me = skein::unit::current().unwrap();
            target.migrate_unit(&me).unwrap();
            skein::yield_now().unwrap();
            r.lock().push(skein::current_rank());
        })
        .unwrap();

    unit.free().unwrap();
    assert_eq!(*ranks.lock(), vec![Some(0), Some(stream.rank())]);
    assert_eq!(unit.stream_rank(), Some(stream.rank()));

    stream.join().unwrap();
    stream.free().unwrap();
    rt.finalize().unwrap();
}

#[test]
fn test_pinned_units_do_not_migrate() {
    let rt = Runtime::init().unwrap();
    let stream = rt.create_execution_stream_basic().unwrap();
    let pool = rt.main_pool().unwrap();

    let pinned = rt
        .spawn_with(&pool, UnitAttr::default().with_migratable(false), || {})
        .unwrap();
    assert!(matches!(
        stream.migrate_unit(&pinned),
        Err(Error::Unsupported(_))
    ));
    let tasklet = rt.spawn_tasklet(&pool, || {}).unwrap();
    assert!(matches!(
        stream.migrate_unit(&tasklet),
        Err(Error::Unsupported(_))
    ));

    pinned.free().unwrap();
    tasklet.free().unwrap();
    stream.join().unwrap();
    stream.free().unwrap();
    rt.finalize().unwrap();
}
