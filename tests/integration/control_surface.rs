//! Control-surface keys, run modes, unmerge, and the scan worker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use samepage_rs::{ControlError, Engine, ScanWorker, SimMemory, RUN_MERGE, RUN_STOP, RUN_UNMERGE};

use crate::harness::{config, filled, world};

#[test]
fn every_documented_key_is_readable() {
    let w = world(config(64));
    for key in [
        "run",
        "pages_to_scan",
        "sleep_ms",
        "refresh_period_s",
        "deferred_timer",
        "pages_shared",
        "pages_sharing",
        "pages_unshared",
        "pages_zero_sharing",
        "stable_nodes",
        "rmap_items",
        "full_scans",
    ] {
        assert!(w.engine.ctl_get(key).is_ok(), "unreadable key {key}");
    }
    assert_eq!(w.engine.ctl_get("bogus"), Err(ControlError::UnknownKey));
}

#[test]
fn writable_keys_round_trip_and_counters_reject_writes() {
    let w = world(config(64));
    w.engine.ctl_set("pages_to_scan", 77).unwrap();
    assert_eq!(w.engine.ctl_get("pages_to_scan").unwrap(), 77);
    w.engine.ctl_set("sleep_ms", 5).unwrap();
    assert_eq!(w.engine.ctl_get("sleep_ms").unwrap(), 5);
    w.engine.ctl_set("refresh_period_s", 60).unwrap();
    assert_eq!(w.engine.ctl_get("refresh_period_s").unwrap(), 60);
    w.engine.ctl_set("deferred_timer", 1).unwrap();
    assert_eq!(w.engine.ctl_get("deferred_timer").unwrap(), 1);

    assert_eq!(
        w.engine.ctl_set("pages_shared", 1),
        Err(ControlError::ReadOnly)
    );
    assert_eq!(
        w.engine.ctl_set("full_scans", 0),
        Err(ControlError::ReadOnly)
    );
    assert_eq!(w.engine.ctl_set("bogus", 1), Err(ControlError::UnknownKey));
    assert_eq!(w.engine.ctl_set("run", 3), Err(ControlError::OutOfRange));
    assert_eq!(
        w.engine.ctl_set("deferred_timer", 2),
        Err(ControlError::OutOfRange)
    );
    assert_eq!(
        w.engine.ctl_set("pages_to_scan", u64::from(u32::MAX) + 1),
        Err(ControlError::OutOfRange)
    );
}

#[test]
fn full_scans_counts_batches() {
    let w = world(config(64));
    assert_eq!(w.engine.ctl_get("full_scans").unwrap(), 0);
    w.settle(3);
    assert_eq!(w.engine.ctl_get("full_scans").unwrap(), 3);
}

#[test]
fn run_stop_halts_scanning() {
    let w = world(config(64));
    w.engine.ctl_set("run", u64::from(RUN_STOP)).unwrap();
    assert!(!w.engine.should_run());
    w.engine.ctl_set("run", u64::from(RUN_MERGE)).unwrap();
    assert!(w.engine.should_run());
}

#[test]
fn unmerge_breaks_every_merge_and_preserves_contents() {
    let w = world(config(64));
    let mut spaces = Vec::new();
    for _ in 0..3 {
        let (s, v) = w.proc();
        w.sim.map_page(s, v, 0x4000, &filled(b'U'));
        spaces.push(s);
    }
    w.pump();
    w.settle(2);
    let stats = w.engine.stats();
    assert_eq!(stats.pages_shared, 1);
    assert_eq!(stats.pages_sharing, 2);

    w.engine.ctl_set("run", u64::from(RUN_UNMERGE)).unwrap();
    w.pump();

    let stats = w.engine.stats();
    assert_eq!(stats.pages_shared, 0);
    assert_eq!(stats.pages_sharing, 0);
    assert_eq!(stats.stable_nodes, 0);
    assert_eq!(w.engine.ctl_get("run").unwrap(), u64::from(RUN_UNMERGE));
    assert!(!w.engine.should_run());

    // Every mapping is private again and the bytes never changed.
    let pages: Vec<_> = spaces
        .iter()
        .map(|&s| w.sim.page_of(s, 0x4000).unwrap())
        .collect();
    assert_ne!(pages[0], pages[1]);
    assert_ne!(pages[1], pages[2]);
    assert_ne!(pages[0], pages[2]);
    for page in pages {
        assert_eq!(w.sim.read_page(page), filled(b'U'));
    }

    // The COW copies re-entered as candidates; scanning is off, so they sit
    // on the new queue until merging is re-enabled.
    w.engine.ctl_set("run", u64::from(RUN_MERGE)).unwrap();
    w.settle(3);
    assert_eq!(w.engine.stats().pages_shared, 1);
    w.engine.validate();
    w.sim.assert_quiescent();
}

#[test]
fn scan_worker_merges_in_the_background() {
    let sim = Arc::new(SimMemory::new());
    let engine = Arc::new(Engine::new(
        Arc::clone(&sim),
        samepage_rs::EngineConfig {
            sleep_ms: 1,
            ..config(64)
        },
    ));

    let s1 = sim.create_space();
    let v1 = sim.add_vma(s1, 0x1000, 0x10000, 0);
    let s2 = sim.create_space();
    let v2 = sim.add_vma(s2, 0x1000, 0x10000, 0);
    sim.map_page(s1, v1, 0x1000, &filled(b'W'));
    sim.map_page(s2, v2, 0x1000, &filled(b'W'));
    sim.pump(&engine);

    let worker = ScanWorker::spawn(Arc::clone(&engine));
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.stats().pages_shared < 1 {
        assert!(Instant::now() < deadline, "worker never merged the pair");
        std::thread::sleep(Duration::from_millis(5));
    }
    worker.stop();

    sim.pump(&engine);
    engine.scan_batch();
    engine.validate();
}
