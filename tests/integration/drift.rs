//! Unstable-tree guardrails: checksum refresh, drift eviction, and
//! transient-fault deferral.

use crate::harness::{config, filled, world};

#[test]
fn drifted_page_is_evicted_and_rekeyed() {
    let w = world(config(4));
    let (s, v) = w.proc();
    w.sim.map_page(s, v, 0x1000, &filled(b'A'));
    w.pump();
    w.step();
    assert_eq!(w.engine.stats().pages_unshared, 1);

    // Mutate the page under its unstable-tree key.
    w.sim.write(s, 0x1000, 0, &filled(b'B'));

    // The refresh pass notices the drift and routes it through rescan.
    w.step();
    assert_eq!(w.engine.stats().pages_unshared, 0);
    w.step();
    assert_eq!(w.engine.stats().pages_unshared, 1);

    // The key now corresponds to the new content: a twin of B merges.
    let (s2, v2) = w.proc();
    w.sim.map_page(s2, v2, 0x1000, &filled(b'B'));
    w.pump();
    w.settle(2);
    assert_eq!(w.engine.stats().pages_shared, 1);
    w.engine.validate();
}

#[test]
fn full_unstable_population_refreshes_within_a_batch_when_small() {
    let w = world(config(16));
    let (s, v) = w.proc();
    for i in 0..5u64 {
        w.sim.map_page(s, v, 0x1000 + i * 0x1000, &filled(10 + i as u8));
    }
    w.pump();
    w.step();
    assert_eq!(w.engine.stats().pages_unshared, 5);

    for i in 0..5u64 {
        w.sim.write(s, 0x1000 + i * 0x1000, 0, &filled(100 + i as u8));
    }

    // Population below batch size: one refresh pass covers all of it.
    w.step();
    assert_eq!(w.engine.stats().pages_unshared, 0);
    w.step();
    assert_eq!(w.engine.stats().pages_unshared, 5);
    w.engine.validate();
}

#[test]
fn locked_page_defers_to_the_rescan_queue() {
    let w = world(config(16));
    let (s, v) = w.proc();
    let page = w.sim.map_page(s, v, 0x1000, &filled(b'L'));
    w.pump();

    w.sim.inject_locked(page, 1);
    w.step();
    // Deferred: tracked but in no tree.
    let stats = w.engine.stats();
    assert_eq!(stats.rmap_items, 1);
    assert_eq!(stats.pages_unshared, 0);

    w.step();
    assert_eq!(w.engine.stats().pages_unshared, 1);
    w.engine.validate();
    w.sim.assert_quiescent();
}

#[test]
fn in_flight_io_defers_to_the_rescan_queue() {
    let w = world(config(16));
    let (s, v) = w.proc();
    let page = w.sim.map_page(s, v, 0x1000, &filled(b'I'));
    w.pump();

    w.sim.inject_dio(page, 1);
    w.step();
    assert_eq!(w.engine.stats().pages_unshared, 0);
    w.step();
    assert_eq!(w.engine.stats().pages_unshared, 1);
    w.engine.validate();
}

#[test]
fn merge_blocked_by_held_page_lock_retries_later() {
    let w = world(config(16));
    let (s1, v1) = w.proc();
    let (s2, v2) = w.proc();
    w.sim.map_page(s1, v1, 0x1000, &filled(b'T'));
    w.pump();
    w.step();
    assert_eq!(w.engine.stats().pages_unshared, 1);

    // Hold the twin's page lock from elsewhere across its first pass: it
    // defers instead of waiting, then merges once the lock is gone.
    let p2 = w.sim.map_page(s2, v2, 0x1000, &filled(b'T'));
    w.pump();
    w.sim.lock_page_external(p2);
    w.step();
    let stats = w.engine.stats();
    assert_eq!(stats.pages_shared, 0);
    assert_eq!(stats.pages_unshared, 1);
    assert_eq!(stats.rmap_items, 2);

    w.sim.unlock_page_external(p2);
    w.settle(2);
    assert_eq!(w.engine.stats().pages_shared, 1);
    w.engine.validate();
    w.sim.assert_quiescent();
}
