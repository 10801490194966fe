//! Zero-page specialization: canonical zero merging and COW unwinding.

use samepage_rs::MemoryHost;

use crate::harness::{config, filled, world};

#[test]
fn all_zero_pages_collapse_onto_the_canonical_zero_page() {
    let w = world(config(64));
    let (s, v) = w.proc();
    for i in 0..3u64 {
        w.sim.map_page(s, v, 0x1000 + i * 0x1000, &[]);
    }
    w.pump();

    w.settle(2);
    let stats = w.engine.stats();
    assert_eq!(stats.pages_zero_sharing, 3);
    assert_eq!(stats.pages_sharing, 3);
    assert_eq!(stats.pages_shared, 0);
    assert_eq!(stats.pages_unshared, 0);
    assert_eq!(stats.rmap_items, 0);

    let zero = w.sim.zero_page();
    for i in 0..3u64 {
        let page = w.sim.page_of(s, 0x1000 + i * 0x1000).unwrap();
        assert_eq!(page, zero);
        assert!(w.sim.read_page(page).iter().all(|&b| b == 0));
    }
    w.engine.validate();
    w.sim.assert_quiescent();
}

#[test]
fn write_to_zero_mapping_cows_and_drops_the_share() {
    let w = world(config(64));
    let (s, v) = w.proc();
    w.sim.map_page(s, v, 0x1000, &[]);
    w.sim.map_page(s, v, 0x2000, &[]);
    w.pump();
    w.settle(2);
    assert_eq!(w.engine.stats().pages_zero_sharing, 2);

    w.sim.write(s, 0x1000, 0, b"no longer zero");
    w.pump();

    assert_eq!(w.engine.stats().pages_zero_sharing, 1);
    let zero = w.sim.zero_page();
    assert_ne!(w.sim.page_of(s, 0x1000).unwrap(), zero);
    assert_eq!(w.sim.page_of(s, 0x2000).unwrap(), zero);

    // The COW copy re-enters the engine as an ordinary candidate.
    w.settle(2);
    assert_eq!(w.engine.stats().pages_unshared, 1);
    w.engine.validate();
}

#[test]
fn nonzero_pages_never_touch_the_zero_page() {
    let w = world(config(64));
    let (s, v) = w.proc();
    w.sim.map_page(s, v, 0x1000, &filled(1));
    w.sim.map_page(s, v, 0x2000, b"\x00\x00\x01");
    w.pump();

    w.settle(3);
    let zero = w.sim.zero_page();
    assert_ne!(w.sim.page_of(s, 0x1000).unwrap(), zero);
    assert_ne!(w.sim.page_of(s, 0x2000).unwrap(), zero);
    assert_eq!(w.engine.stats().pages_zero_sharing, 0);
    w.engine.validate();
}

#[test]
fn zero_and_duplicate_traffic_coexist() {
    let w = world(config(64));
    let (s1, v1) = w.proc();
    let (s2, v2) = w.proc();
    w.sim.map_page(s1, v1, 0x1000, &[]);
    w.sim.map_page(s2, v2, 0x1000, &[]);
    w.sim.map_page(s1, v1, 0x2000, &filled(b'x'));
    w.sim.map_page(s2, v2, 0x2000, &filled(b'x'));
    w.pump();

    w.settle(3);
    let stats = w.engine.stats();
    assert_eq!(stats.pages_zero_sharing, 2);
    assert_eq!(stats.pages_shared, 1);
    // One duplicate merged onto the stable entry, two zero references.
    assert_eq!(stats.pages_sharing, 3);
    w.engine.validate();
    w.sim.assert_quiescent();
}
