//! Duplicate-page merge scenarios: pairs, fan-in, stale stable entries.

use std::ops::ControlFlow;

use samepage_rs::{EngineConfig, KeyMode};

use crate::harness::{config, filled, world};

#[test]
fn duplicate_pair_converges_to_one_shared_page() {
    // Batch size 1 so the two candidates resolve on consecutive batches.
    let w = world(config(1));
    let (s1, v1) = w.proc();
    let (s2, v2) = w.proc();

    w.sim.map_page(s1, v1, 0x1000, &filled(b'A'));
    w.sim.map_page(s2, v2, 0x1000, &filled(b'A'));
    w.pump();

    // First batch: the first candidate lands in the unstable tree.
    w.step();
    let stats = w.engine.stats();
    assert_eq!(stats.pages_unshared, 1);
    assert_eq!(stats.pages_shared, 0);

    // Second batch: its twin finds it and both promote to one stable entry.
    w.step();
    let stats = w.engine.stats();
    assert_eq!(stats.pages_shared, 1);
    assert_eq!(stats.pages_sharing, 1);
    assert_eq!(stats.pages_unshared, 0);
    assert_eq!(stats.stable_nodes, 2);

    // Both mappings resolve to the same physical page, contents intact.
    let p1 = w.sim.page_of(s1, 0x1000).unwrap();
    let p2 = w.sim.page_of(s2, 0x1000).unwrap();
    assert_eq!(p1, p2);
    assert_eq!(w.sim.read_page(p1), filled(b'A'));

    // The registry fans out to both mappings.
    let mut seen = Vec::new();
    let visited = w.engine.on_reference_walk(p1, |m| {
        seen.push(m.space);
        ControlFlow::Continue(())
    });
    assert_eq!(visited, 2);
    assert!(seen.contains(&s1) && seen.contains(&s2));

    // One more batch reaps the merged-away descriptor.
    w.step();
    assert_eq!(w.engine.stats().rmap_items, 1);
    w.engine.validate();
    w.sim.assert_quiescent();
}

#[test]
fn three_way_fan_in_consolidates_onto_one_entry() {
    let w = world(config(64));
    let mut addrs = Vec::new();
    for _ in 0..3 {
        let (s, v) = w.proc();
        w.sim.map_page(s, v, 0x2000, &filled(b'Q'));
        addrs.push(s);
    }
    w.pump();

    w.settle(2);
    let stats = w.engine.stats();
    assert_eq!(stats.pages_shared, 1);
    assert_eq!(stats.pages_sharing, 2);
    assert_eq!(stats.rmap_items, 1);
    assert_eq!(stats.stable_nodes, 3);

    let pages: Vec<_> = addrs
        .iter()
        .map(|&s| w.sim.page_of(s, 0x2000).unwrap())
        .collect();
    assert!(pages.windows(2).all(|w| w[0] == w[1]));
    // Shared frame carries the original mapping plus two merged-in ones.
    assert_eq!(w.sim.mapping_count(pages[0]), 3);
    assert_eq!(w.sim.read_page(pages[0]), filled(b'Q'));

    w.engine.validate();
    w.sim.assert_quiescent();
}

#[test]
fn same_space_duplicates_merge_too() {
    let w = world(config(64));
    let (s, v) = w.proc();
    w.sim.map_page(s, v, 0x1000, &filled(b'D'));
    w.sim.map_page(s, v, 0x2000, &filled(b'D'));
    w.pump();

    w.settle(2);
    let stats = w.engine.stats();
    assert_eq!(stats.pages_shared, 1);
    assert_eq!(stats.pages_sharing, 1);
    // Both anchors collapse onto the single distinct space.
    assert_eq!(stats.stable_nodes, 1);
    assert_eq!(
        w.sim.page_of(s, 0x1000).unwrap(),
        w.sim.page_of(s, 0x2000).unwrap()
    );
    w.engine.validate();
}

#[test]
fn stale_stable_entry_is_pruned_mid_search() {
    let w = world(config(64));
    let (s1, v1) = w.proc();
    let (s2, v2) = w.proc();
    w.sim.map_page(s1, v1, 0x1000, &filled(b'Z'));
    w.sim.map_page(s2, v2, 0x1000, &filled(b'Z'));
    w.pump();
    w.settle(2);
    assert_eq!(w.engine.stats().pages_shared, 1);

    // Kill the stable entry's page binding out from under the tree.
    let kpage = w.sim.page_of(s1, 0x1000).unwrap();
    w.engine.on_death(kpage).unwrap();

    // A new candidate with the same content walks over the stale node: the
    // search must survive, unlink it, and insert as if it never existed.
    let (s3, v3) = w.proc();
    w.sim.map_page(s3, v3, 0x1000, &filled(b'Z'));
    w.pump();
    w.step();

    let stats = w.engine.stats();
    assert_eq!(stats.pages_shared, 0);
    assert_eq!(stats.pages_unshared, 1);
    w.engine.validate();

    // And the index still works: a twin of the new candidate merges.
    let (s4, v4) = w.proc();
    w.sim.map_page(s4, v4, 0x1000, &filled(b'Z'));
    w.pump();
    w.settle(2);
    assert_eq!(w.engine.stats().pages_shared, 1);
    w.engine.validate();
}

#[test]
fn distinct_contents_never_merge() {
    let w = world(config(64));
    let (s1, v1) = w.proc();
    let (s2, v2) = w.proc();
    w.sim.map_page(s1, v1, 0x1000, &filled(b'a'));
    w.sim.map_page(s2, v2, 0x1000, &filled(b'b'));
    w.pump();

    w.settle(3);
    let stats = w.engine.stats();
    assert_eq!(stats.pages_shared, 0);
    assert_eq!(stats.pages_sharing, 0);
    assert_eq!(stats.pages_unshared, 2);
    assert_ne!(
        w.sim.page_of(s1, 0x1000).unwrap(),
        w.sim.page_of(s2, 0x1000).unwrap()
    );
    w.engine.validate();
}

#[test]
fn content_keyed_mode_is_externally_identical() {
    let w = world(EngineConfig {
        key_mode: KeyMode::Content,
        ..config(64)
    });
    let (s1, v1) = w.proc();
    let (s2, v2) = w.proc();
    w.sim.map_page(s1, v1, 0x1000, &filled(b'C'));
    w.sim.map_page(s2, v2, 0x1000, &filled(b'C'));
    w.sim.map_page(s1, v1, 0x2000, &[]);
    w.sim.map_page(s2, v2, 0x2000, &[]);
    w.pump();

    w.settle(3);
    let stats = w.engine.stats();
    assert_eq!(stats.pages_shared, 1);
    assert_eq!(stats.pages_zero_sharing, 2);
    assert_eq!(stats.pages_sharing, 3);
    assert_eq!(
        w.sim.page_of(s1, 0x1000).unwrap(),
        w.sim.page_of(s2, 0x1000).unwrap()
    );
    w.engine.validate();
    w.sim.assert_quiescent();
}

#[test]
fn write_to_merged_page_breaks_cow_privately() {
    let w = world(config(64));
    let (s1, v1) = w.proc();
    let (s2, v2) = w.proc();
    w.sim.map_page(s1, v1, 0x1000, &filled(b'M'));
    w.sim.map_page(s2, v2, 0x1000, &filled(b'M'));
    w.pump();
    w.settle(2);
    assert_eq!(w.engine.stats().pages_shared, 1);

    w.sim.write(s2, 0x1000, 0, b"mutated");
    w.pump();

    // The writer got a private copy; the other mapping is untouched.
    let p1 = w.sim.page_of(s1, 0x1000).unwrap();
    let p2 = w.sim.page_of(s2, 0x1000).unwrap();
    assert_ne!(p1, p2);
    assert_eq!(&w.sim.read_page(p2)[..7], b"mutated");
    assert_eq!(w.sim.read_page(p1), filled(b'M'));
    assert_eq!(w.engine.stats().pages_sharing, 0);

    w.settle(2);
    w.engine.validate();
}
