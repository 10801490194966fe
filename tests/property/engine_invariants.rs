//! Randomized engine invariants: content preservation, zero soundness,
//! progress, and descriptor accounting.

use std::sync::Arc;

use proptest::prelude::*;

use samepage_rs::{Engine, EngineConfig, MemoryHost, SimMemory, SpaceId, VmaId, PAGE_SIZE};

const CASES: u32 = 24;

struct World {
    sim: Arc<SimMemory>,
    engine: Engine<SimMemory>,
    procs: Vec<(SpaceId, VmaId)>,
}

fn world(nprocs: usize) -> World {
    let sim = Arc::new(SimMemory::new());
    let engine = Engine::new(
        Arc::clone(&sim),
        EngineConfig {
            pages_to_scan: 8,
            ..EngineConfig::default()
        },
    );
    let procs = (0..nprocs)
        .map(|_| {
            let s = sim.create_space();
            let v = sim.add_vma(s, 0x1000, 0x100_0000, 0);
            engine.on_space_enter(s);
            (s, v)
        })
        .collect();
    World { sim, engine, procs }
}

impl World {
    fn step(&self) {
        self.engine.scan_batch();
        self.sim.pump(&self.engine);
    }
}

/// Page content from a small alphabet so duplicates are common.
fn content(tag: u8) -> Vec<u8> {
    if tag == 0 {
        Vec::new()
    } else {
        vec![tag; PAGE_SIZE]
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(crate::proptest_cases(CASES)))]

    /// Merging is invisible to readers: whatever was written at a vaddr is
    /// what reads back, always, and the structures stay self-consistent.
    #[test]
    fn contents_survive_any_merge_schedule(
        tags in proptest::collection::vec(0u8..6, 1..20),
        batches in 1u32..8,
    ) {
        let w = world(3);
        let mut placed = Vec::new();
        for (i, &tag) in tags.iter().enumerate() {
            let (s, v) = w.procs[i % w.procs.len()];
            let vaddr = 0x1000 + (i as u64 / w.procs.len() as u64) * 0x1000;
            w.sim.map_page(s, v, vaddr, &content(tag));
            placed.push((s, vaddr, tag));
        }
        w.sim.pump(&w.engine);

        for _ in 0..batches {
            w.step();
        }

        w.engine.validate();
        for &(s, vaddr, tag) in &placed {
            let page = w.sim.page_of(s, vaddr).unwrap();
            let expect = if tag == 0 { vec![0u8; PAGE_SIZE] } else { vec![tag; PAGE_SIZE] };
            prop_assert_eq!(w.sim.read_page(page), expect);
        }
    }

    /// Only genuinely all-zero pages ever reach the canonical zero page.
    #[test]
    fn zero_merges_are_sound(
        tags in proptest::collection::vec(0u8..3, 1..16),
    ) {
        let w = world(2);
        let mut placed = Vec::new();
        for (i, &tag) in tags.iter().enumerate() {
            let (s, v) = w.procs[i % w.procs.len()];
            let vaddr = 0x1000 + (i as u64 / w.procs.len() as u64) * 0x1000;
            w.sim.map_page(s, v, vaddr, &content(tag));
            placed.push((s, vaddr, tag));
        }
        w.sim.pump(&w.engine);
        for _ in 0..6 {
            w.step();
        }

        let zero = w.sim.zero_page();
        let zero_count = placed.iter().filter(|&&(_, _, t)| t == 0).count() as u64;
        for &(s, vaddr, tag) in &placed {
            let page = w.sim.page_of(s, vaddr).unwrap();
            if tag == 0 {
                prop_assert_eq!(page, zero);
            } else {
                prop_assert_ne!(page, zero);
            }
        }
        prop_assert_eq!(w.engine.stats().pages_zero_sharing, zero_count);
        w.engine.validate();
    }

    /// K identical pages given enough batches produce a stable entry with
    /// K-1 sharing references.
    #[test]
    fn duplicates_make_progress(copies in 2usize..6) {
        let w = world(3);
        for i in 0..copies {
            let (s, v) = w.procs[i % w.procs.len()];
            let vaddr = 0x1000 + (i as u64 / w.procs.len() as u64) * 0x1000;
            w.sim.map_page(s, v, vaddr, &content(9));
        }
        w.sim.pump(&w.engine);
        for _ in 0..6 {
            w.step();
        }

        let stats = w.engine.stats();
        prop_assert_eq!(stats.pages_shared, 1);
        prop_assert_eq!(stats.pages_sharing, copies as u64 - 1);
        w.engine.validate();
    }

    /// Descriptor accounting closes: after all pages die, within a bounded
    /// number of batches every descriptor and every pin is gone.
    #[test]
    fn teardown_reclaims_everything(
        tags in proptest::collection::vec(0u8..5, 1..16),
        batches_before in 0u32..5,
    ) {
        let w = world(2);
        let mut placed = Vec::new();
        for (i, &tag) in tags.iter().enumerate() {
            let (s, v) = w.procs[i % w.procs.len()];
            let vaddr = 0x1000 + (i as u64 / w.procs.len() as u64) * 0x1000;
            w.sim.map_page(s, v, vaddr, &content(tag));
            placed.push((s, vaddr));
        }
        w.sim.pump(&w.engine);
        for _ in 0..batches_before {
            w.step();
        }

        for &(s, vaddr) in &placed {
            w.sim.unmap(s, vaddr);
        }
        w.sim.pump(&w.engine);
        w.step();
        w.step();

        let stats = w.engine.stats();
        prop_assert_eq!(stats.rmap_items, 0);
        prop_assert_eq!(stats.pages_shared, 0);
        prop_assert_eq!(stats.pages_unshared, 0);
        prop_assert_eq!(stats.stable_nodes, 0);
        w.engine.validate();
        w.sim.assert_quiescent();
    }

    /// Random interleavings of births, writes, deaths, and batches keep the
    /// structures valid at every quiescent point.
    #[test]
    fn random_schedules_stay_consistent(
        ops in proptest::collection::vec((0u8..4, 0u8..6), 4..40),
    ) {
        let w = world(2);
        let mut live: Vec<(SpaceId, u64)> = Vec::new();
        let mut next_slot = 0u64;

        for &(op, tag) in &ops {
            match op {
                // Birth at a fresh vaddr.
                0 | 1 => {
                    let (s, v) = w.procs[(next_slot % 2) as usize];
                    let vaddr = 0x1000 + next_slot * 0x1000;
                    next_slot += 1;
                    w.sim.map_page(s, v, vaddr, &content(tag));
                    live.push((s, vaddr));
                }
                // Death of the oldest live mapping.
                2 => {
                    if !live.is_empty() {
                        let (s, vaddr) = live.remove(0);
                        w.sim.unmap(s, vaddr);
                    }
                }
                // Mutate the newest live mapping.
                _ => {
                    if let Some(&(s, vaddr)) = live.last() {
                        w.sim.write(s, vaddr, 0, &[tag.wrapping_add(1); 32]);
                    }
                }
            }
            w.sim.pump(&w.engine);
            w.step();
            w.engine.validate();
        }

        // Drain the world and confirm the engine lets go of everything.
        for (s, vaddr) in live {
            w.sim.unmap(s, vaddr);
        }
        w.sim.pump(&w.engine);
        w.step();
        w.step();
        prop_assert_eq!(w.engine.stats().rmap_items, 0);
        w.engine.validate();
        w.sim.assert_quiescent();
    }
}
