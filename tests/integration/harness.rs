//! Shared world-building helpers for the integration suite.

use std::sync::Arc;

use samepage_rs::{Engine, EngineConfig, SimMemory, SpaceId, VmaId, PAGE_SIZE};

pub struct World {
    pub sim: Arc<SimMemory>,
    pub engine: Engine<SimMemory>,
}

/// A default config with a given batch size; tests override the rest as
/// needed.
pub fn config(pages_to_scan: u32) -> EngineConfig {
    EngineConfig {
        pages_to_scan,
        ..EngineConfig::default()
    }
}

pub fn world(config: EngineConfig) -> World {
    let sim = Arc::new(SimMemory::new());
    let engine = Engine::new(Arc::clone(&sim), config);
    World { sim, engine }
}

impl World {
    /// One "process": an address space with a single anonymous region.
    pub fn proc(&self) -> (SpaceId, VmaId) {
        let space = self.sim.create_space();
        let vma = self.sim.add_vma(space, 0x1000, 0x10_0000, 0);
        self.engine.on_space_enter(space);
        (space, vma)
    }

    /// Forward pending host events into the engine.
    pub fn pump(&self) {
        self.sim.pump(&self.engine);
    }

    /// One scan batch followed by event delivery.
    pub fn step(&self) {
        self.engine.scan_batch();
        self.pump();
    }

    pub fn settle(&self, batches: u32) {
        for _ in 0..batches {
            self.step();
        }
    }
}

/// A full page of one repeated byte.
pub fn filled(byte: u8) -> Vec<u8> {
    vec![byte; PAGE_SIZE]
}
