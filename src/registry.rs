//! Reverse-mapping registry: address-space records and shared-page fan-out.
//!
//! A merged page has one physical frame but many virtual mappings. The
//! registry is how host queries against that frame (reference counting,
//! unmap, migration) reach every real mapping: the stable descriptor holds
//! one anchor per distinct address space, each anchor pins its space record,
//! and a walk fans out anchor by anchor through the host's per-space
//! reverse-mapping locks.
//!
//! Space records are inserted when a space enters the engine and are only
//! unlinked once the last anchor pin drains; an exited-but-pinned space stays
//! as a tombstone so anchors never dangle.

use std::ops::ControlFlow;

use ahash::AHashMap;

use crate::desc::Anchor;
use crate::mm::{Mapping, MemoryHost, PageId, SpaceId, WalkStatus};

/// Engine-side record of one address space.
#[derive(Debug, Default)]
pub(crate) struct SpaceRecord {
    /// Anchor pins currently holding this record alive.
    pins: u32,
    /// Space has exited; unlink once pins drain.
    exited: bool,
}

/// All address spaces known to the engine.
#[derive(Debug, Default)]
pub(crate) struct SpaceTable {
    records: AHashMap<SpaceId, SpaceRecord>,
}

impl SpaceTable {
    pub(crate) fn new() -> Self {
        Self {
            records: AHashMap::new(),
        }
    }

    /// Register a space; idempotent. Returns true if it was new.
    pub(crate) fn enter(&mut self, space: SpaceId) -> bool {
        match self.records.entry(space) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                // Re-entry of an exited-but-pinned space revives it.
                e.get_mut().exited = false;
                false
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(SpaceRecord::default());
                true
            }
        }
    }

    /// Space exited. Unlinks immediately when nothing pins it.
    pub(crate) fn exit(&mut self, space: SpaceId) {
        if let Some(rec) = self.records.get_mut(&space) {
            if rec.pins == 0 {
                self.records.remove(&space);
            } else {
                rec.exited = true;
            }
        }
    }

    /// Pin from a new mapping anchor.
    pub(crate) fn pin(&mut self, space: SpaceId) {
        self.records.entry(space).or_default().pins += 1;
    }

    /// Release an anchor pin; unlinks exited records on the last pin.
    pub(crate) fn unpin(&mut self, space: SpaceId) {
        let rec = self
            .records
            .get_mut(&space)
            .expect("unpinning unknown space record");
        assert!(rec.pins > 0, "space pin underflow");
        rec.pins -= 1;
        if rec.pins == 0 && rec.exited {
            self.records.remove(&space);
        }
    }

    pub(crate) fn contains(&self, space: SpaceId) -> bool {
        self.records.contains_key(&space)
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

/// Fan a reference-style visitor over every mapping of `page` reachable from
/// `anchors`. Returns the number of mappings visited; the visitor can stop
/// the walk early.
pub(crate) fn reference_walk<H: MemoryHost>(
    host: &H,
    anchors: &[Anchor],
    page: PageId,
    mut visitor: impl FnMut(&Mapping) -> ControlFlow<()>,
) -> usize {
    let mut visited = 0usize;
    for anchor in anchors {
        let flow = host.walk_space_mappings(anchor.space, page, &mut |m| {
            visited += 1;
            visitor(&m)
        });
        if flow.is_break() {
            break;
        }
    }
    visited
}

/// Fan an unmap-style visitor over every mapping of `page`. The visitor
/// performs the actual PTE teardown through the host; breaking aborts the
/// remaining anchors.
pub(crate) fn unmap_walk<H: MemoryHost>(
    host: &H,
    anchors: &[Anchor],
    page: PageId,
    mut unmapper: impl FnMut(&Mapping) -> ControlFlow<()>,
) -> WalkStatus {
    for anchor in anchors {
        let flow = host.walk_space_mappings(anchor.space, page, &mut |m| unmapper(&m));
        if flow.is_break() {
            return WalkStatus::Stopped;
        }
    }
    WalkStatus::Completed
}
