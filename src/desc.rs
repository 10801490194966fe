//! Per-tracked-page descriptors and their bounded arena.
//!
//! One descriptor exists per anonymous page the engine currently tracks. It
//! carries the page binding, the registration-time address-space anchor, the
//! content checksum, tree and queue membership, and — once the descriptor
//! heads a stable-tree entry — the list of mapping anchors the registry fans
//! out over.
//!
//! Descriptors live in a bounded slab addressed by [`DescId`]. Ids are plain
//! `u32` indices; a live page→descriptor binding in the engine's map implies
//! a live slot, and both are mutated under the same lock, so ids never
//! dangle while reachable.

use crate::mm::{PageId, SpaceId};
use crate::queue::{DeadTag, QueueLink, QueueSlot, RefreshTag, ScanTag};
use crate::tree::TreeNode;

/// Descriptor freshly published on the new queue, not yet in the engine.
pub const FLAG_NEW: u32 = 1 << 0;
/// Scanner has taken ownership of the descriptor.
pub const FLAG_IN_ENGINE: u32 = 1 << 1;
/// Descriptor is a node of the unstable tree.
pub const FLAG_UNSTABLE: u32 = 1 << 2;
/// Descriptor heads a stable-tree entry; its page is write-protected.
pub const FLAG_STABLE: u32 = 1 << 3;
/// Descriptor is queued for a checksum refresh pass.
pub const FLAG_CHECKSUM_QUEUED: u32 = 1 << 4;
/// Checksum must be recomputed before the next tree resolution.
pub const FLAG_INIT_CHECKSUM: u32 = 1 << 5;
/// Descriptor is waiting on the rescan queue.
pub const FLAG_RESCAN_QUEUED: u32 = 1 << 6;
/// Page died; the scanner must detach and free the descriptor.
pub const FLAG_DELETED: u32 = 1 << 7;

/// Index of a descriptor slot in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescId(pub(crate) u32);

/// One anchor pinning a virtual address space that maps a shared page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Anchor {
    pub space: SpaceId,
}

/// The engine's per-tracked-page record.
#[derive(Debug)]
pub struct PageDesc {
    /// Tracked physical page; cleared by a death notification.
    pub page: Option<PageId>,
    /// Address-space anchor captured at registration.
    pub space: SpaceId,
    /// Page's virtual address at registration; used when walking reverse
    /// mappings of the original space.
    pub vaddr_hint: u64,
    /// `FLAG_*` state bits.
    pub flags: u32,
    /// Sampled content checksum; stale while `FLAG_INIT_CHECKSUM` is set.
    pub checksum: u32,
    /// Sharing references the engine has created onto this page.
    pub share_count: u32,
    /// Mapping anchors; non-empty only while heading a stable-tree entry.
    pub anchors: Vec<Anchor>,
    /// Tree node slot; used by at most one of the two trees at a time.
    pub node: TreeNode,
    /// Link for the new and rescan queues (a descriptor is never on both).
    pub scan_link: QueueLink<ScanTag>,
    /// Link for the deletion queue.
    pub dead_link: QueueLink<DeadTag>,
    /// Link for the checksum-refresh queue.
    pub refresh_link: QueueLink<RefreshTag>,
}

impl PageDesc {
    fn new(page: PageId, space: SpaceId, vaddr_hint: u64) -> Self {
        Self {
            page: Some(page),
            space,
            vaddr_hint,
            flags: 0,
            checksum: 0,
            share_count: 0,
            anchors: Vec::new(),
            node: TreeNode::new(),
            scan_link: QueueLink::new(),
            dead_link: QueueLink::new(),
            refresh_link: QueueLink::new(),
        }
    }

    #[inline]
    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    #[inline]
    pub fn set(&mut self, flag: u32) {
        self.flags |= flag;
    }

    #[inline]
    pub fn clear(&mut self, flag: u32) {
        self.flags &= !flag;
    }
}

impl QueueSlot<ScanTag> for PageDesc {
    fn link(&mut self) -> &mut QueueLink<ScanTag> {
        &mut self.scan_link
    }
    fn link_ref(&self) -> &QueueLink<ScanTag> {
        &self.scan_link
    }
}

impl QueueSlot<DeadTag> for PageDesc {
    fn link(&mut self) -> &mut QueueLink<DeadTag> {
        &mut self.dead_link
    }
    fn link_ref(&self) -> &QueueLink<DeadTag> {
        &self.dead_link
    }
}

impl QueueSlot<RefreshTag> for PageDesc {
    fn link(&mut self) -> &mut QueueLink<RefreshTag> {
        &mut self.refresh_link
    }
    fn link_ref(&self) -> &QueueLink<RefreshTag> {
        &self.refresh_link
    }
}

/// Bounded descriptor slab with free-list reuse.
///
/// Capacity is fixed at construction; exhaustion is reported to the birth
/// path as an allocation failure, never grown past. Freed slots go to the
/// tail of a free list so ids churn rather than concentrate.
#[derive(Debug)]
pub struct DescArena {
    slots: Vec<Option<PageDesc>>,
    free: Vec<u32>,
    live: u32,
    capacity: u32,
}

impl DescArena {
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0);
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            capacity,
        }
    }

    /// Number of live descriptors.
    #[inline]
    pub fn live(&self) -> u32 {
        self.live
    }

    /// Allocate a fresh descriptor. `None` when the slab is exhausted.
    pub fn alloc(&mut self, page: PageId, space: SpaceId, vaddr_hint: u64) -> Option<DescId> {
        if self.live == self.capacity {
            return None;
        }
        let desc = PageDesc::new(page, space, vaddr_hint);
        let idx = match self.free.pop() {
            Some(idx) => {
                debug_assert!(self.slots[idx as usize].is_none());
                self.slots[idx as usize] = Some(desc);
                idx
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Some(desc));
                idx
            }
        };
        self.live += 1;
        Some(DescId(idx))
    }

    /// Free a descriptor slot.
    ///
    /// Panics if the descriptor is still linked anywhere: trees, queues, and
    /// anchors must be detached first. Catches leak bugs at the source.
    pub fn free(&mut self, id: DescId) {
        let desc = self.slots[id.0 as usize]
            .take()
            .expect("freeing vacant descriptor slot");
        assert!(desc.node.is_unlinked(), "descriptor freed while in a tree");
        assert!(desc.scan_link.is_unlinked(), "descriptor freed while on scan queue");
        assert!(desc.dead_link.is_unlinked(), "descriptor freed while on deletion queue");
        assert!(
            desc.refresh_link.is_unlinked(),
            "descriptor freed while on refresh queue"
        );
        assert!(desc.anchors.is_empty(), "descriptor freed with live anchors");
        self.free.push(id.0);
        self.live -= 1;
    }

    #[inline]
    pub fn get(&self, id: DescId) -> &PageDesc {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("dereferencing vacant descriptor slot")
    }

    #[inline]
    pub fn get_mut(&mut self, id: DescId) -> &mut PageDesc {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("dereferencing vacant descriptor slot")
    }

    /// Iterate live descriptor ids (prune walks, diagnostics).
    pub fn iter_live(&self) -> impl Iterator<Item = DescId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|_| DescId(idx as u32)))
    }
}
