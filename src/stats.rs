//! Engine counters and snapshots.
//!
//! Counters live with the rest of the engine state and are mutated only
//! under its lock; readers get a consistent snapshot taken under a brief
//! lock hold, plus the free-running full-scan counter. Eventual-consistency
//! semantics: a snapshot observed mid-batch reflects some prefix of that
//! batch's work.

/// Counters owned by the engine core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    /// Distinct stable-tree entries.
    pub pages_shared: u64,
    /// Sharing references the engine created onto stable pages.
    pub pages_sharing: u64,
    /// Unstable-tree size.
    pub pages_unshared: u64,
    /// Sharing references onto the canonical zero page.
    pub pages_zero_sharing: u64,
    /// Live mapping-anchor records hanging off stable entries.
    pub stable_nodes: u64,
    /// Live descriptors.
    pub rmap_items: u64,
}

/// Point-in-time view of the engine counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Distinct stable-tree entries.
    pub pages_shared: u64,
    /// Total sharing references, zero-page references included.
    pub pages_sharing: u64,
    /// Unstable-tree size.
    pub pages_unshared: u64,
    /// Zero-page sharing references.
    pub pages_zero_sharing: u64,
    /// Stable-tree anchor-record count.
    pub stable_nodes: u64,
    /// Live descriptor count.
    pub rmap_items: u64,
    /// Completed scan batches.
    pub full_scans: u64,
}

impl Counters {
    pub(crate) fn snapshot(&self, full_scans: u64) -> StatsSnapshot {
        StatsSnapshot {
            pages_shared: self.pages_shared,
            // Reported sharing folds the zero-page references in, the way
            // the control surface exposes it.
            pages_sharing: self.pages_sharing + self.pages_zero_sharing,
            pages_unshared: self.pages_unshared,
            pages_zero_sharing: self.pages_zero_sharing,
            stable_nodes: self.stable_nodes,
            rmap_items: self.rmap_items,
            full_scans,
        }
    }
}
