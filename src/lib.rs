#![allow(dead_code)]
//! Anonymous-page deduplication engine with explicit host boundaries.
//!
//! The engine scans anonymous pages published to it by its memory host,
//! finds pages with identical content, and merges them into one shared,
//! write-protected, copy-on-write frame. All-zero pages short-circuit to a
//! canonical zero page. It is built around:
//! - A two-tree index: a stable tree of already-merged pages and an
//!   unstable tree of candidates whose content is still provisional.
//! - A randomized-sampling content hash, with a checksum-keyed or
//!   content-keyed tree protocol selected at construction.
//! - A single cooperative scan worker draining four queues (new, rescan,
//!   deletion, checksum refresh) in bounded batches.
//! - A reverse-mapping registry that fans host queries on a shared page out
//!   to every real mapping through per-space anchors.
//!
//! High-level flow (one candidate):
//! 1) Drain from the new queue, pin, and skip locked/IO-busy pages.
//! 2) Zero fast path: checksum hint, verify, replace with the zero page.
//! 3) Stable lookup: on verified content match, write-protect and migrate
//!    the candidate's PTEs onto the shared page.
//! 4) Unstable lookup: on a match, two-page merge and promotion to the
//!    stable tree; otherwise insert and wait for a future twin.
//!
//! Page-table work is delegated to the [`mm::MemoryHost`] capability trait;
//! [`sim::SimMemory`] is the deterministic in-tree host used by the test
//! suites.

pub mod control;
pub mod daemon;
pub mod desc;
pub mod engine;
pub mod hash;
pub mod merge;
pub mod mm;
pub mod queue;
pub mod registry;
pub mod rng;
pub mod sim;
pub mod stats;
pub mod tree;

pub use control::{ControlError, Tunables, RUN_MERGE, RUN_STOP, RUN_UNMERGE};
pub use daemon::ScanWorker;
pub use engine::{Engine, EngineConfig, KeyMode, NotifyError};
pub use hash::PageHasher;
pub use mm::{
    Mapping, MemoryHost, MergeFault, PageId, PteToken, RejectCause, SpaceId, TransientCause,
    VmaId, WalkStatus, PAGE_SIZE, PAGE_WORDS,
};
pub use sim::{MmEvent, SimMemory};
pub use stats::StatsSnapshot;
