//! Capability contract between the engine and its memory host.
//!
//! # Scope
//! The engine never touches page tables itself. Everything it needs from the
//! surrounding memory manager — pinning, page locks, write-protect, PTE
//! replacement, COW breaking, reverse-mapping walks, content primitives — is
//! named here as the [`MemoryHost`] trait. A production embedding implements
//! it over real page-table plumbing; the in-tree [`crate::sim::SimMemory`]
//! implements it over a deterministic model for tests.
//!
//! # Invariants
//! - Every successful [`MemoryHost::pin`] is matched by exactly one
//!   [`MemoryHost::unpin`] on all engine exit paths.
//! - `write_protect` must re-check for in-flight direct I/O after clearing
//!   write permission, and fail transiently rather than protect a page the
//!   hardware may still be writing.
//! - `replace_mapping` commits only if the PTE still matches the token taken
//!   at write-protect time; a changed PTE is a transient fault.
//! - Closures handed to `with_words` must not re-enter the host.

use std::cmp::Ordering;
use std::fmt;
use std::ops::ControlFlow;

/// Bytes per page. The engine tracks whole pages only.
pub const PAGE_SIZE: usize = 4096;

/// `u32` words per page; the unit the sampled hash works in.
pub const PAGE_WORDS: usize = PAGE_SIZE / 4;

/// Identity of one physical page frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

/// Identity of one virtual address space root (the reverse-mapping anchor of
/// a process's anonymous memory).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SpaceId(pub u32);

/// Identity of one mapped region inside a space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VmaId(pub u32);

/// Region flag: mapping is shared between processes.
pub const VMA_FLAG_SHARED: u32 = 1 << 0;
/// Region flag: mapping covers device or I/O memory.
pub const VMA_FLAG_IO: u32 = 1 << 1;
/// Region flag: raw page-frame mapping with no backing struct pages.
pub const VMA_FLAG_PFNMAP: u32 = 1 << 2;
/// Region flag: huge-page region.
pub const VMA_FLAG_HUGE: u32 = 1 << 3;
/// Region flag: mixed-map region (may hold pages without rmap).
pub const VMA_FLAG_MIXEDMAP: u32 = 1 << 4;
/// Region flag: stack-style growth; PTE layout may move under us.
pub const VMA_FLAG_GROWS: u32 = 1 << 5;

/// Returns true if a region with `flags` is eligible for merging.
///
/// Mirrors the anonymous-only discipline: shared, device, raw-frame, huge,
/// mixed, and growable regions are all rejected.
#[inline]
pub fn vma_scannable(flags: u32) -> bool {
    flags
        & (VMA_FLAG_SHARED
            | VMA_FLAG_IO
            | VMA_FLAG_PFNMAP
            | VMA_FLAG_HUGE
            | VMA_FLAG_MIXEDMAP
            | VMA_FLAG_GROWS)
        == 0
}

/// One virtual mapping of a page: where a PTE lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub space: SpaceId,
    pub vma: VmaId,
    pub vaddr: u64,
    /// Region flags of the VMA holding this PTE, for eligibility checks.
    pub vm_flags: u32,
}

/// Opaque snapshot of a PTE taken at write-protect time.
///
/// `replace_mapping` refuses to commit if the live PTE no longer matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PteToken(pub u64);

/// Why a page-table operation could not complete.
///
/// Transient faults are retried through the rescan queue; rejections retire
/// the descriptor. Neither is ever surfaced past the engine boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum MergeFault {
    Transient(TransientCause),
    Rejected(RejectCause),
}

/// Causes that warrant another attempt later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransientCause {
    /// Page lock held by someone else.
    PageLocked,
    /// Direct I/O (mapcount/refcount discrepancy) in flight.
    DirectIo,
    /// The PTE changed between write-protect and replace.
    PteChanged,
    /// Content stopped matching while we were committing.
    ContentDrift,
    /// A same-key node appeared in the stable tree during insert.
    TreeCollision,
}

/// Causes that permanently retire the descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum RejectCause {
    /// Page is not (or no longer) anonymous.
    NotAnonymous,
    /// A mapping sits in a region that merging must not touch.
    IneligibleVma,
    /// The page has no reverse mappings left to operate on.
    NoMappings,
    /// Page pin failed; the frame is going away.
    PinFailed,
    /// The page/descriptor binding no longer matches.
    BindingMismatch,
}

impl MergeFault {
    /// True if the fault should be retried via the rescan queue.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, MergeFault::Transient(_))
    }
}

impl fmt::Display for MergeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeFault::Transient(c) => write!(f, "transient merge fault: {c:?}"),
            MergeFault::Rejected(c) => write!(f, "merge rejected: {c:?}"),
        }
    }
}

impl std::error::Error for MergeFault {}

/// Outcome of a registry unmap walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum WalkStatus {
    /// Every mapping was visited.
    Completed,
    /// The visitor stopped the walk early.
    Stopped,
}

/// Page-table and content capabilities the engine requires of its host.
///
/// All methods are callable from the scanner thread and from notification
/// publishers concurrently; the host synchronizes internally. No method may
/// call back into the engine (deadlock by lock order otherwise).
pub trait MemoryHost: Send + Sync {
    /// Take a reference on the frame so it cannot be reused. Returns false
    /// if the frame is already on its way out.
    fn pin(&self, page: PageId) -> bool;

    /// Release a reference taken by [`pin`](Self::pin).
    fn unpin(&self, page: PageId);

    /// Try to take the page lock without waiting.
    fn try_lock_page(&self, page: PageId) -> bool;

    /// Release the page lock.
    fn unlock_page(&self, page: PageId);

    /// True if someone else currently holds the page lock.
    fn is_locked(&self, page: PageId) -> bool;

    /// True if the frame shows a mapcount/refcount discrepancy (direct I/O).
    fn io_in_flight(&self, page: PageId) -> bool;

    /// True if the frame backs anonymous memory.
    fn is_anonymous(&self, page: PageId) -> bool;

    /// True if the frame is already a merged, write-protected shared page.
    fn is_shared(&self, page: PageId) -> bool;

    /// Stamp the frame as a merged shared page.
    fn mark_shared(&self, page: PageId);

    /// Number of PTEs currently mapping the frame.
    fn map_count(&self, page: PageId) -> u32;

    /// The canonical all-zero page.
    fn zero_page(&self) -> PageId;

    /// Run `f` over the page's content as `u32` words. Returns `None` if the
    /// frame is gone. `f` must not re-enter the host.
    fn with_words<R>(&self, page: PageId, f: impl FnOnce(&[u32]) -> R) -> Option<R>
    where
        Self: Sized;

    /// Full-content ordering of two pages. `None` if either frame is gone.
    fn compare_content(&self, a: PageId, b: PageId) -> Option<Ordering>;

    /// True if every byte of the page is zero. `None` if the frame is gone.
    fn is_zero_filled(&self, page: PageId) -> Option<bool>;

    /// Walk every current mapping of `page` under its anchor lock. The
    /// visitor may fail the walk with a fault; a page with no mappings fails
    /// with [`RejectCause::NoMappings`].
    fn walk_mappings(
        &self,
        page: PageId,
        visitor: &mut dyn FnMut(Mapping) -> ControlFlow<MergeFault>,
    ) -> Result<(), MergeFault>;

    /// Walk the mappings of `page` that live inside `space` (registry
    /// fan-out for shared pages). Visitation stops when the visitor breaks.
    fn walk_space_mappings(
        &self,
        space: SpaceId,
        page: PageId,
        visitor: &mut dyn FnMut(Mapping) -> ControlFlow<()>,
    ) -> ControlFlow<()>;

    /// Clear write permission on one PTE. Must re-check direct I/O after the
    /// clear and roll back with a transient fault if it shows up.
    fn write_protect(&self, m: &Mapping, page: PageId) -> Result<PteToken, MergeFault>;

    /// Swing one PTE from `old` to `new` (read-only). Commits only if the
    /// live PTE still matches `token`.
    fn replace_mapping(
        &self,
        m: &Mapping,
        old: PageId,
        new: PageId,
        token: PteToken,
    ) -> Result<(), MergeFault>;

    /// Give one mapping of a shared page a private writable copy.
    fn break_cow(&self, m: &Mapping, shared: PageId) -> Result<(), MergeFault>;

    /// Pin an address-space root so anchors can outlive process exit.
    fn pin_space(&self, space: SpaceId);

    /// Release an anchor pin.
    fn unpin_space(&self, space: SpaceId);
}
