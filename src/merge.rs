//! Page-merge protocol: write-protect, verify, migrate.
//!
//! All merges follow the same two-phase shape under the candidate's page
//! lock: first every PTE of the candidate is write-protected (collecting one
//! token per mapping), then — with the content now immutable — equality is
//! verified, and only then are the PTEs migrated to the shared page. A PTE
//! that changed between protect and replace is skipped; the mapping it
//! described no longer exists.
//!
//! The page lock is taken with `try_lock`: the scanner prefers to move on
//! and come back through the rescan queue over waiting on a contended page.

use crate::mm::{
    vma_scannable, Mapping, MemoryHost, MergeFault, PageId, PteToken, RejectCause, TransientCause,
};
use std::cmp::Ordering;
use std::ops::ControlFlow;

/// Write-protect every mapping of `page`, returning the mappings and their
/// PTE tokens. Fails the whole pass on an ineligible region or a transient
/// PTE fault; already-protected mappings are left protected (they fault back
/// to writable on the next write).
fn protect_all<H: MemoryHost>(
    host: &H,
    page: PageId,
) -> Result<Vec<(Mapping, PteToken)>, MergeFault> {
    let mut protected = Vec::new();
    host.walk_mappings(page, &mut |m| {
        if !vma_scannable(m.vm_flags) {
            return ControlFlow::Break(MergeFault::Rejected(RejectCause::IneligibleVma));
        }
        match host.write_protect(&m, page) {
            Ok(token) => {
                protected.push((m, token));
                ControlFlow::Continue(())
            }
            Err(fault) => ControlFlow::Break(fault),
        }
    })?;
    Ok(protected)
}

/// Swing every protected mapping from `page` to `target`. Mappings whose PTE
/// changed since the protect phase are skipped. Returns the number replaced.
fn replace_all<H: MemoryHost>(
    host: &H,
    protected: &[(Mapping, PteToken)],
    page: PageId,
    target: PageId,
) -> u32 {
    let mut replaced = 0u32;
    for (m, token) in protected {
        if host.replace_mapping(m, page, target, *token).is_ok() {
            replaced += 1;
        }
    }
    replaced
}

fn with_locked_page<H: MemoryHost, R>(
    host: &H,
    page: PageId,
    f: impl FnOnce() -> Result<R, MergeFault>,
) -> Result<R, MergeFault> {
    if !host.try_lock_page(page) {
        return Err(MergeFault::Transient(TransientCause::PageLocked));
    }
    let result = f();
    host.unlock_page(page);
    result
}

/// Merge candidate `page` into the already-shared `kpage`.
///
/// Write-protects all mappings of `page`, verifies byte equality against
/// `kpage` (required even when the trees are checksum-keyed), and migrates
/// the PTEs. Returns the number of mappings migrated.
pub(crate) fn merge_into_shared<H: MemoryHost>(
    host: &H,
    page: PageId,
    kpage: PageId,
) -> Result<u32, MergeFault> {
    if page == kpage {
        // Shared page forked back at us; nothing to migrate.
        return Ok(0);
    }
    if !host.is_anonymous(page) {
        return Err(MergeFault::Rejected(RejectCause::NotAnonymous));
    }

    with_locked_page(host, page, || {
        let protected = protect_all(host, page)?;
        match host.compare_content(page, kpage) {
            Some(Ordering::Equal) => {}
            Some(_) => return Err(MergeFault::Transient(TransientCause::ContentDrift)),
            None => return Err(MergeFault::Rejected(RejectCause::PinFailed)),
        }
        Ok(replace_all(host, &protected, page, kpage))
    })
}

/// Turn `page` itself into a shared page: write-protect every mapping and
/// stamp it shared. Its PTEs stay in place; later candidates migrate onto it.
pub(crate) fn collapse_to_stable<H: MemoryHost>(host: &H, page: PageId) -> Result<u32, MergeFault> {
    if !host.is_anonymous(page) {
        return Err(MergeFault::Rejected(RejectCause::NotAnonymous));
    }
    with_locked_page(host, page, || {
        let protected = protect_all(host, page)?;
        host.mark_shared(page);
        Ok(protected.len() as u32)
    })
}

/// Two-page merge: promote `page` to shared, then migrate `tree_page`'s
/// mappings onto it. Returns the number of mappings migrated from
/// `tree_page`.
///
/// If the second half faults, `page` is left write-protected and marked
/// shared; the caller's retry path drops it on the next pass, exactly as a
/// racing fork would be dropped.
pub(crate) fn merge_pair<H: MemoryHost>(
    host: &H,
    page: PageId,
    tree_page: PageId,
) -> Result<u32, MergeFault> {
    collapse_to_stable(host, page)?;
    merge_into_shared(host, tree_page, page)
}

/// Merge `page` into the canonical zero page.
///
/// The checksum match that routed us here is only a hint: the page must be
/// re-verified all-zero after its mappings are write-protected.
pub(crate) fn merge_zero<H: MemoryHost>(
    host: &H,
    page: PageId,
    zero: PageId,
) -> Result<u32, MergeFault> {
    if !host.is_anonymous(page) {
        return Err(MergeFault::Rejected(RejectCause::NotAnonymous));
    }
    with_locked_page(host, page, || {
        let protected = protect_all(host, page)?;
        match host.is_zero_filled(page) {
            Some(true) => {}
            Some(false) => return Err(MergeFault::Transient(TransientCause::ContentDrift)),
            None => return Err(MergeFault::Rejected(RejectCause::PinFailed)),
        }
        Ok(replace_all(host, &protected, page, zero))
    })
}
