//! Engine core: state, notifications, and the scan state machine.
//!
//! # Ownership
//! All mutable engine state — descriptor arena, the two trees, the four
//! queues, page bindings, space records, counters — lives in [`CoreState`]
//! behind one short-held mutex. Notification publishers take it for O(1)
//! critical sections; the scanner takes it per work item and releases it at
//! every yield point, so a birth is never blocked behind a whole batch.
//! A second mutex (the engine mutex) is held across each batch and excludes
//! administrative transitions: run-mode changes, unmerge, hotplug pruning.
//!
//! # Trees
//! Only the scanner resolves descriptors against the trees. Tree walks
//! tolerate stale entries: a visited descriptor that died or lost its page
//! binding is unlinked on the spot and the walk restarts from the root,
//! which is what lets the death path stay O(1).
//!
//! # State machine
//! A descriptor moves new → unstable → stable, with the rescan queue as the
//! retry edge for transient faults and the refresh queue as the guardrail
//! that evicts drifted unstable entries. Zero pages short-circuit to the
//! canonical zero page and never enter a tree.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use crossbeam_utils::sync::Unparker;

use crate::control::{Tunables, RUN_MERGE, RUN_UNMERGE};
use crate::desc::{
    Anchor, DescArena, DescId, FLAG_CHECKSUM_QUEUED, FLAG_DELETED, FLAG_INIT_CHECKSUM,
    FLAG_IN_ENGINE, FLAG_NEW, FLAG_RESCAN_QUEUED, FLAG_STABLE, FLAG_UNSTABLE,
};
use crate::hash::PageHasher;
use crate::merge;
use crate::mm::{Mapping, MemoryHost, PageId, SpaceId, WalkStatus};
use crate::queue::{DeadTag, DescQueue, RefreshTag, ScanTag};
use crate::registry::{reference_walk, unmap_walk, SpaceTable};
use crate::stats::{Counters, StatsSnapshot};
use crate::tree::{Dir, PageTree};

/// How tree keys are compared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyMode {
    /// Key on the sampled checksum; O(1) comparisons, content verified
    /// separately on every key match.
    Checksum,
    /// Key on raw page content; a tie is already an exact match.
    Content,
}

/// Construction-time engine parameters. Scan knobs become runtime tunables.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Descriptor slab capacity; births past it fail with an allocation error.
    pub max_descriptors: u32,
    /// Seed for the hash permutation table.
    pub hash_seed: u64,
    /// Tree key protocol.
    pub key_mode: KeyMode,
    /// Initial run mode.
    pub run: u8,
    /// Descriptors consumed per queue per batch.
    pub pages_to_scan: u32,
    /// Inter-batch sleep.
    pub sleep_ms: u32,
    /// Window within which the whole unstable population is rehashed.
    pub refresh_period_s: u32,
    /// Coalesce worker wakeups onto a coarse timer.
    pub deferred_timer: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_descriptors: 1 << 16,
            hash_seed: 0x7361_6d65_7061_6765,
            key_mode: KeyMode::Checksum,
            run: RUN_MERGE,
            pages_to_scan: 1000,
            sleep_ms: 20,
            refresh_period_s: 10,
            deferred_timer: false,
        }
    }
}

/// Rejections surfaced at the notification boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum NotifyError {
    /// The page already has a descriptor.
    AlreadyTracked,
    /// Births only cover anonymous pages.
    NotAnonymous,
    /// The page is already a merged shared page.
    SharedPage,
    /// No descriptor is bound to this page.
    UnknownPage,
    /// The page/descriptor back-pointers disagree.
    MismatchedBinding,
    /// The bounded descriptor slab is exhausted.
    OutOfDescriptors,
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            NotifyError::AlreadyTracked => "page is already tracked",
            NotifyError::NotAnonymous => "page is not anonymous",
            NotifyError::SharedPage => "page is already a shared page",
            NotifyError::UnknownPage => "page is not tracked",
            NotifyError::MismatchedBinding => "page/descriptor binding mismatch",
            NotifyError::OutOfDescriptors => "descriptor slab exhausted",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for NotifyError {}

/// Merge-protocol outcome, dispatched by the batch loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    /// Merged (or inserted); nothing more to do this pass.
    Success,
    /// Leave the descriptor as is.
    Keep,
    /// Retire the descriptor.
    Drop,
    /// Requeue on the rescan queue with a forced checksum recompute.
    Try,
}

struct CoreState {
    arena: DescArena,
    page_map: AHashMap<PageId, DescId>,
    spaces: SpaceTable,
    stable: PageTree,
    unstable: PageTree,
    new_q: DescQueue<ScanTag>,
    rescan_q: DescQueue<ScanTag>,
    dead_q: DescQueue<DeadTag>,
    refresh_q: DescQueue<RefreshTag>,
    counters: Counters,
}

/// Result of a stable-tree search.
enum StableSearch {
    /// Identical shared page found; it is pinned for the caller.
    Found { node: DescId, kpage: PageId },
    NotFound,
    /// A node page could not be pinned mid-walk; give up this pass.
    Aborted,
}

/// Result of an unstable-tree resolution.
enum UnstableSearch {
    /// Same-key candidate found; its page is pinned for the caller.
    Found { node: DescId, tpage: PageId },
    /// No candidate; the probe was inserted.
    Inserted,
    /// Walk could not complete; retry later.
    Aborted,
}

/// The deduplication engine over a memory host `H`.
pub struct Engine<H: MemoryHost> {
    host: Arc<H>,
    hasher: PageHasher,
    key_mode: KeyMode,
    tunables: Tunables,
    state: Mutex<CoreState>,
    /// Engine mutex: excludes admin transitions for the span of a batch.
    batch_lock: Mutex<()>,
    full_scans: AtomicU64,
    waker: Mutex<Option<Unparker>>,
}

impl<H: MemoryHost> Engine<H> {
    pub fn new(host: Arc<H>, config: EngineConfig) -> Self {
        Self {
            host,
            hasher: PageHasher::new(config.hash_seed),
            key_mode: config.key_mode,
            tunables: Tunables::new(
                config.run,
                config.pages_to_scan,
                config.sleep_ms,
                config.refresh_period_s,
                config.deferred_timer,
            ),
            state: Mutex::new(CoreState {
                arena: DescArena::new(config.max_descriptors),
                page_map: AHashMap::new(),
                spaces: SpaceTable::new(),
                stable: PageTree::new(),
                unstable: PageTree::new(),
                new_q: DescQueue::new(),
                rescan_q: DescQueue::new(),
                dead_q: DescQueue::new(),
                refresh_q: DescQueue::new(),
                counters: Counters::default(),
            }),
            batch_lock: Mutex::new(()),
            full_scans: AtomicU64::new(0),
            waker: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Counter snapshot under a brief lock hold.
    pub fn stats(&self) -> StatsSnapshot {
        let st = self.state.lock().unwrap();
        st.counters.snapshot(self.full_scans.load(Ordering::Relaxed))
    }

    /// Register the scan worker's unparker so mode changes and births can
    /// cut its sleep short.
    pub fn set_waker(&self, unparker: Unparker) {
        *self.waker.lock().unwrap() = Some(unparker);
    }

    pub fn wake(&self) {
        if let Some(u) = self.waker.lock().unwrap().as_ref() {
            u.unpark();
        }
    }

    /// True if the worker should be scanning.
    pub fn should_run(&self) -> bool {
        self.tunables.run() & RUN_MERGE != 0
    }

    /// Switch run mode. `RUN_UNMERGE` performs the system-wide unmerge
    /// before the mode becomes visible; `RUN_MERGE` wakes the worker.
    pub fn set_run_mode(&self, mode: u8) {
        self.tunables.run.store(mode, Ordering::Relaxed);
        if mode == RUN_UNMERGE {
            self.unmerge_all();
        }
        if mode & RUN_MERGE != 0 {
            self.wake();
        }
    }

    // ---- notifications -------------------------------------------------

    /// A new anonymous page was created at `vaddr` in `space`.
    pub fn on_birth(&self, page: PageId, space: SpaceId, vaddr: u64) -> Result<(), NotifyError> {
        if self.host.is_shared(page) {
            return Err(NotifyError::SharedPage);
        }
        if !self.host.is_anonymous(page) {
            return Err(NotifyError::NotAnonymous);
        }

        let was_idle = {
            let mut guard = self.state.lock().unwrap();
            let st = &mut *guard;
            if st.page_map.contains_key(&page) {
                return Err(NotifyError::AlreadyTracked);
            }
            let Some(id) = st.arena.alloc(page, space, vaddr) else {
                return Err(NotifyError::OutOfDescriptors);
            };
            st.arena.get_mut(id).set(FLAG_NEW | FLAG_INIT_CHECKSUM);
            st.page_map.insert(page, id);
            st.spaces.enter(space);
            st.counters.rmap_items += 1;
            let was_idle = st.new_q.is_empty();
            st.new_q.push_back(&mut st.arena, id);
            was_idle
        };
        if was_idle {
            self.wake();
        }
        Ok(())
    }

    /// The page died. Descriptors that never entered the engine are freed
    /// here; the rest are flagged and handed to the deletion queue.
    pub fn on_death(&self, page: PageId) -> Result<(), NotifyError> {
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        let Some(&id) = st.page_map.get(&page) else {
            return Err(NotifyError::UnknownPage);
        };
        if st.arena.get(id).page != Some(page) {
            return Err(NotifyError::MismatchedBinding);
        }
        st.page_map.remove(&page);

        let share = {
            let d = st.arena.get_mut(id);
            d.page = None;
            let share = d.share_count;
            d.share_count = 0;
            share
        };
        st.counters.pages_sharing = st.counters.pages_sharing.saturating_sub(u64::from(share));

        let flags = st.arena.get(id).flags;
        if flags & FLAG_NEW != 0 {
            st.new_q.remove(&mut st.arena, id);
            st.arena.get_mut(id).clear(FLAG_NEW);
            Self::destroy_descriptor(&self.host, st, id);
        } else if flags & FLAG_RESCAN_QUEUED != 0 {
            st.rescan_q.remove(&mut st.arena, id);
            st.arena.get_mut(id).clear(FLAG_RESCAN_QUEUED);
            Self::destroy_descriptor(&self.host, st, id);
        } else {
            st.arena.get_mut(id).set(FLAG_DELETED);
            st.dead_q.push_back(&mut st.arena, id);
        }
        Ok(())
    }

    /// One PTE of `page` was unmapped by the host. Adjusts sharing
    /// accounting once the host-visible map count no longer exceeds the
    /// engine's own sharing references.
    pub fn on_mapping_removed(&self, page: PageId) {
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        if page == self.host.zero_page() {
            st.counters.pages_zero_sharing = st.counters.pages_zero_sharing.saturating_sub(1);
            return;
        }
        let Some(&id) = st.page_map.get(&page) else {
            return;
        };
        let share = st.arena.get(id).share_count;
        if share == 0 {
            return;
        }
        if self.host.map_count(page) > share {
            // A mapping the engine never created went away.
            return;
        }
        st.arena.get_mut(id).share_count = share - 1;
        st.counters.pages_sharing = st.counters.pages_sharing.saturating_sub(1);
    }

    /// An address space entered the engine.
    pub fn on_space_enter(&self, space: SpaceId) {
        let newly = {
            let mut guard = self.state.lock().unwrap();
            guard.spaces.enter(space)
        };
        if newly {
            self.wake();
        }
    }

    /// An address space exited; its record lingers while anchors pin it.
    pub fn on_space_exit(&self, space: SpaceId) {
        self.state.lock().unwrap().spaces.exit(space);
    }

    /// Fan a reference visitor over every mapping of a shared page.
    /// Returns the number of mappings visited.
    pub fn on_reference_walk(
        &self,
        page: PageId,
        visitor: impl FnMut(&Mapping) -> ControlFlow<()>,
    ) -> usize {
        let Some(anchors) = self.stable_anchors(page) else {
            return 0;
        };
        reference_walk(&*self.host, &anchors, page, visitor)
    }

    /// Fan an unmapping visitor over every mapping of a shared page.
    pub fn on_unmap_walk(
        &self,
        page: PageId,
        unmapper: impl FnMut(&Mapping) -> ControlFlow<()>,
    ) -> WalkStatus {
        let Some(anchors) = self.stable_anchors(page) else {
            return WalkStatus::Completed;
        };
        unmap_walk(&*self.host, &anchors, page, unmapper)
    }

    /// The host migrated a tracked page to a new frame; rebind.
    pub fn on_migrate(&self, old: PageId, new: PageId) {
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        if let Some(id) = st.page_map.remove(&old) {
            st.page_map.insert(new, id);
            st.arena.get_mut(id).page = Some(new);
        }
    }

    /// A page range is going offline: prune every descriptor whose page
    /// falls inside it, without touching page content.
    pub fn on_range_offline(&self, first: PageId, last: PageId) {
        let _batch = self.batch_lock.lock().unwrap();
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        let victims: Vec<DescId> = st
            .arena
            .iter_live()
            .filter(|&id| {
                st.arena
                    .get(id)
                    .page
                    .is_some_and(|p| first <= p && p <= last)
            })
            .collect();
        for id in victims {
            Self::destroy_descriptor(&self.host, st, id);
        }
    }

    fn stable_anchors(&self, page: PageId) -> Option<Vec<Anchor>> {
        let guard = self.state.lock().unwrap();
        let &id = guard.page_map.get(&page)?;
        let d = guard.arena.get(id);
        if !d.has(FLAG_STABLE) {
            return None;
        }
        Some(d.anchors.clone())
    }

    // ---- scanning ------------------------------------------------------

    /// Run one scan batch: drain the new and rescan queues, resolve each
    /// descriptor against the trees, reap the deletion queue, and refresh a
    /// share of unstable checksums.
    pub fn scan_batch(&self) {
        let _batch = self.batch_lock.lock().unwrap();
        let npages = self.tunables.pages_to_scan();

        let mut work = Vec::new();
        {
            let mut guard = self.state.lock().unwrap();
            let st = &mut *guard;
            for _ in 0..npages {
                let Some(id) = st.new_q.pop_front(&mut st.arena) else {
                    break;
                };
                let d = st.arena.get_mut(id);
                d.clear(FLAG_NEW);
                d.set(FLAG_IN_ENGINE);
                work.push(id);
            }
            for _ in 0..npages {
                let Some(id) = st.rescan_q.pop_front(&mut st.arena) else {
                    break;
                };
                let d = st.arena.get_mut(id);
                d.clear(FLAG_RESCAN_QUEUED);
                if d.has(FLAG_DELETED) {
                    // Deletion queue owns it now.
                    continue;
                }
                work.push(id);
            }
        }

        for id in work {
            self.process_one(id);
            // Yield point between items: publishers get the state lock.
            std::thread::yield_now();
        }

        self.reap_dead();
        self.refresh_checksums();
        self.full_scans.fetch_add(1, Ordering::Relaxed);
    }

    fn process_one(&self, id: DescId) {
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;

        if st.arena.get(id).has(FLAG_DELETED) {
            return;
        }
        let init_checksum = {
            let d = st.arena.get_mut(id);
            let init = d.has(FLAG_INIT_CHECKSUM);
            d.clear(FLAG_INIT_CHECKSUM);
            init
        };
        let Some(page) = st.arena.get(id).page else {
            Self::destroy_descriptor(&self.host, st, id);
            return;
        };
        if !self.host.is_anonymous(page) {
            Self::destroy_descriptor(&self.host, st, id);
            return;
        }
        if !self.host.pin(page) {
            Self::destroy_descriptor(&self.host, st, id);
            return;
        }
        if self.host.is_locked(page) || self.host.io_in_flight(page) {
            Self::requeue_rescan(st, id);
            self.host.unpin(page);
            return;
        }

        match self.cmp_and_merge(st, id, page, init_checksum) {
            Outcome::Success | Outcome::Keep => {}
            Outcome::Drop => Self::destroy_descriptor(&self.host, st, id),
            Outcome::Try => Self::requeue_rescan(st, id),
        }
        self.host.unpin(page);
    }

    /// Resolve one candidate: zero fast path, stable lookup, then unstable
    /// lookup/insert.
    fn cmp_and_merge(
        &self,
        st: &mut CoreState,
        id: DescId,
        page: PageId,
        init_checksum: bool,
    ) -> Outcome {
        if self.host.is_shared(page) || st.arena.get(id).has(FLAG_STABLE) {
            return Outcome::Drop;
        }
        self.remove_from_tree(st, id);

        if init_checksum {
            let Some(sum) = self.host.with_words(page, |w| self.hasher.digest(w)) else {
                return Outcome::Drop;
            };
            st.arena.get_mut(id).checksum = sum;
        }

        // Zero fast path: checksum match is a hint, the merge re-verifies.
        let zero_hint = match self.key_mode {
            KeyMode::Checksum => st.arena.get(id).checksum == self.hasher.zero_checksum(),
            KeyMode::Content => self.host.is_zero_filled(page).unwrap_or(false),
        };
        if zero_hint {
            match merge::merge_zero(&*self.host, page, self.host.zero_page()) {
                Ok(replaced) => {
                    st.counters.pages_zero_sharing += u64::from(replaced);
                    return Outcome::Success;
                }
                Err(fault) if fault.is_transient() => return Outcome::Try,
                Err(_) => {} // fall through to the trees
            }
        }

        match self.stable_search(st, id, page) {
            StableSearch::Found { node, kpage } => {
                let outcome = match merge::merge_into_shared(&*self.host, page, kpage) {
                    Ok(replaced) => {
                        let space = st.arena.get(id).space;
                        self.append_anchor(st, node, space);
                        st.arena.get_mut(node).share_count += replaced;
                        st.counters.pages_sharing += u64::from(replaced);
                        Outcome::Success
                    }
                    Err(fault) if fault.is_transient() => Outcome::Try,
                    Err(_) => Outcome::Drop,
                };
                self.host.unpin(kpage);
                return outcome;
            }
            StableSearch::NotFound => {}
            StableSearch::Aborted => {}
        }

        match self.unstable_search(st, id, page) {
            UnstableSearch::Found { node, tpage } => {
                let outcome = match merge::merge_pair(&*self.host, page, tpage) {
                    Ok(replaced) => {
                        self.remove_from_tree(st, node);
                        match self.stable_insert(st, id, page) {
                            Ok(()) => {
                                let own_space = st.arena.get(id).space;
                                let tree_space = st.arena.get(node).space;
                                self.append_anchor(st, id, own_space);
                                self.append_anchor(st, id, tree_space);
                                st.arena.get_mut(id).share_count += replaced;
                                st.counters.pages_sharing += u64::from(replaced);
                                Outcome::Success
                            }
                            // The candidate was not write-protected during
                            // the earlier search, so a same-key node may
                            // have appeared; retry resolves it as shared.
                            Err(fault) if fault.is_transient() => Outcome::Try,
                            Err(_) => Outcome::Drop,
                        }
                    }
                    Err(fault) if fault.is_transient() => Outcome::Try,
                    Err(_) => Outcome::Drop,
                };
                self.host.unpin(tpage);
                outcome
            }
            UnstableSearch::Inserted => Outcome::Success,
            UnstableSearch::Aborted => Outcome::Try,
        }
    }

    /// Key comparison for the probe page against a tree node's page.
    /// `None` means the node page vanished mid-compare.
    fn key_cmp(
        &self,
        st: &CoreState,
        probe: DescId,
        page: PageId,
        node: DescId,
        node_page: PageId,
    ) -> Option<CmpOrdering> {
        match self.key_mode {
            KeyMode::Checksum => {
                Some(st.arena.get(probe).checksum.cmp(&st.arena.get(node).checksum))
            }
            KeyMode::Content => self.host.compare_content(page, node_page),
        }
    }

    /// True if the tree node can no longer back a comparison and must be
    /// pruned from the walk.
    fn node_stale(st: &CoreState, node: DescId) -> bool {
        let d = st.arena.get(node);
        d.has(FLAG_DELETED) || d.page.is_none()
    }

    fn stable_search(&self, st: &mut CoreState, probe: DescId, page: PageId) -> StableSearch {
        'restart: loop {
            let mut cur = st.stable.root();
            while let Some(node) = cur {
                if Self::node_stale(st, node) {
                    self.remove_from_tree(st, node);
                    continue 'restart;
                }
                let node_page = st.arena.get(node).page.expect("stale check passed");
                // A stable page that lost its write protection (racy COW
                // break) must leave the tree before any content compare.
                if !self.host.is_shared(node_page) {
                    self.remove_from_tree(st, node);
                    continue 'restart;
                }
                if !self.host.pin(node_page) {
                    return StableSearch::Aborted;
                }
                let Some(ord) = self.key_cmp(st, probe, page, node, node_page) else {
                    self.host.unpin(node_page);
                    self.remove_from_tree(st, node);
                    continue 'restart;
                };
                match ord {
                    CmpOrdering::Less => {
                        self.host.unpin(node_page);
                        cur = st.stable.child(&st.arena, node, Dir::Left);
                    }
                    CmpOrdering::Greater => {
                        self.host.unpin(node_page);
                        cur = st.stable.child(&st.arena, node, Dir::Right);
                    }
                    CmpOrdering::Equal => {
                        if self.key_mode == KeyMode::Checksum {
                            // Hash keying still demands content equality.
                            match self.host.compare_content(page, node_page) {
                                Some(CmpOrdering::Equal) => {}
                                Some(_) => {
                                    self.host.unpin(node_page);
                                    return StableSearch::NotFound;
                                }
                                None => {
                                    self.host.unpin(node_page);
                                    self.remove_from_tree(st, node);
                                    continue 'restart;
                                }
                            }
                        }
                        return StableSearch::Found {
                            node,
                            kpage: node_page,
                        };
                    }
                }
            }
            return StableSearch::NotFound;
        }
    }

    fn unstable_search(&self, st: &mut CoreState, probe: DescId, page: PageId) -> UnstableSearch {
        'restart: loop {
            let mut parent = None;
            let mut dir = Dir::Left;
            let mut cur = st.unstable.root();
            while let Some(node) = cur {
                if Self::node_stale(st, node) {
                    self.remove_from_tree(st, node);
                    continue 'restart;
                }
                let node_page = st.arena.get(node).page.expect("stale check passed");
                // Candidates must still be plain anonymous pages.
                if !self.host.is_anonymous(node_page) || self.host.is_shared(node_page) {
                    self.remove_from_tree(st, node);
                    continue 'restart;
                }
                if !self.host.pin(node_page) {
                    return UnstableSearch::Aborted;
                }
                if node_page == page {
                    // Forked duplicate of ourselves; never substitute it.
                    self.host.unpin(node_page);
                    return UnstableSearch::Aborted;
                }
                let Some(ord) = self.key_cmp(st, probe, page, node, node_page) else {
                    self.host.unpin(node_page);
                    self.remove_from_tree(st, node);
                    continue 'restart;
                };
                match ord {
                    CmpOrdering::Less => {
                        self.host.unpin(node_page);
                        parent = Some(node);
                        dir = Dir::Left;
                        cur = st.unstable.child(&st.arena, node, Dir::Left);
                    }
                    CmpOrdering::Greater => {
                        self.host.unpin(node_page);
                        parent = Some(node);
                        dir = Dir::Right;
                        cur = st.unstable.child(&st.arena, node, Dir::Right);
                    }
                    CmpOrdering::Equal => {
                        return UnstableSearch::Found {
                            node,
                            tpage: node_page,
                        };
                    }
                }
            }

            st.unstable.insert_at(&mut st.arena, parent, dir, probe);
            {
                let d = st.arena.get_mut(probe);
                d.set(FLAG_UNSTABLE | FLAG_CHECKSUM_QUEUED);
            }
            st.refresh_q.push_back(&mut st.arena, probe);
            st.counters.pages_unshared += 1;
            return UnstableSearch::Inserted;
        }
    }

    /// Insert a freshly promoted descriptor into the stable tree.
    fn stable_insert(
        &self,
        st: &mut CoreState,
        probe: DescId,
        page: PageId,
    ) -> Result<(), crate::mm::MergeFault> {
        use crate::mm::{MergeFault, RejectCause, TransientCause};
        'restart: loop {
            let mut parent = None;
            let mut dir = Dir::Left;
            let mut cur = st.stable.root();
            while let Some(node) = cur {
                if Self::node_stale(st, node) {
                    self.remove_from_tree(st, node);
                    continue 'restart;
                }
                let node_page = st.arena.get(node).page.expect("stale check passed");
                if !self.host.pin(node_page) {
                    return Err(MergeFault::Rejected(RejectCause::PinFailed));
                }
                let ord = self.key_cmp(st, probe, page, node, node_page);
                self.host.unpin(node_page);
                match ord {
                    None => {
                        self.remove_from_tree(st, node);
                        continue 'restart;
                    }
                    Some(CmpOrdering::Less) => {
                        parent = Some(node);
                        dir = Dir::Left;
                        cur = st.stable.child(&st.arena, node, Dir::Left);
                    }
                    Some(CmpOrdering::Greater) => {
                        parent = Some(node);
                        dir = Dir::Right;
                        cur = st.stable.child(&st.arena, node, Dir::Right);
                    }
                    Some(CmpOrdering::Equal) => {
                        // The search missed this node because our page was
                        // still mutable then; treat as a collision and retry.
                        return Err(MergeFault::Transient(TransientCause::TreeCollision));
                    }
                }
            }
            st.stable.insert_at(&mut st.arena, parent, dir, probe);
            st.arena.get_mut(probe).set(FLAG_STABLE);
            st.counters.pages_shared += 1;
            return Ok(());
        }
    }

    // ---- bookkeeping ---------------------------------------------------

    fn requeue_rescan(st: &mut CoreState, id: DescId) {
        let d = st.arena.get_mut(id);
        d.set(FLAG_INIT_CHECKSUM | FLAG_RESCAN_QUEUED);
        st.rescan_q.push_back(&mut st.arena, id);
    }

    /// Detach `id` from whichever tree it occupies, with counter upkeep.
    /// Anchors are left alone; they fall with the descriptor itself.
    fn remove_from_tree(&self, st: &mut CoreState, id: DescId) {
        let flags = st.arena.get(id).flags;
        if flags & FLAG_STABLE != 0 {
            st.stable.unlink(&mut st.arena, id);
            st.arena.get_mut(id).clear(FLAG_STABLE);
            st.counters.pages_shared = st.counters.pages_shared.saturating_sub(1);
        } else if flags & FLAG_UNSTABLE != 0 {
            st.unstable.unlink(&mut st.arena, id);
            st.arena.get_mut(id).clear(FLAG_UNSTABLE);
            st.counters.pages_unshared = st.counters.pages_unshared.saturating_sub(1);
            if flags & FLAG_CHECKSUM_QUEUED != 0 {
                st.refresh_q.remove(&mut st.arena, id);
                st.arena.get_mut(id).clear(FLAG_CHECKSUM_QUEUED);
            }
        }
    }

    fn append_anchor(&self, st: &mut CoreState, id: DescId, space: SpaceId) {
        if st.arena.get(id).anchors.iter().any(|a| a.space == space) {
            return;
        }
        st.arena.get_mut(id).anchors.push(Anchor { space });
        st.spaces.pin(space);
        self.host.pin_space(space);
        st.counters.stable_nodes += 1;
    }

    fn drop_anchors(host: &Arc<H>, st: &mut CoreState, id: DescId) {
        let anchors = std::mem::take(&mut st.arena.get_mut(id).anchors);
        for anchor in anchors {
            st.spaces.unpin(anchor.space);
            host.unpin_space(anchor.space);
            st.counters.stable_nodes = st.counters.stable_nodes.saturating_sub(1);
        }
    }

    /// Fully detach and free one descriptor: queues, trees, anchors,
    /// binding, counters.
    fn destroy_descriptor(host: &Arc<H>, st: &mut CoreState, id: DescId) {
        let flags = st.arena.get(id).flags;
        if flags & FLAG_NEW != 0 {
            st.new_q.remove(&mut st.arena, id);
        } else if flags & FLAG_RESCAN_QUEUED != 0 {
            st.rescan_q.remove(&mut st.arena, id);
        }
        if st.dead_q.is_linked(&st.arena, id) {
            st.dead_q.remove(&mut st.arena, id);
        }

        // Inline tree removal (static: no &self available here).
        if flags & FLAG_STABLE != 0 {
            st.stable.unlink(&mut st.arena, id);
            st.counters.pages_shared = st.counters.pages_shared.saturating_sub(1);
        } else if flags & FLAG_UNSTABLE != 0 {
            st.unstable.unlink(&mut st.arena, id);
            st.counters.pages_unshared = st.counters.pages_unshared.saturating_sub(1);
            if flags & FLAG_CHECKSUM_QUEUED != 0 {
                st.refresh_q.remove(&mut st.arena, id);
            }
        }

        Self::drop_anchors(host, st, id);

        let share = st.arena.get(id).share_count;
        st.counters.pages_sharing = st.counters.pages_sharing.saturating_sub(u64::from(share));

        if let Some(page) = st.arena.get_mut(id).page.take() {
            st.page_map.remove(&page);
        }
        st.arena.get_mut(id).flags = 0;
        st.arena.free(id);
        st.counters.rmap_items = st.counters.rmap_items.saturating_sub(1);
    }

    /// Drain the deletion queue: every flagged descriptor is detached from
    /// trees and anchors and freed.
    fn reap_dead(&self) {
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        while let Some(id) = st.dead_q.pop_front(&mut st.arena) {
            debug_assert!(st.arena.get(id).has(FLAG_DELETED));
            Self::destroy_descriptor(&self.host, st, id);
        }
    }

    /// Rehash a share of the unstable population sized so a full pass
    /// completes within the refresh period. Drifted descriptors leave the
    /// unstable tree and go back through the rescan queue.
    fn refresh_checksums(&self) {
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;

        let unstable = u64::from(st.refresh_q.len());
        let npages = u64::from(self.tunables.pages_to_scan());
        let sleep = u64::from(self.tunables.sleep_ms());
        let period_ms = u64::from(self.tunables.refresh_period_s()).saturating_mul(1000).max(1);
        let need = if unstable < npages {
            unstable
        } else {
            (unstable.saturating_mul(sleep) / period_ms).min(npages)
        };

        for _ in 0..need {
            let Some(id) = st.refresh_q.pop_front(&mut st.arena) else {
                break;
            };
            st.arena.get_mut(id).clear(FLAG_CHECKSUM_QUEUED);

            if st.arena.get(id).has(FLAG_DELETED) {
                continue;
            }
            debug_assert!(st.arena.get(id).has(FLAG_UNSTABLE));
            let Some(page) = st.arena.get(id).page else {
                continue;
            };

            let requeue = |st: &mut CoreState, id: DescId| {
                st.arena.get_mut(id).set(FLAG_CHECKSUM_QUEUED);
                st.refresh_q.push_back(&mut st.arena, id);
            };

            if !self.host.pin(page) {
                requeue(st, id);
                continue;
            }
            if self.host.is_locked(page) || self.host.io_in_flight(page) {
                requeue(st, id);
                self.host.unpin(page);
                continue;
            }
            let Some(sum) = self.host.with_words(page, |w| self.hasher.digest(w)) else {
                requeue(st, id);
                self.host.unpin(page);
                continue;
            };

            if sum != st.arena.get(id).checksum {
                // The page drifted out from under its key: evict and rescan.
                st.arena.get_mut(id).checksum = sum;
                self.remove_from_tree(st, id);
                Self::requeue_rescan(st, id);
            } else {
                requeue(st, id);
            }
            self.host.unpin(page);
        }
    }

    // ---- validation ----------------------------------------------------

    /// Structural self-check, meant for quiescent points in tests and debug
    /// builds. Panics on violation.
    ///
    /// Checks flag/link agreement on every live descriptor, tree mutual
    /// exclusion, refresh-queue membership, and counter consistency.
    pub fn validate(&self) {
        let guard = self.state.lock().unwrap();
        let st = &*guard;

        let mut stable = 0u64;
        let mut unstable = 0u64;
        let mut refresh_queued = 0u64;
        let mut anchors = 0u64;
        let mut sharing = 0u64;
        for id in st.arena.iter_live() {
            let d = st.arena.get(id);
            let in_stable = d.has(FLAG_STABLE);
            let in_unstable = d.has(FLAG_UNSTABLE);
            assert!(
                !(in_stable && in_unstable),
                "descriptor in both trees: {id:?}"
            );
            assert_eq!(
                d.node.is_unlinked(),
                !(in_stable || in_unstable),
                "tree flag/link mismatch: {id:?}"
            );
            assert_eq!(
                d.scan_link.is_unlinked(),
                !(d.has(FLAG_NEW) || d.has(FLAG_RESCAN_QUEUED)),
                "scan flag/link mismatch: {id:?}"
            );
            assert_eq!(
                d.refresh_link.is_unlinked(),
                !d.has(FLAG_CHECKSUM_QUEUED),
                "refresh flag/link mismatch: {id:?}"
            );
            if d.has(FLAG_CHECKSUM_QUEUED) {
                assert!(in_unstable, "refresh-queued descriptor not unstable: {id:?}");
                refresh_queued += 1;
            }
            if let Some(page) = d.page {
                assert_eq!(
                    st.page_map.get(&page),
                    Some(&id),
                    "page binding mismatch: {id:?}"
                );
                if d.share_count > 0 {
                    assert!(
                        self.host.map_count(page) >= d.share_count,
                        "share count exceeds live mappings: {id:?}"
                    );
                }
            }
            if in_unstable {
                assert!(
                    d.has(FLAG_CHECKSUM_QUEUED) || d.has(FLAG_DELETED),
                    "unstable descriptor missing from refresh queue: {id:?}"
                );
            }
            for anchor in &d.anchors {
                assert!(
                    st.spaces.contains(anchor.space),
                    "anchor pins unknown space: {id:?}"
                );
            }
            stable += u64::from(in_stable);
            unstable += u64::from(in_unstable);
            anchors += d.anchors.len() as u64;
            sharing += u64::from(d.share_count);
        }

        assert_eq!(st.stable.len(), stable, "stable tree length drift");
        assert_eq!(st.unstable.len(), unstable, "unstable tree length drift");
        assert_eq!(
            u64::from(st.refresh_q.len()),
            refresh_queued,
            "refresh queue length drift"
        );
        assert_eq!(st.counters.pages_shared, stable, "pages_shared drift");
        assert_eq!(st.counters.pages_unshared, unstable, "pages_unshared drift");
        assert_eq!(st.counters.stable_nodes, anchors, "stable_nodes drift");
        assert_eq!(st.counters.pages_sharing, sharing, "pages_sharing drift");
        assert_eq!(
            st.counters.rmap_items,
            u64::from(st.arena.live()),
            "rmap_items drift"
        );
        assert_eq!(
            u64::from(st.page_map.len() as u32),
            st.arena
                .iter_live()
                .filter(|&id| st.arena.get(id).page.is_some())
                .count() as u64,
            "page map size drift"
        );
    }

    // ---- unmerge -------------------------------------------------------

    /// System-wide unmerge: walk the stable tree, break COW on every
    /// mapping of every shared page, and retire the descriptors.
    fn unmerge_all(&self) {
        let _batch = self.batch_lock.lock().unwrap();
        loop {
            // Take one stable entry per pass; COW breaking happens outside
            // the state lock.
            let (id, page, anchors) = {
                let mut guard = self.state.lock().unwrap();
                let st = &mut *guard;
                let Some(id) = st.stable.first(&st.arena) else {
                    break;
                };
                let d = st.arena.get(id);
                match d.page {
                    Some(page) if !d.has(FLAG_DELETED) => (id, page, d.anchors.clone()),
                    _ => {
                        Self::destroy_descriptor(&self.host, st, id);
                        continue;
                    }
                }
            };

            for anchor in &anchors {
                self.host
                    .walk_space_mappings(anchor.space, page, &mut |m| {
                        let _ = self.host.break_cow(&m, page);
                        ControlFlow::Continue(())
                    });
            }

            let mut guard = self.state.lock().unwrap();
            let st = &mut *guard;
            // The descriptor cannot have been freed meanwhile (a stable
            // entry's death only flags it), so retiring it here is safe
            // whether or not the page died during the COW breaking.
            Self::destroy_descriptor(&self.host, st, id);
        }
    }
}
