//! Deterministic simulated memory host.
//!
//! A small model of the collaborator the engine runs against in a kernel:
//! physical frames with pin counts, page locks and direct-I/O state, address
//! spaces holding VMAs and PTEs, a canonical zero page, and COW semantics
//! for writes through protected mappings. Everything the model does is
//! deterministic, and fault injection (page appears locked, I/O in flight,
//! pin failure) is counter-based so scenarios replay identically.
//!
//! Page births, deaths, COW copies, and unmaps surface as [`MmEvent`]s that
//! a test driver pulls with [`SimMemory::take_events`] and forwards to the
//! engine — the same pull-shape a kernel's page-fault and page-free hooks
//! would push. [`SimMemory::pump`] does the forwarding for the common case.
//!
//! The host lock is a leaf: no method calls back into the engine, so it is
//! always safe to call host methods while holding engine state.

use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Mutex;

use ahash::AHashMap;

use crate::engine::Engine;
use crate::mm::{
    Mapping, MemoryHost, MergeFault, PageId, PteToken, RejectCause, SpaceId, TransientCause,
    VmaId, PAGE_SIZE, PAGE_WORDS,
};

/// Memory-manager activity a driver forwards into the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmEvent {
    /// A fresh anonymous page appeared (mapping fault or COW copy).
    Born {
        page: PageId,
        space: SpaceId,
        vaddr: u64,
    },
    /// A frame was freed.
    Died(PageId),
    /// One PTE of `page` went away.
    Unmapped(PageId),
}

#[derive(Debug)]
struct Frame {
    words: Vec<u32>,
    pins: u32,
    locked: bool,
    shared: bool,
    anon: bool,
    dio: bool,
    mappings: Vec<Mapping>,
}

#[derive(Debug)]
struct Pte {
    page: PageId,
    writable: bool,
}

#[derive(Debug, Default)]
struct SimVma {
    start: u64,
    len: u64,
    flags: u32,
}

#[derive(Debug, Default)]
struct SimSpace {
    alive: bool,
    pins: u32,
    vmas: AHashMap<VmaId, SimVma>,
    ptes: AHashMap<u64, (VmaId, Pte)>,
}

#[derive(Debug, Default)]
struct Faults {
    locked: AHashMap<PageId, u32>,
    dio: AHashMap<PageId, u32>,
    pin_fail: AHashMap<PageId, u32>,
}

#[derive(Debug)]
struct SimInner {
    frames: AHashMap<PageId, Frame>,
    spaces: AHashMap<SpaceId, SimSpace>,
    next_page: u64,
    next_space: u32,
    next_vma: u32,
    zero: PageId,
    faults: Faults,
    events: VecDeque<MmEvent>,
}

/// The simulated host.
#[derive(Debug)]
pub struct SimMemory {
    inner: Mutex<SimInner>,
}

fn words_from_bytes(content: &[u8]) -> Vec<u32> {
    assert!(content.len() <= PAGE_SIZE, "page content too large");
    let mut words = vec![0u32; PAGE_WORDS];
    for (i, chunk) in content.chunks(4).enumerate() {
        let mut buf = [0u8; 4];
        buf[..chunk.len()].copy_from_slice(chunk);
        words[i] = u32::from_le_bytes(buf);
    }
    words
}

impl SimMemory {
    pub fn new() -> Self {
        let zero = PageId(1);
        let mut frames = AHashMap::new();
        frames.insert(
            zero,
            Frame {
                words: vec![0u32; PAGE_WORDS],
                pins: 1,
                locked: false,
                shared: true,
                anon: false,
                dio: false,
                mappings: Vec::new(),
            },
        );
        Self {
            inner: Mutex::new(SimInner {
                frames,
                spaces: AHashMap::new(),
                next_page: 2,
                next_space: 1,
                next_vma: 1,
                zero,
                faults: Faults::default(),
                events: VecDeque::new(),
            }),
        }
    }

    // ---- world building ------------------------------------------------

    pub fn create_space(&self) -> SpaceId {
        let mut inner = self.inner.lock().unwrap();
        let id = SpaceId(inner.next_space);
        inner.next_space += 1;
        inner.spaces.insert(
            id,
            SimSpace {
                alive: true,
                ..SimSpace::default()
            },
        );
        id
    }

    pub fn add_vma(&self, space: SpaceId, start: u64, len: u64, flags: u32) -> VmaId {
        let mut inner = self.inner.lock().unwrap();
        let id = VmaId(inner.next_vma);
        inner.next_vma += 1;
        let s = inner.spaces.get_mut(&space).expect("unknown space");
        s.vmas.insert(id, SimVma { start, len, flags });
        id
    }

    /// Fault in a fresh anonymous page at `vaddr` and queue its birth event.
    pub fn map_page(&self, space: SpaceId, vma: VmaId, vaddr: u64, content: &[u8]) -> PageId {
        let mut inner = self.inner.lock().unwrap();
        let page = PageId(inner.next_page);
        inner.next_page += 1;

        let vm_flags = {
            let s = inner.spaces.get(&space).expect("unknown space");
            let v = s.vmas.get(&vma).expect("unknown vma");
            assert!(vaddr >= v.start && vaddr < v.start + v.len, "vaddr outside vma");
            v.flags
        };
        inner.frames.insert(
            page,
            Frame {
                words: words_from_bytes(content),
                pins: 0,
                locked: false,
                shared: false,
                anon: true,
                dio: false,
                mappings: vec![Mapping {
                    space,
                    vma,
                    vaddr,
                    vm_flags,
                }],
            },
        );
        let s = inner.spaces.get_mut(&space).expect("unknown space");
        let prior = s.ptes.insert(
            vaddr,
            (
                vma,
                Pte {
                    page,
                    writable: true,
                },
            ),
        );
        assert!(prior.is_none(), "vaddr already mapped");
        inner.events.push_back(MmEvent::Born { page, space, vaddr });
        page
    }

    /// Write through a mapping, faulting a COW copy if the page is a shared
    /// one, or restoring write access on a protected private page.
    pub fn write(&self, space: SpaceId, vaddr: u64, offset: usize, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let (page, writable) = {
            let s = inner.spaces.get(&space).expect("unknown space");
            let (_, pte) = s.ptes.get(&vaddr).expect("vaddr not mapped");
            (pte.page, pte.writable)
        };

        let target = if writable {
            page
        } else if inner.frames[&page].shared {
            Self::cow_copy_locked(&mut inner, space, vaddr, page)
        } else {
            // Private page left write-protected by an abandoned merge
            // attempt: the fault simply restores write access.
            let s = inner.spaces.get_mut(&space).expect("unknown space");
            s.ptes.get_mut(&vaddr).expect("pte vanished").1.writable = true;
            page
        };

        let frame = inner.frames.get_mut(&target).expect("target frame missing");
        assert!(offset + bytes.len() <= PAGE_SIZE, "write past page end");
        let mut raw: Vec<u8> = frame.words.iter().flat_map(|w| w.to_le_bytes()).collect();
        raw[offset..offset + bytes.len()].copy_from_slice(bytes);
        frame.words = words_from_bytes(&raw);
    }

    /// Drop the PTE at `vaddr`, freeing the frame when the last mapping and
    /// pin are gone.
    pub fn unmap(&self, space: SpaceId, vaddr: u64) {
        let mut inner = self.inner.lock().unwrap();
        let page = {
            let s = inner.spaces.get_mut(&space).expect("unknown space");
            let (_, pte) = s.ptes.remove(&vaddr).expect("vaddr not mapped");
            pte.page
        };
        if let Some(frame) = inner.frames.get_mut(&page) {
            frame
                .mappings
                .retain(|m| !(m.space == space && m.vaddr == vaddr));
        }
        inner.events.push_back(MmEvent::Unmapped(page));
        Self::maybe_free_locked(&mut inner, page);
    }

    /// Tear down a whole space. The record lingers while anchor pins hold
    /// it; its mappings go away immediately.
    pub fn destroy_space(&self, space: SpaceId) {
        let vaddrs: Vec<u64> = {
            let inner = self.inner.lock().unwrap();
            inner.spaces.get(&space).map_or_else(Vec::new, |s| s.ptes.keys().copied().collect())
        };
        for vaddr in vaddrs {
            self.unmap(space, vaddr);
        }
        let mut inner = self.inner.lock().unwrap();
        let remove = {
            let s = inner.spaces.get_mut(&space).expect("unknown space");
            s.alive = false;
            s.pins == 0
        };
        if remove {
            inner.spaces.remove(&space);
        }
    }

    // ---- fault injection ----------------------------------------------

    /// The next `n` lock observations of `page` report it locked.
    pub fn inject_locked(&self, page: PageId, n: u32) {
        self.inner.lock().unwrap().faults.locked.insert(page, n);
    }

    /// The next `n` I/O probes of `page` report direct I/O in flight.
    pub fn inject_dio(&self, page: PageId, n: u32) {
        self.inner.lock().unwrap().faults.dio.insert(page, n);
    }

    /// The next `n` pin attempts on `page` fail.
    pub fn inject_pin_fail(&self, page: PageId, n: u32) {
        self.inner.lock().unwrap().faults.pin_fail.insert(page, n);
    }

    /// Persistently flag `page` as having direct I/O in flight.
    pub fn set_dio(&self, page: PageId, dio: bool) {
        self.inner.lock().unwrap().frames.get_mut(&page).expect("unknown page").dio = dio;
    }

    /// Hold the page lock from "elsewhere" (another kernel path).
    pub fn lock_page_external(&self, page: PageId) {
        let mut inner = self.inner.lock().unwrap();
        let frame = inner.frames.get_mut(&page).expect("unknown page");
        assert!(!frame.locked, "page already locked");
        frame.locked = true;
    }

    pub fn unlock_page_external(&self, page: PageId) {
        let mut inner = self.inner.lock().unwrap();
        let frame = inner.frames.get_mut(&page).expect("unknown page");
        assert!(frame.locked, "page not locked");
        frame.locked = false;
    }

    // ---- inspection ----------------------------------------------------

    pub fn page_of(&self, space: SpaceId, vaddr: u64) -> Option<PageId> {
        let inner = self.inner.lock().unwrap();
        inner
            .spaces
            .get(&space)
            .and_then(|s| s.ptes.get(&vaddr))
            .map(|(_, pte)| pte.page)
    }

    pub fn frame_exists(&self, page: PageId) -> bool {
        self.inner.lock().unwrap().frames.contains_key(&page)
    }

    pub fn mapping_count(&self, page: PageId) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .frames
            .get(&page)
            .map_or(0, |f| f.mappings.len() as u32)
    }

    pub fn pin_count(&self, page: PageId) -> u32 {
        self.inner.lock().unwrap().frames.get(&page).map_or(0, |f| f.pins)
    }

    /// Page content as bytes (little-endian word order).
    pub fn read_page(&self, page: PageId) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let frame = inner.frames.get(&page).expect("unknown page");
        frame.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Every pin released and no stray page locks: the engine's resource
    /// discipline at a quiescent point.
    pub fn assert_quiescent(&self) {
        let inner = self.inner.lock().unwrap();
        for (page, frame) in &inner.frames {
            if *page == inner.zero {
                continue;
            }
            assert_eq!(frame.pins, 0, "leaked pin on {page:?}");
            assert!(!frame.locked, "leaked page lock on {page:?}");
        }
    }

    // ---- event plumbing ------------------------------------------------

    /// Drain pending memory-manager events.
    pub fn take_events(&self) -> Vec<MmEvent> {
        self.inner.lock().unwrap().events.drain(..).collect()
    }

    /// Forward pending events into the engine: births, deaths, unmaps.
    /// Loops until the event stream is quiet (a death may be queued by the
    /// engine-triggered frees the events themselves describe).
    pub fn pump(&self, engine: &Engine<SimMemory>) {
        loop {
            let events = self.take_events();
            if events.is_empty() {
                return;
            }
            for event in events {
                match event {
                    MmEvent::Born { page, space, vaddr } => {
                        let _ = engine.on_birth(page, space, vaddr);
                    }
                    MmEvent::Died(page) => {
                        let _ = engine.on_death(page);
                    }
                    MmEvent::Unmapped(page) => engine.on_mapping_removed(page),
                }
            }
        }
    }

    // ---- internals -----------------------------------------------------

    fn cow_copy_locked(inner: &mut SimInner, space: SpaceId, vaddr: u64, shared: PageId) -> PageId {
        let copy = PageId(inner.next_page);
        inner.next_page += 1;

        let (words, mapping) = {
            let frame = inner.frames.get(&shared).expect("shared frame missing");
            let m = frame
                .mappings
                .iter()
                .find(|m| m.space == space && m.vaddr == vaddr)
                .copied()
                .expect("cow fault without mapping");
            (frame.words.clone(), m)
        };
        inner.frames.insert(
            copy,
            Frame {
                words,
                pins: 0,
                locked: false,
                shared: false,
                anon: true,
                dio: false,
                mappings: vec![mapping],
            },
        );
        {
            let s = inner.spaces.get_mut(&space).expect("unknown space");
            let (_, pte) = s.ptes.get_mut(&vaddr).expect("pte vanished");
            pte.page = copy;
            pte.writable = true;
        }
        {
            let frame = inner.frames.get_mut(&shared).expect("shared frame missing");
            frame
                .mappings
                .retain(|m| !(m.space == space && m.vaddr == vaddr));
        }
        inner.events.push_back(MmEvent::Born {
            page: copy,
            space,
            vaddr,
        });
        inner.events.push_back(MmEvent::Unmapped(shared));
        Self::maybe_free_locked(inner, shared);
        copy
    }

    fn maybe_free_locked(inner: &mut SimInner, page: PageId) {
        if page == inner.zero {
            return;
        }
        let free = inner
            .frames
            .get(&page)
            .is_some_and(|f| f.mappings.is_empty() && f.pins == 0);
        if free {
            inner.frames.remove(&page);
            inner.events.push_back(MmEvent::Died(page));
        }
    }

    fn consume(counters: &mut AHashMap<PageId, u32>, page: PageId) -> bool {
        match counters.get_mut(&page) {
            Some(n) if *n > 0 => {
                *n -= 1;
                if *n == 0 {
                    counters.remove(&page);
                }
                true
            }
            _ => false,
        }
    }
}

impl Default for SimMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost for SimMemory {
    fn pin(&self, page: PageId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if Self::consume(&mut inner.faults.pin_fail, page) {
            return false;
        }
        match inner.frames.get_mut(&page) {
            Some(frame) => {
                frame.pins += 1;
                true
            }
            None => false,
        }
    }

    fn unpin(&self, page: PageId) {
        let mut inner = self.inner.lock().unwrap();
        let frame = inner.frames.get_mut(&page).expect("unpin of missing frame");
        assert!(frame.pins > 0, "pin underflow");
        frame.pins -= 1;
        Self::maybe_free_locked(&mut inner, page);
    }

    fn try_lock_page(&self, page: PageId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if Self::consume(&mut inner.faults.locked, page) {
            return false;
        }
        match inner.frames.get_mut(&page) {
            Some(frame) if !frame.locked => {
                frame.locked = true;
                true
            }
            _ => false,
        }
    }

    fn unlock_page(&self, page: PageId) {
        let mut inner = self.inner.lock().unwrap();
        let frame = inner.frames.get_mut(&page).expect("unlock of missing frame");
        assert!(frame.locked, "unlock of unlocked page");
        frame.locked = false;
    }

    fn is_locked(&self, page: PageId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if Self::consume(&mut inner.faults.locked, page) {
            return true;
        }
        inner.frames.get(&page).is_some_and(|f| f.locked)
    }

    fn io_in_flight(&self, page: PageId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if Self::consume(&mut inner.faults.dio, page) {
            return true;
        }
        inner.frames.get(&page).is_some_and(|f| f.dio)
    }

    fn is_anonymous(&self, page: PageId) -> bool {
        self.inner.lock().unwrap().frames.get(&page).is_some_and(|f| f.anon)
    }

    fn is_shared(&self, page: PageId) -> bool {
        self.inner.lock().unwrap().frames.get(&page).is_some_and(|f| f.shared)
    }

    fn mark_shared(&self, page: PageId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(frame) = inner.frames.get_mut(&page) {
            frame.shared = true;
        }
    }

    fn map_count(&self, page: PageId) -> u32 {
        self.mapping_count(page)
    }

    fn zero_page(&self) -> PageId {
        self.inner.lock().unwrap().zero
    }

    fn with_words<R>(&self, page: PageId, f: impl FnOnce(&[u32]) -> R) -> Option<R> {
        let inner = self.inner.lock().unwrap();
        inner.frames.get(&page).map(|frame| f(&frame.words))
    }

    fn compare_content(&self, a: PageId, b: PageId) -> Option<CmpOrdering> {
        let inner = self.inner.lock().unwrap();
        let fa = inner.frames.get(&a)?;
        let fb = inner.frames.get(&b)?;
        Some(fa.words.cmp(&fb.words))
    }

    fn is_zero_filled(&self, page: PageId) -> Option<bool> {
        let inner = self.inner.lock().unwrap();
        inner.frames.get(&page).map(|f| f.words.iter().all(|&w| w == 0))
    }

    fn walk_mappings(
        &self,
        page: PageId,
        visitor: &mut dyn FnMut(Mapping) -> ControlFlow<MergeFault>,
    ) -> Result<(), MergeFault> {
        let mappings = {
            let inner = self.inner.lock().unwrap();
            match inner.frames.get(&page) {
                Some(frame) => frame.mappings.clone(),
                None => return Err(MergeFault::Rejected(RejectCause::PinFailed)),
            }
        };
        if mappings.is_empty() {
            return Err(MergeFault::Rejected(RejectCause::NoMappings));
        }
        for m in mappings {
            if let ControlFlow::Break(fault) = visitor(m) {
                return Err(fault);
            }
        }
        Ok(())
    }

    fn walk_space_mappings(
        &self,
        space: SpaceId,
        page: PageId,
        visitor: &mut dyn FnMut(Mapping) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        let mappings: Vec<Mapping> = {
            let inner = self.inner.lock().unwrap();
            match inner.frames.get(&page) {
                Some(frame) => frame
                    .mappings
                    .iter()
                    .filter(|m| m.space == space)
                    .copied()
                    .collect(),
                None => Vec::new(),
            }
        };
        for m in mappings {
            visitor(m)?;
        }
        ControlFlow::Continue(())
    }

    fn write_protect(&self, m: &Mapping, page: PageId) -> Result<PteToken, MergeFault> {
        let mut inner = self.inner.lock().unwrap();
        if Self::consume(&mut inner.faults.dio, page)
            || inner.frames.get(&page).is_some_and(|f| f.dio)
        {
            // Mirrors the cleared-PTE direct-I/O recheck: bail before the
            // protection sticks.
            return Err(MergeFault::Transient(TransientCause::DirectIo));
        }
        let s = inner
            .spaces
            .get_mut(&m.space)
            .ok_or(MergeFault::Transient(TransientCause::PteChanged))?;
        let (_, pte) = s
            .ptes
            .get_mut(&m.vaddr)
            .ok_or(MergeFault::Transient(TransientCause::PteChanged))?;
        if pte.page != page {
            return Err(MergeFault::Transient(TransientCause::PteChanged));
        }
        pte.writable = false;
        Ok(PteToken(page.0))
    }

    fn replace_mapping(
        &self,
        m: &Mapping,
        old: PageId,
        new: PageId,
        token: PteToken,
    ) -> Result<(), MergeFault> {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.frames.contains_key(&new), "replacement target missing");
        {
            let s = inner
                .spaces
                .get_mut(&m.space)
                .ok_or(MergeFault::Transient(TransientCause::PteChanged))?;
            let (_, pte) = s
                .ptes
                .get_mut(&m.vaddr)
                .ok_or(MergeFault::Transient(TransientCause::PteChanged))?;
            if pte.page != old || pte.writable || token.0 != old.0 {
                return Err(MergeFault::Transient(TransientCause::PteChanged));
            }
            pte.page = new;
        }
        {
            let frame = inner.frames.get_mut(&old).expect("old frame missing");
            frame
                .mappings
                .retain(|fm| !(fm.space == m.space && fm.vaddr == m.vaddr));
        }
        inner.frames.get_mut(&new).expect("new frame missing").mappings.push(*m);
        inner.events.push_back(MmEvent::Unmapped(old));
        Self::maybe_free_locked(&mut inner, old);
        Ok(())
    }

    fn break_cow(&self, m: &Mapping, shared: PageId) -> Result<(), MergeFault> {
        let mut inner = self.inner.lock().unwrap();
        let pte_page = inner
            .spaces
            .get(&m.space)
            .and_then(|s| s.ptes.get(&m.vaddr))
            .map(|(_, pte)| pte.page);
        if pte_page != Some(shared) {
            return Err(MergeFault::Transient(TransientCause::PteChanged));
        }
        Self::cow_copy_locked(&mut inner, m.space, m.vaddr, shared);
        Ok(())
    }

    fn pin_space(&self, space: SpaceId) {
        let mut inner = self.inner.lock().unwrap();
        inner.spaces.entry(space).or_default().pins += 1;
    }

    fn unpin_space(&self, space: SpaceId) {
        let mut inner = self.inner.lock().unwrap();
        let remove = {
            let s = inner.spaces.get_mut(&space).expect("unpin of unknown space");
            assert!(s.pins > 0, "space pin underflow");
            s.pins -= 1;
            s.pins == 0 && !s.alive
        };
        if remove {
            inner.spaces.remove(&space);
        }
    }
}
