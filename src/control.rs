//! Flat key-value control surface and runtime tunables.
//!
//! Mirrors an administrative attribute tree: writable scan knobs, read-only
//! counters, and the run-mode switch. Writable tunables are atomics so the
//! scan worker picks up changes between batches without taking any lock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::engine::Engine;
use crate::mm::MemoryHost;
use std::fmt;

/// Run mode: scanning halted, worker parked.
pub const RUN_STOP: u8 = 0;
/// Run mode: scanning and merging.
pub const RUN_MERGE: u8 = 1;
/// Run mode: break every merge apart, then behave as stopped.
pub const RUN_UNMERGE: u8 = 2;

/// Runtime-writable scan parameters.
#[derive(Debug)]
pub struct Tunables {
    pub(crate) run: AtomicU8,
    pub(crate) pages_to_scan: AtomicU32,
    pub(crate) sleep_ms: AtomicU32,
    pub(crate) refresh_period_s: AtomicU32,
    pub(crate) deferred_timer: AtomicBool,
}

impl Tunables {
    pub(crate) fn new(run: u8, pages_to_scan: u32, sleep_ms: u32, refresh_period_s: u32, deferred_timer: bool) -> Self {
        Self {
            run: AtomicU8::new(run),
            pages_to_scan: AtomicU32::new(pages_to_scan),
            sleep_ms: AtomicU32::new(sleep_ms),
            refresh_period_s: AtomicU32::new(refresh_period_s),
            deferred_timer: AtomicBool::new(deferred_timer),
        }
    }

    #[inline]
    pub fn run(&self) -> u8 {
        self.run.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn pages_to_scan(&self) -> u32 {
        self.pages_to_scan.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sleep_ms(&self) -> u32 {
        self.sleep_ms.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn refresh_period_s(&self) -> u32 {
        self.refresh_period_s.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn deferred_timer(&self) -> bool {
        self.deferred_timer.load(Ordering::Relaxed)
    }
}

/// Errors from the key-value control surface.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ControlError {
    /// No such key.
    UnknownKey,
    /// Key is a read-only counter.
    ReadOnly,
    /// Value does not fit the key's range.
    OutOfRange,
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::UnknownKey => write!(f, "unknown control key"),
            ControlError::ReadOnly => write!(f, "control key is read-only"),
            ControlError::OutOfRange => write!(f, "control value out of range"),
        }
    }
}

impl std::error::Error for ControlError {}

impl<H: MemoryHost> Engine<H> {
    /// Read one control key.
    pub fn ctl_get(&self, key: &str) -> Result<u64, ControlError> {
        let t = self.tunables();
        let stats = self.stats();
        Ok(match key {
            "run" => u64::from(t.run()),
            "pages_to_scan" => u64::from(t.pages_to_scan()),
            "sleep_ms" => u64::from(t.sleep_ms()),
            "refresh_period_s" => u64::from(t.refresh_period_s()),
            "deferred_timer" => u64::from(t.deferred_timer()),
            "pages_shared" => stats.pages_shared,
            "pages_sharing" => stats.pages_sharing,
            "pages_unshared" => stats.pages_unshared,
            "pages_zero_sharing" => stats.pages_zero_sharing,
            "stable_nodes" => stats.stable_nodes,
            "rmap_items" => stats.rmap_items,
            "full_scans" => stats.full_scans,
            _ => return Err(ControlError::UnknownKey),
        })
    }

    /// Write one control key.
    ///
    /// Writing `run = 2` performs the system-wide unmerge synchronously
    /// before the mode change is visible; writing `run = 1` wakes the scan
    /// worker.
    pub fn ctl_set(&self, key: &str, value: u64) -> Result<(), ControlError> {
        let t = self.tunables();
        match key {
            "run" => {
                let mode = u8::try_from(value).map_err(|_| ControlError::OutOfRange)?;
                if mode > RUN_UNMERGE {
                    return Err(ControlError::OutOfRange);
                }
                self.set_run_mode(mode);
            }
            "pages_to_scan" => {
                let v = u32::try_from(value).map_err(|_| ControlError::OutOfRange)?;
                t.pages_to_scan.store(v, Ordering::Relaxed);
            }
            "sleep_ms" => {
                let v = u32::try_from(value).map_err(|_| ControlError::OutOfRange)?;
                t.sleep_ms.store(v, Ordering::Relaxed);
            }
            "refresh_period_s" => {
                let v = u32::try_from(value).map_err(|_| ControlError::OutOfRange)?;
                t.refresh_period_s.store(v, Ordering::Relaxed);
            }
            "deferred_timer" => {
                let v = u8::try_from(value).map_err(|_| ControlError::OutOfRange)?;
                if v > 1 {
                    return Err(ControlError::OutOfRange);
                }
                t.deferred_timer.store(v == 1, Ordering::Relaxed);
            }
            "pages_shared" | "pages_sharing" | "pages_unshared" | "pages_zero_sharing"
            | "stable_nodes" | "rmap_items" | "full_scans" => {
                return Err(ControlError::ReadOnly)
            }
            _ => return Err(ControlError::UnknownKey),
        }
        Ok(())
    }
}
