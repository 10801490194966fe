//! Long-lived scan worker.
//!
//! One cooperative thread drives the engine: run a batch when the run mode
//! allows it, then sleep for the configured interval. Sleeping uses a
//! parker so control writes (`run = 1`) and first births cut the wait
//! short; with the deferred timer enabled, sleeps are rounded up onto a
//! coarse grid so wakeups coalesce instead of firing on exact deadlines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_utils::sync::{Parker, Unparker};

use crate::engine::Engine;
use crate::mm::MemoryHost;

/// Coarse wakeup grid used when the deferred timer is enabled.
const DEFERRED_GRANULE_MS: u64 = 100;

/// Handle to the running scan worker.
pub struct ScanWorker {
    handle: Option<JoinHandle<()>>,
    unparker: Unparker,
    stop: Arc<AtomicBool>,
}

impl ScanWorker {
    /// Spawn the worker. The engine's waker is wired up so mode changes and
    /// idle-to-busy transitions wake it immediately.
    pub fn spawn<H: MemoryHost + 'static>(engine: Arc<Engine<H>>) -> ScanWorker {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        engine.set_waker(unparker.clone());

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("samepage-scand".into())
            .spawn(move || Self::run(engine, parker, stop_flag))
            .expect("spawning scan worker failed");

        ScanWorker {
            handle: Some(handle),
            unparker,
            stop,
        }
    }

    fn run<H: MemoryHost>(engine: Arc<Engine<H>>, parker: Parker, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::Acquire) {
            if engine.should_run() {
                engine.scan_batch();
            }
            if stop.load(Ordering::Acquire) {
                break;
            }
            if engine.should_run() {
                let mut ms = u64::from(engine.tunables().sleep_ms());
                if engine.tunables().deferred_timer() {
                    ms = ms.div_ceil(DEFERRED_GRANULE_MS).max(1) * DEFERRED_GRANULE_MS;
                }
                parker.park_timeout(Duration::from_millis(ms));
            } else {
                // Stopped: wait for a mode write or shutdown to unpark us.
                parker.park();
            }
        }
    }

    /// Ask the worker to exit and join it.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        self.unparker.unpark();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                eprintln!("WARN: scan worker exited by panic");
            }
        }
    }
}

impl Drop for ScanWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.unparker.unpark();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
