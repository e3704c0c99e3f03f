//! Process-wide tracker facade: configuration, live set, dump paths,
//! and the lifecycle state machine.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

use crate::config::{Config, Options};
use crate::live::{MemoryClass, PointerData, Totals};
use crate::unwind::{FpUnwinder, StackSource};

/// Tracker lifecycle. Only `Active` permits add/remove; `Draining`
/// blocks new operations while the exit dump runs; `Frozen` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TrackerState {
    Uninitialized = 0,
    PreMain = 1,
    Active = 2,
    Draining = 3,
    Frozen = 4,
}

impl TrackerState {
    fn from_u8(value: u8) -> TrackerState {
        match value {
            1 => TrackerState::PreMain,
            2 => TrackerState::Active,
            3 => TrackerState::Draining,
            4 => TrackerState::Frozen,
            _ => TrackerState::Uninitialized,
        }
    }
}

pub struct Tracker {
    config: Config,
    pointers: PointerData,
    source: Box<dyn StackSource>,
    state: AtomicU8,
}

impl Tracker {
    /// Build a tracker using the frame-pointer unwinder.
    pub fn new(config: Config) -> Self {
        Self::with_source(config, Box::new(FpUnwinder::default()))
    }

    /// Build a tracker with an injected stack source (tests).
    pub fn with_source(config: Config, source: Box<dyn StackSource>) -> Self {
        Tracker {
            pointers: PointerData::new(config.clone()),
            config,
            source,
            state: AtomicU8::new(TrackerState::Uninitialized as u8),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> TrackerState {
        TrackerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TrackerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Live-pointer bookkeeping is on only while active and configured.
    pub fn track_pointers(&self) -> bool {
        self.state() == TrackerState::Active
            && self.config.options().contains(Options::TRACK_ALLOCS)
    }

    pub fn add_host(&self, addr: usize, size: usize) {
        if self.track_pointers() {
            self.pointers
                .add(self.source.as_ref(), addr, size, MemoryClass::Host);
        }
    }

    pub fn add_mmap(&self, addr: usize, size: usize) {
        if self.track_pointers() {
            self.pointers
                .add(self.source.as_ref(), addr, size, MemoryClass::Mmap);
        }
    }

    /// DMA allocations are keyed by whatever handle the caller owns:
    /// the heap fd for ioctl allocations, the mapping address for
    /// DMA-backed mmaps.
    pub fn add_dma(&self, key: usize, size: usize) {
        if self.track_pointers() {
            self.pointers
                .add(self.source.as_ref(), key, size, MemoryClass::Dma);
        }
    }

    pub fn remove(&self, addr: usize) {
        if self.track_pointers() {
            self.pointers.remove(addr);
        }
    }

    pub fn remove_dma(&self, fd: usize) {
        if self.track_pointers() {
            self.pointers.remove_dma(fd);
        }
    }

    pub fn totals(&self) -> Totals {
        self.pointers.totals()
    }

    pub fn pointers(&self) -> &PointerData {
        &self.pointers
    }

    /// Dump file for the signal path: `{prefix}.time.{epoch}.txt`.
    pub fn signal_dump_path(&self) -> PathBuf {
        self.stamped_path("time")
    }

    /// Dump file for the exit path: `{prefix}.exit.{epoch}.txt`.
    pub fn exit_dump_path(&self) -> PathBuf {
        self.stamped_path("exit")
    }

    fn stamped_path(&self, tag: &str) -> PathBuf {
        let epoch = chrono::Local::now().timestamp();
        PathBuf::from(format!("{}.{}.{}.txt", self.config.dump_prefix(), tag, epoch))
    }

    /// Serialize the current snapshot to a writer.
    pub fn dump_to_writer(&self, w: &mut dyn Write) -> std::io::Result<()> {
        let (totals, entries) = self.pointers.collect_for_dump();
        crate::dump::write_dump(w, &totals, &entries)
    }

    /// Write a dump file.
    pub fn try_dump(&self, path: &Path) -> crate::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.dump_to_writer(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Write a dump file, logging and swallowing I/O failures; the
    /// host process must never see them.
    pub fn dump_to(&self, path: &Path) {
        if let Err(e) = self.try_dump(path) {
            log::warn!("dump to {} failed: {e}", path.display());
        }
    }

    /// Log the peak counters; the exit path reports these even when no
    /// dump file is configured.
    pub fn log_peak_info(&self) {
        let totals = self.totals();
        log::info!(
            "peak usage: host {} bytes, dma {} bytes, total {} bytes",
            totals.peak_host,
            totals.peak_dma,
            totals.peak_total
        );
    }
}
