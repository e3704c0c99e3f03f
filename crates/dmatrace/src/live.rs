//! Live-pointer table, per-class accounting, and the peak engine.
//!
//! Lock order is pointer → frame. `add` interns the backtrace before
//! taking the pointer lock; `remove` extracts the entry first and
//! de-interns after dropping the pointer lock. Only the dump and the
//! peak snapshot hold both locks at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local};

use crate::config::{Config, Options};
use crate::intern::{FrameStack, FrameTable, EMPTY_INDEX, EXIT_INDEX};
use crate::unwind::{StackSource, UnwindStatus};

/// Sizes at or below this are stored raw; bit 31 of the stored size is
/// reserved and never set by the tracker itself.
pub const MAX_TRACKED_SIZE: usize = (1 << 31) - 1;

const SIZE_FLAG_BIT: u32 = 1 << 31;

/// Accounting bucket for an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryClass {
    /// Ordinary heap allocation.
    Host,
    /// Anonymous private mapping.
    Mmap,
    /// Device-heap buffer (fd-keyed or mapped).
    Dma,
}

impl MemoryClass {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryClass::Host => "host",
            MemoryClass::Mmap => "mmap",
            MemoryClass::Dma => "dma",
        }
    }

    /// Host and anonymous mappings account into the host counters.
    fn counts_as_dma(self) -> bool {
        match self {
            MemoryClass::Host | MemoryClass::Mmap => false,
            MemoryClass::Dma => true,
        }
    }
}

/// Running and peak byte counters. Peaks never decrease.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub current_host: usize,
    pub current_dma: usize,
    pub current_total: usize,
    pub peak_host: usize,
    pub peak_dma: usize,
    pub peak_total: usize,
}

impl Totals {
    /// Returns true when this allocation set a new global peak.
    fn charge(&mut self, class: MemoryClass, size: usize) -> bool {
        if class.counts_as_dma() {
            self.current_dma += size;
            self.peak_dma = self.peak_dma.max(self.current_dma);
        } else {
            self.current_host += size;
            self.peak_host = self.peak_host.max(self.current_host);
        }
        self.current_total += size;
        if self.current_total > self.peak_total {
            self.peak_total = self.current_total;
            true
        } else {
            false
        }
    }

    fn discharge(&mut self, class: MemoryClass, size: usize) {
        if class.counts_as_dma() {
            self.current_dma = self.current_dma.saturating_sub(size);
        } else {
            self.current_host = self.current_host.saturating_sub(size);
        }
        self.current_total = self.current_total.saturating_sub(size);
    }
}

#[derive(Debug, Clone)]
struct LiveEntry {
    /// Encoded size; bit 31 reserved.
    size: u32,
    hash_index: u64,
    class: MemoryClass,
    time: DateTime<Local>,
}

impl LiveEntry {
    fn real_size(&self) -> usize {
        (self.size & !SIZE_FLAG_BIT) as usize
    }
}

/// One aggregated row of a snapshot or dump.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub pointer: usize,
    pub count: usize,
    pub size: usize,
    pub class: MemoryClass,
    pub time: DateTime<Local>,
    pub stack: Option<Arc<FrameStack>>,
}

struct LiveSet {
    pointers: HashMap<usize, LiveEntry>,
    totals: Totals,
    peak: Vec<ListEntry>,
}

/// The tracked live set plus the interning table it references.
pub struct PointerData {
    config: Config,
    frames: Mutex<FrameTable>,
    live: Mutex<LiveSet>,
}

/// Map keys are XORed with the all-ones pattern so raw heap addresses
/// never appear in the tracker's own working set. Applied on every
/// insert and lookup; self-inverse.
fn mangle(addr: usize) -> usize {
    addr ^ usize::MAX
}

impl PointerData {
    pub fn new(config: Config) -> Self {
        PointerData {
            config,
            frames: Mutex::new(FrameTable::new()),
            live: Mutex::new(LiveSet {
                pointers: HashMap::new(),
                totals: Totals::default(),
                peak: Vec::new(),
            }),
        }
    }

    fn frames(&self) -> MutexGuard<'_, FrameTable> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live(&self) -> MutexGuard<'_, LiveSet> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Capture and intern a backtrace for an allocation of `size`
    /// bytes. Returns a sentinel when the size filter, configuration,
    /// or the unwinder rule it out.
    pub fn add_backtrace(&self, source: &dyn StackSource, size: usize) -> u64 {
        if !self.config.should_backtrace_size(size) {
            return EMPTY_INDEX;
        }
        if !self.config.options().contains(Options::BACKTRACE) {
            return EMPTY_INDEX;
        }

        let capture = source.capture(self.config.backtrace_frames());
        match capture.status {
            UnwindStatus::ExitFunc => EXIT_INDEX,
            UnwindStatus::Fail => EMPTY_INDEX,
            UnwindStatus::Ok | UnwindStatus::OkTruncated => {
                if capture.pcs.is_empty() {
                    EMPTY_INDEX
                } else {
                    self.frames().intern(capture.pcs, capture.frames)
                }
            }
        }
    }

    /// Drop one backtrace reference. Sentinels are no-ops.
    pub fn remove_backtrace(&self, hash_index: u64) {
        if hash_index <= EMPTY_INDEX {
            return;
        }
        self.frames().release(hash_index);
    }

    /// Record a new allocation. A thread-exit unwind drops the
    /// allocation entirely; everything else lands in the live table and
    /// the totals, possibly rebuilding the peak snapshot.
    pub fn add(&self, source: &dyn StackSource, addr: usize, size: usize, class: MemoryClass) {
        if size > MAX_TRACKED_SIZE {
            return;
        }

        let hash_index = self.add_backtrace(source, size);
        if hash_index == EXIT_INDEX {
            return;
        }

        let mut set = self.live();
        let entry = LiveEntry {
            size: size as u32,
            hash_index,
            class,
            time: Local::now(),
        };
        if let Some(stale) = set.pointers.insert(mangle(addr), entry) {
            // Address reuse without an observed free. Retire the stale
            // entry so the totals stay balanced.
            set.totals.discharge(stale.class, stale.real_size());
            self.frames().release(stale.hash_index);
        }

        let new_peak = set.totals.charge(class, size);
        if new_peak
            && self.config.options().contains(Options::RECORD_MEMORY_PEAK)
            && set.totals.peak_total > self.config.dump_peak_value_bytes()
            && size > self.config.dump_peak_increment_bytes()
        {
            let frames = self.frames();
            let snapshot = build_unique_list(&set.pointers, &frames, false);
            set.peak = snapshot;
        }
    }

    /// Remove a tracked allocation by address. Unknown addresses are a
    /// silent no-op (never-tracked frees arrive here all the time).
    pub fn remove(&self, addr: usize) {
        self.remove_filtered(addr, None);
    }

    /// Remove an fd-keyed DMA allocation. Only entries whose class is
    /// DMA match, so closing an unrelated fd cannot evict a host entry.
    pub fn remove_dma(&self, fd: usize) {
        self.remove_filtered(fd, Some(MemoryClass::Dma));
    }

    fn remove_filtered(&self, addr: usize, wanted: Option<MemoryClass>) {
        let hash_index;
        {
            let mut set = self.live();
            let key = mangle(addr);
            match set.pointers.get(&key) {
                None => return,
                Some(entry) => {
                    if wanted.is_some_and(|class| entry.class != class) {
                        return;
                    }
                }
            }
            let Some(entry) = set.pointers.remove(&key) else {
                return;
            };
            set.totals.discharge(entry.class, entry.real_size());
            hash_index = entry.hash_index;
        }
        self.remove_backtrace(hash_index);
    }

    pub fn totals(&self) -> Totals {
        self.live().totals
    }

    pub fn live_count(&self) -> usize {
        self.live().pointers.len()
    }

    pub fn hash_index_of(&self, addr: usize) -> Option<u64> {
        self.live().pointers.get(&mangle(addr)).map(|e| e.hash_index)
    }

    pub fn frame_record_count(&self) -> usize {
        self.frames().record_count()
    }

    pub fn frame_reference_total(&self) -> usize {
        self.frames().total_references()
    }

    pub fn peak_snapshot(&self) -> Vec<ListEntry> {
        self.live().peak.clone()
    }

    /// Materialize the dump input under both locks: the stored peak
    /// snapshot when peak recording is on and one exists, otherwise a
    /// fresh coalesced view of the live set in allocation-time order.
    pub fn collect_for_dump(&self) -> (Totals, Vec<ListEntry>) {
        let set = self.live();
        let frames = self.frames();

        if self.config.options().contains(Options::RECORD_MEMORY_PEAK) && !set.peak.is_empty() {
            return (set.totals, set.peak.clone());
        }

        let mut list = build_unique_list(&set.pointers, &frames, false);
        list.sort_by_key(|entry| entry.time);
        (set.totals, list)
    }
}

fn build_list(
    pointers: &HashMap<usize, LiveEntry>,
    frames: &FrameTable,
    only_with_backtrace: bool,
) -> Vec<ListEntry> {
    let mut list = Vec::with_capacity(pointers.len());
    for (&mangled, entry) in pointers {
        if only_with_backtrace && entry.hash_index <= EMPTY_INDEX {
            continue;
        }
        let stack = if entry.hash_index > EMPTY_INDEX {
            frames.stack(entry.hash_index)
        } else {
            None
        };
        list.push(ListEntry {
            pointer: mangle(mangled),
            count: 1,
            size: entry.real_size(),
            class: entry.class,
            time: entry.time,
            stack,
        });
    }

    list.sort_by(|a, b| {
        // Size descending, deepest stacks first, stackless entries
        // last, address as the final tiebreak.
        b.size.cmp(&a.size).then_with(|| match (&a.stack, &b.stack) {
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => y.depth().cmp(&x.depth()),
            (None, None) => std::cmp::Ordering::Equal,
        })
        .then_with(|| a.pointer.cmp(&b.pointer))
    });
    list
}

/// Sorted view with consecutive equal (size, stack, class) runs
/// coalesced into a single entry carrying the run's count and its
/// earliest timestamp.
fn build_unique_list(
    pointers: &HashMap<usize, LiveEntry>,
    frames: &FrameTable,
    only_with_backtrace: bool,
) -> Vec<ListEntry> {
    let list = build_list(pointers, frames, only_with_backtrace);
    let mut out: Vec<ListEntry> = Vec::with_capacity(list.len());
    for entry in list {
        if let Some(last) = out.last_mut() {
            if last.size == entry.size
                && last.class == entry.class
                && same_stack(&last.stack, &entry.stack)
            {
                last.count += entry.count;
                if entry.time < last.time {
                    last.time = entry.time;
                }
                continue;
            }
        }
        out.push(entry);
    }
    out
}

fn same_stack(a: &Option<Arc<FrameStack>>, b: &Option<Arc<FrameStack>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => Arc::ptr_eq(x, y),
        _ => false,
    }
}
