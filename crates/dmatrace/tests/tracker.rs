//! End-to-end scenarios driving a tracker with synthetic stacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dmatrace::{Capture, Config, FrameData, StackSource, Tracker, TrackerState, UnwindStatus};

/// Stack source whose answer can be swapped between captures, so one
/// tracker can observe several distinct call sites.
struct ScriptedStacks {
    current: Mutex<Vec<usize>>,
}

impl ScriptedStacks {
    fn new() -> Self {
        ScriptedStacks {
            current: Mutex::new(vec![0x1000, 0x2000]),
        }
    }

    fn set_site(&self, pcs: &[usize]) {
        *self.current.lock().unwrap() = pcs.to_vec();
    }
}

/// Cloneable handle so a test can keep rescripting the source after
/// handing it to a tracker.
struct SharedStacks(Arc<ScriptedStacks>);

impl StackSource for SharedStacks {
    fn capture(&self, max_frames: usize) -> Capture {
        self.0.capture(max_frames)
    }
}

impl StackSource for ScriptedStacks {
    fn capture(&self, _max_frames: usize) -> Capture {
        let pcs = self.current.lock().unwrap().clone();
        let frames = pcs
            .iter()
            .map(|&pc| FrameData {
                pc,
                rel_pc: pc,
                map_name: Some("/opt/app/libwork.so".to_string()),
                map_base: 0,
                symbol: Some("work::churn".to_string()),
                symbol_offset: 17,
            })
            .collect();
        Capture {
            status: UnwindStatus::Ok,
            pcs,
            frames,
        }
    }
}

fn config_from(vars: &[(&str, &str)]) -> Config {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Config::from_lookup(&move |name| map.get(name).cloned())
}

fn active_tracker(vars: &[(&str, &str)]) -> Tracker {
    let tracker = Tracker::with_source(config_from(vars), Box::new(ScriptedStacks::new()));
    tracker.set_state(TrackerState::Active);
    tracker
}

#[test]
fn single_tracked_malloc() {
    let tracker = active_tracker(&[("TRACK_ALLOCS", "1"), ("BACKTRACE", "1")]);

    tracker.add_host(0x55aa0000, 4096);
    assert_eq!(tracker.pointers().live_count(), 1);
    assert_eq!(tracker.totals().current_host, 4096);

    tracker.remove(0x55aa0000);
    assert_eq!(tracker.pointers().live_count(), 0);
    assert_eq!(tracker.totals().current_total, 0);
    assert_eq!(tracker.totals().peak_total, 4096);
}

#[test]
fn dma_lifecycle_via_fd() {
    let tracker = active_tracker(&[("TRACK_ALLOCS", "1"), ("BACKTRACE", "1")]);

    tracker.add_dma(7, 1 << 20);
    assert_eq!(tracker.totals().current_dma, 1 << 20);
    assert!(tracker.totals().peak_dma >= 1 << 20);
    assert_eq!(tracker.totals().current_host, 0);

    tracker.remove_dma(7);
    assert_eq!(tracker.totals().current_dma, 0);
}

#[test]
fn dedup_across_identical_sites() {
    let tracker = active_tracker(&[("TRACK_ALLOCS", "1"), ("BACKTRACE", "1")]);

    for i in 0..100 {
        tracker.add_host(0x100000 + i * 64, 2048);
    }

    let pointers = tracker.pointers();
    assert_eq!(pointers.frame_record_count(), 1);
    assert_eq!(pointers.frame_reference_total(), 100);
    assert_eq!(pointers.live_count(), 100);

    let mut buf = Vec::new();
    tracker.dump_to_writer(&mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();

    let entry_lines: Vec<&str> = text
        .lines()
        .filter(|l| l.starts_with("alloc_size:"))
        .collect();
    assert_eq!(entry_lines.len(), 1);
    assert!(entry_lines[0].contains("alloc_size:2.00KB"));
    assert!(entry_lines[0].contains("alloc_num:100"));
    assert!(text.contains("#0 1000 /opt/app/libwork.so (work::churn+17)"));
}

#[test]
fn refcounts_track_distinct_sites() {
    let source = Box::new(ScriptedStacks::new());
    let tracker = Tracker::with_source(
        config_from(&[("TRACK_ALLOCS", "1"), ("BACKTRACE", "1")]),
        source,
    );
    tracker.set_state(TrackerState::Active);

    tracker.add_host(0x1000, 64);
    tracker.add_host(0x2000, 64);
    assert_eq!(tracker.pointers().frame_record_count(), 1);
    assert_eq!(tracker.pointers().frame_reference_total(), 2);

    tracker.remove(0x1000);
    tracker.remove(0x2000);
    assert_eq!(tracker.pointers().frame_record_count(), 0);
}

#[test]
fn peak_snapshot_tracks_the_high_water_mark() {
    const KB: usize = 1024;
    let tracker = active_tracker(&[
        ("TRACK_ALLOCS", "1"),
        ("BACKTRACE", "1"),
        ("RECORD_MEMORY_PEAK", "1"),
        ("DUMP_PEAK_VALUE_MB", "1"),
        ("DUMP_PEAK_INCREMENT_BYTES", "1024"),
    ]);

    tracker.add_host(0xa000, 768 * KB);
    tracker.add_host(0xb000, 512 * KB);
    tracker.remove(0xa000);
    tracker.add_host(0xc000, 800 * KB);

    // Highest total observed: 512K + 800K = 1312K.
    let snapshot = tracker.pointers().peak_snapshot();
    let bytes: usize = snapshot.iter().map(|e| e.size * e.count).sum();
    assert_eq!(bytes, 1312 * KB);

    // Descend below the peak: the snapshot must not move.
    tracker.remove(0xc000);
    tracker.add_host(0xd000, 8 * KB);
    let bytes: usize = tracker
        .pointers()
        .peak_snapshot()
        .iter()
        .map(|e| e.size * e.count)
        .sum();
    assert_eq!(bytes, 1312 * KB);
}

#[test]
fn dump_file_totals_match_peaks() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let tracker = active_tracker(&[("TRACK_ALLOCS", "1"), ("BACKTRACE", "1")]);

    tracker.add_host(0x1000, 5 * 1024 * 1024);
    tracker.add_dma(4, 2 * 1024 * 1024);
    tracker.remove(0x1000);
    tracker.add_host(0x2000, 1024);

    let path = dir.path().join("dump.txt");
    tracker.dump_to(&path);

    let text = std::fs::read_to_string(&path)?;
    let totals = tracker.totals();
    let expected = format!(
        "host peak used: {}MB, dma peak used {}MB, total peak used: {}MB",
        totals.peak_host / (1024 * 1024),
        totals.peak_dma / (1024 * 1024),
        totals.peak_total / (1024 * 1024)
    );
    assert_eq!(text.lines().next().unwrap(), expected);
    assert_eq!(text.lines().nth(1).unwrap().len(), 89);

    // One block per live allocation, each with at least one frame line.
    assert_eq!(text.matches("alloc_size:").count(), 2);
    assert!(text.matches("#0 ").count() >= 2);
    Ok(())
}

#[test]
fn time_ordered_dump_when_peak_recording_is_off() {
    let tracker = active_tracker(&[("TRACK_ALLOCS", "1"), ("BACKTRACE", "1")]);

    tracker.add_host(0x1000, 64);
    std::thread::sleep(std::time::Duration::from_millis(5));
    tracker.add_host(0x2000, 8192);

    let mut buf = Vec::new();
    tracker.dump_to_writer(&mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();

    let sizes: Vec<&str> = text
        .lines()
        .filter(|l| l.starts_with("alloc_size:"))
        .collect();
    // Ascending allocation time, not descending size.
    assert!(sizes[0].contains("alloc_size:0.06KB"));
    assert!(sizes[1].contains("alloc_size:8.00KB"));
}

#[test]
fn distinct_sites_stay_separate_in_dumps() {
    let script = Arc::new(ScriptedStacks::new());
    let tracker = Tracker::with_source(
        config_from(&[("TRACK_ALLOCS", "1"), ("BACKTRACE", "1")]),
        Box::new(SharedStacks(Arc::clone(&script))),
    );
    tracker.set_state(TrackerState::Active);

    tracker.add_host(0x1000, 2048);
    tracker.add_host(0x2000, 2048);
    script.set_site(&[0x7000, 0x8000, 0x9000]);
    tracker.add_host(0x3000, 2048);

    assert_eq!(tracker.pointers().frame_record_count(), 2);

    let mut buf = Vec::new();
    tracker.dump_to_writer(&mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();
    // Same site and size coalesce; the second site stays its own block.
    assert_eq!(text.matches("alloc_num:2").count(), 1);
    assert_eq!(text.matches("alloc_num:1").count(), 1);
}
