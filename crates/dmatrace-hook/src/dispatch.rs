//! Signal-driven and exit-time dump dispatch.
//!
//! The signal handler itself only raises a flag; a helper thread polls
//! it and performs the dump under the concurrent-ops read lock, so no
//! async-signal-unsafe work ever runs in handler context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dmatrace::{Options, Tracker, TrackerState};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::guard;

static DUMP_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn note_dump_request(_signal: libc::c_int) {
    DUMP_PENDING.store(true, Ordering::Relaxed);
}

/// Install the configured dump signal and start the helper thread.
pub fn install(tracker: &'static Tracker) {
    if !tracker.config().options().contains(Options::DUMP_ON_SIGNAL) {
        return;
    }

    let signal = match Signal::try_from(tracker.config().dump_signal()) {
        Ok(signal) => signal,
        Err(e) => {
            log::warn!(
                "cannot use signal {} for dumps: {e}",
                tracker.config().dump_signal()
            );
            return;
        }
    };

    let action = SigAction::new(
        SigHandler::Handler(note_dump_request),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    if let Err(e) = unsafe { sigaction(signal, &action) } {
        log::warn!("cannot install dump handler for {signal:?}: {e}");
        return;
    }

    if let Err(e) = std::thread::Builder::new()
        .name("dmatrace-dump".into())
        .spawn(move || poll_dump_requests(tracker))
    {
        log::warn!("cannot start dump helper thread: {e}");
    }
}

fn poll_dump_requests(tracker: &'static Tracker) {
    loop {
        std::thread::sleep(Duration::from_millis(100));
        if tracker.state() >= TrackerState::Draining {
            return;
        }
        if DUMP_PENDING.swap(false, Ordering::Relaxed) {
            let _ops = guard::concurrent_read();
            let _mark = guard::ScopedRecursion::enter();
            tracker.dump_to(&tracker.signal_dump_path());
        }
    }
}

/// Exit path: block all in-flight interceptors, dump if configured,
/// freeze. The tracker and the write lock are deliberately leaked —
/// threads may still be tearing down, and their allocator calls must
/// keep hitting a live (if frozen) hook.
pub fn finalize(tracker: &'static Tracker) {
    // Our own dump allocations must stay invisible, and must bypass
    // the ops lock this thread is about to hold exclusively.
    let _mark = guard::ScopedRecursion::enter();
    let write_guard = guard::block_all_operations();

    tracker.set_state(TrackerState::Draining);
    if tracker.config().options().contains(Options::DUMP_ON_EXIT) {
        tracker.dump_to(&tracker.exit_dump_path());
    }
    if tracker.config().options().contains(Options::TRACK_ALLOCS) {
        tracker.log_peak_info();
    }
    tracker.set_state(TrackerState::Frozen);

    std::mem::forget(write_guard);
}
