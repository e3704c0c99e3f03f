//! LD_PRELOAD interposition layer for the dmatrace heap profiler.
//!
//! This cdylib exports the libc allocator symbols (plus `mmap`/`munmap`
//! and the DMA-heap `ioctl`/`close` pair) and forwards tracked events
//! to the [`dmatrace`] engine. Every interceptor has the same shape:
//! bypass checks, reentrancy marker, concurrent-ops read lock, size
//! validation, baseline call, bookkeeping.
//!
//! ```sh
//! TRACK_ALLOCS=1 BACKTRACE=1 DUMP_ON_EXIT=1 \
//!     LD_PRELOAD=libdmatrace_hook.so ./app
//! ```

mod boot;
mod dispatch;
mod dma;
mod guard;
mod sys;

use std::ffi::{CStr, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicPtr, Ordering};

use libc::{c_char, c_int, c_ulong, c_void, off_t};

use dmatrace::live::MAX_TRACKED_SIZE;
use dmatrace::{Config, Options, Tracker, TrackerState};

static TRACKER: AtomicPtr<Tracker> = AtomicPtr::new(std::ptr::null_mut());

fn tracker() -> Option<&'static Tracker> {
    let ptr = TRACKER.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        unsafe { Some(&*ptr) }
    }
}

// Run as a library constructor, after the loader has our dependencies
// in place but before user main.
#[used]
#[link_section = ".init_array"]
static DMATRACE_CTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn dmatrace_ctor() {
        initialize();
    }
    dmatrace_ctor
};

fn initialize() {
    // Baseline and TLS first: until these exist nothing else is safe,
    // and the pre-main arena keeps serving in the meantime.
    sys::init();
    guard::init();
    boot::leave_pre_main();

    // Everything below allocates; keep it invisible to the tracker.
    let _mark = guard::ScopedRecursion::enter();

    let _ = env_logger::try_init();

    let config = Config::from_env();
    let tracker_ref: &'static Tracker = Box::leak(Box::new(Tracker::new(config)));
    tracker_ref.set_state(TrackerState::PreMain);
    TRACKER.store(
        tracker_ref as *const Tracker as *mut Tracker,
        Ordering::Release,
    );

    dispatch::install(tracker_ref);
    unsafe {
        libc::atexit(finalize_handler);
    }

    tracker_ref.set_state(TrackerState::Active);
    log::debug!(
        "dmatrace loaded, options {:?}",
        tracker_ref.config().options()
    );
}

extern "C" fn finalize_handler() {
    if let Some(tracker) = tracker() {
        dispatch::finalize(tracker);
    }
}

#[no_mangle]
pub extern "C" fn malloc(size: usize) -> *mut c_void {
    if boot::pre_main() {
        return boot::alloc(size);
    }
    let Some(_mark) = guard::ScopedRecursion::enter() else {
        return sys::malloc(size);
    };
    let _ops = guard::concurrent_read();
    debug_malloc(size)
}

fn debug_malloc(size: usize) -> *mut c_void {
    if size > MAX_TRACKED_SIZE {
        sys::set_errno(libc::ENOMEM);
        return std::ptr::null_mut();
    }
    let ptr = sys::malloc(size);
    if !ptr.is_null() {
        if let Some(tracker) = tracker() {
            tracker.add_host(ptr as usize, size);
        }
    }
    ptr
}

#[no_mangle]
pub extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    // Arena blocks from the init phase may be freed at any time.
    if boot::release(ptr) {
        return;
    }
    if boot::pre_main() {
        return sys::free(ptr);
    }
    let Some(_mark) = guard::ScopedRecursion::enter() else {
        return sys::free(ptr);
    };
    let _ops = guard::concurrent_read();
    if let Some(tracker) = tracker() {
        tracker.remove(ptr as usize);
    }
    sys::free(ptr);
}

#[no_mangle]
pub extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        sys::set_errno(libc::ENOMEM);
        return std::ptr::null_mut();
    };
    if boot::pre_main() {
        // The fresh mapping is already zero-filled.
        return boot::alloc(total);
    }
    let Some(_mark) = guard::ScopedRecursion::enter() else {
        return sys::calloc(nmemb, size);
    };
    let _ops = guard::concurrent_read();

    if total > MAX_TRACKED_SIZE {
        sys::set_errno(libc::ENOMEM);
        return std::ptr::null_mut();
    }
    let ptr = sys::calloc(1, total);
    if !ptr.is_null() {
        if let Some(tracker) = tracker() {
            tracker.add_host(ptr as usize, total);
        }
    }
    ptr
}

#[no_mangle]
pub extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if boot::pre_main() {
        return boot::realloc(ptr, size);
    }
    let Some(_mark) = guard::ScopedRecursion::enter() else {
        return sys::realloc(ptr, size);
    };
    let _ops = guard::concurrent_read();
    debug_realloc(ptr, size)
}

fn debug_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() {
        return debug_malloc(size);
    }
    if size == 0 {
        if boot::release(ptr) {
            return std::ptr::null_mut();
        }
        if let Some(tracker) = tracker() {
            tracker.remove(ptr as usize);
        }
        sys::free(ptr);
        return std::ptr::null_mut();
    }
    if size > MAX_TRACKED_SIZE {
        sys::set_errno(libc::ENOMEM);
        return std::ptr::null_mut();
    }

    // Blocks served by the init-phase arena cannot meet the baseline
    // realloc; migrate them onto the tracked heap.
    if let Some(old_len) = boot::lookup(ptr) {
        let fresh = debug_malloc(size);
        if !fresh.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    ptr as *const u8,
                    fresh as *mut u8,
                    old_len.min(size),
                );
            }
            boot::release(ptr);
        }
        return fresh;
    }

    if let Some(tracker) = tracker() {
        tracker.remove(ptr as usize);
    }
    let fresh = sys::realloc(ptr, size);
    if !fresh.is_null() {
        if let Some(tracker) = tracker() {
            tracker.add_host(fresh as usize, size);
        }
    }
    fresh
}

#[no_mangle]
pub extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    if boot::pre_main() {
        return boot::alloc_aligned(alignment, size);
    }
    let Some(_mark) = guard::ScopedRecursion::enter() else {
        return sys::memalign(alignment, size);
    };
    let _ops = guard::concurrent_read();
    debug_memalign(alignment, size)
}

fn debug_memalign(alignment: usize, size: usize) -> *mut c_void {
    if size > MAX_TRACKED_SIZE {
        sys::set_errno(libc::ENOMEM);
        return std::ptr::null_mut();
    }
    let ptr = sys::memalign(alignment, size);
    if !ptr.is_null() {
        if let Some(tracker) = tracker() {
            tracker.add_host(ptr as usize, size);
        }
    }
    ptr
}

#[no_mangle]
pub extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if boot::pre_main() {
        let ptr = boot::alloc_aligned(alignment, size);
        if ptr.is_null() {
            return libc::ENOMEM;
        }
        unsafe { *memptr = ptr };
        return 0;
    }
    let Some(_mark) = guard::ScopedRecursion::enter() else {
        return sys::posix_memalign(memptr, alignment, size);
    };
    let _ops = guard::concurrent_read();

    if alignment < std::mem::size_of::<*const c_void>() || !alignment.is_power_of_two() {
        return libc::EINVAL;
    }
    // posix_memalign reports failure through its return value only.
    let saved_errno = sys::errno();
    let ptr = debug_memalign(alignment, size);
    sys::set_errno(saved_errno);
    if ptr.is_null() {
        return libc::ENOMEM;
    }
    unsafe { *memptr = ptr };
    0
}

#[no_mangle]
pub extern "C" fn mmap(
    addr: *mut c_void,
    len: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    // Fixed-address requests are the caller's business; pass through.
    if boot::pre_main() || !addr.is_null() {
        return sys::mmap(addr, len, prot, flags, fd, offset);
    }
    let Some(_mark) = guard::ScopedRecursion::enter() else {
        return sys::mmap(addr, len, prot, flags, fd, offset);
    };
    let _ops = guard::concurrent_read();

    if len > MAX_TRACKED_SIZE {
        sys::set_errno(libc::ENOMEM);
        return libc::MAP_FAILED;
    }
    let result = sys::mmap(addr, len, prot, flags, fd, offset);
    if result != libc::MAP_FAILED {
        if let Some(tracker) = tracker() {
            if fd < 0 {
                tracker.add_mmap(result as usize, len);
            } else if tracker.config().options().contains(Options::DMA_PROBE)
                && dma::is_untracked_dma_heap_fd(fd)
            {
                tracker.add_dma(result as usize, len);
            }
        }
    }
    result
}

#[no_mangle]
pub extern "C" fn munmap(addr: *mut c_void, len: usize) -> c_int {
    if boot::release(addr) {
        return 0;
    }
    if boot::pre_main() {
        return sys::munmap(addr, len);
    }
    let Some(_mark) = guard::ScopedRecursion::enter() else {
        return sys::munmap(addr, len);
    };
    let _ops = guard::concurrent_read();
    if let Some(tracker) = tracker() {
        tracker.remove(addr as usize);
    }
    sys::munmap(addr, len)
}

#[no_mangle]
pub extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if boot::pre_main() {
        return sys::ioctl(fd, request, arg);
    }
    let Some(_mark) = guard::ScopedRecursion::enter() else {
        return sys::ioctl(fd, request, arg);
    };
    let _ops = guard::concurrent_read();

    let ret = sys::ioctl(fd, request, arg);
    if request == dma::DMA_HEAP_IOCTL_ALLOC && ret == 0 && !arg.is_null() {
        if let Some(tracker) = tracker() {
            let data = unsafe { &*(arg as *const dma::DmaHeapAllocationData) };
            tracker.add_dma(data.fd as usize, data.len as usize);
        }
    }
    ret
}

#[no_mangle]
pub extern "C" fn close(fd: c_int) -> c_int {
    if boot::pre_main() {
        return sys::close(fd);
    }
    let Some(_mark) = guard::ScopedRecursion::enter() else {
        return sys::close(fd);
    };
    let _ops = guard::concurrent_read();
    if let Some(tracker) = tracker() {
        tracker.remove_dma(fd as usize);
    }
    sys::close(fd)
}

/// Programmatic checkpoint: write a dump to `path` right now.
#[no_mangle]
pub extern "C" fn checkpoint(path: *const c_char) {
    if path.is_null() {
        return;
    }
    let Some(_mark) = guard::ScopedRecursion::enter() else {
        return;
    };
    let _ops = guard::concurrent_read();
    let Some(tracker) = tracker() else {
        return;
    };
    let bytes = unsafe { CStr::from_ptr(path) }.to_bytes();
    tracker.dump_to(Path::new(OsStr::from_bytes(bytes)));
}
