//! Init-phase gate and the pre-`main` page allocator.
//!
//! Before the library constructor finishes, the baseline resolver
//! cache is incomplete and routing allocations through libc would
//! re-enter the hook. During that window every allocator request is
//! served by one anonymous mapping per request, page-aligned, recorded
//! in a fixed table so the matching `free`/`munmap` — which may arrive
//! long after the gate flips — can recognize and release the block.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use libc::c_void;

use crate::sys;

/// True from load until the constructor has made the tracker safe.
static PRE_MAIN: AtomicBool = AtomicBool::new(true);

pub fn pre_main() -> bool {
    PRE_MAIN.load(Ordering::Acquire)
}

pub fn leave_pre_main() {
    PRE_MAIN.store(false, Ordering::Release);
}

pub const PAGE_SIZE: usize = 4096;

/// Round up to whole pages; zero-size requests still get one page.
pub fn page_align(size: usize) -> usize {
    let size = size.max(1);
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

const ARENA_SLOTS: usize = 1024;

/// Sentinel for a slot claimed but not yet populated.
const CLAIMED: usize = usize::MAX;

static SLOT_ADDR: [AtomicUsize; ARENA_SLOTS] = [const { AtomicUsize::new(0) }; ARENA_SLOTS];
static SLOT_LEN: [AtomicUsize; ARENA_SLOTS] = [const { AtomicUsize::new(0) }; ARENA_SLOTS];

/// Serve one request from a fresh anonymous mapping. Returns null when
/// the mapping fails or the record table is exhausted — handing out an
/// unrecorded block would later feed a mapped page to the baseline
/// `free`.
pub fn alloc(size: usize) -> *mut c_void {
    let len = page_align(size);

    let mut slot = None;
    for (i, addr) in SLOT_ADDR.iter().enumerate() {
        if addr
            .compare_exchange(0, CLAIMED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            slot = Some(i);
            break;
        }
    }
    let Some(slot) = slot else {
        return std::ptr::null_mut();
    };

    let ptr = sys::mmap(
        std::ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        SLOT_ADDR[slot].store(0, Ordering::Release);
        return std::ptr::null_mut();
    }

    SLOT_LEN[slot].store(len, Ordering::Relaxed);
    SLOT_ADDR[slot].store(ptr as usize, Ordering::Release);
    ptr
}

/// Usable length of an arena block, if `ptr` is one.
pub fn lookup(ptr: *mut c_void) -> Option<usize> {
    let addr = ptr as usize;
    if addr == 0 {
        return None;
    }
    for (i, slot) in SLOT_ADDR.iter().enumerate() {
        if slot.load(Ordering::Acquire) == addr {
            return Some(SLOT_LEN[i].load(Ordering::Relaxed));
        }
    }
    None
}

/// Release an arena block. Returns false when `ptr` was not served by
/// the arena (the caller then owns routing it to the baseline).
pub fn release(ptr: *mut c_void) -> bool {
    let addr = ptr as usize;
    if addr == 0 {
        return false;
    }
    for (i, slot) in SLOT_ADDR.iter().enumerate() {
        if slot
            .compare_exchange(addr, CLAIMED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let len = SLOT_LEN[i].load(Ordering::Relaxed);
            sys::munmap(ptr, len);
            SLOT_LEN[i].store(0, Ordering::Relaxed);
            SLOT_ADDR[i].store(0, Ordering::Release);
            return true;
        }
    }
    false
}

/// Pre-`main` realloc: fresh block, copy the smaller extent, release.
pub fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() {
        return alloc(size);
    }
    let Some(old_len) = lookup(ptr) else {
        return std::ptr::null_mut();
    };
    let fresh = alloc(size);
    if !fresh.is_null() {
        unsafe {
            std::ptr::copy_nonoverlapping(ptr as *const u8, fresh as *mut u8, old_len.min(size));
        }
    }
    release(ptr);
    fresh
}

/// Pre-`main` memalign. Mappings are page-aligned already; stricter
/// alignment than a page is not served during init.
pub fn alloc_aligned(alignment: usize, size: usize) -> *mut c_void {
    if alignment > PAGE_SIZE {
        return std::ptr::null_mut();
    }
    alloc(size)
}
