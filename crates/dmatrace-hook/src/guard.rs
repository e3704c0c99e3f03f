//! Reentrancy guard and the process-wide concurrent-operations lock.
//!
//! The per-thread depth counter lives behind a raw `pthread_key` whose
//! slot is allocated with the baseline `malloc` and released by a key
//! destructor that calls the baseline `free` directly. Rust
//! `thread_local!` is off limits here: its lazy initialization
//! allocates through the very symbols this library intercepts, and its
//! destructors run on teardown paths where the tracker must already be
//! invisible.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use libc::c_void;

use crate::sys;

static TLS_KEY: AtomicUsize = AtomicUsize::new(0);
static TLS_KEY_READY: AtomicBool = AtomicBool::new(false);

/// Key destructor: free the depth slot without waking the tracker.
extern "C" fn drop_slot(ptr: *mut c_void) {
    if !ptr.is_null() {
        sys::free(ptr);
    }
}

/// Create the TLS key. Called once from the library constructor; until
/// then every interceptor bypasses to the baseline.
pub fn init() {
    let mut key: libc::pthread_key_t = 0;
    if unsafe { libc::pthread_key_create(&mut key, Some(drop_slot)) } != 0 {
        return;
    }
    TLS_KEY.store(key as usize, Ordering::Release);
    TLS_KEY_READY.store(true, Ordering::Release);
}

fn depth_slot() -> Option<*mut usize> {
    if !TLS_KEY_READY.load(Ordering::Acquire) {
        return None;
    }
    let key = TLS_KEY.load(Ordering::Relaxed) as libc::pthread_key_t;

    let existing = unsafe { libc::pthread_getspecific(key) };
    if !existing.is_null() {
        return Some(existing as *mut usize);
    }

    let slot = sys::malloc(std::mem::size_of::<usize>()) as *mut usize;
    if slot.is_null() {
        return None;
    }
    unsafe {
        *slot = 0;
        if libc::pthread_setspecific(key, slot as *mut c_void) != 0 {
            sys::free(slot as *mut c_void);
            return None;
        }
    }
    Some(slot)
}

/// Scoped reentrancy marker.
///
/// `enter` returns `None` when the current thread is already inside an
/// interceptor (or the TLS is unusable), in which case the caller must
/// defer to the baseline without touching the tracker.
pub struct ScopedRecursion {
    slot: *mut usize,
}

impl ScopedRecursion {
    pub fn enter() -> Option<ScopedRecursion> {
        let slot = depth_slot()?;
        unsafe {
            if *slot > 0 {
                return None;
            }
            *slot += 1;
        }
        Some(ScopedRecursion { slot })
    }
}

impl Drop for ScopedRecursion {
    fn drop(&mut self) {
        unsafe {
            *self.slot -= 1;
        }
    }
}

/// Outermost lock: every interceptor read-holds it across its body;
/// teardown takes it for write and never gives it back.
static OPS_LOCK: RwLock<()> = RwLock::new(());

pub fn concurrent_read() -> RwLockReadGuard<'static, ()> {
    OPS_LOCK.read().unwrap_or_else(|e| e.into_inner())
}

pub fn block_all_operations() -> RwLockWriteGuard<'static, ()> {
    OPS_LOCK.write().unwrap_or_else(|e| e.into_inner())
}
