//! Baseline allocator resolution.
//!
//! Every intercepted symbol is looked up once through the dynamic
//! linker's next-scope search and cached process-wide. The accessors
//! resolve lazily so they are safe before the library constructor has
//! run; a missing required symbol means the hook cannot function and
//! the process aborts.

use std::ffi::CStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{c_int, c_ulong, c_void, off_t};

static SYS_MALLOC: AtomicUsize = AtomicUsize::new(0);
static SYS_FREE: AtomicUsize = AtomicUsize::new(0);
static SYS_CALLOC: AtomicUsize = AtomicUsize::new(0);
static SYS_REALLOC: AtomicUsize = AtomicUsize::new(0);
static SYS_MEMALIGN: AtomicUsize = AtomicUsize::new(0);
static SYS_POSIX_MEMALIGN: AtomicUsize = AtomicUsize::new(0);
static SYS_IOCTL: AtomicUsize = AtomicUsize::new(0);
static SYS_CLOSE: AtomicUsize = AtomicUsize::new(0);

fn resolve(name: &CStr) -> usize {
    let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if addr.is_null() {
        // Nothing works without the baseline.
        unsafe { libc::abort() };
    }
    addr as usize
}

fn load(slot: &AtomicUsize, name: &CStr) -> usize {
    let cached = slot.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let addr = resolve(name);
    slot.store(addr, Ordering::Relaxed);
    addr
}

/// Resolve the whole table eagerly. Called from the constructor; the
/// lazy accessors cover any allocator call that arrives first.
pub fn init() {
    load(&SYS_MALLOC, c"malloc");
    load(&SYS_FREE, c"free");
    load(&SYS_CALLOC, c"calloc");
    load(&SYS_REALLOC, c"realloc");
    load(&SYS_MEMALIGN, c"memalign");
    load(&SYS_POSIX_MEMALIGN, c"posix_memalign");
    load(&SYS_IOCTL, c"ioctl");
    load(&SYS_CLOSE, c"close");
}

pub fn malloc(size: usize) -> *mut c_void {
    let f: unsafe extern "C" fn(usize) -> *mut c_void =
        unsafe { std::mem::transmute(load(&SYS_MALLOC, c"malloc")) };
    unsafe { f(size) }
}

pub fn free(ptr: *mut c_void) {
    let f: unsafe extern "C" fn(*mut c_void) =
        unsafe { std::mem::transmute(load(&SYS_FREE, c"free")) };
    unsafe { f(ptr) }
}

pub fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let f: unsafe extern "C" fn(usize, usize) -> *mut c_void =
        unsafe { std::mem::transmute(load(&SYS_CALLOC, c"calloc")) };
    unsafe { f(nmemb, size) }
}

pub fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let f: unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void =
        unsafe { std::mem::transmute(load(&SYS_REALLOC, c"realloc")) };
    unsafe { f(ptr, size) }
}

pub fn memalign(alignment: usize, size: usize) -> *mut c_void {
    let f: unsafe extern "C" fn(usize, usize) -> *mut c_void =
        unsafe { std::mem::transmute(load(&SYS_MEMALIGN, c"memalign")) };
    unsafe { f(alignment, size) }
}

pub fn posix_memalign(memptr: *mut *mut c_void, alignment: usize, size: usize) -> c_int {
    let f: unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> c_int =
        unsafe { std::mem::transmute(load(&SYS_POSIX_MEMALIGN, c"posix_memalign")) };
    unsafe { f(memptr, alignment, size) }
}

pub fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    let f: unsafe extern "C" fn(c_int, c_ulong, *mut c_void) -> c_int =
        unsafe { std::mem::transmute(load(&SYS_IOCTL, c"ioctl")) };
    unsafe { f(fd, request, arg) }
}

pub fn close(fd: c_int) -> c_int {
    let f: unsafe extern "C" fn(c_int) -> c_int =
        unsafe { std::mem::transmute(load(&SYS_CLOSE, c"close")) };
    unsafe { f(fd) }
}

/// mmap goes through the raw syscall so the baseline never re-enters
/// another interposer in the chain.
pub fn mmap(
    addr: *mut c_void,
    len: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    unsafe {
        libc::syscall(
            libc::SYS_mmap,
            addr as usize as libc::c_long,
            len as libc::c_long,
            prot as libc::c_long,
            flags as libc::c_long,
            fd as libc::c_long,
            offset as libc::c_long,
        ) as *mut c_void
    }
}

pub fn munmap(addr: *mut c_void, len: usize) -> c_int {
    unsafe {
        libc::syscall(
            libc::SYS_munmap,
            addr as usize as libc::c_long,
            len as libc::c_long,
        ) as c_int
    }
}

/// errno is thread-local; setting it must go through libc.
pub fn set_errno(value: c_int) {
    unsafe {
        *libc::__errno_location() = value;
    }
}

pub fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}
