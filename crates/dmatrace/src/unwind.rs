//! Backtrace source: bounded-depth stack capture plus frame resolution.
//!
//! Capture walks frame pointers rather than DWARF tables so that it
//! never allocates on the capture path; resolution goes through
//! `dladdr` and demangles with `rustc-demangle`. Both halves sit behind
//! the [`StackSource`] trait so the engine can be driven by synthetic
//! stacks in tests.

use std::ffi::CStr;

/// Hard ceiling on captured frames regardless of configuration.
pub const MAX_STACK_DEPTH: usize = 256;

/// Outcome of a capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindStatus {
    /// A usable stack was produced.
    Ok,
    /// Stack hit the depth limit; still usable.
    OkTruncated,
    /// The stack terminated in a known thread-exit symbol; the
    /// allocation must not be tracked at all.
    ExitFunc,
    /// No usable stack.
    Fail,
}

/// One resolved frame, ready for pretty-printing.
#[derive(Debug, Clone)]
pub struct FrameData {
    pub pc: usize,
    /// Program counter relative to the containing module's load base.
    pub rel_pc: usize,
    /// Path of the containing shared object, if the loader knows one.
    pub map_name: Option<String>,
    pub map_base: usize,
    /// Demangled symbol name, if any.
    pub symbol: Option<String>,
    pub symbol_offset: usize,
}

/// A captured stack: raw PCs for interning, resolved frames for dumps.
#[derive(Debug, Clone)]
pub struct Capture {
    pub status: UnwindStatus,
    pub pcs: Vec<usize>,
    pub frames: Vec<FrameData>,
}

impl Capture {
    pub fn failed() -> Self {
        Capture {
            status: UnwindStatus::Fail,
            pcs: Vec::new(),
            frames: Vec::new(),
        }
    }
}

pub trait StackSource: Send + Sync {
    fn capture(&self, max_frames: usize) -> Capture;
}

/// Frame-pointer unwinder.
///
/// `skip_frames` drops the innermost frames (the hook's own call path);
/// `exit_prefixes` is the deny-list of symbols that mark thread-exit
/// teardown, where the reentrancy TLS is already being destroyed.
pub struct FpUnwinder {
    skip_frames: usize,
    exit_prefixes: Vec<&'static str>,
}

/// glibc teardown paths that free TLS while still allocating.
const DEFAULT_EXIT_PREFIXES: &[&str] = &[
    "__call_tls_dtors",
    "__nptl_deallocate_tsd",
    "__GI___nptl_deallocate_tsd",
    "_dl_deallocate_tls",
];

impl Default for FpUnwinder {
    fn default() -> Self {
        FpUnwinder {
            skip_frames: 4,
            exit_prefixes: DEFAULT_EXIT_PREFIXES.to_vec(),
        }
    }
}

impl FpUnwinder {
    pub fn new(skip_frames: usize, exit_prefixes: Vec<&'static str>) -> Self {
        FpUnwinder {
            skip_frames,
            exit_prefixes,
        }
    }

    fn is_exit_symbol(&self, symbol: &str) -> bool {
        self.exit_prefixes.iter().any(|p| symbol.starts_with(p))
    }
}

impl StackSource for FpUnwinder {
    fn capture(&self, max_frames: usize) -> Capture {
        let limit = max_frames.min(MAX_STACK_DEPTH);
        let mut raw = [0usize; MAX_STACK_DEPTH];
        // Capture skip_frames extra so the skip never eats user frames.
        let want = (limit + self.skip_frames).min(MAX_STACK_DEPTH);
        let depth = capture_frame_pointers(&mut raw, want);

        if depth <= self.skip_frames {
            return Capture::failed();
        }

        let pcs: Vec<usize> = raw[self.skip_frames..depth].to_vec();
        let frames: Vec<FrameData> = pcs.iter().map(|&pc| resolve_frame(pc)).collect();

        for frame in &frames {
            if let Some(symbol) = &frame.symbol {
                if self.is_exit_symbol(symbol) {
                    return Capture {
                        status: UnwindStatus::ExitFunc,
                        pcs,
                        frames,
                    };
                }
            }
        }

        let status = classify_depth(pcs.len(), limit);
        Capture {
            status,
            pcs,
            frames,
        }
    }
}

/// Status for a successful capture of `depth` frames under `limit`.
fn classify_depth(depth: usize, limit: usize) -> UnwindStatus {
    if depth == 0 {
        UnwindStatus::Fail
    } else if depth >= limit {
        UnwindStatus::OkTruncated
    } else {
        UnwindStatus::Ok
    }
}

/// Walk saved frame pointers from the current frame outward.
///
/// Return addresses live at `[fp + 1]`, the caller's frame pointer at
/// `[fp]`. The walk stops on misaligned or implausible frame pointers
/// and on non-monotonic chains.
#[inline(never)]
fn capture_frame_pointers(stack: &mut [usize; MAX_STACK_DEPTH], max: usize) -> usize {
    let mut depth = 0usize;

    unsafe {
        let mut fp: *const usize = current_frame_pointer();

        while !fp.is_null() && depth < max {
            if (fp as usize) & 0x7 != 0 {
                break;
            }
            let fp_val = fp as usize;
            if !(0x1000..=0x7fff_ffff_ffff).contains(&fp_val) {
                break;
            }

            let ret_addr = *fp.add(1);
            if ret_addr == 0 {
                break;
            }

            stack[depth] = ret_addr;
            depth += 1;

            let next_fp = *fp as *const usize;
            if next_fp <= fp {
                break;
            }
            fp = next_fp;
        }
    }

    depth
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
unsafe fn current_frame_pointer() -> *const usize {
    let fp: *const usize;
    core::arch::asm!(
        "mov {}, rbp",
        out(reg) fp,
        options(nomem, nostack, preserves_flags)
    );
    fp
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn current_frame_pointer() -> *const usize {
    let fp: *const usize;
    core::arch::asm!(
        "mov {}, x29",
        out(reg) fp,
        options(nomem, nostack, preserves_flags)
    );
    fp
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
unsafe fn current_frame_pointer() -> *const usize {
    core::ptr::null()
}

/// Resolve one PC through the dynamic loader, falling back to the
/// maps snapshot for regions the loader does not know (JIT pages,
/// plain anonymous mappings).
pub fn resolve_frame(pc: usize) -> FrameData {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let found = unsafe { libc::dladdr(pc as *const libc::c_void, &mut info) };
    if found == 0 {
        if let Some(frame) = crate::maps::with_mapping(pc, |m| FrameData {
            pc,
            rel_pc: pc - m.start,
            map_name: m.pathname.clone(),
            map_base: m.start,
            symbol: None,
            symbol_offset: 0,
        }) {
            return frame;
        }
        return FrameData {
            pc,
            rel_pc: pc,
            map_name: None,
            map_base: 0,
            symbol: None,
            symbol_offset: 0,
        };
    }

    let map_base = info.dli_fbase as usize;
    let rel_pc = pc.wrapping_sub(map_base);

    let map_name = if info.dli_fname.is_null() {
        None
    } else {
        let name = unsafe { CStr::from_ptr(info.dli_fname) }
            .to_string_lossy()
            .into_owned();
        if name.is_empty() { None } else { Some(name) }
    };

    let (symbol, symbol_offset) = if info.dli_sname.is_null() {
        (None, 0)
    } else {
        let raw = unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy();
        let demangled = rustc_demangle::demangle(raw.as_ref()).to_string();
        let offset = pc.wrapping_sub(info.dli_saddr as usize);
        (Some(demangled), offset)
    };

    FrameData {
        pc,
        rel_pc,
        map_name,
        map_base,
        symbol,
        symbol_offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_depth_limits() {
        assert_eq!(classify_depth(0, 16), UnwindStatus::Fail);
        assert_eq!(classify_depth(4, 16), UnwindStatus::Ok);
        assert_eq!(classify_depth(16, 16), UnwindStatus::OkTruncated);
    }

    #[test]
    fn exit_prefix_match() {
        let unwinder = FpUnwinder::default();
        assert!(unwinder.is_exit_symbol("__call_tls_dtors"));
        assert!(unwinder.is_exit_symbol("__nptl_deallocate_tsd.cold"));
        assert!(!unwinder.is_exit_symbol("malloc"));
    }

    #[test]
    fn resolve_unmapped_pc_falls_back_to_raw() {
        // An address nothing is mapped at must still produce a frame,
        // with the PC doubling as the relative PC.
        let frame = resolve_frame(0x10);
        assert_eq!(frame.pc, 0x10);
        assert_eq!(frame.rel_pc, 0x10);
        assert!(frame.map_name.is_none());
        assert_eq!(frame.map_base, 0);
    }

    #[test]
    fn resolve_libc_symbol() {
        // getpid lives in libc; dladdr should at least find its module.
        let frame = resolve_frame(libc::getpid as usize);
        assert!(frame.map_name.is_some());
        assert!(frame.rel_pc <= frame.pc);
    }

    #[test]
    fn capture_does_not_crash() {
        let unwinder = FpUnwinder::new(0, Vec::new());
        // Depth and status depend on how the test binary was compiled;
        // the call itself must be safe regardless.
        let capture = unwinder.capture(32);
        assert!(capture.pcs.len() <= 32);
        assert_eq!(capture.pcs.len(), capture.frames.len());
    }
}
