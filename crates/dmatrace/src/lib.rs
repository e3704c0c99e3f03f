//! Allocation-tracking engine for the dmatrace heap profiler.
//!
//! The engine is deliberately independent of symbol interposition: it
//! receives allocation and deallocation events from the hook layer (or
//! from tests), interns call-site backtraces, maintains the live set and
//! peak accounting, and serializes dumps. The companion `dmatrace-hook`
//! cdylib owns the exported libc symbols and feeds this crate.

pub mod config;
pub mod dump;
pub mod error;
pub mod intern;
pub mod live;
pub mod maps;
pub mod tracker;
pub mod unwind;

pub use config::{Config, Options};
pub use error::{Error, Result};
pub use live::MemoryClass;
pub use tracker::{Tracker, TrackerState};
pub use unwind::{Capture, FpUnwinder, FrameData, StackSource, UnwindStatus};
