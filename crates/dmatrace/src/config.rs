//! Startup configuration, parsed once from the environment.
//!
//! Option variables are presence-tested (setting `TRACK_ALLOCS` to any
//! value raises the bit); numeric variables that fail to parse log a
//! diagnostic and disable the option they feed, so a typo can never
//! keep the library from loading.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Options: u64 {
        /// Record backtraces for tracked allocations.
        const BACKTRACE = 1 << 1;
        /// Maintain the live-pointer table at all.
        const TRACK_ALLOCS = 1 << 2;
        /// Only unwind allocations inside the [min, max] size band.
        const BACKTRACE_SPECIFIC_SIZES = 1 << 3;
        /// Snapshot the live set whenever a new global peak is reached.
        const RECORD_MEMORY_PEAK = 1 << 7;
        /// Install the dump signal handler.
        const DUMP_ON_SIGNAL = 1 << 11;
        /// Write a dump from the process-exit path.
        const DUMP_ON_EXIT = 1 << 12;
        /// Probe /proc/self/fdinfo to classify file-backed mmaps as DMA.
        const DMA_PROBE = 1 << 13;
    }
}

const DEFAULT_BACKTRACE_FRAMES: usize = 128;
const DEFAULT_DUMP_PREFIX: &str = "/tmp/dmatrace_heap";

#[derive(Debug, Clone)]
pub struct Config {
    options: Options,
    backtrace_frames: usize,
    backtrace_min_size_bytes: usize,
    backtrace_max_size_bytes: usize,
    dump_peak_value_bytes: usize,
    dump_peak_increment_bytes: usize,
    dump_signal: i32,
    dump_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            options: Options::DMA_PROBE,
            backtrace_frames: DEFAULT_BACKTRACE_FRAMES,
            backtrace_min_size_bytes: 0,
            backtrace_max_size_bytes: usize::MAX,
            dump_peak_value_bytes: 0,
            dump_peak_increment_bytes: 0,
            dump_signal: libc::SIGUSR1,
            dump_prefix: DEFAULT_DUMP_PREFIX.to_string(),
        }
    }
}

impl Config {
    /// Parse from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    /// Parse from an arbitrary variable source. Tests inject closures
    /// here instead of mutating the process environment.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let mut config = Config::default();

        for (var, option) in [
            ("TRACK_ALLOCS", Options::TRACK_ALLOCS),
            ("BACKTRACE", Options::BACKTRACE),
            ("BACKTRACE_SPECIFIC_SIZES", Options::BACKTRACE_SPECIFIC_SIZES),
            ("RECORD_MEMORY_PEAK", Options::RECORD_MEMORY_PEAK),
            ("DUMP_ON_SIGNAL", Options::DUMP_ON_SIGNAL),
            ("DUMP_ON_EXIT", Options::DUMP_ON_EXIT),
        ] {
            if lookup(var).is_some() {
                config.options |= option;
            }
        }
        if lookup("BACKTRACE_DMA_PROBE").is_some_and(|v| v == "0") {
            config.options.remove(Options::DMA_PROBE);
        }

        if let Some(frames) =
            numeric(lookup, "BACKTRACE_FRAMES", &mut config.options, Options::BACKTRACE)
        {
            if frames == 0 {
                invalid("BACKTRACE_FRAMES", "0", &mut config.options, Options::BACKTRACE);
            } else {
                config.backtrace_frames = frames;
            }
        }

        if let Some(min) = numeric(
            lookup,
            "BACKTRACE_MIN_SIZE_BYTES",
            &mut config.options,
            Options::BACKTRACE_SPECIFIC_SIZES,
        ) {
            config.backtrace_min_size_bytes = min;
        }
        if let Some(max) = numeric(
            lookup,
            "BACKTRACE_MAX_SIZE_BYTES",
            &mut config.options,
            Options::BACKTRACE_SPECIFIC_SIZES,
        ) {
            config.backtrace_max_size_bytes = max;
        }
        if config.backtrace_min_size_bytes > config.backtrace_max_size_bytes {
            log::warn!(
                "BACKTRACE_MIN_SIZE_BYTES {} exceeds BACKTRACE_MAX_SIZE_BYTES {}, size filter disabled",
                config.backtrace_min_size_bytes,
                config.backtrace_max_size_bytes
            );
            config.options.remove(Options::BACKTRACE_SPECIFIC_SIZES);
        }

        if let Some(mb) = numeric(
            lookup,
            "DUMP_PEAK_VALUE_MB",
            &mut config.options,
            Options::RECORD_MEMORY_PEAK,
        ) {
            config.dump_peak_value_bytes = mb.saturating_mul(1024 * 1024);
        }
        if let Some(bytes) = numeric(
            lookup,
            "DUMP_PEAK_INCREMENT_BYTES",
            &mut config.options,
            Options::RECORD_MEMORY_PEAK,
        ) {
            config.dump_peak_increment_bytes = bytes;
        }

        if let Some(raw) = lookup("BACKTRACE_DUMP_SIGNAL") {
            match raw.trim().parse::<i32>() {
                Ok(sig) if sig > 0 => config.dump_signal = sig,
                _ => invalid("BACKTRACE_DUMP_SIGNAL", &raw, &mut config.options, Options::DUMP_ON_SIGNAL),
            }
        }

        if let Some(prefix) = lookup("BACKTRACE_DUMP_PREFIX") {
            if !prefix.is_empty() {
                config.dump_prefix = prefix;
            }
        }

        config
    }

    pub fn options(&self) -> Options {
        self.options
    }

    pub fn backtrace_frames(&self) -> usize {
        self.backtrace_frames
    }

    pub fn backtrace_min_size_bytes(&self) -> usize {
        self.backtrace_min_size_bytes
    }

    pub fn backtrace_max_size_bytes(&self) -> usize {
        self.backtrace_max_size_bytes
    }

    pub fn dump_peak_value_bytes(&self) -> usize {
        self.dump_peak_value_bytes
    }

    pub fn dump_peak_increment_bytes(&self) -> usize {
        self.dump_peak_increment_bytes
    }

    pub fn dump_signal(&self) -> i32 {
        self.dump_signal
    }

    pub fn dump_prefix(&self) -> &str {
        &self.dump_prefix
    }

    /// Size filter applied before unwinding.
    pub fn should_backtrace_size(&self, size_bytes: usize) -> bool {
        if !self.options.contains(Options::BACKTRACE_SPECIFIC_SIZES) {
            return true;
        }
        size_bytes >= self.backtrace_min_size_bytes && size_bytes <= self.backtrace_max_size_bytes
    }

    #[cfg(test)]
    pub(crate) fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }
}

fn numeric(
    lookup: &dyn Fn(&str) -> Option<String>,
    var: &'static str,
    options: &mut Options,
    associated: Options,
) -> Option<usize> {
    let raw = lookup(var)?;
    match raw.trim().parse::<usize>() {
        Ok(value) => Some(value),
        Err(_) => {
            invalid(var, &raw, options, associated);
            None
        }
    }
}

fn invalid(var: &'static str, raw: &str, options: &mut Options, associated: Options) {
    let err = crate::Error::ConfigInvalid {
        var,
        value: raw.to_string(),
    };
    log::warn!("{err}; disabling {associated:?}");
    options.remove(associated);
}
