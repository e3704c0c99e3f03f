//! /proc/self/maps snapshot for frames the dynamic loader cannot
//! attribute (JIT pages and plain anonymous regions).

use std::fs;
use std::sync::Mutex;

/// A parsed memory mapping from /proc/self/maps.
#[derive(Debug, Clone)]
pub struct MemoryMapping {
    pub start: usize,
    pub end: usize,
    pub perms: String,
    pub offset: usize,
    pub pathname: Option<String>,
}

impl MemoryMapping {
    pub fn is_executable(&self) -> bool {
        self.perms.contains('x')
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Collection of the process's memory mappings.
pub struct MemoryMaps {
    mappings: Vec<MemoryMapping>,
}

impl MemoryMaps {
    pub fn snapshot() -> std::io::Result<Self> {
        let content = fs::read_to_string("/proc/self/maps")?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mappings = content.lines().filter_map(Self::parse_line).collect();
        MemoryMaps { mappings }
    }

    fn parse_line(line: &str) -> Option<MemoryMapping> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            return None;
        }

        // Address range "start-end"
        let addr_parts: Vec<&str> = parts[0].split('-').collect();
        if addr_parts.len() != 2 {
            return None;
        }

        let start = usize::from_str_radix(addr_parts[0], 16).ok()?;
        let end = usize::from_str_radix(addr_parts[1], 16).ok()?;
        let perms = parts[1].to_string();
        let offset = usize::from_str_radix(parts[2], 16).ok()?;

        // Pathname is the last field (if present)
        let pathname = if parts.len() >= 6 {
            Some(parts[5..].join(" "))
        } else {
            None
        };

        Some(MemoryMapping {
            start,
            end,
            perms,
            offset,
            pathname,
        })
    }

    pub fn find(&self, addr: usize) -> Option<&MemoryMapping> {
        self.mappings.iter().find(|m| m.contains(addr))
    }
}

static PROCESS_MAPS: Mutex<Option<MemoryMaps>> = Mutex::new(None);

/// Look up `addr` in a lazily captured snapshot of this process's maps.
pub fn with_mapping<T>(addr: usize, f: impl FnOnce(&MemoryMapping) -> T) -> Option<T> {
    let mut cached = PROCESS_MAPS.lock().unwrap_or_else(|e| e.into_inner());
    if cached.is_none() {
        *cached = MemoryMaps::snapshot().ok();
    }
    cached.as_ref()?.find(addr).map(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
55c3a0000000-55c3a0021000 r--p 00000000 103:02 1835286 /usr/bin/someapp
55c3a0021000-55c3a0042000 r-xp 00021000 103:02 1835286 /usr/bin/someapp
7f10c0000000-7f10c0800000 rw-p 00000000 00:00 0
7f10c1000000-7f10c1004000 rwxp 00000000 00:00 0 [anon:jit-cache]
ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0 [vsyscall]";

    #[test]
    fn parses_named_and_anonymous_lines() {
        let maps = MemoryMaps::parse(SAMPLE);
        let text = maps.find(0x55c3a0021100).unwrap();
        assert_eq!(text.pathname.as_deref(), Some("/usr/bin/someapp"));
        assert!(text.is_executable());
        assert_eq!(text.offset, 0x21000);

        let anon = maps.find(0x7f10c0000000).unwrap();
        assert!(anon.pathname.is_none());
        assert!(!anon.is_executable());
    }

    #[test]
    fn anon_tag_counts_as_a_name() {
        let maps = MemoryMaps::parse(SAMPLE);
        let jit = maps.find(0x7f10c1000010).unwrap();
        assert_eq!(jit.pathname.as_deref(), Some("[anon:jit-cache]"));
    }

    #[test]
    fn unmapped_addresses_miss() {
        let maps = MemoryMaps::parse(SAMPLE);
        assert!(maps.find(0x1000).is_none());
    }

    #[test]
    fn live_snapshot_sees_our_own_code() {
        let maps = MemoryMaps::snapshot().unwrap();
        let here = parses_named_and_anonymous_lines as usize;
        let mapping = maps.find(here).unwrap();
        assert!(mapping.is_executable());
    }
}
