//! Stable line-oriented text serialization of the live/peak sets.

use std::io::{self, Write};

use crate::live::{ListEntry, Totals};
use crate::unwind::FrameData;

const MB: usize = 1024 * 1024;
const RULE_WIDTH: usize = 89;

/// Write the totals header, the rule line, and one block per entry.
pub fn write_dump(w: &mut dyn Write, totals: &Totals, entries: &[ListEntry]) -> io::Result<()> {
    writeln!(
        w,
        "host peak used: {}MB, dma peak used {}MB, total peak used: {}MB",
        totals.peak_host / MB,
        totals.peak_dma / MB,
        totals.peak_total / MB
    )?;
    writeln!(w, "{}", "+".repeat(RULE_WIDTH))?;
    writeln!(w)?;

    for entry in entries {
        write_entry(w, entry)?;
        writeln!(w)?;
    }

    Ok(())
}

fn write_entry(w: &mut dyn Write, entry: &ListEntry) -> io::Result<()> {
    writeln!(
        w,
        "alloc_size:{:.2}KB\talloc_type:{}\talloc_num:{}\talloc_time:{}",
        entry.size as f64 / 1024.0,
        entry.class.as_str(),
        entry.count,
        entry.time.format("%Y-%m-%d %H:%M:%S%.3f")
    )?;

    if let Some(stack) = &entry.stack {
        for (n, frame) in stack.frames.iter().enumerate() {
            write_frame(w, n, frame)?;
        }
    }

    Ok(())
}

fn write_frame(w: &mut dyn Write, n: usize, frame: &FrameData) -> io::Result<()> {
    write!(w, "#{} {:x} ", n, frame.rel_pc)?;

    match &frame.map_name {
        Some(name) => write!(w, "{}", name)?,
        None if frame.map_base != 0 => write!(w, "<anonymous:{:x}>", frame.map_base)?,
        None => write!(w, "<unknown>")?,
    }

    if let Some(symbol) = &frame.symbol {
        if frame.symbol_offset != 0 {
            write!(w, " ({}+{})", symbol, frame.symbol_offset)?;
        } else {
            write!(w, " ({})", symbol)?;
        }
    }

    writeln!(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::MemoryClass;
    use crate::intern::FrameStack;
    use chrono::{Local, TimeZone};
    use std::sync::Arc;

    fn frame(rel_pc: usize, module: Option<&str>, base: usize, symbol: Option<&str>, offset: usize) -> FrameData {
        FrameData {
            pc: rel_pc + base,
            rel_pc,
            map_name: module.map(str::to_string),
            map_base: base,
            symbol: symbol.map(str::to_string),
            symbol_offset: offset,
        }
    }

    fn entry_at(size: usize, count: usize, frames: Vec<FrameData>) -> ListEntry {
        let pcs: Vec<usize> = frames.iter().map(|f| f.pc).collect();
        let stack = if frames.is_empty() {
            None
        } else {
            Some(Arc::new(FrameStack {
                pcs: pcs.into(),
                frames,
            }))
        };
        ListEntry {
            pointer: 0xdead0000,
            count,
            size,
            class: MemoryClass::Host,
            time: Local.with_ymd_and_hms(2024, 3, 15, 10, 30, 45).unwrap(),
            stack,
        }
    }

    fn render(totals: &Totals, entries: &[ListEntry]) -> String {
        let mut buf = Vec::new();
        write_dump(&mut buf, totals, entries).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn header_uses_integer_megabytes() {
        let totals = Totals {
            peak_host: 3 * MB + 513 * 1024,
            peak_dma: 2 * MB,
            peak_total: 5 * MB + 513 * 1024,
            ..Totals::default()
        };
        let text = render(&totals, &[]);
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "host peak used: 3MB, dma peak used 2MB, total peak used: 5MB"
        );
        assert_eq!(lines.next().unwrap(), "+".repeat(89));
        assert_eq!(lines.next().unwrap(), "");
    }

    #[test]
    fn entry_line_literals() {
        let entry = entry_at(2048, 100, vec![]);
        let text = render(&Totals::default(), &[entry]);
        let line = text.lines().nth(3).unwrap();
        assert_eq!(
            line,
            "alloc_size:2.00KB\talloc_type:host\talloc_num:100\talloc_time:2024-03-15 10:30:45.000"
        );
    }

    #[test]
    fn frame_line_with_symbol_and_offset() {
        let entry = entry_at(
            4096,
            1,
            vec![frame(0x1234, Some("/usr/lib/libfoo.so"), 0x7000_0000, Some("foo::bar"), 24)],
        );
        let text = render(&Totals::default(), &[entry]);
        assert!(text.contains("#0 1234 /usr/lib/libfoo.so (foo::bar+24)"));
    }

    #[test]
    fn frame_line_omits_offset_zero_and_symbolless_parens() {
        let entry = entry_at(
            4096,
            1,
            vec![
                frame(0x10, Some("/lib/a.so"), 0x1000, Some("f"), 0),
                frame(0x20, Some("/lib/b.so"), 0x2000, None, 0),
            ],
        );
        let text = render(&Totals::default(), &[entry]);
        assert!(text.contains("#0 10 /lib/a.so (f)\n"));
        assert!(text.contains("#1 20 /lib/b.so\n"));
    }

    #[test]
    fn anonymous_and_unknown_modules() {
        let entry = entry_at(
            64,
            1,
            vec![
                frame(0x10, None, 0xab000, None, 0),
                frame(0x20, None, 0, None, 0),
            ],
        );
        let text = render(&Totals::default(), &[entry]);
        assert!(text.contains("#0 10 <anonymous:ab000>\n"));
        assert!(text.contains("#1 20 <unknown>\n"));
    }

    #[test]
    fn entries_are_blank_line_separated() {
        let entries = vec![entry_at(1024, 1, vec![]), entry_at(512, 2, vec![])];
        let text = render(&Totals::default(), &entries);
        let blocks: Vec<&str> = text.split("\n\n").collect();
        // header block + one block per entry + trailing empty split
        assert_eq!(blocks.len(), 4);
    }
}
