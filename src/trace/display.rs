//! Human-readable rendering of decoded events and segment statistics.

use std::fmt::Write as _;

use super::event::Event;
use super::stats::SegmentStats;
use crate::symbols::Symbols;

/// One line per event, with names resolved through `symbols` where possible.
pub fn render_event(event: &Event, symbols: &Symbols) -> String {
    let thread = |tid: u16| thread_label(u32::from(tid), symbols);
    let method = |ptr: u32| match symbols.methods.get(ptr) {
        Some(record) => format!("{} \t {}", record.class, record.method),
        None => "<unknown>".to_string(),
    };
    let field = |ptr: u32, detail: u16| match symbols.fields.get(ptr, detail) {
        Some(record) => format!(" {}.{}", record.class, record.name),
        None => String::new(),
    };

    match event {
        Event::MethodEnter { tid, method: ptr } => {
            format!("{:>10} Entering  method 0x{ptr:08X} {}", thread(*tid), method(*ptr))
        }
        Event::MethodExit { tid, method: ptr } => {
            format!("{:>10} Exiting   method 0x{ptr:08X} {}", thread(*tid), method(*ptr))
        }
        Event::MethodUnroll { tid, method: ptr } => {
            format!("{:>10} Unrolling method 0x{ptr:08X} {}", thread(*tid), method(*ptr))
        }
        Event::FieldRead {
            tid,
            field: ptr,
            object,
            dex_pc,
            detail,
        } => format!(
            "{:>10} Reading field 0x{ptr:08X} object 0x{object:08X} dex 0x{dex_pc:08X}{}",
            thread(*tid),
            field(*ptr, *detail)
        ),
        Event::FieldWrite {
            tid,
            field: ptr,
            object,
            dex_pc,
            detail,
        } => format!(
            "{:>10} Writing field 0x{ptr:08X} object 0x{object:08X} dex 0x{dex_pc:08X}{}",
            thread(*tid),
            field(*ptr, *detail)
        ),
        Event::ExceptionCaught { tid, text } => {
            format!("{:>10} ExceptionCaught {}", thread(*tid), text.escape_debug())
        }
        Event::MessageDispatched { tid, text } => {
            format!("{:>10} Message {}", thread(*tid), text.escape_debug())
        }
        Event::Idle { timestamp_ms } => format!("{:>10} Idle at {timestamp_ms}", "-"),
        Event::Ping { timestamp_ms } => format!("{:>10} Ping at {timestamp_ms}", "-"),
        Event::ThreadTerminated { tid } => {
            format!("{:>10} Thread {} terminated", "-", thread_label(*tid, symbols))
        }
        Event::TargetMethodEntered { method_id } => {
            format!("{:>10} Target method {method_id} entered", "-")
        }
        Event::TargetMethodExited { method_id } => {
            format!("{:>10} Target method {method_id} exited", "-")
        }
        Event::TargetMethodUnwound { method_id } => {
            format!("{:>10} Target method {method_id} unwound", "-")
        }
    }
}

fn thread_label(tid: u32, symbols: &Symbols) -> String {
    match symbols.threads.name(tid) {
        Some(name) => name.to_string(),
        None => format!("tid {tid}"),
    }
}

/// Render the statistics tables for one or more segments.
pub fn render_stats(stats: &SegmentStats, symbols: &Symbols) -> String {
    let mut out = String::new();

    render_header(&mut out);
    render_kind_breakdown(&mut out, stats);
    render_threads(&mut out, stats, symbols);
    render_top_methods(&mut out, stats, symbols);

    out
}

fn render_header(out: &mut String) {
    out.push_str("============================================================\n");
    out.push_str("                   TRACE SEGMENT SUMMARY\n");
    out.push_str("============================================================\n");
}

fn render_kind_breakdown(out: &mut String, stats: &SegmentStats) {
    out.push_str("\nEVENT KINDS\n");
    out.push_str("-----------\n");
    writeln!(out, "{:<22} {:>10}", "Kind", "Count").unwrap();
    writeln!(out, "{:<22} {:>10}", "----------------------", "----------").unwrap();
    for (kind, count) in &stats.kinds {
        writeln!(out, "{kind:<22} {count:>10}").unwrap();
    }
    writeln!(out, "{:<22} {:>10}", "----------------------", "----------").unwrap();
    writeln!(out, "{:<22} {:>10}", "TOTAL", stats.events).unwrap();

    if let Some((first, last)) = stats.time_span {
        writeln!(out, "\nIdle/ping span: {first} .. {last} ({} ms)", last - first).unwrap();
    }
}

fn render_threads(out: &mut String, stats: &SegmentStats, symbols: &Symbols) {
    out.push_str("\nTHREADS\n");
    out.push_str("-------\n");
    for (tid, count) in stats.busiest_threads() {
        let name = thread_label(u32::from(tid), symbols);
        writeln!(out, "{:<30} {count:>10}", truncate(&name, 30)).unwrap();
    }
}

fn render_top_methods(out: &mut String, stats: &SegmentStats, symbols: &Symbols) {
    out.push_str("\nTOP 10 ENTERED METHODS\n");
    out.push_str("----------------------\n");
    for (ptr, count) in stats.top_methods(10) {
        let name = symbols
            .methods
            .get(ptr)
            .map(|record| format!("{}.{}", record.class, record.method))
            .unwrap_or_else(|| "<unknown>".to_string());
        writeln!(out, "{count:>8}  0x{ptr:08X}  {}", truncate(&name, 60)).unwrap();
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{MethodTable, ThreadTable};
    use crate::trace::decode::decode;
    use crate::trace::encode::SegmentBuilder;
    use std::path::Path;

    fn symbols() -> Symbols {
        let path = Path::new("test");
        Symbols {
            threads: ThreadTable::parse(path, "7\tmain\n").unwrap(),
            methods: MethodTable::parse(
                path,
                "1000\tLandroid/os/Handler;\tdispatchMessage\t(Landroid/os/Message;)V\tHandler.java\n",
            )
            .unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_render_events() {
        let symbols = symbols();
        let lines: Vec<String> = SegmentBuilder::new()
            .method_enter(7, 0x1000)
            .method_exit(9, 0x2000)
            .field_read(7, 0x3000, 0xABCD, 0x10, 0)
            .message(7, "[id 1] tick")
            .idle(1234)
            .thread_terminated(7)
            .target_unwound(4)
            .events()
            .iter()
            .map(|event| render_event(event, &symbols))
            .collect();

        assert_eq!(
            lines,
            vec![
                "      main Entering  method 0x00001000 Landroid/os/Handler; \t dispatchMessage",
                "     tid 9 Exiting   method 0x00002000 <unknown>",
                "      main Reading field 0x00003000 object 0x0000ABCD dex 0x00000010",
                "      main Message [id 1] tick",
                "         - Idle at 1234",
                "         - Thread main terminated",
                "         - Target method 4 unwound",
            ]
        );
    }

    #[test]
    fn test_render_stats() {
        let bytes = SegmentBuilder::new()
            .method_enter(7, 0x1000)
            .method_enter(7, 0x1000)
            .idle(10)
            .finish();
        let mut stats = SegmentStats::default();
        decode(bytes.as_slice(), &mut stats).unwrap();

        let out = render_stats(&stats, &symbols());
        assert!(out.contains(&format!("{:<22} {:>10}", "MethodEnter", 2)), "{out}");
        assert!(out.contains(&format!("{:<22} {:>10}", "TOTAL", 3)), "{out}");
        assert!(out.contains(&format!("{:<30} {:>10}", "main", 2)), "{out}");
        assert!(
            out.contains("       2  0x00001000  Landroid/os/Handler;.dispatchMessage"),
            "{out}"
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }
}
