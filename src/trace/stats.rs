//! Per-segment event statistics for `minitrace decode --stats`.

use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;

use super::decode::EventSink;
use super::event::Event;

#[derive(Debug, Clone, Default)]
pub struct SegmentStats {
    pub events: usize,
    /// Count per event kind, sorted by kind name
    pub kinds: BTreeMap<&'static str, usize>,
    /// Records per thread id (thread-bound records only)
    pub threads: HashMap<u16, usize>,
    /// `MethodEnter` count per method pointer
    pub method_enters: HashMap<u32, usize>,
    /// First and last idle/ping timestamp seen
    pub time_span: Option<(u64, u64)>,
}

impl SegmentStats {
    pub fn record(&mut self, event: &Event) {
        self.events += 1;
        *self.kinds.entry(event.kind()).or_default() += 1;
        if let Some(tid) = event.tid() {
            *self.threads.entry(tid).or_default() += 1;
        }
        match *event {
            Event::MethodEnter { method, .. } => {
                *self.method_enters.entry(method).or_default() += 1;
            }
            Event::Idle { timestamp_ms } | Event::Ping { timestamp_ms } => {
                self.time_span = Some(match self.time_span {
                    None => (timestamp_ms, timestamp_ms),
                    Some((first, last)) => (first.min(timestamp_ms), last.max(timestamp_ms)),
                });
            }
            _ => {}
        }
    }

    /// The `n` most-entered methods, ties broken by pointer.
    pub fn top_methods(&self, n: usize) -> Vec<(u32, usize)> {
        let mut methods: Vec<_> = self.method_enters.iter().map(|(p, c)| (*p, *c)).collect();
        methods.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        methods.truncate(n);
        methods
    }

    /// Threads by record count, busiest first.
    pub fn busiest_threads(&self) -> Vec<(u16, usize)> {
        let mut threads: Vec<_> = self.threads.iter().map(|(t, c)| (*t, *c)).collect();
        threads.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        threads
    }
}

impl EventSink for SegmentStats {
    fn event(&mut self, event: Event) -> ControlFlow<()> {
        self.record(&event);
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::decode::decode;
    use crate::trace::encode::SegmentBuilder;

    #[test]
    fn test_counts() {
        let bytes = SegmentBuilder::new()
            .ping(50)
            .method_enter(7, 0x10)
            .method_enter(7, 0x10)
            .method_enter(8, 0x18)
            .method_exit(7, 0x10)
            .idle(20)
            .finish();

        let mut stats = SegmentStats::default();
        decode(bytes.as_slice(), &mut stats).unwrap();

        assert_eq!(stats.events, 6);
        assert_eq!(stats.kinds["MethodEnter"], 3);
        assert_eq!(stats.kinds["Idle"], 1);
        assert_eq!(stats.top_methods(1), vec![(0x10, 2)]);
        assert_eq!(stats.busiest_threads(), vec![(7, 3), (8, 1)]);
        assert_eq!(stats.time_span, Some((20, 50)));
    }
}
