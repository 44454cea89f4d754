//! Per-message and per-idle method statistics for one traced process.
//!
//! Two windows run side by side over the event stream:
//!
//! - the **message window** opens when the main thread logs a dispatched
//!   message and closes when the main thread leaves the dispatcher method; only
//!   main-thread method entries count toward it;
//! - the **idle window** spans from one idle event to the next and counts method
//!   entries on every thread.
//!
//! Every message window lies inside one idle window, so each message's methods
//! are a subset of its idle snapshot's methods.

use std::collections::{BTreeMap, HashSet};
use std::ops::ControlFlow;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::symbols::{Symbols, normalize_class};
use crate::trace::{Event, EventSink};

/// `[id 12] ...` or `[id12] ...`
static MESSAGE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[id\s*(\d+)\]").expect("valid regex"));

/// Which thread and which method delimit message dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateOptions {
    pub main_thread: String,
    /// Slash form, e.g. `android/os/Handler`
    pub dispatch_class: String,
    pub dispatch_method: String,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            main_thread: "main".to_string(),
            dispatch_class: "android/os/Handler".to_string(),
            dispatch_method: "dispatchMessage".to_string(),
        }
    }
}

/// Method entry counts keyed by method pointer.
pub type MethodCounts = BTreeMap<u32, u64>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStats {
    /// The dispatched message as logged, including its `[id N]` tag
    pub text: String,
    pub methods: MethodCounts,
}

/// Contents of `<base>messages.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTable {
    pub messages: BTreeMap<u64, MessageStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleSnapshot {
    pub timestamp_ms: u64,
    /// Message ids dispatched since the previous idle event, in order
    pub message_ids: Vec<u64>,
    pub methods: MethodCounts,
}

/// Activity after the final idle event; it has no closing timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenWindow {
    pub message_ids: Vec<u64>,
    pub methods: MethodCounts,
}

/// Contents of `<base>idle.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleTable {
    pub snapshots: Vec<IdleSnapshot>,
    pub open_window: Option<OpenWindow>,
}

/// Both tables for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Aggregation {
    pub messages: MessageTable,
    pub idle: IdleTable,
    /// Method pointers that were counted without a symbol
    pub unknown_methods: usize,
}

/// Event sink building the message and idle tables.
pub struct Aggregator<'a> {
    symbols: &'a Symbols,
    main_tids: HashSet<u16>,
    dispatch: HashSet<u32>,
    current_message: Option<u64>,
    messages: BTreeMap<u64, MessageStats>,
    idle_message_ids: Vec<u64>,
    idle_methods: MethodCounts,
    snapshots: Vec<IdleSnapshot>,
    unknown: HashSet<u32>,
}

impl<'a> Aggregator<'a> {
    pub fn new(symbols: &'a Symbols, options: &AggregateOptions) -> Self {
        let main_tids: HashSet<u16> = symbols
            .threads
            .tids_named(&options.main_thread)
            .filter_map(|tid| u16::try_from(tid).ok())
            .collect();
        if main_tids.is_empty() {
            log::warn!(
                "No thread named {:?}; message statistics will be empty",
                options.main_thread
            );
        }

        let dispatch_class = normalize_class(&options.dispatch_class);
        let dispatch: HashSet<u32> = symbols
            .methods
            .iter()
            .filter(|(_, record)| {
                record.method == options.dispatch_method
                    && record.normalized_class() == dispatch_class
            })
            .map(|(ptr, _)| ptr)
            .collect();
        log::debug!(
            "Main thread ids {main_tids:?}, {} dispatcher pointer(s)",
            dispatch.len()
        );

        Self {
            symbols,
            main_tids,
            dispatch,
            current_message: None,
            messages: BTreeMap::new(),
            idle_message_ids: Vec::new(),
            idle_methods: MethodCounts::new(),
            snapshots: Vec::new(),
            unknown: HashSet::new(),
        }
    }

    /// Message currently being dispatched on the main thread.
    pub fn current_message(&self) -> Option<u64> {
        self.current_message
    }

    pub fn record(&mut self, event: &Event) {
        match *event {
            Event::MessageDispatched { tid, ref text } if self.is_main(tid) => {
                self.on_message(text);
            }
            Event::MethodEnter { tid, method } => self.on_enter(tid, method),
            Event::MethodExit { tid, method } | Event::MethodUnroll { tid, method }
                if self.is_main(tid) && self.dispatch.contains(&method) =>
            {
                self.current_message = None;
            }
            Event::Idle { timestamp_ms } => self.on_idle(timestamp_ms),
            _ => {}
        }
    }

    pub fn finish(self) -> Aggregation {
        let open_window = (!self.idle_message_ids.is_empty() || !self.idle_methods.is_empty())
            .then(|| OpenWindow {
                message_ids: self.idle_message_ids,
                methods: self.idle_methods,
            });

        Aggregation {
            messages: MessageTable {
                messages: self.messages,
            },
            idle: IdleTable {
                snapshots: self.snapshots,
                open_window,
            },
            unknown_methods: self.unknown.len(),
        }
    }

    fn is_main(&self, tid: u16) -> bool {
        self.main_tids.contains(&tid)
    }

    fn on_message(&mut self, text: &str) {
        let Some(id) = parse_message_id(text) else {
            log::warn!("Ignoring message without an id: {text:?}");
            return;
        };
        self.current_message = Some(id);
        self.messages.insert(
            id,
            MessageStats {
                text: text.to_string(),
                methods: MethodCounts::new(),
            },
        );
        self.idle_message_ids.push(id);
    }

    fn on_enter(&mut self, tid: u16, method: u32) {
        if self.symbols.methods.get(method).is_none() && self.unknown.insert(method) {
            log::warn!("Unknown method pointer 0x{method:08X} on thread {tid}");
        }

        *self.idle_methods.entry(method).or_default() += 1;

        if self.is_main(tid)
            && let Some(id) = self.current_message
            && let Some(stats) = self.messages.get_mut(&id)
        {
            *stats.methods.entry(method).or_default() += 1;
        }
    }

    /// Snapshot and reset the window counters.
    ///
    /// This also ends the current message, which an idle marker alone does
    /// not imply. The loop only idles between dispatches, so a message still
    /// open here lost its exit record.
    fn on_idle(&mut self, timestamp_ms: u64) {
        if let Some(id) = self.current_message.take() {
            log::debug!("Message {id} still open at idle {timestamp_ms}; closing it");
        }
        self.snapshots.push(IdleSnapshot {
            timestamp_ms,
            message_ids: std::mem::take(&mut self.idle_message_ids),
            methods: std::mem::take(&mut self.idle_methods),
        });
    }
}

impl EventSink for Aggregator<'_> {
    fn event(&mut self, event: Event) -> ControlFlow<()> {
        self.record(&event);
        ControlFlow::Continue(())
    }
}

/// Leading `[id N]` of a dispatched-message text.
pub fn parse_message_id(text: &str) -> Option<u64> {
    MESSAGE_ID.captures(text)?.get(1)?.as_str().parse().ok()
}
