//! Decoded trace events.

use serde::Serialize;

/// Tag that opens every trace segment.
pub const TRACE_MAGIC: [u8; 4] = *b"MiTr";

/// Header length written by every known format version.
pub const HEADER_LEN: u16 = 20;

/// Fixed header at the start of each `data_<N>.bin` segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TraceHeader {
    pub version: u16,
    pub header_len: u16,
    /// Bitmask of what the runtime was asked to log (methods, fields, messages, ...)
    pub log_flags: u32,
    /// Trace start, epoch milliseconds
    pub start_ms: u64,
}

/// One decoded record.
///
/// `tid` is the runtime's 16-bit thread id as it appears in `info_t.log`.
/// Method and field pointers have their low three (action) bits cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, strum::IntoStaticStr)]
#[serde(tag = "kind")]
pub enum Event {
    MethodEnter {
        tid: u16,
        method: u32,
    },
    MethodExit {
        tid: u16,
        method: u32,
    },
    MethodUnroll {
        tid: u16,
        method: u32,
    },
    FieldRead {
        tid: u16,
        field: u32,
        object: u32,
        dex_pc: u32,
        detail: u16,
    },
    FieldWrite {
        tid: u16,
        field: u32,
        object: u32,
        dex_pc: u32,
        detail: u16,
    },
    ExceptionCaught {
        tid: u16,
        text: String,
    },
    MessageDispatched {
        tid: u16,
        text: String,
    },
    Idle {
        timestamp_ms: u64,
    },
    Ping {
        timestamp_ms: u64,
    },
    ThreadTerminated {
        tid: u32,
    },
    TargetMethodEntered {
        method_id: u32,
    },
    TargetMethodExited {
        method_id: u32,
    },
    TargetMethodUnwound {
        method_id: u32,
    },
}

impl Event {
    /// Thread the event happened on, for records that carry one.
    pub fn tid(&self) -> Option<u16> {
        match self {
            Event::MethodEnter { tid, .. }
            | Event::MethodExit { tid, .. }
            | Event::MethodUnroll { tid, .. }
            | Event::FieldRead { tid, .. }
            | Event::FieldWrite { tid, .. }
            | Event::ExceptionCaught { tid, .. }
            | Event::MessageDispatched { tid, .. } => Some(*tid),
            _ => None,
        }
    }

    /// Short name of the event kind (`"MethodEnter"`, `"Idle"`, ...).
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}
