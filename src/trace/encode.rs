//! Builds segments in the runtime's on-device format.
//!
//! The runtime is the only real writer; this exists for fixtures, replaying
//! captured events and tests. It keeps the events it wrote so callers can
//! compare decoder output against them.

use super::decode::{
    ACTION_ENTER, ACTION_EXCEPTION, ACTION_EXIT, ACTION_FIELD_READ, ACTION_FIELD_WRITE,
    ACTION_MASK, ACTION_MESSAGE, ACTION_UNROLL, TEXT_RECORD_PREFIX, TID_IDLE, TID_PING,
    TID_TARGET_ENTER, TID_TARGET_EXIT, TID_TARGET_UNWIND, TID_THREAD_END,
};
use super::event::{Event, HEADER_LEN, TRACE_MAGIC};

#[derive(Debug, Clone)]
pub struct SegmentBuilder {
    version: u16,
    log_flags: u32,
    start_ms: u64,
    body: Vec<u8>,
    events: Vec<Event>,
    ends: Vec<usize>,
}

impl Default for SegmentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentBuilder {
    pub fn new() -> Self {
        Self {
            version: 1,
            log_flags: 0,
            start_ms: 0,
            body: Vec::new(),
            events: Vec::new(),
            ends: Vec::new(),
        }
    }

    pub fn version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    pub fn log_flags(mut self, log_flags: u32) -> Self {
        self.log_flags = log_flags;
        self
    }

    pub fn start_ms(mut self, start_ms: u64) -> Self {
        self.start_ms = start_ms;
        self
    }

    /// Append any event.
    ///
    /// Pointers must have their low three bits clear, since those bits carry
    /// the action on disk; set bits are masked off.
    pub fn event(mut self, event: Event) -> Self {
        match &event {
            Event::Idle { timestamp_ms } => self.short(TID_IDLE, &timestamp_ms.to_le_bytes()),
            Event::Ping { timestamp_ms } => self.short(TID_PING, &timestamp_ms.to_le_bytes()),
            Event::ThreadTerminated { tid } => self.short(TID_THREAD_END, &tid.to_le_bytes()),
            Event::TargetMethodEntered { method_id } => {
                self.short(TID_TARGET_ENTER, &method_id.to_le_bytes())
            }
            Event::TargetMethodExited { method_id } => {
                self.short(TID_TARGET_EXIT, &method_id.to_le_bytes())
            }
            Event::TargetMethodUnwound { method_id } => {
                self.short(TID_TARGET_UNWIND, &method_id.to_le_bytes())
            }
            Event::MethodEnter { tid, method } => self.raw(*tid, *method, ACTION_ENTER),
            Event::MethodExit { tid, method } => self.raw(*tid, *method, ACTION_EXIT),
            Event::MethodUnroll { tid, method } => self.raw(*tid, *method, ACTION_UNROLL),
            Event::FieldRead {
                tid,
                field,
                object,
                dex_pc,
                detail,
            } => {
                self.raw(*tid, *field, ACTION_FIELD_READ);
                self.field_tail(*object, *dex_pc, *detail);
            }
            Event::FieldWrite {
                tid,
                field,
                object,
                dex_pc,
                detail,
            } => {
                self.raw(*tid, *field, ACTION_FIELD_WRITE);
                self.field_tail(*object, *dex_pc, *detail);
            }
            Event::ExceptionCaught { tid, text } => self.text(*tid, text, ACTION_EXCEPTION),
            Event::MessageDispatched { tid, text } => self.text(*tid, text, ACTION_MESSAGE),
        }
        self.ends.push(usize::from(HEADER_LEN) + self.body.len());
        self.events.push(event);
        self
    }

    pub fn idle(self, timestamp_ms: u64) -> Self {
        self.event(Event::Idle { timestamp_ms })
    }

    pub fn ping(self, timestamp_ms: u64) -> Self {
        self.event(Event::Ping { timestamp_ms })
    }

    pub fn thread_terminated(self, tid: u32) -> Self {
        self.event(Event::ThreadTerminated { tid })
    }

    pub fn target_entered(self, method_id: u32) -> Self {
        self.event(Event::TargetMethodEntered { method_id })
    }

    pub fn target_exited(self, method_id: u32) -> Self {
        self.event(Event::TargetMethodExited { method_id })
    }

    pub fn target_unwound(self, method_id: u32) -> Self {
        self.event(Event::TargetMethodUnwound { method_id })
    }

    pub fn method_enter(self, tid: u16, method: u32) -> Self {
        self.event(Event::MethodEnter { tid, method })
    }

    pub fn method_exit(self, tid: u16, method: u32) -> Self {
        self.event(Event::MethodExit { tid, method })
    }

    pub fn method_unroll(self, tid: u16, method: u32) -> Self {
        self.event(Event::MethodUnroll { tid, method })
    }

    pub fn field_read(self, tid: u16, field: u32, object: u32, dex_pc: u32, detail: u16) -> Self {
        self.event(Event::FieldRead {
            tid,
            field,
            object,
            dex_pc,
            detail,
        })
    }

    pub fn field_write(self, tid: u16, field: u32, object: u32, dex_pc: u32, detail: u16) -> Self {
        self.event(Event::FieldWrite {
            tid,
            field,
            object,
            dex_pc,
            detail,
        })
    }

    pub fn exception(self, tid: u16, text: &str) -> Self {
        self.event(Event::ExceptionCaught {
            tid,
            text: text.to_string(),
        })
    }

    pub fn message(self, tid: u16, text: &str) -> Self {
        self.event(Event::MessageDispatched {
            tid,
            text: text.to_string(),
        })
    }

    /// Events written so far, in order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Byte offset just past each record in the finished segment.
    pub fn record_ends(&self) -> &[usize] {
        &self.ends
    }

    /// Header plus all records.
    pub fn finish(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(usize::from(HEADER_LEN) + self.body.len());
        out.extend_from_slice(&TRACE_MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&HEADER_LEN.to_le_bytes());
        out.extend_from_slice(&self.log_flags.to_le_bytes());
        out.extend_from_slice(&self.start_ms.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    fn short(&mut self, tid: u16, payload: &[u8]) {
        self.body.extend_from_slice(&tid.to_le_bytes());
        self.body.extend_from_slice(payload);
    }

    fn raw(&mut self, tid: u16, value: u32, action: u32) {
        let raw = (value & !ACTION_MASK) | action;
        self.short(tid, &raw.to_le_bytes());
    }

    fn field_tail(&mut self, object: u32, dex_pc: u32, detail: u16) {
        self.body.extend_from_slice(&object.to_le_bytes());
        self.body.extend_from_slice(&dex_pc.to_le_bytes());
        self.body.extend_from_slice(&detail.to_le_bytes());
    }

    fn text(&mut self, tid: u16, text: &str, action: u32) {
        // Declared length covers tid + raw + text + NUL
        let total = TEXT_RECORD_PREFIX + text.len() as u32 + 1;
        self.raw(tid, total << 3, action);
        self.body.extend_from_slice(text.as_bytes());
        self.body.push(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_matches_runtime_bytes() {
        let bytes = SegmentBuilder::new().message(7, "[id1]").finish();
        let mut expected = Vec::new();
        expected.extend_from_slice(&7u16.to_le_bytes());
        expected.extend_from_slice(&102u32.to_le_bytes());
        expected.extend_from_slice(b"[id1]\0");
        assert_eq!(&bytes[20..], expected.as_slice());
    }

    #[test]
    fn test_record_ends() {
        let builder = SegmentBuilder::new().idle(1).method_enter(7, 0x10);
        assert_eq!(builder.record_ends(), &[30, 36]);
        assert_eq!(builder.finish().len(), 36);
    }
}
