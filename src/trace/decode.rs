//! Streaming decoder for `data_<N>.bin` segments.
//!
//! # Layout
//!
//! ```text
//! header   magic[4] version:u16 header_len:u16 log_flags:u32 start_ms:u64
//! record   tid:u16, then by tid:
//!            0      idle        ts:u64
//!            1      ping        ts:u64
//!            2      thread end  tid:u32
//!            3/4/5  target      method_id:u32   (entered/exited/unwound)
//!            other  raw:u32, action = raw & 7, value = raw & !7
//!                     0/1/2  method enter/exit/unroll
//!                     3/4    field read/write   obj:u32 dex:u32 detail:u16
//!                     5/6    exception/message  (value >> 3) - 6 bytes, NUL-terminated
//! ```
//!
//! Everything is little-endian. The runtime appends to segments while we read
//! them, so a short read anywhere ends decoding quietly and the partial record
//! is dropped.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::ops::ControlFlow;
use std::path::Path;

use super::error::TraceError;
use super::event::{Event, HEADER_LEN, TRACE_MAGIC, TraceHeader};

pub(crate) const ACTION_MASK: u32 = 0x07;

pub(crate) const TID_IDLE: u16 = 0;
pub(crate) const TID_PING: u16 = 1;
pub(crate) const TID_THREAD_END: u16 = 2;
pub(crate) const TID_TARGET_ENTER: u16 = 3;
pub(crate) const TID_TARGET_EXIT: u16 = 4;
pub(crate) const TID_TARGET_UNWIND: u16 = 5;

pub(crate) const ACTION_ENTER: u32 = 0;
pub(crate) const ACTION_EXIT: u32 = 1;
pub(crate) const ACTION_UNROLL: u32 = 2;
pub(crate) const ACTION_FIELD_READ: u32 = 3;
pub(crate) const ACTION_FIELD_WRITE: u32 = 4;
pub(crate) const ACTION_EXCEPTION: u32 = 5;
pub(crate) const ACTION_MESSAGE: u32 = 6;

/// Size of the `tid` + `raw` prefix that text records count in their length.
pub(crate) const TEXT_RECORD_PREFIX: u32 = 6;

/// Receives decoded events in file order.
///
/// Returning `ControlFlow::Break` stops decoding immediately; the rest of the
/// segment is not read.
pub trait EventSink {
    fn event(&mut self, event: Event) -> ControlFlow<()>;
}

impl<F> EventSink for F
where
    F: FnMut(Event) -> ControlFlow<()>,
{
    fn event(&mut self, event: Event) -> ControlFlow<()> {
        self(event)
    }
}

/// What a call to [`decode`] saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeSummary {
    /// `None` when the segment ended before a complete header
    pub header: Option<TraceHeader>,
    /// Events handed to the sink
    pub events: usize,
    /// The sink asked to stop before the end of the data
    pub stopped: bool,
}

/// Pull-based reader over one segment.
///
/// Also usable as an iterator of `Result<Event, TraceError>`; the iterator
/// fuses after the first error.
pub struct TraceReader<R> {
    inner: R,
    offset: u64,
    header: Option<TraceHeader>,
    done: bool,
}

impl<R: Read> TraceReader<R> {
    /// Read and validate the header.
    ///
    /// Fails with [`TraceError::FormatMismatch`] before touching any record
    /// when the magic tag is wrong.
    pub fn new(inner: R) -> Result<Self, TraceError> {
        let mut reader = Self {
            inner,
            offset: 0,
            header: None,
            done: false,
        };
        reader.header = reader.read_header()?;
        reader.done = reader.header.is_none();
        Ok(reader)
    }

    pub fn header(&self) -> Option<&TraceHeader> {
        self.header.as_ref()
    }

    /// Bytes consumed by complete reads so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next complete record, or `None` at end of data (including a cut-off
    /// final record).
    pub fn next_event(&mut self) -> Result<Option<Event>, TraceError> {
        if self.done {
            return Ok(None);
        }
        let start = self.offset;
        match self.read_record(start) {
            Ok(Some(event)) => Ok(Some(event)),
            Ok(None) => {
                self.done = true;
                if self.offset > start {
                    log::debug!("Dropping partial record at byte {start}");
                }
                Ok(None)
            }
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }

    fn read_header(&mut self) -> Result<Option<TraceHeader>, TraceError> {
        let Some(magic) = self.read_array::<4>()? else {
            return Ok(None);
        };
        if magic != TRACE_MAGIC {
            return Err(TraceError::FormatMismatch {
                reason: format!("magic {magic:02x?}, expected {TRACE_MAGIC:02x?}"),
            });
        }

        let Some(rest) = self.read_array::<16>()? else {
            return Ok(None);
        };
        let header = TraceHeader {
            version: u16::from_le_bytes([rest[0], rest[1]]),
            header_len: u16::from_le_bytes([rest[2], rest[3]]),
            log_flags: u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]),
            start_ms: u64::from_le_bytes([
                rest[8], rest[9], rest[10], rest[11], rest[12], rest[13], rest[14], rest[15],
            ]),
        };

        if header.header_len < HEADER_LEN {
            return Err(TraceError::FormatMismatch {
                reason: format!(
                    "header length {} is shorter than {HEADER_LEN}",
                    header.header_len
                ),
            });
        }

        // Newer writers may append header fields; skip what we don't know
        let extra = u64::from(header.header_len - HEADER_LEN);
        if extra > 0 {
            let skipped = io::copy(&mut (&mut self.inner).take(extra), &mut io::sink())?;
            self.offset += skipped;
            if skipped < extra {
                return Ok(None);
            }
        }

        Ok(Some(header))
    }

    fn read_record(&mut self, start: u64) -> Result<Option<Event>, TraceError> {
        let Some(tid) = self.read_u16()? else {
            return Ok(None);
        };

        let event = match tid {
            TID_IDLE => self
                .read_u64()?
                .map(|timestamp_ms| Event::Idle { timestamp_ms }),
            TID_PING => self
                .read_u64()?
                .map(|timestamp_ms| Event::Ping { timestamp_ms }),
            TID_THREAD_END => self.read_u32()?.map(|tid| Event::ThreadTerminated { tid }),
            TID_TARGET_ENTER => self
                .read_u32()?
                .map(|method_id| Event::TargetMethodEntered { method_id }),
            TID_TARGET_EXIT => self
                .read_u32()?
                .map(|method_id| Event::TargetMethodExited { method_id }),
            TID_TARGET_UNWIND => self
                .read_u32()?
                .map(|method_id| Event::TargetMethodUnwound { method_id }),
            tid => return self.read_thread_record(tid, start),
        };
        Ok(event)
    }

    fn read_thread_record(&mut self, tid: u16, start: u64) -> Result<Option<Event>, TraceError> {
        let Some(raw) = self.read_u32()? else {
            return Ok(None);
        };
        let action = raw & ACTION_MASK;
        let value = raw & !ACTION_MASK;

        match action {
            ACTION_ENTER => Ok(Some(Event::MethodEnter { tid, method: value })),
            ACTION_EXIT => Ok(Some(Event::MethodExit { tid, method: value })),
            ACTION_UNROLL => Ok(Some(Event::MethodUnroll { tid, method: value })),
            ACTION_FIELD_READ | ACTION_FIELD_WRITE => {
                let Some(rest) = self.read_array::<10>()? else {
                    return Ok(None);
                };
                let object = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
                let dex_pc = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
                let detail = u16::from_le_bytes([rest[8], rest[9]]);
                let event = if action == ACTION_FIELD_READ {
                    Event::FieldRead {
                        tid,
                        field: value,
                        object,
                        dex_pc,
                        detail,
                    }
                } else {
                    Event::FieldWrite {
                        tid,
                        field: value,
                        object,
                        dex_pc,
                        detail,
                    }
                };
                Ok(Some(event))
            }
            ACTION_EXCEPTION | ACTION_MESSAGE => {
                let total = value >> 3;
                // The declared length covers tid + raw and must leave room for the NUL
                if total <= TEXT_RECORD_PREFIX {
                    return Err(TraceError::corrupt(
                        start,
                        format!("text record of {total} bytes has no room for its terminator"),
                    ));
                }
                let Some(mut bytes) = self.read_vec(u64::from(total - TEXT_RECORD_PREFIX))? else {
                    return Ok(None);
                };
                bytes.pop();
                let text = String::from_utf8_lossy(&bytes).into_owned();
                if action == ACTION_EXCEPTION {
                    Ok(Some(Event::ExceptionCaught { tid, text }))
                } else {
                    Ok(Some(Event::MessageDispatched { tid, text }))
                }
            }
            other => Err(TraceError::corrupt(
                start,
                format!("unknown action {other} on thread {tid}"),
            )),
        }
    }

    /// Fill `buf` completely; `Ok(false)` when the data runs out first.
    fn fill(&mut self, buf: &mut [u8]) -> Result<bool, TraceError> {
        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.offset += buf.len() as u64;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read_array<const N: usize>(&mut self) -> Result<Option<[u8; N]>, TraceError> {
        let mut buf = [0u8; N];
        Ok(self.fill(&mut buf)?.then_some(buf))
    }

    /// Read exactly `len` bytes without trusting `len` for the allocation size.
    fn read_vec(&mut self, len: u64) -> Result<Option<Vec<u8>>, TraceError> {
        let mut buf = Vec::new();
        let read = (&mut self.inner).take(len).read_to_end(&mut buf)?;
        if (read as u64) < len {
            return Ok(None);
        }
        self.offset += len;
        Ok(Some(buf))
    }

    fn read_u16(&mut self) -> Result<Option<u16>, TraceError> {
        Ok(self.read_array::<2>()?.map(u16::from_le_bytes))
    }

    fn read_u32(&mut self) -> Result<Option<u32>, TraceError> {
        Ok(self.read_array::<4>()?.map(u32::from_le_bytes))
    }

    fn read_u64(&mut self) -> Result<Option<u64>, TraceError> {
        Ok(self.read_array::<8>()?.map(u64::from_le_bytes))
    }
}

impl<R: Read> Iterator for TraceReader<R> {
    type Item = Result<Event, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}

/// Decode one segment into `sink`.
pub fn decode<R: Read, S: EventSink + ?Sized>(
    reader: R,
    sink: &mut S,
) -> Result<DecodeSummary, TraceError> {
    let mut reader = TraceReader::new(reader)?;
    let mut summary = DecodeSummary {
        header: reader.header,
        events: 0,
        stopped: false,
    };

    while let Some(event) = reader.next_event()? {
        summary.events += 1;
        if sink.event(event).is_break() {
            summary.stopped = true;
            break;
        }
    }

    Ok(summary)
}

/// Decode a segment file from disk.
pub fn decode_file<S: EventSink + ?Sized>(
    path: &Path,
    sink: &mut S,
) -> Result<DecodeSummary, TraceError> {
    let file = File::open(path)?;
    decode(BufReader::new(file), sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::encode::SegmentBuilder;

    fn collect(bytes: &[u8]) -> Result<Vec<Event>, TraceError> {
        TraceReader::new(bytes)?.collect()
    }

    #[test]
    fn test_method_enter_example() {
        let mut bytes = SegmentBuilder::new().finish();
        bytes.extend_from_slice(&7u16.to_le_bytes());
        bytes.extend_from_slice(&0x0000_1000u32.to_le_bytes());

        let events = collect(&bytes).unwrap();
        assert_eq!(
            events,
            vec![Event::MethodEnter {
                tid: 7,
                method: 0x1000
            }]
        );
    }

    #[test]
    fn test_message_example() {
        let mut bytes = SegmentBuilder::new().finish();
        bytes.extend_from_slice(&7u16.to_le_bytes());
        bytes.extend_from_slice(&102u32.to_le_bytes());
        bytes.extend_from_slice(b"[id1]\0");

        let events = collect(&bytes).unwrap();
        assert_eq!(
            events,
            vec![Event::MessageDispatched {
                tid: 7,
                text: "[id1]".into()
            }]
        );
    }

    #[test]
    fn test_bad_magic_is_format_mismatch() {
        let mut bytes = SegmentBuilder::new().method_enter(7, 0x1000).finish();
        bytes[..4].copy_from_slice(b"SLOW");

        let mut seen = 0;
        let result = decode(bytes.as_slice(), &mut |_: Event| {
            seen += 1;
            ControlFlow::Continue(())
        });
        assert!(matches!(result, Err(TraceError::FormatMismatch { .. })));
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_short_header_len_is_format_mismatch() {
        let mut bytes = SegmentBuilder::new().finish();
        bytes[6..8].copy_from_slice(&12u16.to_le_bytes());
        assert!(matches!(
            TraceReader::new(bytes.as_slice()),
            Err(TraceError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn test_longer_header_is_skipped() {
        let body = SegmentBuilder::new().idle(5).finish();
        let mut bytes = body[..20].to_vec();
        bytes[6..8].copy_from_slice(&24u16.to_le_bytes());
        bytes.extend_from_slice(&[0xAA; 4]);
        bytes.extend_from_slice(&body[20..]);

        let reader = TraceReader::new(bytes.as_slice()).unwrap();
        assert_eq!(reader.header().unwrap().header_len, 24);
        let events: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(events, vec![Event::Idle { timestamp_ms: 5 }]);
    }

    #[test]
    fn test_header_fields() {
        let bytes = SegmentBuilder::new()
            .version(3)
            .log_flags(0x0001_0180)
            .start_ms(1_600_000_000_123)
            .finish();
        let reader = TraceReader::new(bytes.as_slice()).unwrap();
        let header = reader.header().unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.header_len, 20);
        assert_eq!(header.log_flags, 0x0001_0180);
        assert_eq!(header.start_ms, 1_600_000_000_123);
    }

    #[test]
    fn test_empty_and_partial_header_decode_nothing() {
        for len in [0, 3, 4, 19] {
            let bytes = SegmentBuilder::new().finish();
            let summary = decode(&bytes[..len], &mut |_: Event| ControlFlow::Continue(())).unwrap();
            assert_eq!(summary.header, None, "len {len}");
            assert_eq!(summary.events, 0);
        }
    }

    #[test]
    fn test_all_record_kinds() {
        let builder = SegmentBuilder::new()
            .idle(100)
            .ping(101)
            .thread_terminated(12)
            .target_entered(1)
            .target_exited(1)
            .target_unwound(2)
            .method_enter(9, 0x2000)
            .method_exit(9, 0x2000)
            .method_unroll(9, 0x2008)
            .field_read(9, 0x3000, 0xdead_bee0, 0x14, 2)
            .field_write(10, 0x3008, 0x1234_5670, 0x20, 0)
            .exception(9, "java.lang.IllegalStateException")
            .message(9, "[id 4] Handler (android.view.Choreographer$FrameHandler)");
        let expected = builder.events().to_vec();

        assert_eq!(collect(&builder.finish()).unwrap(), expected);
    }

    #[test]
    fn test_truncation_yields_complete_prefix() {
        let builder = SegmentBuilder::new()
            .method_enter(7, 0x1000)
            .field_read(7, 0x2000, 1, 2, 3)
            .message(7, "[id 1] msg")
            .idle(42)
            .method_exit(7, 0x1000);
        let bytes = builder.finish();
        let ends = builder.record_ends();

        for cut in 20..bytes.len() {
            let complete = ends.iter().filter(|&&end| end <= cut).count();
            let events = collect(&bytes[..cut]).unwrap();
            assert_eq!(events, builder.events()[..complete], "cut at {cut}");
        }
    }

    #[test]
    fn test_sink_can_stop_early() {
        let bytes = SegmentBuilder::new()
            .method_enter(7, 0x10)
            .method_enter(7, 0x18)
            .method_enter(7, 0x20)
            .finish();

        let mut seen = Vec::new();
        let summary = decode(bytes.as_slice(), &mut |event: Event| {
            seen.push(event);
            if seen.len() == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();

        assert!(summary.stopped);
        assert_eq!(summary.events, 2);
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_unknown_action_is_corrupt() {
        let mut bytes = SegmentBuilder::new().method_enter(7, 0x10).finish();
        bytes.extend_from_slice(&7u16.to_le_bytes());
        bytes.extend_from_slice(&(0x40u32 | 7).to_le_bytes());
        bytes.extend_from_slice(&[0; 16]);

        let mut reader = TraceReader::new(bytes.as_slice()).unwrap();
        assert!(reader.next_event().unwrap().is_some());
        let err = reader.next_event().unwrap_err();
        assert!(
            matches!(err, TraceError::CorruptRecord { offset: 26, .. }),
            "{err:?}"
        );
        // Fused after the error
        assert!(reader.next_event().unwrap().is_none());
    }

    #[test]
    fn test_text_record_without_terminator_room_is_corrupt() {
        let mut bytes = SegmentBuilder::new().finish();
        bytes.extend_from_slice(&7u16.to_le_bytes());
        bytes.extend_from_slice(&((6u32 << 3) | ACTION_MESSAGE).to_le_bytes());
        assert!(matches!(
            collect(&bytes),
            Err(TraceError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut bytes = SegmentBuilder::new().finish();
        bytes.extend_from_slice(&7u16.to_le_bytes());
        bytes.extend_from_slice(&((10u32 << 3) | ACTION_EXCEPTION).to_le_bytes());
        bytes.extend_from_slice(&[b'o', b'k', 0xFF, 0]);

        let events = collect(&bytes).unwrap();
        assert_eq!(
            events,
            vec![Event::ExceptionCaught {
                tid: 7,
                text: "ok\u{FFFD}".into()
            }]
        );
    }

    #[test]
    fn test_decode_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mt_0_data_0.bin");
        std::fs::write(&path, SegmentBuilder::new().ping(9).finish()).unwrap();

        let mut events = Vec::new();
        let summary = decode_file(&path, &mut |e: Event| {
            events.push(e);
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(summary.events, 1);
        assert_eq!(events, vec![Event::Ping { timestamp_ms: 9 }]);
    }
}
