//! Trace decoding errors.
//!
//! Truncation is deliberately absent: a short read is how a segment that is
//! still being written ends, so the decoder stops without an error.

/// Fatal problems with one trace segment.
///
/// These abort the current file only; callers decoding several segments log
/// the error and move on to the next one.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// The first four bytes are not the trace tag, or the header is unusable
    #[error("not a trace segment: {reason}")]
    FormatMismatch { reason: String },

    /// A record that cannot be a valid encoding (not merely cut short)
    #[error("corrupt record at byte {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: String },

    #[error("failed to read trace data")]
    Io(#[from] std::io::Error),
}

impl TraceError {
    pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        TraceError::CorruptRecord {
            offset,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = TraceError::FormatMismatch {
            reason: "magic b\"SLOW\"".into(),
        };
        assert_eq!(err.to_string(), "not a trace segment: magic b\"SLOW\"");

        let err = TraceError::corrupt(26, "unknown action 7");
        assert_eq!(err.to_string(), "corrupt record at byte 26: unknown action 7");
    }
}
