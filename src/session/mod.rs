//! Trace-server sessions: status-line parsing, per-process state and file
//! retrieval.

mod error;
mod line_log;
mod protocol;
mod registry;

pub use error::{ProtocolViolation, RegistryError};
pub use line_log::{LINE_LOG_FILE, LineEntry, LineLog};
pub use protocol::{StatusLine, parse_line};
pub use registry::{
    CleanupReport, CloseOutcome, ExtractedSession, ExtractionFailure, Registry, Session,
    SessionState, session_base,
};
