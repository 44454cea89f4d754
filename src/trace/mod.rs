//! MiniTrace binary segments: decoding, rendering and discovery.
//!
//! # Usage
//!
//! ```no_run
//! use std::ops::ControlFlow;
//! use minitrace::trace::{Event, decode_file};
//!
//! let mut enters = 0;
//! decode_file("mt_0/mt_0_data_0.bin".as_ref(), &mut |event: Event| {
//!     if matches!(event, Event::MethodEnter { .. }) {
//!         enters += 1;
//!     }
//!     ControlFlow::Continue(())
//! })?;
//! # Ok::<(), minitrace::trace::TraceError>(())
//! ```

pub mod decode;
pub mod display;
pub mod encode;
pub mod error;
pub mod event;
pub mod files;
pub mod stats;

pub use decode::{DecodeSummary, EventSink, TraceReader, decode, decode_file};
pub use display::{render_event, render_stats};
pub use encode::SegmentBuilder;
pub use error::TraceError;
pub use event::{Event, HEADER_LEN, TRACE_MAGIC, TraceHeader};
pub use files::{SessionFiles, find_bases, segment_base};
pub use stats::SegmentStats;
