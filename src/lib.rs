//! Collect MiniTrace method traces from an Android device and turn them into
//! per-message and per-idle-period method statistics.
//!
//! The pieces, bottom up:
//!
//! - [`trace`] decodes binary trace segments into [`trace::Event`]s;
//! - [`symbols`] loads the thread, method and field tables written alongside;
//! - [`aggregate`] folds events into message and idle tables;
//! - [`device`] talks to the device through `adb`;
//! - [`session`] follows the trace server's status lines and pulls each
//!   traced process's files when it finishes;
//! - [`run`] ties a whole trace-server invocation together.

pub mod aggregate;
pub mod analysis;
pub mod config;
pub mod device;
pub mod logcat;
pub mod run;
pub mod session;
pub mod symbols;
pub mod trace;
