//! Talking to the device under test.
//!
//! [`Device`] is the seam between the trace machinery and the bridge binary.
//! [`Adb`] is the real implementation; [`MemoryDevice`] is an in-process fake
//! for tests and dry runs.

mod adb;
mod error;
mod memory;
mod pacer;

use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

pub use adb::{Adb, OfflineRetry};
pub use error::{DeviceError, is_offline_output};
pub use memory::{DeviceCall, MemoryDevice};
pub use pacer::Pacer;

/// Which stream a line from a long-running command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LineSource {
    Stdout,
    Stderr,
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Operations the trace run needs from a device.
///
/// `args` are bridge arguments (`["shell", "ls /data"]`), not a shell string.
/// Remote paths are passed through unmodified; implementations quote them.
pub trait Device: Send + Sync {
    /// Run a short command to completion. Non-zero exit is an error.
    fn run(&self, args: &[&str], timeout: Option<Duration>) -> Result<CommandOutput, DeviceError>;

    /// Run a long command, handing each output line to `on_line` as it arrives.
    ///
    /// Returns the exit code (`None` when killed). Setting `cancel` kills the
    /// local process; lines already read are still delivered.
    fn stream(
        &self,
        args: &[&str],
        cancel: &AtomicBool,
        on_line: &mut dyn FnMut(LineSource, &str),
    ) -> Result<Option<i32>, DeviceError>;

    /// Copy `remote` into `local_dir`, returning the local file path.
    fn pull(&self, remote: &str, local_dir: &Path) -> Result<PathBuf, DeviceError>;

    fn remove(&self, remote: &str) -> Result<(), DeviceError>;

    /// Remote paths starting with `prefix`, sorted. A missing directory is empty.
    fn list(&self, prefix: &str) -> Result<Vec<String>, DeviceError>;

    /// Ids of processes whose name is `name`.
    fn pids(&self, name: &str) -> Result<Vec<u32>, DeviceError>;

    fn kill(&self, pid: u32) -> Result<(), DeviceError>;

    /// Start a bridge command in the background with stdout and stderr
    /// appended to `log_path`. The process runs until the handle is dropped.
    fn spawn_logged(&self, args: &[&str], log_path: &Path)
    -> Result<BackgroundProcess, DeviceError>;
}

/// A local background process. Dropping it kills the process.
#[derive(Debug)]
pub struct BackgroundProcess {
    command: String,
    child: Option<Child>,
}

impl BackgroundProcess {
    pub fn new(command: String, child: Option<Child>) -> Self {
        Self { command, child }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Whether the process is still alive. Handles without a local process
    /// are always running.
    pub fn is_running(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    pub fn stop(mut self) {
        self.kill();
    }

    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            log::debug!("Stopping `{}`", self.command);
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Kill every process named `name`, logging failures.
///
/// Returns how many kills succeeded.
pub fn kill_all(device: &dyn Device, name: &str) -> usize {
    let pids = match device.pids(name) {
        Ok(pids) => pids,
        Err(e) => {
            log::warn!("Failed to list {name} processes: {e}");
            return 0;
        }
    };

    pids.into_iter()
        .filter(|&pid| match device.kill(pid) {
            Ok(()) => {
                log::debug!("Killed {name} (pid {pid})");
                true
            }
            Err(e) => {
                log::warn!("Failed to kill {name} (pid {pid}): {e}");
                false
            }
        })
        .count()
}

/// Final path component of a remote path.
pub(crate) fn remote_file_name(remote: &str) -> &str {
    remote.rsplit('/').next().unwrap_or(remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_all() {
        let device = MemoryDevice::new();
        device.add_process(10, "/data/local/tmp/mtserver");
        device.add_process(11, "/data/local/tmp/mtserver");
        device.add_process(12, "com.example");

        assert_eq!(kill_all(&device, "/data/local/tmp/mtserver"), 2);
        assert_eq!(device.processes(), vec![(12, "com.example".to_string())]);
    }

    #[test]
    fn test_remote_file_name() {
        assert_eq!(remote_file_name("/data/local/tmp/mt_0_data_0.bin"), "mt_0_data_0.bin");
        assert_eq!(remote_file_name("plain"), "plain");
    }

    #[test]
    fn test_line_source_display() {
        assert_eq!(LineSource::Stderr.to_string(), "stderr");
    }
}
