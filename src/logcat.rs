//! Device log captured next to a trace run.
//!
//! The shadow has no graceful stop: it runs until its handle is dropped,
//! which kills the local `logcat` process.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::device::{BackgroundProcess, Device};

pub const LOGCAT_FILE: &str = "logcat.txt";

const CLEAR_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct LogShadow {
    process: BackgroundProcess,
    path: PathBuf,
}

impl LogShadow {
    /// Clear the device log buffer and start `logcat <filter>` into
    /// `<output_dir>/logcat.txt`.
    pub fn start(device: &dyn Device, filter: &str, output_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        // A stale buffer only adds noise to the capture
        if let Err(e) = device.run(&["logcat", "-c"], Some(CLEAR_TIMEOUT)) {
            log::warn!("Failed to clear device log: {e}");
        }

        let path = output_dir.join(LOGCAT_FILE);
        let mut args = vec!["logcat"];
        args.extend(filter.split_whitespace());
        let process = device
            .spawn_logged(&args, &path)
            .context("Failed to start log shadow")?;
        log::info!("Capturing device log to {}", path.display());
        Ok(Self { process, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&mut self) -> bool {
        self.process.is_running()
    }

    pub fn stop(self) {
        self.process.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_LOGCAT_FILTER;
    use crate::device::{DeviceCall, MemoryDevice};

    #[test]
    fn test_clears_then_spawns_with_filter() {
        let device = MemoryDevice::new();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out");

        let shadow = LogShadow::start(&device, DEFAULT_LOGCAT_FILTER, &output).unwrap();
        assert_eq!(shadow.path(), output.join(LOGCAT_FILE));
        assert!(shadow.path().exists());

        let calls = device.calls();
        assert_eq!(calls[0], DeviceCall::Run("logcat -c".into()));
        assert_eq!(
            calls[1],
            DeviceCall::Spawn(format!("logcat {DEFAULT_LOGCAT_FILTER}"))
        );
        shadow.stop();
    }

    #[test]
    fn test_offline_device_fails_to_start() {
        let device = MemoryDevice::new();
        device.set_offline(true);
        let dir = tempfile::tempdir().unwrap();
        let err = LogShadow::start(&device, "*:S", dir.path()).unwrap_err();
        assert_eq!(err.to_string(), "Failed to start log shadow");
    }
}
