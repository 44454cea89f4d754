//! [`Device`] over the `adb` binary.

use std::borrow::Cow;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use wait_timeout::ChildExt;

use super::error::{DeviceError, is_offline_output};
use super::pacer::Pacer;
use super::{BackgroundProcess, CommandOutput, Device, LineSource, remote_file_name};

/// Bound for bookkeeping commands (`ls`, `rm`, `ps`, `kill`).
const SHORT_TIMEOUT: Duration = Duration::from_secs(30);

/// How often `stream` checks its cancel flag while no output arrives.
const STREAM_POLL: Duration = Duration::from_millis(100);

/// Bridge restarts allowed when adb reports the device offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfflineRetry {
    pub retries: u32,
    /// Sleep after the first restart; doubled after each further one
    pub backoff: Duration,
}

impl Default for OfflineRetry {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: Duration::from_millis(200),
        }
    }
}

impl OfflineRetry {
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Debug, Clone)]
pub struct Adb {
    binary: PathBuf,
    serial: Option<String>,
    retry: OfflineRetry,
    pacer: Option<Pacer>,
}

impl Adb {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            serial: None,
            retry: OfflineRetry::default(),
            pacer: None,
        }
    }

    /// Target one device (`adb -s <serial>`).
    pub fn with_serial(mut self, serial: Option<String>) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_offline_retry(mut self, retry: OfflineRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Space short commands at least `interval` apart. Zero disables pacing.
    pub fn with_command_interval(mut self, interval: Duration) -> Self {
        self.pacer = (!interval.is_zero()).then(|| Pacer::new(interval));
        self
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(serial) = &self.serial {
            cmd.args(["-s", serial]);
        }
        cmd.args(args);
        cmd
    }

    fn describe(&self, args: &[&str]) -> String {
        let mut parts = vec![self.binary.to_string_lossy().into_owned()];
        if let Some(serial) = &self.serial {
            parts.push("-s".to_string());
            parts.push(serial.clone());
        }
        parts.extend(args.iter().map(|a| a.to_string()));
        parts.join(" ")
    }

    /// One attempt: spawn, collect output, honor the timeout.
    fn run_once(
        &self,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<(Option<i32>, CommandOutput), DeviceError> {
        let command = self.describe(args);
        log::debug!("$ {command}");
        let io_error = |source| DeviceError::Io {
            command: command.clone(),
            source,
        };

        let mut child = self
            .command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(io_error)?;

        // Drain both pipes on threads so a chatty command can't fill one and block
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_thread = thread::spawn(move || read_lossy(stdout));
        let stderr_thread = thread::spawn(move || read_lossy(stderr));

        let status = match timeout {
            Some(limit) => match child.wait_timeout(limit) {
                Ok(Some(status)) => status,
                Ok(None) => {
                    log::debug!("`{command}` timed out after {limit:?}");
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_thread.join();
                    let _ = stderr_thread.join();
                    return Err(DeviceError::Timeout {
                        command,
                        timeout: limit,
                    });
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(io_error(e));
                }
            },
            None => child.wait().map_err(io_error)?,
        };

        let output = CommandOutput {
            stdout: stdout_thread.join().unwrap_or_default(),
            stderr: stderr_thread.join().unwrap_or_default(),
        };
        Ok((status.code(), output))
    }

    /// Restart the adb server. Failures are logged; the retry will surface them.
    fn reset_bridge(&self) {
        for args in [["kill-server"], ["start-server"]] {
            let result = Command::new(&self.binary)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if let Err(e) = result {
                log::warn!("Failed to run adb {}: {e}", args[0]);
            }
        }
    }

    fn shell(&self, script: &str) -> Result<CommandOutput, DeviceError> {
        self.run(&["shell", script], Some(SHORT_TIMEOUT))
    }
}

impl Device for Adb {
    fn run(&self, args: &[&str], timeout: Option<Duration>) -> Result<CommandOutput, DeviceError> {
        let command = self.describe(args);

        for attempt in 0..=self.retry.retries {
            if let Some(pacer) = &self.pacer {
                pacer.wait();
            }

            let (exit_code, output) = self.run_once(args, timeout)?;

            if is_offline_output(&output.stderr) {
                if attempt == self.retry.retries {
                    break;
                }
                let delay = self.retry.delay(attempt);
                log::warn!(
                    "Device offline during `{command}`; restarting adb and retrying in {delay:?} ({}/{})",
                    attempt + 1,
                    self.retry.retries
                );
                self.reset_bridge();
                thread::sleep(delay);
                continue;
            }

            if exit_code != Some(0) {
                return Err(DeviceError::CommandFailed {
                    command,
                    exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                });
            }
            return Ok(output);
        }

        Err(DeviceError::Offline {
            command,
            attempts: self.retry.retries + 1,
        })
    }

    fn stream(
        &self,
        args: &[&str],
        cancel: &AtomicBool,
        on_line: &mut dyn FnMut(LineSource, &str),
    ) -> Result<Option<i32>, DeviceError> {
        let command = self.describe(args);
        log::debug!("$ {command} (streaming)");
        let io_error = |source| DeviceError::Io {
            command: command.clone(),
            source,
        };

        let mut child = self
            .command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(io_error)?;

        let (tx, rx) = crossbeam_channel::unbounded::<(LineSource, String)>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, LineSource::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, LineSource::Stderr, tx.clone()));
        }
        drop(tx);

        let mut killed = false;
        let mut offline = false;
        loop {
            match rx.recv_timeout(STREAM_POLL) {
                Ok((source, line)) => {
                    if source == LineSource::Stderr && is_offline_output(&line) {
                        offline = true;
                    }
                    on_line(source, &line);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !killed && cancel.load(Ordering::Acquire) {
                        log::debug!("Cancelling `{command}`");
                        let _ = child.kill();
                        killed = true;
                    }
                }
                // Both pipes closed
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = child.wait().map_err(io_error)?;
        for reader in readers {
            let _ = reader.join();
        }
        log::debug!("`{command}` exited with {status}");

        if offline && !killed && !status.success() {
            return Err(DeviceError::Offline {
                command,
                attempts: 1,
            });
        }
        Ok(status.code())
    }

    fn pull(&self, remote: &str, local_dir: &Path) -> Result<PathBuf, DeviceError> {
        std::fs::create_dir_all(local_dir).map_err(|source| DeviceError::Io {
            command: format!("mkdir {}", local_dir.display()),
            source,
        })?;
        let local = local_dir.to_string_lossy();
        self.run(&["pull", remote, &local], None)?;
        Ok(local_dir.join(remote_file_name(remote)))
    }

    fn remove(&self, remote: &str) -> Result<(), DeviceError> {
        self.shell(&format!("rm -f {}", quote(remote)))?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, DeviceError> {
        let output = match self.shell(&format!("ls -d {}*", quote(prefix))) {
            Ok(output) => output,
            // Nothing matched, or the directory doesn't exist yet
            Err(DeviceError::CommandFailed { stdout, stderr, .. })
                if is_missing(&stderr) || is_missing(&stdout) =>
            {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        Ok(parse_listing(&output.stdout, prefix))
    }

    fn pids(&self, name: &str) -> Result<Vec<u32>, DeviceError> {
        let output = self.shell("ps -A")?;
        let mut pids = parse_ps(&output.stdout, name);
        // Pre-O toybox `ps` lists everything and rejects -A
        if pids.is_empty() && output.stdout.lines().count() <= 1 {
            pids = parse_ps(&self.shell("ps")?.stdout, name);
        }
        Ok(pids)
    }

    fn kill(&self, pid: u32) -> Result<(), DeviceError> {
        self.shell(&format!("kill {pid}"))?;
        Ok(())
    }

    fn spawn_logged(
        &self,
        args: &[&str],
        log_path: &Path,
    ) -> Result<BackgroundProcess, DeviceError> {
        let command = self.describe(args);
        log::debug!("$ {command} > {}", log_path.display());
        let io_error = |source| DeviceError::Io {
            command: command.clone(),
            source,
        };

        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(io_error)?;
        let child = self
            .command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file.try_clone().map_err(io_error)?))
            .stderr(Stdio::from(log_file))
            .spawn()
            .map_err(io_error)?;
        Ok(BackgroundProcess::new(command, Some(child)))
    }
}

fn read_lossy(pipe: Option<impl Read>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn forward_lines(
    pipe: impl Read + Send + 'static,
    source: LineSource,
    tx: crossbeam_channel::Sender<(LineSource, String)>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send((source, line)).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn quote(remote: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(remote))
}

fn is_missing(output: &str) -> bool {
    output.contains("No such file")
}

/// Keep lines naming files under `prefix`; older adb prints errors to stdout.
fn parse_listing(stdout: &str, prefix: &str) -> Vec<String> {
    let mut files: Vec<String> = stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(prefix) && !is_missing(line))
        .map(str::to_string)
        .collect();
    files.sort();
    files
}

/// Second column of `ps` rows whose last column is `name`.
fn parse_ps(stdout: &str, name: &str) -> Vec<u32> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            match columns.as_slice() {
                [_, pid, .., last] if *last == name => pid.parse().ok(),
                _ => None,
            }
        })
        .collect()
}
