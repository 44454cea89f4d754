//! In-process [`Device`] fake with a scripted file system and process list.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use super::error::DeviceError;
use super::{BackgroundProcess, CommandOutput, Device, LineSource, remote_file_name};

/// One recorded call, in the order the fake received them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Run(String),
    Stream(String),
    Pull(String),
    Remove(String),
    List(String),
    Pids(String),
    Kill(u32),
    Spawn(String),
}

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    processes: BTreeMap<u32, String>,
    calls: Vec<DeviceCall>,
    failing_pulls: BTreeSet<String>,
    failing_list: bool,
    offline: bool,
    script: Vec<(LineSource, String)>,
    /// Process that keeps `stream` open until it is killed
    stream_pid: Option<u32>,
    /// Process `stream` starts, named after the remote command
    stream_spawns: Option<u32>,
    stream_exit: Option<i32>,
}

#[derive(Debug, Default)]
pub struct MemoryDevice {
    state: Mutex<State>,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, remote: &str, contents: impl Into<Vec<u8>>) {
        self.lock().files.insert(remote.to_string(), contents.into());
    }

    pub fn add_process(&self, pid: u32, name: &str) {
        self.lock().processes.insert(pid, name.to_string());
    }

    /// Make `pull(remote)` fail with a command error.
    pub fn fail_pull(&self, remote: &str) {
        self.lock().failing_pulls.insert(remote.to_string());
    }

    pub fn fail_list(&self, failing: bool) {
        self.lock().failing_list = failing;
    }

    /// Every call fails with [`DeviceError::Offline`] while set.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Lines `stream` delivers, then exits with `exit_code`.
    pub fn script_stream(&self, lines: Vec<(LineSource, String)>, exit_code: Option<i32>) {
        let mut state = self.lock();
        state.script = lines;
        state.stream_exit = exit_code;
    }

    /// After the scripted lines, keep `stream` running until process `pid`
    /// is killed or the caller cancels.
    pub fn hold_stream_until_killed(&self, pid: u32) {
        self.lock().stream_pid = Some(pid);
    }

    /// `stream(["shell", program, ..])` starts process `pid` named `program`,
    /// the way `ps` lists a shell-launched binary.
    pub fn stream_starts_process(&self, pid: u32) {
        self.lock().stream_spawns = Some(pid);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.lock().calls.clone()
    }

    pub fn files(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    pub fn processes(&self) -> Vec<(u32, String)> {
        self.lock()
            .processes
            .iter()
            .map(|(pid, name)| (*pid, name.clone()))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Record `call` and fail if the device is offline.
    fn enter(&self, call: DeviceCall) -> Result<std::sync::MutexGuard<'_, State>, DeviceError> {
        let mut state = self.lock();
        let command = format!("{call:?}");
        state.calls.push(call);
        if state.offline {
            return Err(DeviceError::Offline {
                command,
                attempts: 1,
            });
        }
        Ok(state)
    }
}

fn failed(command: String, stderr: &str) -> DeviceError {
    DeviceError::CommandFailed {
        command,
        exit_code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

impl Device for MemoryDevice {
    fn run(&self, args: &[&str], _timeout: Option<Duration>) -> Result<CommandOutput, DeviceError> {
        drop(self.enter(DeviceCall::Run(args.join(" ")))?);
        Ok(CommandOutput::default())
    }

    fn stream(
        &self,
        args: &[&str],
        cancel: &AtomicBool,
        on_line: &mut dyn FnMut(LineSource, &str),
    ) -> Result<Option<i32>, DeviceError> {
        let (script, hold, exit) = {
            let mut state = self.enter(DeviceCall::Stream(args.join(" ")))?;
            if let Some(pid) = state.stream_spawns
                && let ["shell", program, ..] = args
            {
                state.processes.insert(pid, program.to_string());
            }
            (state.script.clone(), state.stream_pid, state.stream_exit)
        };

        for (source, line) in &script {
            if cancel.load(Ordering::Acquire) {
                return Ok(None);
            }
            on_line(*source, line);
        }

        if let Some(pid) = hold {
            loop {
                if cancel.load(Ordering::Acquire) {
                    return Ok(None);
                }
                if !self.lock().processes.contains_key(&pid) {
                    return Ok(exit);
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
        Ok(exit)
    }

    fn pull(&self, remote: &str, local_dir: &Path) -> Result<PathBuf, DeviceError> {
        let state = self.enter(DeviceCall::Pull(remote.to_string()))?;
        if state.failing_pulls.contains(remote) {
            return Err(failed(format!("pull {remote}"), "adb: error: failed to copy"));
        }
        let Some(contents) = state.files.get(remote) else {
            return Err(failed(
                format!("pull {remote}"),
                &format!("adb: error: failed to stat remote object '{remote}': No such file or directory"),
            ));
        };

        let local = local_dir.join(remote_file_name(remote));
        let io_error = |source| DeviceError::Io {
            command: format!("pull {remote}"),
            source,
        };
        std::fs::create_dir_all(local_dir).map_err(io_error)?;
        std::fs::write(&local, contents).map_err(io_error)?;
        Ok(local)
    }

    fn remove(&self, remote: &str) -> Result<(), DeviceError> {
        let mut state = self.enter(DeviceCall::Remove(remote.to_string()))?;
        state.files.remove(remote);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, DeviceError> {
        let state = self.enter(DeviceCall::List(prefix.to_string()))?;
        if state.failing_list {
            return Err(failed(format!("ls {prefix}*"), "ls: Permission denied"));
        }
        Ok(state
            .files
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn pids(&self, name: &str) -> Result<Vec<u32>, DeviceError> {
        let state = self.enter(DeviceCall::Pids(name.to_string()))?;
        Ok(state
            .processes
            .iter()
            .filter(|(_, n)| n.as_str() == name)
            .map(|(pid, _)| *pid)
            .collect())
    }

    fn kill(&self, pid: u32) -> Result<(), DeviceError> {
        let mut state = self.enter(DeviceCall::Kill(pid))?;
        match state.processes.remove(&pid) {
            Some(_) => Ok(()),
            None => Err(failed(format!("kill {pid}"), "No such process")),
        }
    }

    /// Creates the log file; no process is started.
    fn spawn_logged(
        &self,
        args: &[&str],
        log_path: &Path,
    ) -> Result<BackgroundProcess, DeviceError> {
        let command = args.join(" ");
        drop(self.enter(DeviceCall::Spawn(command.clone()))?);
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|source| DeviceError::Io {
                command: command.clone(),
                source,
            })?;
        Ok(BackgroundProcess::new(command, None))
    }
}
