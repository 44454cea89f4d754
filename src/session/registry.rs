//! Per-process session state driven by trace-server status lines.
//!
//! ```text
//! Connected ──> Constructed ──PrefixSelected──> Running ──Closed──> (removed)
//!                    │                             │
//!                    └──────── clean_up ───────────┴──────────────> (removed)
//! ```
//!
//! `FileReleased` keeps a session in `Running`. There is no edge back to
//! `Constructed`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::error::{ProtocolViolation, RegistryError};
use super::line_log::{LINE_LOG_FILE, LineLog};
use super::protocol::{StatusLine, parse_line};
use crate::device::{Device, DeviceError, LineSource, kill_all, remote_file_name};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Connected; the runtime has not picked its file prefix yet
    Constructed,
    Running { prefix: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub pid: u32,
    pub state: SessionState,
    /// Local copies of files released mid-session
    pub released: Vec<PathBuf>,
}

/// A session whose files were all pulled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedSession {
    pub socket: u32,
    pub pid: u32,
    pub prefix: String,
    /// File-name prefix inside `dir`, e.g. `mt_0_`
    pub base: String,
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
}

/// A close whose retrieval failed; any files pulled during it were deleted.
#[derive(Debug)]
pub struct ExtractionFailure {
    pub socket: u32,
    pub pid: u32,
    pub prefix: String,
    pub error: DeviceError,
}

#[derive(Debug)]
pub enum CloseOutcome {
    Extracted(ExtractedSession),
    Failed(ExtractionFailure),
}

impl CloseOutcome {
    pub fn socket(&self) -> u32 {
        match self {
            CloseOutcome::Extracted(s) => s.socket,
            CloseOutcome::Failed(f) => f.socket,
        }
    }

    pub fn extracted(&self) -> Option<&ExtractedSession> {
        match self {
            CloseOutcome::Extracted(s) => Some(s),
            CloseOutcome::Failed(_) => None,
        }
    }
}

/// What [`Registry::clean_up`] did.
#[derive(Debug)]
pub struct CleanupReport {
    pub reason: String,
    pub servers_killed: usize,
    /// Running sessions closed during cleanup
    pub closed: Vec<CloseOutcome>,
    /// `(socket, pid)` of sessions that never received a prefix
    pub abandoned: Vec<(u32, u32)>,
    pub line_log: Option<PathBuf>,
}

/// Session bookkeeping for one trace-server invocation.
pub struct Registry {
    device: Arc<dyn Device>,
    output_dir: PathBuf,
    server_process: String,
    sessions: BTreeMap<u32, Session>,
    lines: LineLog,
    ready: Arc<AtomicBool>,
    cleaned_up: bool,
}

impl Registry {
    /// `server_process` is the server as `ps` lists it (its full path on the
    /// device); every process with that name is killed on cleanup.
    pub fn new(device: Arc<dyn Device>, output_dir: &Path, server_process: &str) -> Self {
        Self {
            device,
            output_dir: output_dir.to_path_buf(),
            server_process: server_process.to_string(),
            sessions: BTreeMap::new(),
            lines: LineLog::new(),
            ready: Arc::new(AtomicBool::new(false)),
            cleaned_up: false,
        }
    }

    /// Share `ready` with a workload driver created before the registry.
    pub fn with_ready_flag(mut self, ready: Arc<AtomicBool>) -> Self {
        self.ready = ready;
        self
    }

    /// Set once the server reports it is accepting connections.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up
    }

    pub fn sessions(&self) -> &BTreeMap<u32, Session> {
        &self.sessions
    }

    pub fn session(&self, socket: u32) -> Option<&Session> {
        self.sessions.get(&socket)
    }

    pub fn line_log(&self) -> &LineLog {
        &self.lines
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Journal and apply one server line.
    ///
    /// Returns the outcome when the line closed a session. On stderr only the
    /// readiness line counts; connection lines there are journaled and
    /// otherwise ignored.
    pub fn handle_line(
        &mut self,
        source: LineSource,
        line: &str,
    ) -> Result<Option<CloseOutcome>, RegistryError> {
        let status = match (source, parse_line(line)) {
            (LineSource::Stdout, status) => status,
            (LineSource::Stderr, ready @ StatusLine::ServerReady { .. }) => ready,
            (LineSource::Stderr, _) => StatusLine::Informational,
        };
        self.lines.record(source, status.kind(), line);

        match status {
            StatusLine::ServerReady { uid } => {
                log::info!("Trace server ready (uid {uid})");
                self.ready.store(true, Ordering::Release);
            }
            StatusLine::Connected { socket, pid } => self.new_connection(socket, pid)?,
            StatusLine::PrefixSelected { socket, prefix } => self.give_prefix(socket, &prefix)?,
            StatusLine::FileReleased { socket, file } => {
                self.release_file(socket, &file)?;
            }
            StatusLine::Closed { socket, prefix } => {
                return Ok(Some(self.close_connection(socket, &prefix)?));
            }
            StatusLine::Informational => log::debug!("server [{source}]: {line}"),
        }
        Ok(None)
    }

    pub fn new_connection(&mut self, socket: u32, pid: u32) -> Result<(), ProtocolViolation> {
        if self.sessions.contains_key(&socket) {
            return Err(ProtocolViolation::DuplicateConnection { socket });
        }
        log::debug!("Socket {socket}: connection from pid {pid}");
        self.sessions.insert(
            socket,
            Session {
                pid,
                state: SessionState::Constructed,
                released: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn give_prefix(&mut self, socket: u32, prefix: &str) -> Result<(), ProtocolViolation> {
        let session = self
            .sessions
            .get_mut(&socket)
            .ok_or(ProtocolViolation::UnknownSocket { socket })?;
        if let SessionState::Running { prefix: existing } = &session.state {
            return Err(ProtocolViolation::PrefixAlreadySet {
                socket,
                prefix: existing.clone(),
            });
        }
        log::info!("Socket {socket}: pid {} traces to {prefix}", session.pid);
        session.state = SessionState::Running {
            prefix: prefix.to_string(),
        };
        Ok(())
    }

    /// Pull one finished file mid-session and delete it from the device.
    pub fn release_file(&mut self, socket: u32, file: &str) -> Result<PathBuf, RegistryError> {
        let prefix = self.running_prefix(socket)?.to_string();
        if !file.starts_with(&prefix) {
            return Err(ProtocolViolation::FileOutsidePrefix {
                socket,
                file: file.to_string(),
                prefix,
            }
            .into());
        }

        let dir = self.session_dir(socket, &prefix);
        let local = self.device.pull(file, &dir)?;
        self.device.remove(file)?;
        log::debug!("Socket {socket}: released {file} -> {}", local.display());

        if let Some(session) = self.sessions.get_mut(&socket) {
            session.released.push(local.clone());
        }
        Ok(local)
    }

    /// Pull everything left under `prefix` and remove the session.
    ///
    /// Retrieval failures don't raise: the files pulled by this call are
    /// deleted locally and the failure is returned as the outcome.
    pub fn close_connection(
        &mut self,
        socket: u32,
        prefix: &str,
    ) -> Result<CloseOutcome, ProtocolViolation> {
        let expected = self.running_prefix(socket)?;
        if expected != prefix {
            return Err(ProtocolViolation::PrefixMismatch {
                socket,
                expected: expected.to_string(),
                given: prefix.to_string(),
            });
        }

        let Some(session) = self.sessions.remove(&socket) else {
            return Err(ProtocolViolation::UnknownSocket { socket });
        };
        Ok(self.extract(socket, session.pid, prefix, session.released))
    }

    /// Kill the server, close every session and write the line journal.
    ///
    /// Runs once; later calls, including [`abort`](Self::abort), return `None`.
    pub fn clean_up(&mut self, reason: &str) -> Option<CleanupReport> {
        self.shut_down(reason, log::Level::Info)
    }

    /// [`clean_up`](Self::clean_up) after a failure: the line history is
    /// logged as a warning.
    pub fn abort(&mut self, reason: &str) -> Option<CleanupReport> {
        self.shut_down(reason, log::Level::Warn)
    }

    fn shut_down(&mut self, reason: &str, history: log::Level) -> Option<CleanupReport> {
        if self.cleaned_up {
            log::debug!("Cleanup already done; ignoring ({reason})");
            return None;
        }
        self.cleaned_up = true;
        log::info!("Cleaning up trace run: {reason}");

        let servers_killed = kill_all(self.device.as_ref(), &self.server_process);

        let mut closed = Vec::new();
        let mut abandoned = Vec::new();
        for (socket, session) in std::mem::take(&mut self.sessions) {
            match session.state {
                SessionState::Running { prefix } => {
                    let outcome = self.extract(socket, session.pid, &prefix, session.released);
                    closed.push(outcome);
                }
                SessionState::Constructed => {
                    log::warn!(
                        "Socket {socket}: pid {} never selected a prefix; nothing to retrieve",
                        session.pid
                    );
                    abandoned.push((socket, session.pid));
                }
            }
        }

        self.lines.dump(reason, history);
        let path = self.output_dir.join(LINE_LOG_FILE);
        let line_log = match self.lines.write_jsonl(&path) {
            Ok(()) => Some(path),
            Err(e) => {
                log::warn!("Failed to write server line log: {e:#}");
                None
            }
        };

        Some(CleanupReport {
            reason: reason.to_string(),
            servers_killed,
            closed,
            abandoned,
            line_log,
        })
    }

    fn running_prefix(&self, socket: u32) -> Result<&str, ProtocolViolation> {
        match self.sessions.get(&socket) {
            None => Err(ProtocolViolation::UnknownSocket { socket }),
            Some(Session {
                state: SessionState::Constructed,
                ..
            }) => Err(ProtocolViolation::NotRunning { socket }),
            Some(Session {
                state: SessionState::Running { prefix },
                ..
            }) => Ok(prefix),
        }
    }

    /// Local area for a prefix: `/data/local/tmp/mt_0_` -> `<output>/mt_0/`.
    fn session_dir(&self, socket: u32, prefix: &str) -> PathBuf {
        let name = session_base(prefix).trim_end_matches('_');
        if name.is_empty() {
            self.output_dir.join(format!("session_{socket}"))
        } else {
            self.output_dir.join(name)
        }
    }

    fn extract(
        &self,
        socket: u32,
        pid: u32,
        prefix: &str,
        released: Vec<PathBuf>,
    ) -> CloseOutcome {
        let dir = self.session_dir(socket, prefix);
        match self.pull_all(prefix, &dir) {
            Ok(pulled) => {
                let mut files = released;
                files.extend(pulled);
                log::info!(
                    "Socket {socket}: retrieved {} file(s) into {}",
                    files.len(),
                    dir.display()
                );
                CloseOutcome::Extracted(ExtractedSession {
                    socket,
                    pid,
                    prefix: prefix.to_string(),
                    base: session_base(prefix).to_string(),
                    dir,
                    files,
                })
            }
            Err(error) => {
                log::error!("Socket {socket}: retrieval of {prefix}* failed: {error}");
                CloseOutcome::Failed(ExtractionFailure {
                    socket,
                    pid,
                    prefix: prefix.to_string(),
                    error,
                })
            }
        }
    }

    /// Pull every remote file under `prefix`, then delete them remotely.
    ///
    /// On a failed pull the local copies made by this call are removed and the
    /// device is left as it was.
    fn pull_all(&self, prefix: &str, dir: &Path) -> Result<Vec<PathBuf>, DeviceError> {
        // `list` matches by string prefix; never touch anything else
        let remote_files: Vec<String> = self
            .device
            .list(prefix)?
            .into_iter()
            .filter(|remote| {
                let inside = remote.starts_with(prefix);
                if !inside {
                    log::warn!("Skipping {remote}: outside {prefix}");
                }
                inside
            })
            .collect();

        let mut pulled = Vec::with_capacity(remote_files.len());
        for remote in &remote_files {
            match self.device.pull(remote, dir) {
                Ok(local) => pulled.push(local),
                Err(e) => {
                    for local in &pulled {
                        if let Err(rm) = fs::remove_file(local) {
                            log::debug!("Failed to remove partial {}: {rm}", local.display());
                        }
                    }
                    return Err(e);
                }
            }
        }

        for remote in &remote_files {
            if let Err(e) = self.device.remove(remote) {
                log::warn!("Pulled {remote} but failed to delete it: {e}");
            }
        }

        Ok(pulled)
    }
}

/// Last path component of a prefix: `/data/local/tmp/mt_0_` -> `mt_0_`.
pub fn session_base(prefix: &str) -> &str {
    remote_file_name(prefix)
}
