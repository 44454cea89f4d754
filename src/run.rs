//! One trace-server invocation, end to end.
//!
//! The server command streams on its own thread; every line crosses a channel
//! to the calling thread, which owns the [`Registry`] and applies lines in
//! arrival order. Whatever ends the loop, the registry is cleaned up exactly
//! once, and the sessions it extracted are then analyzed in parallel.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::RecvTimeoutError;
use rayon::prelude::*;

use crate::aggregate::AggregateOptions;
use crate::analysis::{SessionAnalysis, analyze_session};
use crate::config::Config;
use crate::device::{Device, DeviceError, LineSource, kill_all};
use crate::logcat::LogShadow;
use crate::session::{
    CleanupReport, CloseOutcome, ExtractedSession, ExtractionFailure, Registry, RegistryError,
};

/// How often the consumer checks deadlines and stop flags while idle.
const POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub package: String,
    pub server_path: String,
    pub log_flags: String,
    pub output_dir: PathBuf,
    /// Stop after this long; `None` runs until the server exits.
    pub duration: Option<Duration>,
    pub ready_timeout: Duration,
    /// `None` disables the log shadow.
    pub logcat_filter: Option<String>,
    pub aggregate: AggregateOptions,
}

impl RunOptions {
    pub fn from_config(config: &Config, package: &str) -> Self {
        Self {
            package: package.to_string(),
            server_path: config.server_path.clone(),
            log_flags: config.log_flags.clone(),
            output_dir: config.output_dir.clone(),
            duration: None,
            ready_timeout: config.ready_timeout(),
            logcat_filter: Some(config.logcat_filter.clone()),
            aggregate: config.aggregate_options(),
        }
    }
}

/// Why the consumer loop stopped.
#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum RunEnd {
    ServerExited { code: Option<i32> },
    DurationElapsed,
    Interrupted,
    /// The server never reported readiness in time
    NotReady,
    ProtocolError(String),
    DeviceError(String),
}

impl RunEnd {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            RunEnd::NotReady | RunEnd::ProtocolError(_) | RunEnd::DeviceError(_)
        )
    }

    fn describe(&self) -> String {
        match self {
            RunEnd::ServerExited { code: Some(code) } => format!("server exited with {code}"),
            RunEnd::ServerExited { code: None } => "server was killed".to_string(),
            RunEnd::DurationElapsed => "run duration elapsed".to_string(),
            RunEnd::Interrupted => "interrupted".to_string(),
            RunEnd::NotReady => "server not ready in time".to_string(),
            RunEnd::ProtocolError(e) => format!("protocol error: {e}"),
            RunEnd::DeviceError(e) => format!("device error: {e}"),
        }
    }
}

impl std::fmt::Display for RunEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Analysis result for one extracted session.
#[derive(Debug)]
pub struct SessionResult {
    pub session: ExtractedSession,
    pub analysis: anyhow::Result<SessionAnalysis>,
}

#[derive(Debug)]
pub struct RunReport {
    pub end: RunEnd,
    pub ready: bool,
    pub lines: usize,
    pub servers_killed: usize,
    pub sessions: Vec<SessionResult>,
    pub extraction_failures: Vec<ExtractionFailure>,
    /// `(socket, pid)` of connections that never selected a prefix
    pub abandoned: Vec<(u32, u32)>,
    pub line_log: Option<PathBuf>,
    pub logcat: Option<PathBuf>,
}

impl RunReport {
    pub fn analyzed(&self) -> impl Iterator<Item = &SessionAnalysis> {
        self.sessions.iter().filter_map(|s| s.analysis.as_ref().ok())
    }

    pub fn failed_analyses(&self) -> usize {
        self.sessions.iter().filter(|s| s.analysis.is_err()).count()
    }
}

/// Hands the readiness flag to a workload driver.
///
/// If readiness is not observed within the wait, the waiter asks the run to
/// terminate the server.
#[derive(Debug, Clone)]
pub struct ReadyWaiter {
    ready: Arc<AtomicBool>,
    give_up: Arc<AtomicBool>,
}

impl ReadyWaiter {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Block until the server is ready. Returns `false`, and forces
    /// termination, if `timeout` passes first.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_ready() {
                return true;
            }
            thread::sleep(POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
        if self.is_ready() {
            return true;
        }
        log::warn!("Trace server not ready after {timeout:?}; terminating it");
        self.give_up.store(true, Ordering::Release);
        false
    }
}

enum ServerEvent {
    Line(LineSource, String),
    Exited(Result<Option<i32>, DeviceError>),
}

pub struct TraceRun {
    device: Arc<dyn Device>,
    options: RunOptions,
    ready: Arc<AtomicBool>,
    give_up: Arc<AtomicBool>,
    interrupt: Arc<AtomicBool>,
}

impl TraceRun {
    pub fn new(device: Arc<dyn Device>, options: RunOptions) -> Self {
        Self {
            device,
            options,
            ready: Arc::new(AtomicBool::new(false)),
            give_up: Arc::new(AtomicBool::new(false)),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn ready_waiter(&self) -> ReadyWaiter {
        ReadyWaiter {
            ready: Arc::clone(&self.ready),
            give_up: Arc::clone(&self.give_up),
        }
    }

    /// Setting this flag ends the run as [`RunEnd::Interrupted`].
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// End the run on SIGINT or SIGTERM.
    ///
    /// A signal that arrives while the interrupt flag is already set exits the
    /// process: a second Ctrl-C, or any signal once the server lines are done.
    #[cfg(unix)]
    pub fn interrupt_on_signals(&self) -> anyhow::Result<()> {
        use signal_hook::consts::{SIGINT, SIGTERM};
        for signal in [SIGINT, SIGTERM] {
            // Registered first so it sees the flag before this signal sets it
            signal_hook::flag::register_conditional_shutdown(
                signal,
                128 + signal,
                Arc::clone(&self.interrupt),
            )
            .context("Failed to install signal handler")?;
            signal_hook::flag::register(signal, Arc::clone(&self.interrupt))
                .context("Failed to install signal handler")?;
        }
        Ok(())
    }

    pub fn run(self) -> anyhow::Result<RunReport> {
        let options = &self.options;
        std::fs::create_dir_all(&options.output_dir)
            .with_context(|| format!("Failed to create {}", options.output_dir.display()))?;

        let stale = kill_all(self.device.as_ref(), &options.server_path);
        if stale > 0 {
            log::info!("Killed {stale} stale trace server(s)");
        }

        let shadow = match &options.logcat_filter {
            Some(filter) => match LogShadow::start(self.device.as_ref(), filter, &options.output_dir) {
                Ok(shadow) => Some(shadow),
                Err(e) => {
                    log::warn!("Running without device log: {e:#}");
                    None
                }
            },
            None => None,
        };

        let mut registry = Registry::new(
            Arc::clone(&self.device),
            &options.output_dir,
            &options.server_path,
        )
        .with_ready_flag(Arc::clone(&self.ready));

        let cancel = AtomicBool::new(false);
        let (tx, rx) = crossbeam_channel::unbounded();
        let args = [
            "shell",
            options.server_path.as_str(),
            "server",
            options.package.as_str(),
            options.log_flags.as_str(),
        ];
        log::info!("Starting trace server for {}", options.package);

        let (end, closed, cleanup) = thread::scope(|scope| {
            let device = self.device.as_ref();
            let cancel = &cancel;
            let server = thread::Builder::new()
                .name("trace-server".to_string())
                .spawn_scoped(scope, move || {
                    let result = device.stream(&args, cancel, &mut |source, line| {
                        let _ = tx.send(ServerEvent::Line(source, line.to_string()));
                    });
                    let _ = tx.send(ServerEvent::Exited(result));
                });
            let server = match server {
                Ok(handle) => handle,
                Err(e) => {
                    let end = RunEnd::DeviceError(format!("failed to start server thread: {e}"));
                    let cleanup = registry.abort(&end.describe());
                    return (end, Vec::new(), cleanup);
                }
            };

            let (end, closed) = self.consume(&mut registry, &rx);
            let cleanup = if end.is_failure() {
                log::error!("Trace run aborted: {end}");
                registry.abort(&end.describe())
            } else {
                registry.clean_up(&end.describe())
            };

            cancel.store(true, Ordering::Release);
            if server.join().is_err() {
                log::error!("Trace server thread panicked");
            }
            (end, closed, cleanup)
        });

        // Nothing is left to interrupt; later signals exit
        self.interrupt.store(true, Ordering::Release);

        let logcat = shadow.map(|shadow| {
            let path = shadow.path().to_path_buf();
            shadow.stop();
            path
        });

        Ok(self.finish(end, registry.line_log().len(), closed, cleanup, logcat))
    }

    /// Apply server lines until something ends the run.
    fn consume(
        &self,
        registry: &mut Registry,
        rx: &crossbeam_channel::Receiver<ServerEvent>,
    ) -> (RunEnd, Vec<CloseOutcome>) {
        let started = Instant::now();
        let mut closed = Vec::new();

        let end = loop {
            if self.interrupt.load(Ordering::Acquire) {
                break RunEnd::Interrupted;
            }
            if self.give_up.load(Ordering::Acquire)
                || (!registry.is_ready() && started.elapsed() >= self.options.ready_timeout)
            {
                break RunEnd::NotReady;
            }
            if let Some(limit) = self.options.duration
                && started.elapsed() >= limit
            {
                break RunEnd::DurationElapsed;
            }

            match rx.recv_timeout(POLL) {
                Ok(ServerEvent::Line(source, line)) => match registry.handle_line(source, &line) {
                    Ok(Some(outcome)) => closed.push(outcome),
                    Ok(None) => {}
                    Err(RegistryError::Protocol(e)) => {
                        break RunEnd::ProtocolError(format!("{e} (line: {line:?})"));
                    }
                    Err(RegistryError::Device(e)) => {
                        break RunEnd::DeviceError(e.to_string());
                    }
                },
                Ok(ServerEvent::Exited(Ok(code))) => break RunEnd::ServerExited { code },
                Ok(ServerEvent::Exited(Err(e))) => break RunEnd::DeviceError(e.to_string()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break RunEnd::ServerExited { code: None },
            }
        };
        (end, closed)
    }

    fn finish(
        &self,
        end: RunEnd,
        lines: usize,
        mut closed: Vec<CloseOutcome>,
        cleanup: Option<CleanupReport>,
        logcat: Option<PathBuf>,
    ) -> RunReport {
        let (servers_killed, abandoned, line_log) = match cleanup {
            Some(report) => {
                closed.extend(report.closed);
                (report.servers_killed, report.abandoned, report.line_log)
            }
            None => (0, Vec::new(), None),
        };

        let mut extracted = Vec::new();
        let mut extraction_failures = Vec::new();
        for outcome in closed {
            match outcome {
                CloseOutcome::Extracted(session) => extracted.push(session),
                CloseOutcome::Failed(failure) => {
                    log::warn!(
                        "Socket {}: failed to retrieve {}: {}",
                        failure.socket,
                        failure.prefix,
                        failure.error
                    );
                    extraction_failures.push(failure);
                }
            }
        }

        let aggregate = &self.options.aggregate;
        let sessions: Vec<SessionResult> = extracted
            .into_par_iter()
            .map(|session| {
                let analysis = analyze_session(&session.dir, &session.base, aggregate);
                if let Err(e) = &analysis {
                    log::error!("Analysis of {} failed: {e:#}", session.prefix);
                }
                SessionResult { session, analysis }
            })
            .collect();

        RunReport {
            end,
            ready: self.ready.load(Ordering::Acquire),
            lines,
            servers_killed,
            sessions,
            extraction_failures,
            abandoned,
            line_log,
            logcat,
        }
    }
}
