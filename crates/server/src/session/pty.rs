//! PTY process handles.
//!
//! This module provides the core PTY spawning and I/O functionality.
//! A process handle owns a single pseudo-terminal with an agent or shell
//! process for the lifetime of one session.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::{SessionParams, DEFAULT_COLS, DEFAULT_ROWS};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::launch::LaunchPlan;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session's process has already ended.
    #[error("session already exited: {0}")]
    AlreadyExited(SessionId),

    /// The configured session cap was reached.
    #[error("session limit reached ({0})")]
    CapacityExceeded(usize),

    /// Failed to spawn the PTY process.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to terminate the process.
    #[error("failed to kill process: {0}")]
    KillFailed(String),

    /// Artifact handling failed.
    #[error("artifact rejected: {0}")]
    Artifact(#[from] crate::session::artifacts::ArtifactError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bytes read from the PTY per call.
const READ_BUFFER_SIZE: usize = 16384;

/// Capacity of the raw reader channel; a full channel blocks the reader,
/// which is PTY flow control, not data loss.
const READER_CHANNEL_CAPACITY: usize = 256;

/// Grace period between polite termination and the hard process-group kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Dimension bounds applied to every resize request.
const MIN_ROWS: u16 = 10;
const MAX_ROWS: u16 = 200;
const MIN_COLS: u16 = 20;
const MAX_COLS: u16 = 400;

/// Clamps requested dimensions to the supported range.
pub fn clamp_dimensions(rows: u16, cols: u16) -> (u16, u16) {
    (
        rows.clamp(MIN_ROWS, MAX_ROWS),
        cols.clamp(MIN_COLS, MAX_COLS),
    )
}

/// A pseudo-terminal with a spawned agent or shell process.
///
/// The handle manages the PTY master, the child process, and the set of
/// temporary artifact paths created during the session's life. It provides
/// methods to write input, resize the terminal, and terminate the process
/// tree. Output is consumed through the channel returned by
/// [`ProcessHandle::start_reader`].
pub struct ProcessHandle {
    /// Session this handle belongs to.
    session_id: SessionId,

    /// Program launched in the PTY, for diagnostics.
    program: String,

    /// The PTY master handle.
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,

    /// The writer for the PTY.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,

    /// The child process.
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,

    /// Flag indicating if the process is still running.
    running: Arc<AtomicBool>,

    /// Whether the process has produced at least one output chunk.
    output_seen: AtomicBool,

    /// Current terminal size.
    rows: AtomicU16,
    cols: AtomicU16,

    /// Temporary artifact paths to delete when the session closes. A set,
    /// not a list: the same path scheduled twice must not delete twice.
    artifacts: std::sync::Mutex<HashSet<PathBuf>>,

    /// Process ID of the direct child.
    pid: Option<u32>,
}

impl ProcessHandle {
    /// Spawns the process described by a launch plan inside a fresh PTY.
    ///
    /// The working directory must exist and the program must be resolvable,
    /// otherwise this fails with [`SessionError::SpawnFailed`]. The PTY is
    /// created at the default 24x80; callers send real dimensions right
    /// after attach.
    pub fn spawn(params: &SessionParams, plan: &LaunchPlan) -> Result<Self, SessionError> {
        if !params.workdir.is_dir() {
            return Err(SessionError::SpawnFailed(format!(
                "working directory does not exist: {}",
                params.workdir.display()
            )));
        }
        if which::which(&plan.program).is_err() {
            return Err(SessionError::SpawnFailed(format!(
                "executable not found: {}",
                plan.program
            )));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&plan.program);
        cmd.args(&plan.args);
        cmd.cwd(&params.workdir);
        for (key, value) in &plan.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let pid = child.process_id();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        tracing::info!(
            session_id = %params.session_id,
            program = %plan.program,
            pid = ?pid,
            workdir = %params.workdir.display(),
            "spawned session process"
        );

        Ok(Self {
            session_id: params.session_id.clone(),
            program: plan.program.clone(),
            master: Arc::new(Mutex::new(pair.master)),
            writer: Arc::new(Mutex::new(writer)),
            child: Arc::new(Mutex::new(child)),
            running: Arc::new(AtomicBool::new(true)),
            output_seen: AtomicBool::new(false),
            rows: AtomicU16::new(DEFAULT_ROWS),
            cols: AtomicU16::new(DEFAULT_COLS),
            artifacts: std::sync::Mutex::new(HashSet::new()),
            pid,
        })
    }

    /// Returns the session ID.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Returns the process ID of the child, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the program launched in the PTY.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the current terminal size as (rows, cols).
    pub fn size(&self) -> (u16, u16) {
        (
            self.rows.load(Ordering::SeqCst),
            self.cols.load(Ordering::SeqCst),
        )
    }

    /// Returns whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Marks that the process produced output; used for the dead-on-arrival
    /// diagnostic when a process exits before its first chunk.
    pub fn mark_output_seen(&self) {
        self.output_seen.store(true, Ordering::SeqCst);
    }

    /// Whether the process ever produced output.
    pub fn output_seen(&self) -> bool {
        self.output_seen.load(Ordering::SeqCst)
    }

    /// Starts the blocking read loop and returns the raw output channel.
    ///
    /// A dedicated blocking task reads from the PTY and feeds the channel;
    /// the channel closes when the process exits or the reader fails. Call
    /// at most once per handle.
    pub async fn start_reader(&self) -> Result<mpsc::Receiver<Vec<u8>>, SessionError> {
        let reader = {
            let master = self.master.lock().await;
            master
                .try_clone_reader()
                .map_err(|e| SessionError::SpawnFailed(e.to_string()))?
        };

        let (tx, rx) = mpsc::channel::<Vec<u8>>(READER_CHANNEL_CAPACITY);
        let running = Arc::clone(&self.running);
        let session_id = self.session_id.clone();

        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::debug!(session_id = %session_id, "PTY EOF, reader stopping");
                        break;
                    }
                    Ok(n) => {
                        if tx.blocking_send(buffer[..n].to_vec()).is_err() {
                            tracing::debug!(
                                session_id = %session_id,
                                "output channel closed, reader stopping"
                            );
                            break;
                        }
                    }
                    Err(e) => {
                        // Linux reports EIO on the master once the child
                        // exits, so a read error is the usual exit path.
                        if running.load(Ordering::SeqCst) {
                            tracing::debug!(
                                session_id = %session_id,
                                error = %e,
                                "PTY read ended"
                            );
                        }
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    /// Writes input bytes to the PTY.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyExited(self.session_id.clone()));
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    /// Resizes the PTY, clamping to the supported range.
    ///
    /// Returns `Ok(false)` without touching the PTY when the clamped
    /// dimensions equal the current ones; rapid identical resize requests
    /// must not signal the child repeatedly.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<bool, SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyExited(self.session_id.clone()));
        }

        let (rows, cols) = clamp_dimensions(rows, cols);
        if (rows, cols) == self.size() {
            return Ok(false);
        }

        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        drop(master);

        self.rows.store(rows, Ordering::SeqCst);
        self.cols.store(cols, Ordering::SeqCst);

        tracing::debug!(
            session_id = %self.session_id,
            rows = rows,
            cols = cols,
            "resized PTY"
        );
        Ok(true)
    }

    /// Records a temporary artifact path for cleanup at close.
    pub fn track_artifact(&self, path: PathBuf) {
        if let Ok(mut set) = self.artifacts.lock() {
            set.insert(path);
        }
    }

    /// Takes the artifact set, leaving it empty.
    ///
    /// Clearing before deletion makes a second close see an empty set, so
    /// no path is ever deleted twice.
    pub fn take_artifacts(&self) -> Vec<PathBuf> {
        match self.artifacts.lock() {
            Ok(mut set) => set.drain().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Number of tracked artifacts (test support).
    pub fn artifact_count(&self) -> usize {
        self.artifacts.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Checks whether the child has exited, without blocking.
    ///
    /// Returns the exit code when the process has ended.
    pub async fn try_wait(&self) -> Result<Option<i32>, SessionError> {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.running.store(false, Ordering::SeqCst);
                Ok(Some(status.exit_code() as i32))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(SessionError::Io(e)),
        }
    }

    /// Polls for process exit up to `timeout`, returning the exit code if
    /// the process ended within the window.
    pub async fn wait_exit_code(&self, timeout: Duration) -> Option<i32> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.try_wait().await {
                Ok(Some(code)) => return Some(code),
                Ok(None) => {}
                Err(_) => return None,
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Terminates the process and all of its descendants.
    ///
    /// Sends a polite termination to the process group first, escalating to
    /// a hard kill after [`KILL_GRACE`]. Interactive shells spawn
    /// grandchildren; signaling only the direct child leaves those orphaned.
    /// Idempotent: killing an already-dead process returns its exit code.
    pub async fn kill_tree(&self) -> Result<Option<i32>, SessionError> {
        self.running.store(false, Ordering::SeqCst);

        let mut child = self.child.lock().await;

        if let Ok(Some(status)) = child.try_wait() {
            return Ok(Some(status.exit_code() as i32));
        }

        signal_process_group(self.pid, false);

        let deadline = tokio::time::Instant::now() + KILL_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(
                        session_id = %self.session_id,
                        exit_code = status.exit_code(),
                        "process terminated within grace period"
                    );
                    return Ok(Some(status.exit_code() as i32));
                }
                Ok(None) => {}
                Err(e) => return Err(SessionError::KillFailed(e.to_string())),
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        tracing::warn!(
            session_id = %self.session_id,
            pid = ?self.pid,
            "grace period expired, hard-killing process group"
        );
        signal_process_group(self.pid, true);
        child
            .kill()
            .map_err(|e| SessionError::KillFailed(e.to_string()))?;

        let status = child
            .wait()
            .map_err(|e| SessionError::KillFailed(e.to_string()))?;
        Ok(Some(status.exit_code() as i32))
    }
}

/// Signals the child's process group.
///
/// The PTY child is its own session leader, so its pid doubles as the
/// process group id and the signal reaches every descendant.
#[cfg(unix)]
fn signal_process_group(pid: Option<u32>, hard: bool) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else { return };
    let signal = if hard { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        tracing::debug!(pid = pid, signal = ?signal, error = %e, "killpg failed");
    }
}

#[cfg(not(unix))]
fn signal_process_group(_pid: Option<u32>, _hard: bool) {}
