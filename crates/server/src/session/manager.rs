//! Session registry and lifecycle management.
//!
//! The registry owns every live process-session. `open` is idempotent per
//! session id, so a reconnecting client lands on its existing process
//! instead of spawning a second one. Sessions leave the registry in exactly
//! three ways: an explicit `close`, their process exiting (the pump removes
//! the entry), or the periodic cleanup reaping orphans nobody is attached
//! to anymore.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use protocol::{AgentKind, ImagePayload, Message, SessionParams};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::launch::{AgentProfile, LaunchPlan};
use crate::session::artifacts::{cleanup_artifacts, ArtifactError, ArtifactStore};
use crate::session::broadcaster::{OutputBroadcaster, TransportId};
use crate::session::pty::{ProcessHandle, SessionError, SessionId};
use crate::session::pump::pump_output;

/// Default cap on concurrent sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 10;

/// Default idle period after which a session with no attached transports
/// is reaped, in seconds.
pub const DEFAULT_ORPHAN_TTL_SECS: u64 = 300;

/// Upper bound on one session teardown during full shutdown.
const SHUTDOWN_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Interface for managing process-sessions.
///
/// Implementations must be thread-safe and suitable for concurrent access
/// from every connection task.
#[allow(async_fn_in_trait)]
pub trait SessionManager: Send + Sync {
    /// Opens the session named in `params`, spawning its process if absent.
    ///
    /// Returns the session description and whether it already existed. A
    /// second open with the same id lands on the running process.
    async fn open(&self, params: SessionParams) -> Result<(SessionInfo, bool), SessionError>;

    /// Registers `transport_id` as the session's sole output transport,
    /// displacing any previously attached transports.
    ///
    /// Returns the receiver the transport's writer task drains.
    async fn attach_exclusive(
        &self,
        session_id: &SessionId,
        transport_id: TransportId,
    ) -> Result<mpsc::Receiver<Message>, SessionError>;

    /// Detaches one transport. The session keeps running unattached.
    async fn detach(&self, session_id: &SessionId, transport_id: &TransportId);

    /// Writes keyboard bytes to the session's terminal.
    async fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SessionError>;

    /// Applies a terminal geometry change.
    ///
    /// Returns `false` when the clamped dimensions equal the current ones
    /// and no resize was issued.
    async fn resize(
        &self,
        session_id: &SessionId,
        rows: u16,
        cols: u16,
    ) -> Result<bool, SessionError>;

    /// Persists a pasted image and hands its path to the session's agent.
    async fn store_artifact(
        &self,
        session_id: &SessionId,
        image: &ImagePayload,
    ) -> Result<StoredArtifact, SessionError>;

    /// Terminates the session's process tree and discards its artifacts.
    ///
    /// Closing an unknown or already-closed session is a no-op.
    async fn close(&self, session_id: &SessionId) -> Result<(), SessionError>;

    /// Describes every live session.
    async fn list(&self) -> Vec<SessionInfo>;

    /// Describes one session, if present.
    async fn get(&self, session_id: &SessionId) -> Option<SessionInfo>;

    /// Whether a session with this id exists.
    fn exists(&self, session_id: &SessionId) -> bool;

    /// Number of live sessions.
    fn count(&self) -> usize;
}

/// Information about a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Agent driven by this session.
    pub agent: AgentKind,
    /// Persona role the agent was launched with.
    pub role: String,
    /// Working directory, as shown to clients.
    pub workdir: String,
    /// Process ID of the agent.
    pub pid: Option<u32>,
    /// Current terminal rows.
    pub rows: u16,
    /// Current terminal columns.
    pub cols: u16,
    /// Whether the process is still running.
    pub running: bool,
    /// Number of attached transports.
    pub transports: usize,
}

/// Outcome of persisting a pasted image into a session.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    /// Absolute path handed to the agent.
    pub path: PathBuf,
    /// Client-supplied name, echoed back in the acknowledgement.
    pub filename: String,
}

/// One live session: the process handle plus its output fan-out.
struct SessionEntry {
    params: SessionParams,
    handle: Arc<ProcessHandle>,
    broadcaster: Arc<OutputBroadcaster>,
}

impl SessionEntry {
    async fn info(&self) -> SessionInfo {
        let (rows, cols) = self.handle.size();
        SessionInfo {
            id: self.params.session_id.clone(),
            agent: self.params.agent,
            role: self.params.role.clone(),
            workdir: self.params.workdir.display().to_string(),
            pid: self.handle.pid(),
            rows,
            cols,
            running: self.handle.is_running(),
            transports: self.broadcaster.client_count().await,
        }
    }
}

/// Formats the line typed into the agent on behalf of a pasted image.
///
/// The trailing space (and missing newline) leaves the command sitting in
/// the agent's input box so the user submits it themselves.
fn artifact_injection(command: &str, path: &Path) -> String {
    format!("{} {} ", command, path.display())
}

/// Removes `session_id` from the map only while it still holds `entry`,
/// tearing the entry down if so.
///
/// Pump teardown runs detached from `open`, so by the time it fires a
/// reopen may have replaced the entry under the same id. That replacement
/// must survive the stale teardown.
async fn remove_exact(
    sessions: &DashMap<SessionId, Arc<SessionEntry>>,
    session_id: &SessionId,
    entry: &Arc<SessionEntry>,
) -> bool {
    let Some((_, removed)) =
        sessions.remove_if(session_id, |_, current| Arc::ptr_eq(current, entry))
    else {
        return false;
    };
    cleanup_artifacts(removed.handle.take_artifacts());
    removed.broadcaster.detach_all().await;
    true
}

/// Registry-backed implementation of [`SessionManager`].
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Arc<SessionEntry>>>,
    open_gate: Mutex<()>,
    artifacts: ArtifactStore,
    default_shell: Option<String>,
    max_sessions: usize,
    orphan_ttl: Duration,
}

impl SessionRegistry {
    /// Creates a registry with default limits.
    pub fn new() -> Self {
        Self::with_settings(
            ArtifactStore::new(),
            None,
            DEFAULT_MAX_SESSIONS,
            Duration::from_secs(DEFAULT_ORPHAN_TTL_SECS),
        )
    }

    /// Creates a registry with explicit limits and stores.
    pub fn with_settings(
        artifacts: ArtifactStore,
        default_shell: Option<String>,
        max_sessions: usize,
        orphan_ttl: Duration,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            open_gate: Mutex::new(()),
            artifacts,
            default_shell,
            max_sessions,
            orphan_ttl,
        }
    }

    fn lookup(&self, session_id: &SessionId) -> Option<Arc<SessionEntry>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Removes dead sessions and reaps orphans.
    ///
    /// A session whose process has exited is torn down immediately. A
    /// running session that has had no attached transport for longer than
    /// the orphan TTL is closed; reconnecting clients mint fresh session
    /// ids, so nothing will ever attach to it again.
    pub async fn cleanup(&self) {
        let mut dead = Vec::new();
        let mut orphaned = Vec::new();

        for entry in self.sessions.iter() {
            if !entry.value().handle.is_running() {
                dead.push(entry.key().clone());
            } else if let Some(idle) = entry.value().broadcaster.unattached_for_millis() {
                if idle >= self.orphan_ttl.as_millis() as u64 {
                    orphaned.push(entry.key().clone());
                }
            }
        }

        for id in dead {
            info!(session_id = %id, "removing dead session");
            if let Err(e) = self.close(&id).await {
                warn!(session_id = %id, error = %e, "failed to remove dead session");
            }
        }

        for id in orphaned {
            info!(
                session_id = %id,
                ttl_secs = self.orphan_ttl.as_secs(),
                "closing session with no attached transports"
            );
            if let Err(e) = self.close(&id).await {
                warn!(session_id = %id, error = %e, "failed to close orphaned session");
            }
        }
    }

    /// Starts a background task that periodically runs cleanup.
    pub fn start_cleanup_task(self: &Arc<Self>, interval_secs: u64) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_secs(interval_secs);
            loop {
                tokio::time::sleep(interval).await;
                registry.cleanup().await;
            }
        });
    }

    /// Closes every session, bounding each teardown so one stuck process
    /// cannot hang server shutdown.
    pub async fn shutdown_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        if ids.is_empty() {
            return;
        }

        info!(count = ids.len(), "shutting down all sessions");
        for id in ids {
            match tokio::time::timeout(SHUTDOWN_SESSION_TIMEOUT, self.close(&id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(session_id = %id, error = %e, "error closing session during shutdown")
                }
                Err(_) => warn!(session_id = %id, "session close timed out during shutdown"),
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager for SessionRegistry {
    async fn open(&self, params: SessionParams) -> Result<(SessionInfo, bool), SessionError> {
        // Serialize opens: the capacity check and the insert below must not
        // interleave with another open.
        let _gate = self.open_gate.lock().await;

        if let Some(entry) = self.lookup(&params.session_id) {
            if entry.handle.is_running() {
                debug!(session_id = %params.session_id, "reusing running session");
                return Ok((entry.info().await, true));
            }
            // Exited but not yet reaped by its pump. Tear the remnant down
            // and spawn fresh under the same id.
            self.close(&params.session_id).await?;
        }

        if self.sessions.len() >= self.max_sessions {
            warn!(
                session_id = %params.session_id,
                limit = self.max_sessions,
                "refusing to open session beyond the configured limit"
            );
            return Err(SessionError::CapacityExceeded(self.max_sessions));
        }

        let plan = LaunchPlan::build(&params, self.default_shell.as_deref());
        let handle = Arc::new(ProcessHandle::spawn(&params, &plan)?);
        let broadcaster = Arc::new(OutputBroadcaster::new());
        let entry = Arc::new(SessionEntry {
            params: params.clone(),
            handle: Arc::clone(&handle),
            broadcaster: Arc::clone(&broadcaster),
        });

        // Only `open` inserts, and the gate makes this the sole open in
        // flight, so the slot is necessarily free.
        self.sessions
            .insert(params.session_id.clone(), Arc::clone(&entry));

        let raw_rx = match handle.start_reader().await {
            Ok(rx) => rx,
            Err(e) => {
                remove_exact(&self.sessions, &params.session_id, &entry).await;
                let _ = handle.kill_tree().await;
                return Err(e);
            }
        };

        // Pump until the process dies, then drop the registry entry so a
        // dead session can never be attached.
        let sessions = Arc::clone(&self.sessions);
        let pump_handle = Arc::clone(&handle);
        let pump_broadcaster = Arc::clone(&broadcaster);
        let pump_entry = Arc::clone(&entry);
        let session_id = params.session_id.clone();
        tokio::spawn(async move {
            let exit_code = pump_output(pump_handle, raw_rx, pump_broadcaster).await;
            if remove_exact(&sessions, &session_id, &pump_entry).await {
                debug!(
                    session_id = %session_id,
                    exit_code = ?exit_code,
                    "session removed from registry"
                );
            }
        });

        info!(
            session_id = %params.session_id,
            agent = %params.agent,
            pid = ?handle.pid(),
            "session opened"
        );
        Ok((entry.info().await, false))
    }

    async fn attach_exclusive(
        &self,
        session_id: &SessionId,
        transport_id: TransportId,
    ) -> Result<mpsc::Receiver<Message>, SessionError> {
        let entry = self
            .lookup(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
        Ok(entry.broadcaster.attach_exclusive(transport_id).await)
    }

    async fn detach(&self, session_id: &SessionId, transport_id: &TransportId) {
        if let Some(entry) = self.lookup(session_id) {
            if let Some(stats) = entry.broadcaster.detach(transport_id).await {
                debug!(
                    session_id = %session_id,
                    transport_id = %transport_id,
                    sent = stats.messages_sent,
                    dropped = stats.messages_dropped,
                    "transport detached"
                );
            }
        }
    }

    async fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SessionError> {
        let entry = self
            .lookup(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
        entry.handle.write(data).await
    }

    async fn resize(
        &self,
        session_id: &SessionId,
        rows: u16,
        cols: u16,
    ) -> Result<bool, SessionError> {
        let entry = self
            .lookup(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
        entry.handle.resize(rows, cols).await
    }

    async fn store_artifact(
        &self,
        session_id: &SessionId,
        image: &ImagePayload,
    ) -> Result<StoredArtifact, SessionError> {
        let entry = self
            .lookup(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        let profile = AgentProfile::for_kind(entry.params.agent);
        let Some(command) = profile.artifact_command else {
            return Err(SessionError::Artifact(ArtifactError::Unsupported));
        };

        let path = self.artifacts.persist(session_id, image)?;
        entry.handle.track_artifact(path.clone());
        entry
            .handle
            .write(artifact_injection(command, &path).as_bytes())
            .await?;

        info!(
            session_id = %session_id,
            path = %path.display(),
            "image handed to agent"
        );
        Ok(StoredArtifact {
            path,
            filename: image.filename.clone(),
        })
    }

    async fn close(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let Some((_, entry)) = self.sessions.remove(session_id) else {
            debug!(session_id = %session_id, "close for unknown session ignored");
            return Ok(());
        };

        entry.broadcaster.detach_all().await;
        let kill_result = entry.handle.kill_tree().await;
        cleanup_artifacts(entry.handle.take_artifacts());
        let exit_code = kill_result?;

        info!(session_id = %session_id, exit_code = ?exit_code, "session closed");
        Ok(())
    }

    async fn list(&self) -> Vec<SessionInfo> {
        let entries: Vec<Arc<SessionEntry>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            infos.push(entry.info().await);
        }
        infos
    }

    async fn get(&self, session_id: &SessionId) -> Option<SessionInfo> {
        match self.lookup(session_id) {
            Some(entry) => Some(entry.info().await),
            None => None,
        }
    }

    fn exists(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    fn count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::mint_session_id;
    use std::time::Instant;
    use tempfile::TempDir;

    fn shell_params(workdir: &Path) -> SessionParams {
        SessionParams::new(workdir, AgentKind::Shell)
    }

    fn test_registry(temp: &TempDir, max_sessions: usize, orphan_ttl: Duration) -> SessionRegistry {
        let artifacts = ArtifactStore::with_limits(temp.path().to_path_buf(), 1024 * 1024);
        SessionRegistry::with_settings(artifacts, None, max_sessions, orphan_ttl)
    }

    fn default_registry(temp: &TempDir) -> SessionRegistry {
        test_registry(
            temp,
            DEFAULT_MAX_SESSIONS,
            Duration::from_secs(DEFAULT_ORPHAN_TTL_SECS),
        )
    }

    /// Drains the receiver until `needle` shows up in terminal output or
    /// the deadline passes.
    async fn wait_for_output(
        rx: &mut mpsc::Receiver<Message>,
        needle: &str,
        deadline: Duration,
    ) -> bool {
        let start = Instant::now();
        let mut collected = Vec::new();
        while start.elapsed() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(Message::TerminalOutput(chunk))) => {
                    collected.extend_from_slice(&chunk.data);
                    if String::from_utf8_lossy(&collected).contains(needle) {
                        return true;
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => return false,
                Err(_) => {}
            }
        }
        false
    }

    #[tokio::test]
    async fn test_open_spawns_new_session() {
        let temp = TempDir::new().unwrap();
        let registry = default_registry(&temp);

        let params = shell_params(temp.path());
        let id = params.session_id.clone();
        let (info, was_existing) = registry.open(params).await.unwrap();

        assert!(!was_existing);
        assert_eq!(info.id, id);
        assert!(info.running);
        assert!(info.pid.is_some());
        assert_eq!(registry.count(), 1);
        assert!(registry.exists(&id));

        registry.close(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_same_id_reuses_running_session() {
        let temp = TempDir::new().unwrap();
        let registry = default_registry(&temp);

        let params = shell_params(temp.path());
        let id = params.session_id.clone();
        let (first, was_existing) = registry.open(params.clone()).await.unwrap();
        assert!(!was_existing);

        let (second, was_existing) = registry.open(params).await.unwrap();
        assert!(was_existing);
        assert_eq!(second.pid, first.pid);
        assert_eq!(registry.count(), 1);

        registry.close(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_rejects_beyond_capacity() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(&temp, 2, Duration::from_secs(300));

        let first = shell_params(temp.path());
        let second = shell_params(temp.path());
        registry.open(first.clone()).await.unwrap();
        registry.open(second.clone()).await.unwrap();

        let third = shell_params(temp.path());
        match registry.open(third).await {
            Err(SessionError::CapacityExceeded(limit)) => assert_eq!(limit, 2),
            other => panic!("expected CapacityExceeded, got {:?}", other.map(|_| ())),
        }

        registry.close(&first.session_id).await.unwrap();
        registry.close(&second.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_opens_never_overshoot_capacity() {
        let temp = TempDir::new().unwrap();
        let registry = Arc::new(test_registry(&temp, 3, Duration::from_secs(300)));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let params = shell_params(temp.path());
            tasks.push(tokio::spawn(async move { registry.open(params).await }));
        }

        let mut opened = 0;
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => opened += 1,
                Err(SessionError::CapacityExceeded(limit)) => {
                    assert_eq!(limit, 3);
                    rejected += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(opened, 3);
        assert_eq!(rejected, 5);
        assert_eq!(registry.count(), 3);

        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ignores_unknown() {
        let temp = TempDir::new().unwrap();
        let registry = default_registry(&temp);

        let params = shell_params(temp.path());
        let id = params.session_id.clone();
        registry.open(params).await.unwrap();

        registry.close(&id).await.unwrap();
        registry.close(&id).await.unwrap();
        registry.close(&mint_session_id()).await.unwrap();
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_write_reaches_terminal() {
        let temp = TempDir::new().unwrap();
        let registry = default_registry(&temp);

        let params = shell_params(temp.path());
        let id = params.session_id.clone();
        registry.open(params).await.unwrap();

        let mut rx = registry
            .attach_exclusive(&id, "t1".to_string())
            .await
            .unwrap();

        // Quote-splitting keeps the marker out of the echoed command line.
        registry
            .write(&id, b"printf 'regis''try_ok\\n'\n")
            .await
            .unwrap();

        assert!(wait_for_output(&mut rx, "registry_ok", Duration::from_secs(5)).await);
        registry.close(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_applies_and_skips_noop() {
        let temp = TempDir::new().unwrap();
        let registry = default_registry(&temp);

        let params = shell_params(temp.path());
        let id = params.session_id.clone();
        registry.open(params).await.unwrap();

        assert!(registry.resize(&id, 30, 100).await.unwrap());
        assert!(!registry.resize(&id, 30, 100).await.unwrap());

        let info = registry.get(&id).await.unwrap();
        assert_eq!((info.rows, info.cols), (30, 100));

        registry.close(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_ops_on_unknown_session_fail() {
        let temp = TempDir::new().unwrap();
        let registry = default_registry(&temp);
        let id = mint_session_id();

        assert!(matches!(
            registry.write(&id, b"x").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.resize(&id, 30, 100).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.attach_exclusive(&id, "t1".to_string()).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_store_artifact_rejected_without_agent_support() {
        let temp = TempDir::new().unwrap();
        let registry = default_registry(&temp);

        let params = shell_params(temp.path());
        let id = params.session_id.clone();
        registry.open(params).await.unwrap();

        let image = ImagePayload::from_bytes(b"not a real png", "shot.png");
        match registry.store_artifact(&id, &image).await {
            Err(SessionError::Artifact(ArtifactError::Unsupported)) => {}
            other => panic!("expected Unsupported, got {:?}", other.map(|_| ())),
        }

        registry.close(&id).await.unwrap();
    }

    #[test]
    fn test_artifact_injection_format() {
        let line = artifact_injection("add", Path::new("/tmp/ai_image_abc_def.png"));
        assert_eq!(line, "add /tmp/ai_image_abc_def.png ");
        assert!(!line.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_close_removes_tracked_artifacts() {
        let temp = TempDir::new().unwrap();
        let registry = default_registry(&temp);

        let params = shell_params(temp.path());
        let id = params.session_id.clone();
        registry.open(params).await.unwrap();

        let file = temp.path().join("ai_image_test.png");
        std::fs::write(&file, b"png bytes").unwrap();
        registry
            .lookup(&id)
            .unwrap()
            .handle
            .track_artifact(file.clone());

        registry.close(&id).await.unwrap();
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_exited_process_leaves_registry() {
        let temp = TempDir::new().unwrap();
        let registry = default_registry(&temp);

        let params = shell_params(temp.path());
        let id = params.session_id.clone();
        registry.open(params).await.unwrap();

        let mut rx = registry
            .attach_exclusive(&id, "t1".to_string())
            .await
            .unwrap();
        registry.write(&id, b"exit\n").await.unwrap();

        // The pump must emit the exit notification and drop the entry.
        let start = Instant::now();
        let mut saw_exit = false;
        while start.elapsed() < Duration::from_secs(10) {
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(Message::Exited(_))) => {
                    saw_exit = true;
                    break;
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {}
            }
        }
        assert!(saw_exit, "no exit notification observed");

        let start = Instant::now();
        while registry.exists(&id) && start.elapsed() < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!registry.exists(&id));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_stale_pump_teardown_spares_reopened_session() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(&temp, 4, Duration::from_secs(300));
        let params = shell_params(temp.path());

        registry.open(params.clone()).await.unwrap();
        let stale = registry.lookup(&params.session_id).unwrap();

        registry.close(&params.session_id).await.unwrap();
        registry.open(params.clone()).await.unwrap();

        // The first pump's teardown runs against the old entry and must not
        // evict the replacement now living under the same id.
        assert!(!remove_exact(&registry.sessions, &params.session_id, &stale).await);
        assert!(registry.exists(&params.session_id));

        registry.close(&params.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_reaps_unattached_sessions() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(&temp, DEFAULT_MAX_SESSIONS, Duration::from_millis(100));

        let params = shell_params(temp.path());
        let id = params.session_id.clone();
        registry.open(params).await.unwrap();

        // Attach then detach so the unattached clock restarts now.
        let _rx = registry
            .attach_exclusive(&id, "t1".to_string())
            .await
            .unwrap();
        registry.detach(&id, &"t1".to_string()).await;

        tokio::time::sleep(Duration::from_millis(250)).await;
        registry.cleanup().await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_attached_sessions() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(&temp, DEFAULT_MAX_SESSIONS, Duration::from_millis(100));

        let params = shell_params(temp.path());
        let id = params.session_id.clone();
        registry.open(params).await.unwrap();

        let _rx = registry
            .attach_exclusive(&id, "t1".to_string())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        registry.cleanup().await;
        assert_eq!(registry.count(), 1);

        registry.close(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_exclusive_counts_one_transport() {
        let temp = TempDir::new().unwrap();
        let registry = default_registry(&temp);

        let params = shell_params(temp.path());
        let id = params.session_id.clone();
        registry.open(params).await.unwrap();

        let _rx1 = registry
            .attach_exclusive(&id, "t1".to_string())
            .await
            .unwrap();
        let _rx2 = registry
            .attach_exclusive(&id, "t2".to_string())
            .await
            .unwrap();

        let info = registry.get(&id).await.unwrap();
        assert_eq!(info.transports, 1);

        registry.close(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_all_closes_everything() {
        let temp = TempDir::new().unwrap();
        let registry = default_registry(&temp);

        registry.open(shell_params(temp.path())).await.unwrap();
        registry.open(shell_params(temp.path())).await.unwrap();
        assert_eq!(registry.count(), 2);

        registry.shutdown_all().await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_list_describes_sessions() {
        let temp = TempDir::new().unwrap();
        let registry = default_registry(&temp);

        let params = shell_params(temp.path()).with_role("QA");
        let id = params.session_id.clone();
        registry.open(params).await.unwrap();

        let infos = registry.list().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, id);
        assert_eq!(infos[0].agent, AgentKind::Shell);
        assert_eq!(infos[0].role, "QA");
        assert_eq!(infos[0].workdir, temp.path().display().to_string());

        registry.close(&id).await.unwrap();
    }
}
