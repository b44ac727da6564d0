//! Message router for dispatching incoming frames to session operations.
//!
//! One router instance serves one established connection. The transport
//! layer performs the open handshake itself and then feeds every decoded
//! message through [`MessageRouter::route`], sending whatever reply the
//! router hands back.

use std::sync::Arc;

use protocol::{ErrorCode, ErrorMessage, ImageAdded, Message};
use tracing::{debug, warn};

use crate::session::{SessionError, SessionId, SessionManager};

/// Result type for router operations.
pub type RouterResult = Result<Option<Message>, RouterError>;

/// Errors that can occur during message routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Session-related error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// The message is not valid at this point in the connection.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RouterError {
    /// Converts the error to the wire-level error notice.
    ///
    /// The recoverable flag tells the client whether the session survived:
    /// artifact and protocol problems leave it running, while spawn
    /// failures and operations on a dead process do not.
    pub fn to_error_message(&self) -> ErrorMessage {
        let (code, recoverable) = match self {
            RouterError::Session(e) => match e {
                SessionError::NotFound(_) => (ErrorCode::ProcessExited, false),
                SessionError::AlreadyExited(_) => (ErrorCode::ProcessExited, false),
                SessionError::CapacityExceeded(_) => (ErrorCode::Spawn, false),
                SessionError::SpawnFailed(_) => (ErrorCode::Spawn, false),
                SessionError::WriteFailed(_) => (ErrorCode::Transport, true),
                SessionError::ResizeFailed(_) => (ErrorCode::Transport, true),
                SessionError::KillFailed(_) => (ErrorCode::Transport, true),
                SessionError::Artifact(_) => (ErrorCode::Artifact, true),
                SessionError::Io(_) => (ErrorCode::Transport, true),
            },
            RouterError::InvalidRequest(_) => (ErrorCode::Protocol, true),
        };

        ErrorMessage::new(code, self.to_string(), recoverable)
    }
}

/// Routes decoded messages of one connection to its session.
///
/// The session id is fixed at handshake time; input, resize, and image
/// frames implicitly target the connection's session.
pub struct MessageRouter<M: SessionManager> {
    manager: Arc<M>,
}

impl<M: SessionManager> MessageRouter<M> {
    /// Creates a router backed by the given session manager.
    pub fn new(manager: Arc<M>) -> Self {
        Self { manager }
    }

    /// Routes one message for the session established on this connection.
    ///
    /// Returns `Ok(Some(reply))` when a response frame should be sent,
    /// `Ok(None)` when the message was consumed without a reply, or an
    /// error to be reported to the client.
    pub async fn route(&self, message: Message, session_id: &SessionId) -> RouterResult {
        match message {
            Message::Input(chunk) => {
                self.manager.write(session_id, &chunk.data).await?;
                Ok(None)
            }

            Message::Resize(req) => {
                let changed = self.manager.resize(session_id, req.rows, req.cols).await?;
                debug!(
                    session_id = %session_id,
                    rows = req.rows,
                    cols = req.cols,
                    changed,
                    "resize routed"
                );
                Ok(None)
            }

            Message::Image(payload) => {
                let stored = self.manager.store_artifact(session_id, &payload).await?;
                Ok(Some(Message::ImageAdded(ImageAdded {
                    path: stored.path.display().to_string(),
                    filename: stored.filename,
                })))
            }

            Message::Ping => Ok(Some(Message::Pong)),

            Message::Open(_) => Err(RouterError::InvalidRequest(
                "open is only valid as the first message of a connection".to_string(),
            )),

            Message::Error(err) => {
                warn!(session_id = %session_id, ?err, "error notice received from peer");
                Ok(None)
            }

            Message::Pong => {
                debug!(session_id = %session_id, "pong received");
                Ok(None)
            }

            // Server-to-client messages have no meaning inbound. Drop them
            // rather than killing the connection over a confused client.
            Message::Ready(_)
            | Message::TerminalOutput(_)
            | Message::ImageAdded(_)
            | Message::Exited(_) => {
                debug!(session_id = %session_id, "ignoring server-bound message from client");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::artifacts::ArtifactError;
    use crate::session::{SessionInfo, StoredArtifact, TransportId};
    use protocol::{
        AgentKind, ImagePayload, InputChunk, ProcessExit, ResizeRequest, SessionParams,
        SessionReady,
    };
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Mock session manager recording the calls the router makes.
    struct MockSessionManager {
        should_fail: Option<fn() -> SessionError>,
        last_write: Mutex<Option<Vec<u8>>>,
        last_resize: Mutex<Option<(u16, u16)>>,
        artifact_requests: Mutex<usize>,
    }

    impl MockSessionManager {
        fn new() -> Self {
            Self {
                should_fail: None,
                last_write: Mutex::new(None),
                last_resize: Mutex::new(None),
                artifact_requests: Mutex::new(0),
            }
        }

        fn failing(make_error: fn() -> SessionError) -> Self {
            Self {
                should_fail: Some(make_error),
                ..Self::new()
            }
        }

        fn fail_if_configured(&self) -> Result<(), SessionError> {
            match self.should_fail {
                Some(make_error) => Err(make_error()),
                None => Ok(()),
            }
        }

        fn fake_info(session_id: &SessionId) -> SessionInfo {
            SessionInfo {
                id: session_id.clone(),
                agent: AgentKind::Shell,
                role: "General".to_string(),
                workdir: "/tmp".to_string(),
                pid: Some(4242),
                rows: 24,
                cols: 80,
                running: true,
                transports: 0,
            }
        }
    }

    impl SessionManager for MockSessionManager {
        async fn open(
            &self,
            params: SessionParams,
        ) -> Result<(SessionInfo, bool), SessionError> {
            self.fail_if_configured()?;
            Ok((Self::fake_info(&params.session_id), false))
        }

        async fn attach_exclusive(
            &self,
            session_id: &SessionId,
            _transport_id: TransportId,
        ) -> Result<mpsc::Receiver<Message>, SessionError> {
            self.fail_if_configured()
                .map_err(|_| SessionError::NotFound(session_id.clone()))?;
            let (_tx, rx) = mpsc::channel(16);
            Ok(rx)
        }

        async fn detach(&self, _session_id: &SessionId, _transport_id: &TransportId) {}

        async fn write(&self, _session_id: &SessionId, data: &[u8]) -> Result<(), SessionError> {
            self.fail_if_configured()?;
            *self.last_write.lock().unwrap() = Some(data.to_vec());
            Ok(())
        }

        async fn resize(
            &self,
            _session_id: &SessionId,
            rows: u16,
            cols: u16,
        ) -> Result<bool, SessionError> {
            self.fail_if_configured()?;
            let changed = self.last_resize.lock().unwrap().replace((rows, cols)) != Some((rows, cols));
            Ok(changed)
        }

        async fn store_artifact(
            &self,
            session_id: &SessionId,
            image: &ImagePayload,
        ) -> Result<StoredArtifact, SessionError> {
            self.fail_if_configured()?;
            *self.artifact_requests.lock().unwrap() += 1;
            Ok(StoredArtifact {
                path: PathBuf::from(format!("/tmp/ai_image_{}_mock.png", &session_id[..4])),
                filename: image.filename.clone(),
            })
        }

        async fn close(&self, _session_id: &SessionId) -> Result<(), SessionError> {
            self.fail_if_configured()
        }

        async fn list(&self) -> Vec<SessionInfo> {
            vec![]
        }

        async fn get(&self, session_id: &SessionId) -> Option<SessionInfo> {
            Some(Self::fake_info(session_id))
        }

        fn exists(&self, _session_id: &SessionId) -> bool {
            self.should_fail.is_none()
        }

        fn count(&self) -> usize {
            0
        }
    }

    fn test_router() -> (MessageRouter<MockSessionManager>, Arc<MockSessionManager>) {
        let manager = Arc::new(MockSessionManager::new());
        (MessageRouter::new(Arc::clone(&manager)), manager)
    }

    fn session_id() -> SessionId {
        "fedcba98-0000-4000-8000-000000000000".to_string()
    }

    #[tokio::test]
    async fn test_route_input_writes_to_session() {
        let (router, manager) = test_router();

        let msg = Message::Input(InputChunk::new(b"ls -la\n".to_vec()));
        let result = router.route(msg, &session_id()).await.unwrap();

        assert!(result.is_none());
        assert_eq!(
            manager.last_write.lock().unwrap().as_deref(),
            Some(b"ls -la\n".as_slice())
        );
    }

    #[tokio::test]
    async fn test_route_input_on_dead_session_fails() {
        let manager = Arc::new(MockSessionManager::failing(|| {
            SessionError::NotFound("gone".to_string())
        }));
        let router = MessageRouter::new(Arc::clone(&manager));

        let msg = Message::Input(InputChunk::new(b"x".to_vec()));
        let err = router.route(msg, &session_id()).await.unwrap_err();

        let notice = err.to_error_message();
        assert_eq!(notice.code, ErrorCode::ProcessExited);
        assert!(!notice.recoverable);
    }

    #[tokio::test]
    async fn test_route_resize_forwards_dimensions() {
        let (router, manager) = test_router();

        let msg = Message::Resize(ResizeRequest { rows: 40, cols: 120 });
        let result = router.route(msg, &session_id()).await.unwrap();

        assert!(result.is_none());
        assert_eq!(*manager.last_resize.lock().unwrap(), Some((40, 120)));
    }

    #[tokio::test]
    async fn test_route_image_replies_with_acknowledgement() {
        let (router, manager) = test_router();

        let msg = Message::Image(ImagePayload::from_bytes(b"fake png", "screenshot.png"));
        let result = router.route(msg, &session_id()).await.unwrap();

        match result {
            Some(Message::ImageAdded(added)) => {
                assert!(added.path.starts_with("/tmp/ai_image_"));
                assert_eq!(added.filename, "screenshot.png");
            }
            other => panic!("expected ImageAdded, got {:?}", other),
        }
        assert_eq!(*manager.artifact_requests.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_route_image_rejection_is_recoverable() {
        let manager = Arc::new(MockSessionManager::failing(|| {
            SessionError::Artifact(ArtifactError::Unsupported)
        }));
        let router = MessageRouter::new(Arc::clone(&manager));

        let msg = Message::Image(ImagePayload::from_bytes(b"fake png", "shot.png"));
        let err = router.route(msg, &session_id()).await.unwrap_err();

        let notice = err.to_error_message();
        assert_eq!(notice.code, ErrorCode::Artifact);
        assert!(notice.recoverable);
    }

    #[tokio::test]
    async fn test_route_ping_replies_pong() {
        let (router, _manager) = test_router();

        let result = router.route(Message::Ping, &session_id()).await.unwrap();
        assert_eq!(result, Some(Message::Pong));
    }

    #[tokio::test]
    async fn test_route_duplicate_open_rejected() {
        let (router, _manager) = test_router();

        let params = SessionParams::new("/tmp", AgentKind::Shell);
        let err = router
            .route(Message::Open(params), &session_id())
            .await
            .unwrap_err();

        assert!(matches!(err, RouterError::InvalidRequest(_)));
        let notice = err.to_error_message();
        assert_eq!(notice.code, ErrorCode::Protocol);
        assert!(notice.recoverable);
    }

    #[tokio::test]
    async fn test_route_server_bound_messages_ignored() {
        let (router, _manager) = test_router();
        let id = session_id();

        let ignored = [
            Message::Ready(SessionReady {
                session_id: id.clone(),
                agent: AgentKind::Shell,
                workdir: "/tmp".to_string(),
            }),
            Message::TerminalOutput(protocol::OutputChunk::new(b"out".to_vec())),
            Message::ImageAdded(ImageAdded {
                path: "/tmp/x.png".to_string(),
                filename: "x.png".to_string(),
            }),
            Message::Exited(ProcessExit { exit_code: Some(0) }),
            Message::Pong,
            Message::Error(ErrorMessage::new(ErrorCode::Transport, "peer says", true)),
        ];

        for msg in ignored {
            let result = router.route(msg, &id).await.unwrap();
            assert!(result.is_none());
        }
    }

    #[test]
    fn test_error_taxonomy_mapping() {
        let cases: Vec<(SessionError, ErrorCode, bool)> = vec![
            (
                SessionError::NotFound("x".to_string()),
                ErrorCode::ProcessExited,
                false,
            ),
            (
                SessionError::AlreadyExited("x".to_string()),
                ErrorCode::ProcessExited,
                false,
            ),
            (SessionError::CapacityExceeded(10), ErrorCode::Spawn, false),
            (
                SessionError::SpawnFailed("no such program".to_string()),
                ErrorCode::Spawn,
                false,
            ),
            (
                SessionError::WriteFailed("broken pipe".to_string()),
                ErrorCode::Transport,
                true,
            ),
            (
                SessionError::Artifact(ArtifactError::Unsupported),
                ErrorCode::Artifact,
                true,
            ),
        ];

        for (session_error, code, recoverable) in cases {
            let notice = RouterError::Session(session_error).to_error_message();
            assert_eq!(notice.code, code);
            assert_eq!(notice.recoverable, recoverable);
        }
    }
}
