//! Output pump.
//!
//! One pump per live session drains the raw PTY reader channel and
//! forwards the bytes to the session's broadcaster. The pump alternates
//! two regimes: right after data it sleeps ~1 ms and coalesces whatever
//! accumulated into a single broadcast (low latency without per-read
//! overhead), and while the child is quiescent it parks on the channel
//! under a ~50 ms poll cap (near-zero CPU). When the process ends the
//! pump emits the exit notification to every attached transport.

use std::sync::Arc;
use std::time::Duration;

use protocol::{Message, OutputChunk, ProcessExit};
use tokio::sync::mpsc;

use crate::session::broadcaster::OutputBroadcaster;
use crate::session::pty::ProcessHandle;

/// Settle time after the first chunk of a burst before broadcasting.
const SETTLE_DELAY: Duration = Duration::from_millis(1);

/// Poll cap while no output is arriving.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Upper bound on chunks merged into one broadcast.
const COALESCE_MAX_CHUNKS: usize = 64;

/// How long to wait for the exit code after the output stream ends.
const EXIT_CODE_WAIT: Duration = Duration::from_secs(2);

/// Drives one session's output from the PTY to its broadcaster.
///
/// Runs until the process exits or the reader channel closes, then emits
/// the exit notification and returns the exit code when one was
/// observable. The caller removes the registry entry afterwards; a dead
/// process must never linger in the registry.
pub async fn pump_output(
    handle: Arc<ProcessHandle>,
    mut raw_rx: mpsc::Receiver<Vec<u8>>,
    broadcaster: Arc<OutputBroadcaster>,
) -> Option<i32> {
    let session_id = handle.session_id().clone();

    loop {
        match tokio::time::timeout(IDLE_POLL, raw_rx.recv()).await {
            Ok(Some(first)) => {
                handle.mark_output_seen();
                tokio::time::sleep(SETTLE_DELAY).await;

                let mut chunk = first;
                let mut merged = 1;
                while merged < COALESCE_MAX_CHUNKS {
                    match raw_rx.try_recv() {
                        Ok(more) => {
                            chunk.extend_from_slice(&more);
                            merged += 1;
                        }
                        Err(_) => break,
                    }
                }

                broadcaster
                    .broadcast(Message::TerminalOutput(OutputChunk::new(chunk)))
                    .await;
            }
            Ok(None) => {
                tracing::debug!(session_id = %session_id, "reader channel closed");
                break;
            }
            Err(_) => {
                // Idle: cheap liveness probe so an exit whose EOF never
                // propagates (platform quirk) still ends the pump.
                match handle.try_wait().await {
                    Ok(None) => {}
                    Ok(Some(_)) | Err(_) => {
                        drain_remaining(&handle, &mut raw_rx, &broadcaster).await;
                        break;
                    }
                }
            }
        }
    }

    let exit_code = handle.wait_exit_code(EXIT_CODE_WAIT).await;

    if !handle.output_seen() {
        // Dead on arrival: nothing was ever rendered, so leave the user a
        // clue in the output stream itself.
        let hint = format!(
            "\r\n[process exited before producing output; try running '{}' manually]\r\n",
            handle.program()
        );
        broadcaster
            .broadcast(Message::TerminalOutput(OutputChunk::new(hint.into_bytes())))
            .await;
    }

    tracing::info!(
        session_id = %session_id,
        exit_code = ?exit_code,
        "session process ended"
    );
    broadcaster
        .send_direct(Message::Exited(ProcessExit { exit_code }))
        .await;

    exit_code
}

/// Flushes whatever the reader buffered before the exit was noticed.
async fn drain_remaining(
    handle: &ProcessHandle,
    raw_rx: &mut mpsc::Receiver<Vec<u8>>,
    broadcaster: &OutputBroadcaster,
) {
    let mut tail: Vec<u8> = Vec::new();
    while let Ok(more) = raw_rx.try_recv() {
        tail.extend_from_slice(&more);
    }
    if !tail.is_empty() {
        handle.mark_output_seen();
        broadcaster
            .broadcast(Message::TerminalOutput(OutputChunk::new(tail)))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::LaunchPlan;
    use protocol::{AgentKind, SessionParams};
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn shell_plan(program: &str) -> LaunchPlan {
        LaunchPlan {
            program: program.to_string(),
            args: vec![],
            env: vec![],
        }
    }

    async fn start_session(
        dir: &TempDir,
        program: &str,
    ) -> (Arc<ProcessHandle>, Arc<OutputBroadcaster>) {
        let params = SessionParams::new(dir.path(), AgentKind::Shell);
        let handle =
            Arc::new(ProcessHandle::spawn(&params, &shell_plan(program)).unwrap());
        let raw_rx = handle.start_reader().await.unwrap();
        let broadcaster = Arc::new(OutputBroadcaster::new());

        let pump_handle = Arc::clone(&handle);
        let pump_broadcaster = Arc::clone(&broadcaster);
        tokio::spawn(async move {
            pump_output(pump_handle, raw_rx, pump_broadcaster).await;
        });

        (handle, broadcaster)
    }

    async fn collect_until<F>(
        rx: &mut mpsc::Receiver<Message>,
        mut predicate: F,
    ) -> Option<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        for _ in 0..100 {
            match timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(msg)) => {
                    if predicate(&msg) {
                        return Some(msg);
                    }
                }
                Ok(None) => return None,
                Err(_) => {}
            }
        }
        None
    }

    #[tokio::test]
    async fn test_pump_delivers_output_in_order() {
        let dir = TempDir::new().unwrap();
        let (handle, broadcaster) = start_session(&dir, "/bin/sh").await;
        let mut rx = broadcaster.attach("t".to_string()).await;

        // The command echo never contains "AB" adjacent, so seeing "AB"
        // proves both prints arrived, in production order.
        handle.write(b"printf A; printf B\n").await.unwrap();

        let mut seen: Vec<u8> = Vec::new();
        for _ in 0..100 {
            match timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(Message::TerminalOutput(chunk))) => {
                    seen.extend_from_slice(&chunk.data);
                    if String::from_utf8_lossy(&seen).contains("AB") {
                        break;
                    }
                }
                Ok(Some(_)) | Err(_) => {}
                Ok(None) => break,
            }
        }
        let text = String::from_utf8_lossy(&seen);
        assert!(text.contains("AB"), "expected A then B in order, got: {text}");

        let _ = handle.kill_tree().await;
    }

    #[tokio::test]
    async fn test_pump_emits_exited_on_shell_exit() {
        let dir = TempDir::new().unwrap();
        let (handle, broadcaster) = start_session(&dir, "/bin/sh").await;
        let mut rx = broadcaster.attach("t".to_string()).await;

        handle.write(b"exit 7\n").await.unwrap();

        let exited = collect_until(&mut rx, |m| matches!(m, Message::Exited(_))).await;
        match exited {
            Some(Message::Exited(ProcessExit { exit_code })) => {
                assert_eq!(exit_code, Some(7));
            }
            other => panic!("expected exited notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pump_hints_when_process_dies_silently() {
        let dir = TempDir::new().unwrap();
        // `false` exits immediately without writing anything.
        let (_handle, broadcaster) = start_session(&dir, "false").await;
        let mut rx = broadcaster.attach("t".to_string()).await;

        let hint = collect_until(&mut rx, |m| {
            matches!(m, Message::TerminalOutput(chunk)
                if String::from_utf8_lossy(&chunk.data).contains("manually"))
        })
        .await;
        assert!(hint.is_some(), "expected a dead-on-arrival hint");

        let exited = collect_until(&mut rx, |m| matches!(m, Message::Exited(_))).await;
        assert!(exited.is_some(), "expected exited after the hint");
    }
}
