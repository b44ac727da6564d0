//! Optional auto-continue loop for unattended agent sessions.
//!
//! Watches a session's output and, when the agent goes quiet without
//! finishing, nudges it with a fixed continuation prompt. The idle heuristic
//! cannot tell a stalled agent from a long-running command, so the loop is
//! strictly opt-in and every run is bounded by hard stop conditions.

use std::sync::LazyLock;
use std::time::Duration;

use regex::bytes::Regex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How often the loop inspects the session.
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(3);

/// Quiet time after which the agent counts as idle.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(10);

/// Continuation prompts injected before the loop gives up.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Size of the rolling output window the checks run against.
const TAIL_CAPACITY: usize = 4096;

/// Length of the prefix used to fingerprint an error report.
const ERROR_SIGNATURE_BYTES: usize = 120;

/// Keywords that mark the output window as an error report.
static ERROR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|exception|failed|fatal|panic|traceback)\b")
        .expect("error keyword pattern is valid")
});

/// Tuning for the auto-continue loop.
#[derive(Debug, Clone)]
pub struct AutomationConfig {
    /// How often the loop inspects the session.
    pub check_period: Duration,
    /// Quiet time after which a continuation prompt is injected.
    pub idle_threshold: Duration,
    /// Hard cap on injected prompts.
    pub max_iterations: u32,
    /// Token whose appearance in the output means the work is finished.
    pub completion_sentinel: String,
    /// Prompt injected when the agent idles without finishing.
    pub continuation_prompt: String,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            check_period: DEFAULT_CHECK_PERIOD,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            completion_sentinel: "ALL_TASKS_COMPLETE".to_string(),
            continuation_prompt: "continue".to_string(),
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomationOutcome {
    /// The completion sentinel appeared in the output.
    Completed,
    /// The iteration cap was reached without a sentinel.
    LimitReached,
    /// The same error fingerprint appeared on two consecutive quiet checks.
    StuckLoop,
    /// The cancellation token fired.
    Cancelled,
    /// The output stream ended or input could no longer be queued.
    Detached,
}

/// Runs the loop until a stop condition fires.
///
/// `output_rx` taps the session's output stream; `input_tx` carries injected
/// prompts back to the session as raw input. Stop conditions in precedence
/// order: completion sentinel, iteration cap, stuck error loop. A stuck
/// verdict is never reported as success.
pub async fn run(
    config: AutomationConfig,
    mut output_rx: mpsc::Receiver<Vec<u8>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) -> AutomationOutcome {
    let mut tail: Vec<u8> = Vec::with_capacity(TAIL_CAPACITY);
    let mut last_output = Instant::now();
    let mut output_since_check = false;
    let mut iterations: u32 = 0;
    let mut last_signature: Option<Vec<u8>> = None;

    let mut ticker = tokio::time::interval(config.check_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick resolves immediately; checks start one period in.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return AutomationOutcome::Cancelled,
            chunk = output_rx.recv() => match chunk {
                Some(chunk) => {
                    append_tail(&mut tail, &chunk);
                    last_output = Instant::now();
                    output_since_check = true;
                }
                None => return AutomationOutcome::Detached,
            },
            _ = ticker.tick() => {
                if contains_token(&tail, config.completion_sentinel.as_bytes()) {
                    info!(iterations, "completion sentinel seen");
                    return AutomationOutcome::Completed;
                }
                if iterations >= config.max_iterations {
                    info!(iterations, "iteration cap reached");
                    return AutomationOutcome::LimitReached;
                }
                // A stable error fingerprint across two quiet checks means
                // the agent is going in circles; more prompts will not help.
                if output_since_check {
                    last_signature = None;
                    output_since_check = false;
                } else if let Some(signature) = error_signature(&tail) {
                    if last_signature.as_deref() == Some(signature) {
                        info!(iterations, "stuck error loop detected");
                        return AutomationOutcome::StuckLoop;
                    }
                    last_signature = Some(signature.to_vec());
                } else {
                    last_signature = None;
                }
                if last_output.elapsed() >= config.idle_threshold {
                    iterations += 1;
                    debug!(iterations, "injecting continuation prompt");
                    let mut prompt = config.continuation_prompt.clone().into_bytes();
                    prompt.push(b'\n');
                    if input_tx.send(prompt).await.is_err() {
                        return AutomationOutcome::Detached;
                    }
                    last_output = Instant::now();
                }
            }
        }
    }
}

/// Appends a chunk, keeping only the newest window of output.
fn append_tail(tail: &mut Vec<u8>, chunk: &[u8]) {
    tail.extend_from_slice(chunk);
    if tail.len() > TAIL_CAPACITY {
        let excess = tail.len() - TAIL_CAPACITY;
        tail.drain(..excess);
    }
}

fn contains_token(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

/// Fingerprint of the most recent error keyword in the window, if any.
///
/// The fingerprint anchors at the last keyword match so a newer, different
/// error displaces an older one still inside the window.
fn error_signature(tail: &[u8]) -> Option<&[u8]> {
    let found = ERROR_PATTERN.find_iter(tail).last()?;
    let end = tail.len().min(found.start() + ERROR_SIGNATURE_BYTES);
    Some(&tail[found.start()..end])
}
