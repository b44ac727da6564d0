//! Render-side delivery policy for terminal output.
//!
//! Interactive agents emit output far faster than a terminal widget can
//! usefully paint. The delivery loop coalesces everything received within one
//! animation frame into a single write, preserving byte order, and restores
//! the bottom pin only when the user had not scrolled away.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Interval on which buffered output is flushed to the sink, one frame at
/// roughly 60 Hz.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(16);

/// Rendering surface the delivery loop writes into.
///
/// Implementations are terminal widgets or test doubles. Calls arrive from
/// the delivery task, one flush at a time.
pub trait OutputSink: Send {
    /// Writes bytes to the surface in production order.
    fn render(&mut self, data: &[u8]);

    /// Whether the view is currently pinned to the bottom.
    fn is_scrolled_to_bottom(&self) -> bool;

    /// Re-pins the view to the bottom.
    fn scroll_to_bottom(&mut self);
}

/// Runs the delivery loop until the output channel closes or the token fires.
///
/// Buffered bytes always flush before the loop exits, so a process's final
/// output is never lost to shutdown timing.
pub async fn deliver_output<S: OutputSink>(
    mut output_rx: mpsc::Receiver<Vec<u8>>,
    mut sink: S,
    cancel: CancellationToken,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                flush(&mut pending, &mut sink);
                return;
            }
            chunk = output_rx.recv() => match chunk {
                Some(chunk) => pending.extend_from_slice(&chunk),
                None => {
                    flush(&mut pending, &mut sink);
                    return;
                }
            },
            _ = ticker.tick() => flush(&mut pending, &mut sink),
        }
    }
}

/// Spawns [`deliver_output`] as a task.
pub fn spawn_delivery_loop<S>(
    output_rx: mpsc::Receiver<Vec<u8>>,
    sink: S,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    S: OutputSink + 'static,
{
    tokio::spawn(deliver_output(output_rx, sink, cancel))
}

/// Hands the pending buffer to the sink in one write.
fn flush<S: OutputSink>(pending: &mut Vec<u8>, sink: &mut S) {
    if pending.is_empty() {
        return;
    }
    // The pin check must happen before the write changes the scroll extent.
    let pinned = sink.is_scrolled_to_bottom();
    sink.render(pending);
    if pinned {
        sink.scroll_to_bottom();
    }
    pending.clear();
}
