// ===============================
// src/stream.rs (push-stream connection loop)
// ===============================
//
// One task per socket. The task:
// - connects, hands every text frame to the caller's handler (in order)
// - on client teardown sends Close(1000) and exits, never reconnects
// - on drop/error reconnects with exponential backoff + jitter, up to
//   `max_retries` consecutive failures (0 = stop on first disconnect)
//
use std::borrow::Cow;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::metrics::{WS_CONNECTED, WS_RECONNECTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_ms: u64,
    pub max_shift: u32,
    pub jitter_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_ms: 500, max_shift: 6, jitter_ms: 250 }
    }
}

impl ReconnectPolicy {
    pub fn never() -> Self { Self { max_retries: 0, ..Self::default() } }

    /// Delay before reconnect attempt number `attempt` (1-based):
    /// base * 2^min(attempt, max_shift) + jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.min(self.max_shift);
        let base = self.base_ms.saturating_mul(1u64 << shift);
        let jitter = if self.jitter_ms > 0 { rand::thread_rng().gen_range(0..=self.jitter_ms) } else { 0 };
        Duration::from_millis(base.saturating_add(jitter))
    }
}

/// Owner side of a running socket task. Dropping it tears the socket down.
pub struct StreamHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StreamHandle {
    /// Signal teardown without waiting for the socket to close.
    pub fn close(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Signal teardown and wait until the task exits.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let Some(task) = self.task.take() else { return };
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                error!(?e, "stream task panicked");
            }
        }
    }

    pub fn is_finished(&self) -> bool { self.task.as_ref().map_or(true, JoinHandle::is_finished) }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

enum Exit { Teardown, Dropped }

/// Spawn a socket task. `make_url` is called before every connection attempt
/// (so credentials can be re-read); returning `None` stops the task.
pub fn spawn<U, H>(kind: &'static str, label: String, policy: ReconnectPolicy, make_url: U, on_text: H) -> StreamHandle
where
    U: FnMut() -> Option<Url> + Send + 'static,
    H: FnMut(&str) + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let task = tokio::spawn(run(kind, label, policy, make_url, on_text, rx));
    StreamHandle { shutdown: Some(tx), task: Some(task) }
}

async fn run<U, H>(
    kind: &'static str,
    label: String,
    policy: ReconnectPolicy,
    mut make_url: U,
    mut on_text: H,
    mut shutdown: oneshot::Receiver<()>,
) where
    U: FnMut() -> Option<Url>,
    H: FnMut(&str),
{
    let mut attempt: u32 = 0;
    loop {
        let Some(url) = make_url() else {
            warn!(stream = kind, %label, "no url for stream, stopping");
            return;
        };

        info!(stream = kind, %label, "connecting");
        let connected = tokio::select! {
            biased;
            _ = &mut shutdown => return,
            res = connect_async(url.as_str()) => res,
        };

        match connected {
            Ok((ws, _resp)) => {
                info!(stream = kind, %label, "connected");
                attempt = 0;
                WS_CONNECTED.with_label_values(&[kind]).inc();
                let (mut sink, mut source) = ws.split();

                let exit = loop {
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => {
                            let frame = CloseFrame { code: CloseCode::Normal, reason: Cow::Borrowed("client teardown") };
                            let _ = sink.send(Message::Close(Some(frame))).await;
                            let _ = sink.close().await;
                            break Exit::Teardown;
                        }
                        frame = source.next() => match frame {
                            Some(Ok(Message::Text(txt))) => on_text(&txt),
                            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                                Ok(txt) => on_text(txt),
                                Err(_) => debug!(stream = kind, %label, "non-utf8 binary frame dropped"),
                            },
                            Some(Ok(Message::Close(frame))) => {
                                info!(stream = kind, %label, ?frame, "closed by server");
                                break Exit::Dropped;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(stream = kind, %label, error = %e, "read error");
                                break Exit::Dropped;
                            }
                            None => break Exit::Dropped,
                        }
                    }
                };

                WS_CONNECTED.with_label_values(&[kind]).dec();
                if let Exit::Teardown = exit {
                    info!(stream = kind, %label, "closed");
                    return;
                }
            }
            Err(e) => {
                warn!(stream = kind, %label, error = %e, "connect failed");
            }
        }

        attempt = attempt.saturating_add(1);
        if attempt > policy.max_retries {
            warn!(stream = kind, %label, attempts = attempt, "giving up, stream stays down until resubscribed");
            return;
        }
        let delay = policy.delay(attempt);
        WS_RECONNECTS.with_label_values(&[kind]).inc();
        info!(stream = kind, %label, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::select! {
            biased;
            _ = &mut shutdown => return,
            _ = sleep(delay) => {}
        }
    }
}
