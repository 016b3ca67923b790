//! Client side of the signaling link: a websocket that survives unexpected
//! closes with capped exponential backoff and flushes queued sends on reopen.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::{info, warn};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{ClientMessage, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reconnect schedule on unexpected close, capped at the final value. The
/// attempt counter resets on a successful open.
const RECONNECT_DELAYS: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
];

#[derive(Debug, Error)]
pub enum SignalClientError {
    #[error("signaling client is closed")]
    Closed,
}

/// Events surfaced to the session controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    /// The server assigned us an identity. Re-emitted after each reconnect.
    Connected { client_id: String },
    Message(ServerMessage),
    /// The client was closed explicitly; no further events follow.
    Closed,
}

/// Handle to the signaling transport. Sends enqueue onto an unbounded queue
/// drained by the connection task; messages enqueued while the link is down
/// are flushed once it reopens.
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl SignalingClient {
    /// Spawn the connection task against `url` and return the handle plus
    /// the event stream.
    pub fn connect(url: Url) -> (Self, mpsc::UnboundedReceiver<SignalEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        tokio::spawn(run_link(
            url,
            outbound_rx,
            event_tx,
            closed.clone(),
            shutdown.clone(),
        ));

        (
            Self {
                outbound: outbound_tx,
                closed,
                shutdown,
            },
            event_rx,
        )
    }

    /// Clone of the outbound queue, for wiring into the session controller.
    /// Bypasses the closed check; sends after [`SignalingClient::close`] are
    /// dropped by the connection task.
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.outbound.clone()
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), SignalClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalClientError::Closed);
        }
        self.outbound
            .send(message)
            .map_err(|_| SignalClientError::Closed)
    }

    /// Close the link for good; suppresses reconnection.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }
}

async fn run_link(
    url: Url,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::UnboundedSender<SignalEvent>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let mut attempt: usize = 0;
    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                info!("signaling connected to {url}");
                attempt = 0;
                run_connection(stream, &mut outbound, &events, &shutdown).await;
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                warn!("signaling link lost, reconnecting");
            }
            Err(err) => {
                warn!("signaling connect to {url} failed: {err}");
            }
        }
        let delay = RECONNECT_DELAYS[attempt.min(RECONNECT_DELAYS.len() - 1)];
        attempt += 1;
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.notified() => break,
        }
    }
    let _ = events.send(SignalEvent::Closed);
}

async fn run_connection(
    stream: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    events: &mpsc::UnboundedSender<SignalEvent>,
    shutdown: &Notify,
) {
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            Some(message) = outbound.recv() => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("signaling encode failed: {err}");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            maybe_msg = source.next() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(ServerMessage::Connected { client_id }) => {
                                let _ = events.send(SignalEvent::Connected { client_id });
                            }
                            Ok(message) => {
                                let _ = events.send(SignalEvent::Message(message));
                            }
                            Err(err) => warn!("invalid signaling payload: {err}"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
