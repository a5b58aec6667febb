use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use relay_core::codec::encode_message;
use relay_core::sync::locked;
use relay_core::{Message, RelayError, Result};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub queue_capacity: usize,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    pub max_frame_bytes: usize,
}

/// Write side of one websocket peer. Frames are queued to a dedicated writer
/// task; cancelling `closed` ends both the writer and the read loop.
pub(crate) struct Connection {
    pub conn_id: String,
    sender: mpsc::Sender<WsMessage>,
    closed: CancellationToken,
    last_seen: Mutex<Instant>,
    max_frame_bytes: usize,
}

impl Connection {
    pub fn spawn(
        conn_id: String,
        mut ws_sender: SplitSink<WebSocket, WsMessage>,
        settings: &ConnectionSettings,
        closed: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<WsMessage>(settings.queue_capacity.max(1));
        let write_timeout = settings.write_timeout;
        let ping_interval = settings.ping_interval;
        let writer_closed = closed.clone();
        let writer_id = conn_id.clone();
        let write_task = tokio::spawn(async move {
            let mut ping = (!ping_interval.is_zero()).then(|| {
                let mut ticker = tokio::time::interval(ping_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker
            });
            loop {
                let frame = tokio::select! {
                    _ = writer_closed.cancelled() => {
                        let close = WsMessage::Close(Some(CloseFrame {
                            code: 1000,
                            reason: "closing".into(),
                        }));
                        let _ = tokio::time::timeout(write_timeout, ws_sender.send(close)).await;
                        return;
                    }
                    frame = rx.recv() => match frame {
                        Some(frame) => frame,
                        None => return,
                    },
                    _ = async {
                        match ping.as_mut() {
                            Some(ticker) => {
                                ticker.tick().await;
                            }
                            None => std::future::pending::<()>().await,
                        }
                    } => WsMessage::Ping(Vec::new()),
                };
                match tokio::time::timeout(write_timeout, ws_sender.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(event = "write_error", conn_id = %writer_id, error = %err);
                        writer_closed.cancel();
                        return;
                    }
                    Err(_) => {
                        warn!(event = "write_timeout", conn_id = %writer_id);
                        writer_closed.cancel();
                        return;
                    }
                }
            }
        });

        let connection = Self {
            conn_id,
            sender: tx,
            closed,
            last_seen: Mutex::new(Instant::now()),
            max_frame_bytes: settings.max_frame_bytes,
        };
        (connection, write_task)
    }

    pub fn touch(&self) {
        *locked(&self.last_seen) = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        *locked(&self.last_seen)
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub async fn send(&self, message: &Message) -> Result<()> {
        let text = encode_message(message, self.max_frame_bytes)?;
        debug!(event = "message_sent", conn_id = %self.conn_id, name = %message.name);
        self.sender
            .send(WsMessage::Text(text))
            .await
            .map_err(|_| RelayError::transport(&self.conn_id, "connection closed"))
    }
}

/// Extracts the payload of a data frame; control frames yield None.
pub(crate) fn frame_bytes(frame: WsMessage) -> Option<Vec<u8>> {
    match frame {
        WsMessage::Text(text) => Some(text.into_bytes()),
        WsMessage::Binary(bytes) => Some(bytes),
        WsMessage::Close(_) | WsMessage::Ping(_) | WsMessage::Pong(_) => None,
    }
}
