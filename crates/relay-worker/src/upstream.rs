//! Link from a worker to the index: dial, register, pump frames, redial.

use futures_util::{SinkExt, StreamExt};
use relay_core::codec::{decode_message, encode_message};
use relay_core::config::Credentials;
use relay_core::{names, Message};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use url::Url;

use crate::worker::Worker;

enum SessionEnd {
    Cancelled,
    Closed,
    Failed(String),
}

/// Keeps the worker registered with the index until the worker shuts down.
/// Outbound messages queue in `outbox` and only leave once the index has
/// welcomed the current link.
pub(crate) async fn run(
    worker: Arc<Worker>,
    url: Url,
    mut outbox: mpsc::UnboundedReceiver<Message>,
) {
    let token = worker.token().clone();
    let retry_delay = worker.config().retry_delay;
    loop {
        let end = session(&worker, &url, &mut outbox).await;
        worker.set_registered(false);
        match end {
            SessionEnd::Cancelled => break,
            SessionEnd::Closed => info!(event = "index_closed", url = %url),
            SessionEnd::Failed(reason) => warn!(event = "index_error", url = %url, error = %reason),
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }
    debug!(event = "upstream_stop", worker = %worker.name());
}

async fn session(
    worker: &Worker,
    url: &Url,
    outbox: &mut mpsc::UnboundedReceiver<Message>,
) -> SessionEnd {
    let token = worker.token().clone();
    let max_frame_bytes = worker.config().max_frame_bytes;
    let request = match dial_request(url, worker.config().credentials.as_ref()) {
        Ok(request) => request,
        Err(err) => return SessionEnd::Failed(err),
    };
    let connected = tokio::select! {
        _ = token.cancelled() => return SessionEnd::Cancelled,
        connected = connect_async(request) => connected,
    };
    let mut ws = match connected {
        Ok((ws, _)) => ws,
        Err(err) => return SessionEnd::Failed(err.to_string()),
    };

    let register = match worker
        .register_message()
        .and_then(|message| encode_message(&message, max_frame_bytes).map_err(Into::into))
    {
        Ok(frame) => frame,
        Err(err) => return SessionEnd::Failed(err.to_string()),
    };
    if let Err(err) = ws.send(WsMessage::Text(register)).await {
        return SessionEnd::Failed(err.to_string());
    }
    info!(event = "index_connected", worker = %worker.name(), url = %url);

    let mut welcomed = false;
    let end = loop {
        tokio::select! {
            _ = token.cancelled() => break SessionEnd::Cancelled,
            frame = ws.next() => {
                let frame = match frame {
                    None | Some(Ok(WsMessage::Close(_))) => break SessionEnd::Closed,
                    Some(Err(err)) => break SessionEnd::Failed(err.to_string()),
                    Some(Ok(frame)) => frame,
                };
                let Some(bytes) = frame_bytes(frame) else {
                    continue;
                };
                match decode_message(&bytes, max_frame_bytes) {
                    Ok(message) => {
                        if message.name == names::WORKER_WELCOME {
                            welcomed = true;
                            worker.set_registered(true);
                        }
                        worker.receive(message);
                    }
                    Err(err) => warn!(event = "message_invalid", source = "index", error = %err),
                }
            }
            queued = outbox.recv(), if welcomed => {
                let Some(message) = queued else {
                    break SessionEnd::Cancelled;
                };
                let frame = match encode_message(&message, max_frame_bytes) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(event = "message_dropped", name = %message.name, error = %err);
                        continue;
                    }
                };
                if let Err(err) = ws.send(WsMessage::Text(frame)).await {
                    break SessionEnd::Failed(err.to_string());
                }
            }
        }
    };
    let _ = ws.close(None).await;
    end
}

fn dial_request(url: &Url, credentials: Option<&Credentials>) -> Result<Request, String> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| err.to_string())?;
    if let Some(credentials) = credentials {
        let value = HeaderValue::from_str(&credentials.authorization_header())
            .map_err(|err| err.to_string())?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }
    Ok(request)
}

fn frame_bytes(frame: WsMessage) -> Option<Vec<u8>> {
    match frame {
        WsMessage::Text(text) => Some(text.into_bytes()),
        WsMessage::Binary(bytes) => Some(bytes),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_carries_basic_credentials() {
        let url = Url::parse("ws://127.0.0.1:4000/websockets/worker").unwrap();
        let credentials = Credentials::from_parts("relay", "secret").unwrap();
        let request = dial_request(&url, Some(&credentials)).unwrap();
        let value = request.headers().get(header::AUTHORIZATION).unwrap();
        assert_eq!(value.to_str().unwrap(), credentials.authorization_header());

        let request = dial_request(&url, None).unwrap();
        assert!(request.headers().get(header::AUTHORIZATION).is_none());
    }
}
