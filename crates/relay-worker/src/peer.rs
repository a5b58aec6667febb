use relay_core::codec::encode_message;
use relay_core::message::WorkerInfo;
use relay_core::{Message, RelayError, Result};
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

/// HTTP client for direct worker-to-worker delivery.
#[derive(Debug, Clone)]
pub(crate) struct PeerClient {
    client: reqwest::Client,
    max_frame_bytes: usize,
}

impl PeerClient {
    pub(crate) fn new(timeout: Duration, max_frame_bytes: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RelayError::transport("peer client", err))?;
        Ok(Self {
            client,
            max_frame_bytes,
        })
    }

    pub(crate) async fn post(&self, peer: &WorkerInfo, message: &Message) -> Result<()> {
        let body = encode_message(message, self.max_frame_bytes)?;
        let url = messages_url(&peer.addr);
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| RelayError::transport(&peer.name, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::PeerStatus {
                target: peer.name.clone(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

fn messages_url(addr: &str) -> String {
    let addr = addr.trim().trim_end_matches('/');
    if addr.contains("://") {
        format!("{addr}/messages")
    } else {
        format!("http://{addr}/messages")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_url_accepts_bare_and_full_addresses() {
        assert_eq!(messages_url("127.0.0.1:4001"), "http://127.0.0.1:4001/messages");
        assert_eq!(
            messages_url("http://10.0.0.2:4001/"),
            "http://10.0.0.2:4001/messages"
        );
    }
}
