use relay_core::codec::DEFAULT_MAX_FRAME_BYTES;
use relay_core::config::{Credentials, DEFAULT_INDEX_ADDR};
use relay_core::dispatcher::DEFAULT_MAX_IN_FLIGHT;
use std::time::Duration;
use url::Url;

const WORKER_SOCKET_PATH: &str = "/websockets/worker";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    /// `host:port` of the index, or a full `ws://` URL.
    pub index_addr: String,
    /// Base URL peers use to reach this worker. Filled from the bound listener
    /// when empty.
    pub advertised_addr: String,
    pub credentials: Option<Credentials>,
    pub retry_delay: Duration,
    pub peer_timeout: Duration,
    pub max_frame_bytes: usize,
    pub max_in_flight: usize,
    pub debug: bool,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>, index_addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index_addr: index_addr.into(),
            ..Self::default()
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            index_addr: DEFAULT_INDEX_ADDR.to_string(),
            advertised_addr: String::new(),
            credentials: None,
            retry_delay: Duration::from_secs(2),
            peer_timeout: Duration::from_secs(5),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            debug: false,
        }
    }
}

pub fn index_url(addr: &str) -> Result<Url, url::ParseError> {
    let addr = addr.trim();
    if addr.contains("://") {
        let mut url = Url::parse(addr)?;
        if url.path().is_empty() || url.path() == "/" {
            url.set_path(WORKER_SOCKET_PATH);
        }
        return Ok(url);
    }
    Url::parse(&format!("ws://{addr}{WORKER_SOCKET_PATH}"))
}
