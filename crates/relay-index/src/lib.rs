//! Index hub: keeps the worker and UI registries and relays messages
//! between them over websockets.

mod connection;
mod http;
mod index;

pub use http::router;
pub use index::{Index, IndexConfig};

use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Serves the index on `listener` until `shutdown` is cancelled, then closes
/// every connection and drains the dispatcher.
pub async fn serve(
    index: Arc<Index>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let addr = listener.local_addr()?;
    index.clone().start_ui_reaper();
    info!(event = "index_start", addr = %addr);

    let graceful = {
        let index = index.clone();
        async move {
            shutdown.cancelled().await;
            index.shutdown();
        }
    };
    let result = axum::serve(listener, router(index.clone()))
        .with_graceful_shutdown(graceful)
        .await;
    index.close().await;
    info!(event = "index_stop", addr = %addr);
    result
}
