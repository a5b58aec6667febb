use axum::{
    extract::{ws::WebSocketUpgrade, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tracing::warn;

use crate::index::Index;

pub fn router(index: Arc<Index>) -> Router {
    Router::new()
        .route("/ok", get(|| async { StatusCode::OK }))
        .route("/api/workers", get(list_workers))
        .route("/websockets/worker", get(worker_ws_handler))
        .route("/websockets/ui", get(ui_ws_handler))
        .layer(middleware::from_fn_with_state(index.clone(), require_auth))
        .with_state(index)
}

async fn require_auth(State(index): State<Arc<Index>>, request: Request, next: Next) -> Response {
    let Some(credentials) = &index.config().credentials else {
        return next.run(request).await;
    };
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| credentials.verify(value))
        .unwrap_or(false);
    if !authorized {
        warn!(event = "unauthorized", path = %request.uri().path());
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"relay\"")],
        )
            .into_response();
    }
    next.run(request).await
}

async fn list_workers(State(index): State<Arc<Index>>) -> impl IntoResponse {
    Json(index.workers())
}

async fn worker_ws_handler(
    ws: WebSocketUpgrade,
    State(index): State<Arc<Index>>,
) -> impl IntoResponse {
    let max_frame_bytes = index.config().max_frame_bytes;
    ws.max_message_size(max_frame_bytes)
        .on_upgrade(move |socket| index.handle_worker_socket(socket))
}

async fn ui_ws_handler(ws: WebSocketUpgrade, State(index): State<Arc<Index>>) -> impl IntoResponse {
    let max_frame_bytes = index.config().max_frame_bytes;
    ws.max_message_size(max_frame_bytes)
        .on_upgrade(move |socket| index.handle_ui_socket(socket))
}
