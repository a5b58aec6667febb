use axum::{body::Bytes, extract::State, http::StatusCode, routing::get, routing::post, Router};
use relay_core::codec::decode_message;
use std::sync::Arc;
use tracing::warn;

use crate::worker::Worker;

/// Peer-facing HTTP surface of a worker.
pub fn router(worker: Arc<Worker>) -> Router {
    Router::new()
        .route("/ok", get(|| async { StatusCode::OK }))
        .route("/messages", post(receive_message))
        .with_state(worker)
}

async fn receive_message(State(worker): State<Arc<Worker>>, body: Bytes) -> StatusCode {
    match decode_message(&body, worker.config().max_frame_bytes) {
        Ok(message) => {
            worker.receive(message);
            StatusCode::OK
        }
        Err(err) => {
            warn!(event = "message_invalid", source = "peer", error = %err);
            StatusCode::BAD_REQUEST
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::WorkerConfig;
    use crate::worker::Worker;
    use relay_core::codec::encode_message;
    use relay_core::{DispatchCondition, Identifier, Message};
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn serve(name: &str) -> (std::sync::Arc<Worker>, String) {
        let worker = Worker::new(WorkerConfig::new(name, "127.0.0.1:1")).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = worker.serve(listener).unwrap();
        (worker, format!("http://{addr}"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn health_endpoint_answers_ok() {
        let (worker, base) = serve("w1").await;
        assert_eq!(worker.addr(), base);
        let response = reqwest::get(format!("{base}/ok")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        worker.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn posted_messages_reach_local_handlers() {
        let (worker, base) = serve("w1").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        worker.on(DispatchCondition::name("say.done"), move |message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
                Ok(())
            }
        });

        let message = Message::new(
            Identifier::runnable("speak", "w2"),
            Some(Identifier::worker("w1")),
            "say.done",
        );
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/messages"))
            .body(encode_message(&message, 1024).unwrap())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, message);

        let response = client
            .post(format!("{base}/messages"))
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        worker.shutdown().await;
    }
}
