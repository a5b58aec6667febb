//! Worker node: hosts runnables, registers with the index and exchanges
//! messages with peers directly over HTTP.

mod config;
mod peer;
mod server;
mod upstream;
mod worker;

pub use config::{index_url, WorkerConfig};
pub use server::router;
pub use worker::Worker;
