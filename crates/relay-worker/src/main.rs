use anyhow::Context;
use clap::Parser;
use relay_core::config::{self, Credentials};
use relay_core::logging::{init_logging, LogSettings};
use relay_core::runnable::{Dispatch, FnRunnable, Metadata};
use relay_core::Message;
use relay_worker::{Worker, WorkerConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

const ECHO_REQUEST: &str = "echo";
const ECHO_REPLY: &str = "echo.reply";

#[derive(Parser, Debug)]
#[command(name = "relay-worker")]
struct Args {
    #[arg(long, default_value = "")]
    name: String,
    /// Address the peer HTTP surface listens on.
    #[arg(long, default_value = "")]
    addr: String,
    /// Base URL advertised to peers; defaults to the listen address.
    #[arg(long, default_value = "")]
    advertised_addr: String,
    #[arg(long, default_value = "")]
    index_addr: String,
    #[arg(long, default_value = "")]
    username: String,
    #[arg(long, default_value = "")]
    password: String,
    #[arg(long, default_value_t = 2)]
    retry_delay: u64,
    #[arg(long, default_value_t = false)]
    autostart: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[derive(Debug, Clone)]
struct Config {
    addr: String,
    log_dir: String,
    autostart: bool,
    worker: WorkerConfig,
}

fn load_config() -> Config {
    let args = Args::parse();
    let default_name = format!("worker-{}", std::process::id());
    let debug = args.debug || config::env_true(config::ENV_DEBUG);
    Config {
        addr: config::resolve(&args.addr, config::ENV_WORKER_ADDR, config::DEFAULT_WORKER_ADDR),
        log_dir: config::resolve(&args.log_dir, config::ENV_LOG_DIR, ""),
        autostart: args.autostart,
        worker: WorkerConfig {
            name: config::resolve(&args.name, config::ENV_WORKER_NAME, &default_name),
            index_addr: config::resolve(
                &args.index_addr,
                config::ENV_INDEX_ADDR,
                config::DEFAULT_INDEX_ADDR,
            ),
            advertised_addr: args.advertised_addr.trim().to_string(),
            credentials: Credentials::resolve(&args.username, &args.password),
            retry_delay: Duration::from_secs(args.retry_delay.max(1)),
            debug,
            ..WorkerConfig::default()
        },
    }
}

/// Answers every `echo` message with an `echo.reply` carrying the same payload.
fn echo_runnable() -> FnRunnable {
    FnRunnable::idle(Metadata::new("echo", "replies to echo messages")).with_on_message(
        |message: Message, dispatch: Dispatch| async move {
            if message.name != ECHO_REQUEST {
                return Ok(());
            }
            let mut reply = dispatch.message(Some(message.from), ECHO_REPLY);
            reply.payload = message.payload;
            dispatch.send(reply).await
        },
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    let _log_guard = init_logging(&LogSettings {
        component: "worker".to_string(),
        name: config.worker.name.clone(),
        log_dir: config.log_dir.clone(),
        debug: config.worker.debug,
    });

    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid addr {}", config.addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr} failed"))?;

    let worker = Worker::new(config.worker.clone())?;
    worker.add_runnable(echo_runnable())?;
    worker.serve(listener)?;
    worker.connect()?;
    if config.autostart {
        if let Err(err) = worker.start_runnable("echo") {
            warn!(event = "autostart_failed", error = %err);
        }
    }

    let _ = tokio::signal::ctrl_c().await;
    info!(event = "signal_received");
    worker.shutdown().await;
    Ok(())
}
