use anyhow::Context;
use clap::Parser;
use relay_core::config::{self, Credentials};
use relay_core::logging::{init_logging, LogSettings};
use relay_index::{serve, Index, IndexConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "relay-index")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    username: String,
    #[arg(long, default_value = "")]
    password: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 30)]
    ui_timeout: u64,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[derive(Debug, Clone)]
struct Config {
    addr: String,
    log_dir: String,
    index: IndexConfig,
}

fn load_config() -> Config {
    let args = Args::parse();
    let debug = args.debug || config::env_true(config::ENV_DEBUG);
    Config {
        addr: config::resolve(&args.addr, config::ENV_INDEX_ADDR, config::DEFAULT_INDEX_ADDR),
        log_dir: config::resolve(&args.log_dir, config::ENV_LOG_DIR, ""),
        index: IndexConfig {
            credentials: Credentials::resolve(&args.username, &args.password),
            ui_timeout: Duration::from_secs(args.ui_timeout),
            ping_interval: Duration::from_secs(args.ping_interval),
            write_timeout: Duration::from_secs(args.write_timeout),
            debug,
            ..IndexConfig::default()
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    let _log_guard = init_logging(&LogSettings {
        component: "index".to_string(),
        name: config.addr.replace(':', "-"),
        log_dir: config.log_dir.clone(),
        debug: config.index.debug,
    });

    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid addr {}", config.addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr} failed"))?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(event = "signal_received");
            shutdown.cancel();
        });
    }

    let index = Index::new(config.index.clone());
    if let Err(err) = serve(index, listener, shutdown).await {
        error!(event = "index_error", error = %err);
        return Err(err.into());
    }
    Ok(())
}
