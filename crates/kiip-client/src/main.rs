//! Kiip client binary.
//!
//! # Usage
//!
//! ```bash
//! # Two instances sharing one store; only the leader connects
//! kiip-client --url ws://localhost:3020 --store-dir .kiip
//! kiip-client --url ws://localhost:3020 --store-dir .kiip --rank hidden
//! ```

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use kiip_client::{
    Client, ClientConfig, ClientError, DEFAULT_STORE_DIR, DEFAULT_URL, run_console, shutdown_signal,
};
use kiip_core::{ActivityRank, ElectionConfig, ReconnectPolicy, TransportConfig};
use tokio::{io::BufReader, task::LocalSet};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Kiip client
#[derive(Parser, Debug)]
#[command(name = "kiip-client")]
#[command(about = "Kiip client with cross-instance leader election")]
#[command(version)]
struct Args {
    /// Server WebSocket URL
    #[arg(long, default_value = DEFAULT_URL)]
    url: String,

    /// Directory shared with the other instances
    #[arg(long, default_value = DEFAULT_STORE_DIR)]
    store_dir: PathBuf,

    /// Delay before reconnecting, in milliseconds
    #[arg(long, default_value = "1000")]
    reconnect_interval_ms: u64,

    /// Double the reconnect delay after each failure, up to this many milliseconds
    #[arg(long)]
    max_backoff_ms: Option<u64>,

    /// Store scan interval, in milliseconds
    #[arg(long, default_value = "50")]
    poll_interval_ms: u64,

    /// Activity rank at startup (focused, visible, hidden)
    #[arg(long, default_value = "focused")]
    rank: ActivityRank,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).init();

    if args.poll_interval_ms == 0 {
        return Err(ClientError::Config("--poll-interval-ms must be positive".into()).into());
    }

    let reconnect_policy = match args.max_backoff_ms {
        Some(max) => ReconnectPolicy::Backoff { max: Duration::from_millis(max) },
        None => ReconnectPolicy::Fixed,
    };
    let config = ClientConfig {
        url: args.url,
        store_dir: args.store_dir,
        transport: TransportConfig {
            reconnect_interval: Duration::from_millis(args.reconnect_interval_ms),
            reconnect_policy,
            ..TransportConfig::default()
        },
        election: ElectionConfig::default(),
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        rank: args.rank,
    };

    tracing::info!("Kiip client starting");
    tracing::info!("Store directory {}", config.store_dir.display());

    LocalSet::new()
        .run_until(async move {
            let client = Client::start(config)?;
            let stdin = BufReader::new(tokio::io::stdin());
            let result = tokio::select! {
                result = run_console(&client, stdin, tokio::io::stdout()) => result,
                signal = shutdown_signal() => signal,
            };
            client.shutdown();
            result
        })
        .await?;

    Ok(())
}

