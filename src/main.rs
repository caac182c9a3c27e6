use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use relay_ai::{HttpRecommendClient, RecommendClient};
use relay_server::ServerConfig;
use relay_store::Database;
use relay_telemetry::{init_telemetry, TelemetryConfig};

/// Clinical relay: terminal connections, HIS push routing, AI recommendation
/// orchestration and per-stimulus tracing.
#[derive(Parser, Debug)]
#[command(name = "cdss-relay", version)]
struct Args {
    /// Listen port.
    #[arg(long, env = "RELAY_PORT", default_value_t = 8000)]
    port: u16,

    /// Path to the SQLite database. Defaults to ~/.cdss-relay/relay.db.
    #[arg(long, env = "RELAY_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Base URL of the recommendation upstream.
    #[arg(
        long,
        env = "RELAY_UPSTREAM_URL",
        default_value = "http://210.12.11.251:27860"
    )]
    upstream_url: String,

    /// Endpoint path of the recommendation upstream.
    #[arg(
        long,
        env = "RELAY_UPSTREAM_ENDPOINT",
        default_value = "/rimagai/checkitem/recommend_item_with_reason"
    )]
    upstream_endpoint: String,

    /// Disable the SQLite warn+ log sink.
    #[arg(long, env = "RELAY_NO_LOG_DB")]
    no_log_db: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        log_to_sqlite: !args.no_log_db,
        ..TelemetryConfig::default()
    });

    tracing::info!("starting relay server");

    let db_path = match args.db_path {
        Some(path) => path,
        None => {
            let dir = dirs_home().join(".cdss-relay");
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("cannot create data directory {}", dir.display()))?;
            dir.join("relay.db")
        }
    };
    let db = Database::open(&db_path).context("failed to open database")?;
    tracing::info!(path = %db_path.display(), "database opened");

    let client: Arc<dyn RecommendClient> = Arc::new(
        HttpRecommendClient::new(&args.upstream_url, &args.upstream_endpoint)
            .context("failed to build upstream client")?,
    );

    let config = ServerConfig {
        port: args.port,
        ..ServerConfig::default()
    };
    let handle = relay_server::start(config, db, client)
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port, "relay server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    Ok(())
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
