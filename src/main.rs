//! Quizlink Daemon
//!
//! Links learning-platform accounts to chat-bot accounts and aggregates
//! per-topic quiz performance for linked users.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! quizlink
//!
//! # Start with custom config
//! quizlink --config /path/to/config.toml
//!
//! # Notify a bot running next door
//! quizlink --notify-url http://localhost:3000 --notify-token s3cret
//!
//! # Custom database and port
//! quizlink --db /data/quizlink.db --http-port 8096
//! ```

use clap::Parser;
use quizlink::{
    notifier, Config, Database, Dispatcher, HttpServer, IngestCoordinator, LinkStore,
    PerformanceStore, Sweeper, SystemClock,
};
use quizlink::clock::Clock;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "quizlink")]
#[command(about = "Account linking and quiz performance aggregation for a learning platform and a chat bot")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (database and default config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, env = "QUIZLINK_DB")]
    db: Option<PathBuf>,

    /// HTTP API port
    #[arg(long, env = "QUIZLINK_HTTP_PORT")]
    http_port: Option<u16>,

    /// Bot API base URL for notifications
    #[arg(long, env = "QUIZLINK_NOTIFY_URL")]
    notify_url: Option<String>,

    /// Bearer token sent with notifications
    #[arg(long, env = "QUIZLINK_NOTIFY_TOKEN")]
    notify_token: Option<String>,

    /// Log filter directive used when RUST_LOG is unset
    #[arg(long, default_value = "quizlink=info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(db) = args.db {
        config.database_path = Some(db);
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(url) = args.notify_url {
        config.notifier.base_url = Some(url);
    }
    if let Some(token) = args.notify_token {
        config.notifier.auth_token = Some(token);
    }
    config.validate()?;

    info!(
        data_dir = %config.data_dir.display(),
        database = %config.database_path().display(),
        http_port = config.http_port,
        "Starting quizlink"
    );

    // Ensure data directory exists
    tokio::fs::create_dir_all(&config.data_dir).await?;
    if let Some(parent) = config.database_path().parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if args.config.is_none() && !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let db = Arc::new(Database::open(&config.database_path())?);

    let links = Arc::new(
        LinkStore::new(Arc::clone(&db), Arc::clone(&clock)).with_code_ttl(config.code_ttl_secs),
    );
    let performance = Arc::new(PerformanceStore::new(Arc::clone(&db), Arc::clone(&clock)));
    let classifier = Arc::new(config.classifier.build());

    let notifier = notifier::from_config(&config.notifier)?;
    match &config.notifier.base_url {
        Some(url) => info!(url = %url, timeout_ms = config.notifier.timeout_ms, "Bot notifications enabled"),
        None => warn!("No notifier URL configured, bot notifications disabled"),
    }

    let coordinator = Arc::new(IngestCoordinator::new(
        Arc::clone(&links),
        performance,
        Arc::clone(&classifier),
        Dispatcher::new(notifier),
        clock,
    ));
    info!(topics = classifier.topics().len(), "Topic classifier ready");

    // Expired code sweeper
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let mut sweeper = Sweeper::new(Arc::clone(&links), Duration::from_secs(config.sweep_interval_secs));
    sweeper.set_shutdown(shutdown_rx);
    let sweeper_handle = tokio::spawn(sweeper.run());

    // HTTP API
    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_server = Arc::new(HttpServer::new(coordinator, Arc::clone(&db), http_addr));

    info!("HTTP API available at http://{}", http_addr);
    info!("Endpoints:");
    info!("  GET  /health                          - Health check");
    info!("  POST /link/code                       - Issue verification code");
    info!("  POST /link/redeem                     - Redeem verification code");
    info!("  GET  /link/{{platformUserId}}           - Link status");
    info!("  POST /events/quiz-submitted           - Record one answer");
    info!("  POST /events/attempt-submitted        - Record a quiz attempt");
    info!("  GET  /performance/{{externalUserId}}    - Per-topic performance");
    info!("  GET  /topics                          - Topic catalogue");

    info!("Press Ctrl+C to stop.");

    // Handle shutdown signal
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    // Stop the sweeper
    let _ = shutdown_tx.send(());
    let _ = sweeper_handle.await;

    if let Ok(stats) = db.stats() {
        info!(
            pending_codes = stats.pending_codes,
            linked_accounts = stats.linked_accounts,
            performance_records = stats.performance_records,
            "Final database stats"
        );
    }

    Ok(())
}
