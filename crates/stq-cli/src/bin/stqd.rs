use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use stq_core::EngineFacade;
use stq_db::{pool, DbConfig, StorePool};
use tokio::signal;
use tracing::info;

/// The stq scheduler server: coordinates shell-command tasks across a
/// fleet of polling runners.
#[derive(Parser)]
#[command(name = "stqd", about = "stq scheduler server")]
struct Cli {
    /// Host to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind to.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Path to the persisted state file.
    #[arg(long, default_value = DbConfig::DEFAULT_FILE)]
    dbfile: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = DbConfig::new(cli.dbfile.clone());

    let store = StorePool::connect(&config)
        .await
        .context("failed to open store")?;
    store
        .migrate(pool::default_migrations_path())
        .await
        .context("failed to run migrations")?;

    let counts = pool::table_counts(&store.reader).await.unwrap_or_default();
    info!(dbfile = %cli.dbfile, ?counts, "store ready");

    let engine = Arc::new(EngineFacade::new(store));
    let router = stq_cli::http::build_router(engine);

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "stqd listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
