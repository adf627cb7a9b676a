use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::DbConfig;

/// A pair of pools against the same SQLite file: one writer connection that
/// serializes every mutating operation, and a multi-connection reader pool
/// for concurrent, committed-snapshot reads.
///
/// A single-connection writer pool gives the same "one writer at a time"
/// guarantee `BEGIN EXCLUSIVE` would, without needing to issue the pragma
/// by hand: sqlx simply blocks the next `acquire()` until the in-flight
/// transaction's connection is returned to the pool.
#[derive(Clone)]
pub struct StorePool {
    pub writer: SqlitePool,
    pub reader: SqlitePool,
}

impl StorePool {
    /// Connect both pools, creating the database file if absent and
    /// enabling WAL journaling for concurrent reads.
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let url = config.connect_url();

        let writer_opts: SqliteConnectOptions = url
            .parse()
            .with_context(|| format!("invalid database url {url}"))?;
        let writer_opts = writer_opts
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(writer_opts.clone())
            .await
            .with_context(|| format!("failed to open writer connection at {url}"))?;

        let reader = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(writer_opts)
            .await
            .with_context(|| format!("failed to open reader pool at {url}"))?;

        Ok(Self { writer, reader })
    }

    /// Run all pending migrations against the writer connection.
    pub async fn migrate(&self, migrations_dir: &Path) -> Result<()> {
        run_migrations(&self.writer, migrations_dir).await
    }

    pub async fn close(&self) {
        self.writer.close().await;
        self.reader.close().await;
    }
}

/// Run all pending migrations from the given directory against the pool.
///
/// Uses a runtime `Migrator` so that no running database is required at
/// compile time (unlike the `sqlx::migrate!()` macro).
pub async fn run_migrations(pool: &SqlitePool, migrations_dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .with_context(|| {
            format!(
                "failed to load migrations from {}",
                migrations_dir.display()
            )
        })?;

    migrator
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!("migrations applied successfully");
    Ok(())
}

/// Return the row count for every user table in the database.
///
/// Useful for the server's startup log line.
pub async fn table_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' \
         ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .context("failed to list tables")?;

    let mut counts = Vec::with_capacity(tables.len());
    for (table_name,) in &tables {
        // Table names come from sqlite_master so they are safe identifiers.
        let query = format!("SELECT COUNT(*) FROM {table_name}");
        let count: (i64,) = sqlx::query_as(&query)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table_name}"))?;
        counts.push((table_name.clone(), count.0));
    }
    Ok(counts)
}

/// Return the default path to the migrations directory shipped with
/// `stq-db`.
///
/// At runtime this resolves relative to the `stq-db` crate's source tree
/// via the `CARGO_MANIFEST_DIR` compile-time env.
pub fn default_migrations_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}
