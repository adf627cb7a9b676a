//! Shared test utilities for stq integration tests.
//!
//! Unlike a networked database, SQLite needs no shared container: each test
//! gets its own temporary file, migrated fresh, torn down when the returned
//! guard is dropped.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tempfile::NamedTempFile;

use stq_db::pool;

/// Keeps the backing temp file alive for the lifetime of a test. Dropping it
/// deletes the file; call [`drop_test_db`] for an explicit, early teardown.
pub struct TestDbGuard {
    _file: NamedTempFile,
}

/// Create a temporary, migrated SQLite database.
///
/// Returns `(pool, guard)`. Keep `guard` alive for as long as the pool is
/// used — its drop removes the backing file.
pub async fn create_test_db() -> (SqlitePool, TestDbGuard) {
    let file = NamedTempFile::new().expect("failed to create temp db file");
    let url = format!("sqlite://{}?mode=rwc", file.path().display());

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to temp database {url}: {e}"));

    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    (pool, TestDbGuard { _file: file })
}

/// Explicitly close a test database's pool and drop its guard, deleting the
/// backing file. Safe to skip — the guard's `Drop` impl does the same thing.
pub async fn drop_test_db(pool: SqlitePool, guard: TestDbGuard) {
    pool.close().await;
    drop(guard);
}
