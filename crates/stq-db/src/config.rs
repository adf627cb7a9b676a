use std::env;

/// Database configuration.
///
/// Reads from the `STQ_DATABASE_URL` environment variable, falling back to
/// a file named `stq_persistence.db` in the current directory when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file (or a full `sqlite://` URL).
    pub database_url: String,
}

impl DbConfig {
    /// The default database file used when no environment variable or CLI
    /// flag is set.
    pub const DEFAULT_FILE: &str = "stq_persistence.db";

    /// Build a config from the environment.
    ///
    /// Priority: `STQ_DATABASE_URL` env var, then the compile-time default.
    pub fn from_env() -> Self {
        let database_url =
            env::var("STQ_DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_FILE.to_owned());
        Self { database_url }
    }

    /// Build a config from an explicit file path or `sqlite://` URL (used by
    /// the `--dbfile` CLI flag and by tests).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// The `sqlite://` connection URL sqlx expects, creating the file on
    /// first connect if it does not already exist.
    pub fn connect_url(&self) -> String {
        if self.database_url.starts_with("sqlite:") {
            self.database_url.clone()
        } else {
            format!("sqlite://{}?mode=rwc", self.database_url)
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_file() {
        let cfg = DbConfig::new(DbConfig::DEFAULT_FILE);
        assert_eq!(cfg.database_url, "stq_persistence.db");
    }

    #[test]
    fn connect_url_wraps_bare_path() {
        let cfg = DbConfig::new("stq_persistence.db");
        assert_eq!(cfg.connect_url(), "sqlite://stq_persistence.db?mode=rwc");
    }

    #[test]
    fn connect_url_passes_through_explicit_scheme() {
        let cfg = DbConfig::new("sqlite::memory:");
        assert_eq!(cfg.connect_url(), "sqlite::memory:");
    }
}
