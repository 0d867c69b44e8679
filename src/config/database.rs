use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Database configuration.
///
/// The database keeps each caller's current spend window so that limits
/// survive restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum DatabaseConfig {
    /// No database. Spend is tracked in memory only and lost on restart.
    None,
    /// SQLite database file.
    Sqlite(SqliteConfig),
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig::Sqlite(SqliteConfig::default())
    }
}

impl DatabaseConfig {
    pub fn is_none(&self) -> bool {
        matches!(self, DatabaseConfig::None)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            DatabaseConfig::None => Ok(()),
            DatabaseConfig::Sqlite(c) => c.validate(),
        }
    }
}

/// SQLite configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteConfig {
    /// Path to the SQLite database file.
    /// Use `:memory:` for an in-memory database (testing only).
    #[serde(default = "default_sqlite_path")]
    pub path: String,

    /// Create the database file if it doesn't exist.
    #[serde(default = "default_true")]
    pub create_if_missing: bool,

    /// Run migrations on startup.
    #[serde(default = "default_true")]
    pub run_migrations: bool,

    /// Enable WAL mode.
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_sqlite_max_connections")]
    pub max_connections: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
            create_if_missing: true,
            run_migrations: true,
            wal_mode: true,
            busy_timeout_ms: default_busy_timeout(),
            max_connections: default_sqlite_max_connections(),
        }
    }
}

impl SqliteConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.path.is_empty() {
            return Err(ConfigError::Validation(
                "SQLite path cannot be empty".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Validation(
                "SQLite max_connections must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_sqlite_path() -> String {
    "tollgate_usage.db".to_string()
}

fn default_true() -> bool {
    true
}

fn default_busy_timeout() -> u64 {
    5000 // 5 seconds
}

fn default_sqlite_max_connections() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_sqlite_file() {
        match DatabaseConfig::default() {
            DatabaseConfig::Sqlite(c) => {
                assert_eq!(c.path, "tollgate_usage.db");
                assert!(c.wal_mode);
            }
            DatabaseConfig::None => panic!("expected sqlite default"),
        }
    }

    #[test]
    fn test_parse_none() {
        let config: DatabaseConfig = toml::from_str(r#"type = "none""#).unwrap();
        assert!(config.is_none());
    }

    #[test]
    fn test_parse_sqlite_with_defaults() {
        let config: DatabaseConfig = toml::from_str(
            r#"
            type = "sqlite"
            path = "/var/lib/tollgate/usage.db"
            "#,
        )
        .unwrap();
        let DatabaseConfig::Sqlite(c) = config else {
            panic!("expected sqlite");
        };
        assert_eq!(c.path, "/var/lib/tollgate/usage.db");
        assert_eq!(c.busy_timeout_ms, 5000);
        assert_eq!(c.max_connections, 5);
    }

    #[test]
    fn test_empty_path_rejected() {
        let config = DatabaseConfig::Sqlite(SqliteConfig {
            path: String::new(),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }
}
