use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Where workflow history lives.
///
/// ```toml
/// [database]
/// type = "postgres"
/// url = "postgres://user:${DB_PASSWORD}@db/workflows"
/// ssl_mode = "require"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum DatabaseConfig {
    /// Commands that need storage refuse to start.
    #[default]
    None,

    /// Fine for a single main instance.
    #[cfg(feature = "database-sqlite")]
    Sqlite(SqliteConfig),

    /// Needed once several main instances share one history table.
    #[cfg(feature = "database-postgres")]
    Postgres(PostgresConfig),
}

impl DatabaseConfig {
    pub fn is_none(&self) -> bool {
        matches!(self, DatabaseConfig::None)
    }

    /// Whether startup applies pending migrations. When false, startup only
    /// checks that they were applied by someone else.
    pub fn run_migrations(&self) -> bool {
        match self {
            DatabaseConfig::None => false,
            #[cfg(feature = "database-sqlite")]
            DatabaseConfig::Sqlite(sqlite) => sqlite.run_migrations,
            #[cfg(feature = "database-postgres")]
            DatabaseConfig::Postgres(pg) => pg.run_migrations,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            DatabaseConfig::None => Ok(()),
            #[cfg(feature = "database-sqlite")]
            DatabaseConfig::Sqlite(sqlite) => {
                if sqlite.path.trim().is_empty() {
                    return Err(ConfigError::Validation(
                        "database.path must not be empty".into(),
                    ));
                }
                Ok(())
            }
            #[cfg(feature = "database-postgres")]
            DatabaseConfig::Postgres(pg) => {
                if pg.url.trim().is_empty() {
                    return Err(ConfigError::Validation(
                        "database.url must not be empty".into(),
                    ));
                }
                if pg.max_connections == 0 || pg.min_connections > pg.max_connections {
                    return Err(ConfigError::Validation(format!(
                        "database pool bounds are invalid: min {} max {}",
                        pg.min_connections, pg.max_connections
                    )));
                }
                Ok(())
            }
        }
    }
}

#[cfg(feature = "database-sqlite")]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteConfig {
    /// Database file. `:memory:` only makes sense for tests.
    pub path: String,

    #[serde(default = "default_true")]
    pub create_if_missing: bool,

    #[serde(default = "default_true")]
    pub run_migrations: bool,

    /// Write-ahead logging, so producers can keep saving versions while a
    /// prune holds its write transaction.
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    #[serde(default = "default_sqlite_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_sqlite_pool_size")]
    pub max_connections: u32,
}

#[cfg(feature = "database-postgres")]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresConfig {
    /// Primary. Compaction reads and writes here.
    pub url: String,

    /// Replica for history lookups and listings.
    #[serde(default)]
    pub read_url: Option<String>,

    #[serde(default = "default_pg_min_connections")]
    pub min_connections: u32,

    /// Per pool. A cycle holds one connection at a time.
    #[serde(default = "default_pg_max_connections")]
    pub max_connections: u32,

    /// How long to wait for a free connection.
    #[serde(default = "default_pg_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_pg_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub run_migrations: bool,

    #[serde(default)]
    pub ssl_mode: PostgresSslMode,
}

/// Mirrors libpq's `sslmode`.
#[cfg(feature = "database-postgres")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostgresSslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

#[cfg(feature = "database-postgres")]
impl PostgresSslMode {
    pub fn to_sqlx(self) -> sqlx::postgres::PgSslMode {
        use sqlx::postgres::PgSslMode;
        match self {
            PostgresSslMode::Disable => PgSslMode::Disable,
            PostgresSslMode::Prefer => PgSslMode::Prefer,
            PostgresSslMode::Require => PgSslMode::Require,
            PostgresSslMode::VerifyCa => PgSslMode::VerifyCa,
            PostgresSslMode::VerifyFull => PgSslMode::VerifyFull,
        }
    }
}

#[cfg(any(feature = "database-sqlite", feature = "database-postgres"))]
fn default_true() -> bool {
    true
}

#[cfg(feature = "database-sqlite")]
fn default_sqlite_busy_timeout_ms() -> u64 {
    5_000
}

#[cfg(feature = "database-sqlite")]
fn default_sqlite_pool_size() -> u32 {
    4
}

#[cfg(feature = "database-postgres")]
fn default_pg_min_connections() -> u32 {
    1
}

#[cfg(feature = "database-postgres")]
fn default_pg_max_connections() -> u32 {
    4
}

#[cfg(feature = "database-postgres")]
fn default_pg_connect_timeout_secs() -> u64 {
    10
}

#[cfg(feature = "database-postgres")]
fn default_pg_idle_timeout_secs() -> u64 {
    300
}
