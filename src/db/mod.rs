mod error;
#[cfg(feature = "database-postgres")]
pub mod postgres;
pub mod repos;
#[cfg(feature = "database-sqlite")]
pub mod sqlite;

#[cfg(all(test, any(feature = "database-sqlite", feature = "database-postgres")))]
pub mod tests;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

pub use error::{DbError, DbResult};
pub use repos::*;

use crate::config::DatabaseConfig;

/// Primary plus optional replica.
#[cfg(feature = "database-postgres")]
struct PgPoolPair {
    write: sqlx::PgPool,
    read: Option<sqlx::PgPool>,
}

/// Readiness of the store, shared with background workers.
///
/// Compaction must not start against a schema that has not been migrated, so
/// workers consult [`is_migrated`](Self::is_migrated) before scheduling.
#[derive(Debug, Default)]
pub struct ConnectionState {
    migrated: AtomicBool,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State for a store whose schema is known to be current.
    pub fn migrated() -> Self {
        let state = Self::new();
        state.mark_migrated();
        state
    }

    pub fn is_migrated(&self) -> bool {
        self.migrated.load(Ordering::Acquire)
    }

    pub fn mark_migrated(&self) {
        self.migrated.store(true, Ordering::Release);
    }
}

/// Repositories are built once per pool and handed out as trait objects.
struct CachedRepos {
    workflow_history: Arc<dyn WorkflowHistoryRepo>,
}

enum PoolStorage {
    #[cfg(feature = "database-sqlite")]
    Sqlite(sqlx::SqlitePool),
    #[cfg(feature = "database-postgres")]
    Postgres(PgPoolPair),
    #[cfg(not(any(feature = "database-sqlite", feature = "database-postgres")))]
    _None(std::convert::Infallible),
}

/// Connection pool for the configured backend, its repositories and its
/// readiness flag.
pub struct DbPool {
    inner: PoolStorage,
    repos: CachedRepos,
    state: Arc<ConnectionState>,
}

impl DbPool {
    /// Wrap an existing SQLite pool. The store starts out not ready.
    #[cfg(feature = "database-sqlite")]
    pub fn from_sqlite(pool: sqlx::SqlitePool) -> Self {
        let repos = CachedRepos {
            workflow_history: Arc::new(sqlite::SqliteWorkflowHistoryRepo::new(pool.clone())),
        };
        DbPool {
            inner: PoolStorage::Sqlite(pool),
            repos,
            state: Arc::new(ConnectionState::new()),
        }
    }

    /// Wrap existing PostgreSQL pools. The store starts out not ready.
    #[cfg(feature = "database-postgres")]
    pub fn from_postgres(write_pool: sqlx::PgPool, read_pool: Option<sqlx::PgPool>) -> Self {
        let repos = CachedRepos {
            workflow_history: Arc::new(postgres::PostgresWorkflowHistoryRepo::new(
                write_pool.clone(),
                read_pool.clone(),
            )),
        };
        DbPool {
            inner: PoolStorage::Postgres(PgPoolPair {
                write: write_pool,
                read: read_pool,
            }),
            repos,
            state: Arc::new(ConnectionState::new()),
        }
    }

    /// Connect to the configured backend.
    pub async fn from_config(config: &DatabaseConfig) -> DbResult<Self> {
        match config {
            DatabaseConfig::None => Err(DbError::NotConfigured),
            #[cfg(feature = "database-sqlite")]
            DatabaseConfig::Sqlite(cfg) => {
                let pool = sqlx::sqlite::SqlitePoolOptions::new()
                    .max_connections(cfg.max_connections)
                    .connect_with(
                        sqlx::sqlite::SqliteConnectOptions::new()
                            .filename(&cfg.path)
                            .create_if_missing(cfg.create_if_missing)
                            .journal_mode(if cfg.wal_mode {
                                sqlx::sqlite::SqliteJournalMode::Wal
                            } else {
                                sqlx::sqlite::SqliteJournalMode::Delete
                            })
                            .busy_timeout(std::time::Duration::from_millis(cfg.busy_timeout_ms)),
                    )
                    .await?;

                Ok(Self::from_sqlite(pool))
            }
            #[cfg(feature = "database-postgres")]
            DatabaseConfig::Postgres(cfg) => {
                let pool_options = || {
                    sqlx::postgres::PgPoolOptions::new()
                        .min_connections(cfg.min_connections)
                        .max_connections(cfg.max_connections)
                        .acquire_timeout(std::time::Duration::from_secs(cfg.connect_timeout_secs))
                        .idle_timeout(std::time::Duration::from_secs(cfg.idle_timeout_secs))
                };
                let connect_options = |url: &str| -> DbResult<sqlx::postgres::PgConnectOptions> {
                    Ok(url
                        .parse::<sqlx::postgres::PgConnectOptions>()?
                        .ssl_mode(cfg.ssl_mode.to_sqlx()))
                };

                let write_pool = pool_options()
                    .connect_with(connect_options(&cfg.url)?)
                    .await?;

                let read_pool = if let Some(read_url) = &cfg.read_url {
                    tracing::info!("Configuring read replica pool");
                    Some(pool_options().connect_with(connect_options(read_url)?).await?)
                } else {
                    None
                };

                Ok(Self::from_postgres(write_pool, read_pool))
            }
        }
    }

    /// Apply pending migrations on the primary and mark the store ready.
    pub async fn run_migrations(&self) -> DbResult<()> {
        match &self.inner {
            #[cfg(feature = "database-sqlite")]
            PoolStorage::Sqlite(pool) => {
                sqlx::migrate!("./migrations_sqlx/sqlite").run(pool).await?;
            }
            #[cfg(feature = "database-postgres")]
            PoolStorage::Postgres(pools) => {
                sqlx::migrate!("./migrations_sqlx/postgres")
                    .run(&pools.write)
                    .await?;
            }
            #[cfg(not(any(feature = "database-sqlite", feature = "database-postgres")))]
            PoolStorage::_None(infallible) => match *infallible {},
        }
        self.state.mark_migrated();
        tracing::debug!("Workflow history schema is up to date");
        Ok(())
    }

    /// Check whether every bundled migration has already been applied,
    /// without applying anything. Marks the store ready when it has.
    pub async fn verify_migrations(&self) -> DbResult<bool> {
        let applied = match &self.inner {
            #[cfg(feature = "database-sqlite")]
            PoolStorage::Sqlite(pool) => {
                let mut conn = pool.acquire().await?;
                migrations_applied(&mut *conn, &sqlx::migrate!("./migrations_sqlx/sqlite")).await?
            }
            #[cfg(feature = "database-postgres")]
            PoolStorage::Postgres(pools) => {
                let mut conn = pools.write.acquire().await?;
                migrations_applied(&mut *conn, &sqlx::migrate!("./migrations_sqlx/postgres"))
                    .await?
            }
            #[cfg(not(any(feature = "database-sqlite", feature = "database-postgres")))]
            PoolStorage::_None(infallible) => match *infallible {},
        };

        if applied {
            self.state.mark_migrated();
        } else {
            tracing::warn!("Database schema is behind; run `migrate` before compaction can start");
        }
        Ok(applied)
    }

    pub fn workflow_history(&self) -> Arc<dyn WorkflowHistoryRepo> {
        Arc::clone(&self.repos.workflow_history)
    }

    /// Shared readiness flag, set once migrations are applied or verified.
    pub fn connection_state(&self) -> Arc<ConnectionState> {
        Arc::clone(&self.state)
    }

    /// `SELECT 1` against every pool.
    pub async fn health_check(&self) -> DbResult<()> {
        match &self.inner {
            #[cfg(feature = "database-sqlite")]
            PoolStorage::Sqlite(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
                Ok(())
            }
            #[cfg(feature = "database-postgres")]
            PoolStorage::Postgres(pools) => {
                sqlx::query("SELECT 1").execute(&pools.write).await?;
                if let Some(read) = &pools.read {
                    sqlx::query("SELECT 1").execute(read).await?;
                }
                Ok(())
            }
            #[cfg(not(any(feature = "database-sqlite", feature = "database-postgres")))]
            PoolStorage::_None(infallible) => match *infallible {},
        }
    }
}

#[cfg(any(feature = "database-sqlite", feature = "database-postgres"))]
async fn migrations_applied<C>(conn: &mut C, migrator: &sqlx::migrate::Migrator) -> DbResult<bool>
where
    C: sqlx::migrate::Migrate + Send,
{
    conn.ensure_migrations_table().await?;
    let applied: std::collections::HashSet<i64> = conn
        .list_applied_migrations()
        .await?
        .into_iter()
        .map(|m| m.version)
        .collect();

    Ok(migrator
        .iter()
        .filter(|m| !m.migration_type.is_down_migration())
        .all(|m| applied.contains(&m.version)))
}
