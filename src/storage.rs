//! Optional durable session snapshot (spec.md §6.3, §4.C), gated behind the
//! `sqlite-storage` feature. The core's correctness does not depend on this:
//! the spec only mandates at-least-once stat recording guarded by the
//! session's own `stats_recorded` flag, not durability across crashes. This
//! module is an independent periodic task, not a write-through hook inside
//! every `Coordinator` command — see DESIGN.md for why.
//!
//! Each session is a single serialized blob keyed by its id; writes are
//! full-object replace, exactly as §6.3 specifies.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::WrapErr;
use sqlx::{
    any::AnyKind,
    migrate::{Migrate, MigrateDatabase, Migrator},
    pool::PoolOptions,
    Any, Executor, Pool, Row,
};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::coordinator::Coordinator;
use crate::store::StatusFilter;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Clone, Debug, PartialEq, Eq, Parser)]
pub struct Options {
    /// Database connection string. Sqlite file: `sqlite://sessions.db`;
    /// in-memory: `sqlite::memory:`.
    #[clap(long, env, default_value = "sqlite://sessions.db")]
    database_url: String,

    /// Allow creation or migration of the database schema.
    #[clap(long, env, default_value = "true")]
    pub database_migrate: bool,

    /// Maximum number of connections in the database connection pool.
    #[clap(long, env, default_value = "10")]
    pub database_max_connections: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".into(),
            database_migrate: true,
            database_max_connections: 10,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PersistentStorage(Pool<Any>);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::error::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub async fn storage_client(options: &Options) -> eyre::Result<PersistentStorage> {
    info!(url = %&options.database_url, "connecting to session storage database");

    if options.database_migrate && !Any::database_exists(options.database_url.as_str()).await? {
        warn!(url = %&options.database_url, "database does not exist, creating it");
        Any::create_database(options.database_url.as_str()).await?;
    }

    let pool = PoolOptions::<Any>::new()
        .max_connections(options.database_max_connections)
        .connect(options.database_url.as_str())
        .await
        .wrap_err("error connecting to session storage database")?;

    let sql = match pool.any_kind() {
        #[cfg(feature = "sqlite")]
        AnyKind::Sqlite => "sqlite_version() || ' ' || sqlite_source_id()",
        #[allow(unreachable_patterns)]
        _ => "'unknown'",
    };
    let version = pool
        .fetch_one(format!("SELECT {sql};").as_str())
        .await
        .wrap_err("error reading database version")?
        .get::<String, _>(0);
    info!(url = %&options.database_url, kind = ?pool.any_kind(), ?version, "connected to session storage database");

    let latest = MIGRATOR.migrations.last().expect("at least one migration is bundled").version;
    if options.database_migrate {
        info!(url = %&options.database_url, "running session storage migrations if necessary");
        MIGRATOR.run(&pool).await?;
    }

    #[allow(deprecated)]
    if let Some((version, dirty)) = pool.acquire().await?.version().await? {
        if dirty {
            error!(url = %&options.database_url, version, expected = latest, "database is in an incomplete migration state");
            return Err(eyre::eyre!("database is in an incomplete migration state"));
        } else if version < latest {
            error!(url = %&options.database_url, version, expected = latest, "database is not up to date");
            return Err(eyre::eyre!("database is not up to date, rerun with --database-migrate"));
        } else if version > latest {
            error!(url = %&options.database_url, version, latest, "database schema is newer than this binary");
            return Err(eyre::eyre!("database schema is newer than this binary, please update"));
        }
    } else {
        error!(url = %&options.database_url, "could not read database schema version");
        return Err(eyre::eyre!("could not read database schema version"));
    }

    Ok(PersistentStorage(pool))
}

impl PersistentStorage {
    /// Full-object-replace write of one session's current state (§6.3). Not
    /// called per-mutation; `snapshot_loop` is the only caller.
    pub async fn put_session(&self, id: uuid::Uuid, body: &impl serde::Serialize) -> Result<(), StorageError> {
        let blob = serde_json::to_string(body)?;
        let sql = "INSERT INTO sessions (id, body) VALUES (?1, ?2) \
                   ON CONFLICT(id) DO UPDATE SET body = excluded.body";
        self.0.execute(sqlx::query(sql).bind(id.to_string()).bind(blob)).await?;
        Ok(())
    }

    pub async fn delete_session(&self, id: uuid::Uuid) -> Result<(), StorageError> {
        self.0
            .execute(sqlx::query("DELETE FROM sessions WHERE id = ?1").bind(id.to_string()))
            .await?;
        Ok(())
    }
}

/// Periodically snapshots every live session to `storage` as a full-object
/// replace. Runs for the lifetime of the process; errors are logged and
/// swallowed, matching §7's "scheduler callbacks and socket send errors are
/// logged and swallowed" policy extended to this best-effort sidecar.
pub async fn snapshot_loop(coordinator: Arc<Coordinator>, storage: PersistentStorage, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let sessions = coordinator.list_sessions(StatusFilter::All).await;
        for session in &sessions {
            if let Err(err) = storage.put_session(session.id, session).await {
                error!(session_id = %session.id, %err, "failed to snapshot session");
            }
        }
    }
}
