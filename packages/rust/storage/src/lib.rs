//! libSQL storage layer for WikiSelect.
//!
//! The [`Storage`] struct wraps a libSQL database holding builders, versioned
//! selections, archive tasks, recurrence schedules and the job broker table.
//!
//! Every worker process opens its own [`Storage`]; coordination between
//! processes happens only through this database. Operations that must be
//! atomic across processes (version allocation, job promotion) run inside
//! `BEGIN IMMEDIATE` transactions on a dedicated connection.

mod archive_tasks;
mod builders;
mod jobs;
mod migrations;
mod schedules;
mod selections;

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use tracing::{info, warn};
use wikiselect_shared::{Result, WikiSelectError};

pub use jobs::NewJob;

/// Pragmas applied to every connection.
const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA journal_mode = WAL;";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Database,
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WikiSelectError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| WikiSelectError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| WikiSelectError::Storage(e.to_string()))?;
        configure(&conn).await?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open the database, retrying a fixed number of times with a fixed delay.
    ///
    /// This is the only automatic retry in the system; every other failure is
    /// surfaced to the caller.
    pub async fn open_with_retry(path: &Path, attempts: u32, delay: Duration) -> Result<Self> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::open(path).await {
                Ok(storage) => return Ok(storage),
                Err(e) if attempt < attempts => {
                    warn!(
                        attempt,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "database open failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(WikiSelectError::Storage(format!(
                        "could not open database after {attempts} attempts: {e}"
                    )));
                }
            }
        }
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    WikiSelectError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Open a dedicated connection for a transaction.
    async fn connect(&self) -> Result<Connection> {
        let conn = self.db.connect().map_err(db_err)?;
        configure(&conn).await?;
        Ok(conn)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction on its own connection.
    ///
    /// The write lock is taken up front, so concurrent writers (in this or
    /// another process) serialize instead of interleaving reads and writes.
    pub(crate) async fn immediate<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let conn = self.connect().await?;
        conn.execute_batch("BEGIN IMMEDIATE").await.map_err(db_err)?;

        match f(conn.clone()).await {
            Ok(value) => {
                conn.execute_batch("COMMIT").await.map_err(db_err)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = conn.execute_batch("ROLLBACK").await {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

async fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(CONNECTION_PRAGMAS)
        .await
        .map_err(|e| WikiSelectError::Storage(format!("failed to configure connection: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

/// Map a libSQL error, surfacing uniqueness violations and lock contention as conflicts.
pub(crate) fn db_err(e: libsql::Error) -> WikiSelectError {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed") || message.contains("database is locked") {
        WikiSelectError::conflict(message)
    } else {
        WikiSelectError::Storage(message)
    }
}

/// Timestamps are stored as fixed-width RFC 3339 UTC strings so they sort lexically.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_ts() -> String {
    ts(&Utc::now())
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WikiSelectError::Storage(format!("invalid date '{s}': {e}")))
}

pub(crate) fn get_string(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(db_err)
}

pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> Result<i64> {
    row.get::<i64>(idx).map_err(db_err)
}

pub(crate) fn get_opt_string(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

pub(crate) fn get_opt_ts(row: &libsql::Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    get_opt_string(row, idx).map(|s| parse_ts(&s)).transpose()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Utc;
    use wikiselect_shared::{Builder, new_id};

    /// Create a temp file storage for testing.
    pub async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("ws_test_{}.db", new_id()));
        Storage::open(&tmp).await.expect("open test db")
    }

    pub fn sample_builder(owner: &str) -> Builder {
        Builder {
            id: new_id(),
            owner_id: owner.into(),
            name: "Physics articles".into(),
            project: "en.wikipedia.org".into(),
            model: "simple".into(),
            params: serde_json::json!({"list": ["Photon", "Electron"]}),
            current_version: 0,
            selection_archive_version: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub async fn stored_builder(storage: &Storage) -> Builder {
        let builder = sample_builder("alice");
        storage.insert_builder(&builder).await.expect("insert builder");
        builder
    }
}
