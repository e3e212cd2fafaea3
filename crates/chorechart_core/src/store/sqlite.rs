//! Shared document kept in a local SQLite file.
//!
//! # Responsibility
//! - Persist the document as one JSON row keyed by its path.
//! - Run read-modify-write as revision-guarded conditional writes.
//! - Surface writes from other processes via a revision-polling feed.
//!
//! # Invariants
//! - `revision` increases by one per commit.
//! - A conditional write lands only while the row still carries the
//!   revision the mutator saw; otherwise the mutator is re-applied.
//! - SQLite calls run on the blocking pool, never on an async worker.
//! - The store never reports offline.

use super::{
    ChangeFeed, ConnectivitySubscription, DocumentSubscription, Mutator, StoreAdapter,
    StoreError, StoreResult, MAX_TRANSACTION_ATTEMPTS,
};
use crate::db::{open_db, open_db_in_memory};
use crate::model::state::AppState;
use crate::schema::Schema;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct StoredRow {
    body: String,
    revision: i64,
}

struct SqliteShared {
    conn: Mutex<Connection>,
    document_path: String,
    location: String,
    schema: Arc<Schema>,
    feed: ChangeFeed,
    /// Highest revision already announced to subscribers.
    published_revision: AtomicI64,
}

impl SqliteShared {
    fn read_row(conn: &Connection, document_path: &str) -> StoreResult<Option<StoredRow>> {
        let row = conn
            .query_row(
                "SELECT body, revision FROM documents WHERE path = ?1;",
                [document_path],
                |row| {
                    Ok(StoredRow {
                        body: row.get(0)?,
                        revision: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn write_row(conn: &Connection, document_path: &str, body: &str) -> StoreResult<i64> {
        let revision = conn.query_row(
            "INSERT INTO documents (path, body, revision) VALUES (?1, ?2, 1)
             ON CONFLICT(path) DO UPDATE SET
                body = excluded.body,
                revision = documents.revision + 1,
                updated_at = (strftime('%s', 'now') * 1000)
             RETURNING revision;",
            params![document_path, body],
            |row| row.get(0),
        )?;
        Ok(revision)
    }

    /// Writes `body` only if the stored revision still equals `expected`
    /// (0 for an absent row). Returns the new revision, or `None` when
    /// another writer got there first.
    fn write_row_if(
        conn: &Connection,
        document_path: &str,
        body: &str,
        expected: i64,
    ) -> StoreResult<Option<i64>> {
        let revision = if expected == 0 {
            conn.query_row(
                "INSERT INTO documents (path, body, revision) VALUES (?1, ?2, 1)
                 ON CONFLICT(path) DO NOTHING
                 RETURNING revision;",
                params![document_path, body],
                |row| row.get(0),
            )
        } else {
            conn.query_row(
                "UPDATE documents SET
                    body = ?2,
                    revision = revision + 1,
                    updated_at = (strftime('%s', 'now') * 1000)
                 WHERE path = ?1 AND revision = ?3
                 RETURNING revision;",
                params![document_path, body, expected],
                |row| row.get(0),
            )
        }
        .optional()?;
        Ok(revision)
    }

    fn decode(&self, row: &StoredRow) -> StoreResult<AppState> {
        let raw: Value = serde_json::from_str(&row.body)?;
        Ok(self.schema.normalize(&raw))
    }

    fn announce(&self, revision: i64, state: AppState) {
        let previous = self.published_revision.fetch_max(revision, Ordering::SeqCst);
        if revision > previous {
            self.feed.publish(state);
        }
    }

    fn load(&self) -> StoreResult<Option<StoredRow>> {
        let conn = self.conn.lock();
        Self::read_row(&conn, &self.document_path)
    }

    /// Publishes the stored document if another process changed it.
    fn poll_foreign_write(&self) -> StoreResult<()> {
        let row = self.load()?;
        let Some(row) = row else {
            return Ok(());
        };
        if row.revision > self.published_revision.load(Ordering::SeqCst) {
            debug!(
                "event=change_feed module=store status=ok backend=sqlite revision={}",
                row.revision
            );
            let state = self.decode(&row)?;
            self.announce(row.revision, state);
        }
        Ok(())
    }
}

/// Runs `work` against the shared connection on the blocking pool.
async fn blocking<T, F>(shared: &Arc<SqliteShared>, work: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce(&SqliteShared) -> StoreResult<T> + Send + 'static,
{
    let shared = Arc::clone(shared);
    tokio::task::spawn_blocking(move || work(&shared))
        .await
        .map_err(|err| StoreError::Unavailable(format!("sqlite worker failed: {err}")))?
}

/// Single-document store backed by a local SQLite database.
pub struct SqliteDocumentStore {
    shared: Arc<SqliteShared>,
    change_feed: Mutex<Option<JoinHandle<()>>>,
}

impl SqliteDocumentStore {
    /// Opens (or creates) the database at `db_path` and addresses the
    /// document stored under `document_path`.
    pub fn open(
        db_path: impl AsRef<Path>,
        document_path: &str,
        schema: Arc<Schema>,
    ) -> StoreResult<Self> {
        let location = format!("sqlite://{}#{document_path}", db_path.as_ref().display());
        let conn = open_db(db_path)?;
        Self::from_connection(conn, document_path, location, schema)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory(document_path: &str, schema: Arc<Schema>) -> StoreResult<Self> {
        let conn = open_db_in_memory()?;
        let location = format!("sqlite://:memory:#{document_path}");
        Self::from_connection(conn, document_path, location, schema)
    }

    fn from_connection(
        conn: Connection,
        document_path: &str,
        location: String,
        schema: Arc<Schema>,
    ) -> StoreResult<Self> {
        let current_revision = SqliteShared::read_row(&conn, document_path)?
            .map_or(0, |row| row.revision);
        Ok(Self {
            shared: Arc::new(SqliteShared {
                conn: Mutex::new(conn),
                document_path: document_path.to_string(),
                location,
                schema,
                feed: ChangeFeed::new(true),
                published_revision: AtomicI64::new(current_revision),
            }),
            change_feed: Mutex::new(None),
        })
    }

    /// Starts polling for writes made by other processes.
    ///
    /// Calling it again replaces the previous poller.
    pub fn start_change_feed(&self, period: Duration) {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = blocking(&shared, SqliteShared::poll_foreign_write).await {
                    warn!(
                        "event=change_feed module=store status=error backend=sqlite error={err}"
                    );
                }
            }
        });

        if let Some(previous) = self.change_feed.lock().replace(handle) {
            previous.abort();
        }
        info!(
            "event=change_feed_start module=store status=ok backend=sqlite period_ms={}",
            period.as_millis()
        );
    }

    /// Stops the change feed poller, if running.
    pub fn shutdown(&self) {
        if let Some(handle) = self.change_feed.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for SqliteDocumentStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl StoreAdapter for SqliteDocumentStore {
    fn location(&self) -> &str {
        &self.shared.location
    }

    async fn get(&self) -> StoreResult<Option<AppState>> {
        blocking(&self.shared, |shared| {
            shared
                .load()?
                .map(|row| shared.decode(&row))
                .transpose()
        })
        .await
    }

    async fn set(&self, state: &AppState) -> StoreResult<()> {
        let normalized = self.shared.schema.normalize_state(state);
        let body = serde_json::to_string(&normalized)?;
        let revision = blocking(&self.shared, move |shared| {
            let conn = shared.conn.lock();
            SqliteShared::write_row(&conn, &shared.document_path, &body)
        })
        .await?;
        self.shared.announce(revision, normalized);
        Ok(())
    }

    async fn transactional_update(&self, mutator: Mutator<'_>) -> StoreResult<AppState> {
        let shared = &self.shared;
        for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
            let row = blocking(shared, SqliteShared::load).await?;
            let (current, expected) = match &row {
                Some(row) => (shared.decode(row)?, row.revision),
                None => (shared.schema.normalize(&Value::Null), 0),
            };

            let next = shared.schema.normalize_state(&mutator(current.clone()));
            if row.is_some() && next == current {
                return Ok(current);
            }

            let body = serde_json::to_string(&next)?;
            let written = blocking(shared, move |shared| {
                let conn = shared.conn.lock();
                SqliteShared::write_row_if(&conn, &shared.document_path, &body, expected)
            })
            .await?;
            let Some(revision) = written else {
                debug!(
                    "event=transaction_retry module=store status=conflict backend=sqlite attempt={attempt}"
                );
                continue;
            };
            shared.announce(revision, next.clone());
            return Ok(next);
        }

        Err(StoreError::TransactionConflict {
            attempts: MAX_TRANSACTION_ATTEMPTS,
        })
    }

    fn subscribe(&self) -> DocumentSubscription {
        self.shared.feed.subscribe()
    }

    fn subscribe_connectivity(&self) -> ConnectivitySubscription {
        self.shared.feed.subscribe_connectivity()
    }
}
