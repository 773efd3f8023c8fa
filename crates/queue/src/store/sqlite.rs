//! SQLite event table with the lease claim protocol.
//!
//! All statement text is built once per store from the configured table name
//! and batch size, then prepared through the connection's statement cache.
//! Several stores (or processes) may open the same database file; claims are
//! single `UPDATE` statements, so SQLite's write lock keeps them disjoint.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kairos_core::{Config, ResultExt};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde_json::Value;
use tracing::{debug, info};

use super::{LeaseStore, Store, StoreStats};
use crate::event::{Event, EventId, EventStatus};
use crate::stat::{StatMap, StatProvider};
use crate::{Error, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_COLUMNS: &str = "id, trigger_type, trigger_time, retry_attempts, data, status, \
                             owner, owner_lock_time, time_created, time_updated";

/// Statement text for one table, fixed at construction.
#[derive(Debug)]
struct Statements {
    schema: String,
    insert: String,
    cancel: String,
    archive: Option<String>,
    delete: String,
    update_for_retry: String,
    declare_ownership: String,
    select_claimed: String,
    reset_expired: String,
    select_one: String,
    count: String,
}

impl Statements {
    fn new(table: &str, select_limit: usize, archive_terminal: bool) -> Self {
        let archive_table = format!("{table}_archive");
        let mut schema = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT NOT NULL PRIMARY KEY,
                trigger_type TEXT NOT NULL,
                trigger_time INTEGER NOT NULL,
                retry_attempts INTEGER NOT NULL DEFAULT 0,
                data TEXT,
                status INTEGER NOT NULL,
                owner TEXT NOT NULL DEFAULT '',
                owner_lock_time INTEGER DEFAULT NULL,
                owner_seq INTEGER NOT NULL DEFAULT 0,
                time_created INTEGER NOT NULL,
                time_updated INTEGER DEFAULT NULL
            );
            CREATE INDEX IF NOT EXISTS {table}_owner_idx ON {table} (owner, owner_seq);"
        );
        if archive_terminal {
            schema.push_str(&format!(
                "CREATE TABLE IF NOT EXISTS {archive_table} (
                    id TEXT NOT NULL PRIMARY KEY,
                    trigger_type TEXT NOT NULL,
                    trigger_time INTEGER NOT NULL,
                    retry_attempts INTEGER NOT NULL,
                    data TEXT,
                    status INTEGER NOT NULL,
                    time_created INTEGER NOT NULL,
                    time_completed INTEGER NOT NULL
                );"
            ));
        }

        Self {
            schema,
            insert: format!(
                "INSERT INTO {table} (id, trigger_type, trigger_time, retry_attempts, data, status, time_created)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            cancel: format!("UPDATE {table} SET status = ?1, time_updated = ?2 WHERE id = ?3"),
            archive: archive_terminal.then(|| {
                format!(
                    "INSERT OR REPLACE INTO {archive_table}
                     (id, trigger_type, trigger_time, retry_attempts, data, status, time_created, time_completed)
                     SELECT id, trigger_type, trigger_time, retry_attempts, data, ?1, time_created, ?2
                     FROM {table} WHERE id = ?3"
                )
            }),
            delete: format!("DELETE FROM {table} WHERE id = ?1"),
            update_for_retry: format!(
                "UPDATE {table}
                 SET owner = '', owner_lock_time = NULL, owner_seq = 0,
                     trigger_time = ?1, retry_attempts = ?2, data = COALESCE(?3, data), time_updated = ?4
                 WHERE id = ?5"
            ),
            declare_ownership: format!(
                "UPDATE {table} SET owner = ?1, owner_lock_time = ?2, owner_seq = ?3
                 WHERE id IN (
                     SELECT id FROM {table} WHERE id < ?4 AND owner = '' ORDER BY id LIMIT {select_limit}
                 )"
            ),
            select_claimed: format!(
                "SELECT {columns} FROM {table}
                 WHERE id < ?1 AND owner = ?2 AND (owner_seq = ?3 OR status = {cancel})
                 ORDER BY id",
                columns = EVENT_COLUMNS,
                cancel = EventStatus::Cancel.code()
            ),
            reset_expired: format!(
                "UPDATE {table} SET owner = '', owner_lock_time = NULL
                 WHERE owner != '' AND owner_lock_time < ?1"
            ),
            select_one: format!(
                "SELECT {columns} FROM {table} WHERE id = ?1",
                columns = EVENT_COLUMNS
            ),
            count: format!("SELECT COUNT(*) FROM {table}"),
        }
    }
}

/// Row as read from the table, before validation.
#[derive(Debug)]
struct EventRecord {
    id: String,
    trigger_type: String,
    trigger_time_ms: i64,
    retry_attempts: i64,
    data: Option<String>,
    status: i64,
    owner: String,
    owner_lock_time_ms: Option<i64>,
    time_created_ms: i64,
    time_updated_ms: Option<i64>,
}

impl EventRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            trigger_type: row.get(1)?,
            trigger_time_ms: row.get(2)?,
            retry_attempts: row.get(3)?,
            data: row.get(4)?,
            status: row.get(5)?,
            owner: row.get(6)?,
            owner_lock_time_ms: row.get(7)?,
            time_created_ms: row.get(8)?,
            time_updated_ms: row.get(9)?,
        })
    }

    fn into_event(self) -> Result<Event> {
        let data = match self.data.as_deref() {
            Some(text) => serde_json::from_str(text).map_err(|e| {
                Error::invalid_record(format!("event {}: payload is not JSON: {e}", self.id))
            })?,
            None => Value::Null,
        };
        let attempts = u32::try_from(self.retry_attempts).map_err(|_| {
            Error::invalid_record(format!(
                "event {}: retry_attempts {} out of range",
                self.id, self.retry_attempts
            ))
        })?;
        let trigger_time = from_millis(self.trigger_time_ms)
            .ok_or_else(|| Error::invalid_record(format!("event {}: bad trigger_time", self.id)))?;

        Ok(Event {
            trigger_type: self.trigger_type,
            trigger_time,
            owner: self.owner,
            attempts,
            status: EventStatus::from_code(self.status),
            data,
            created: from_millis(self.time_created_ms).unwrap_or(trigger_time),
            updated: self.time_updated_ms.and_then(from_millis),
            completed: None,
            locked: self.owner_lock_time_ms.and_then(from_millis),
            id: EventId::from(self.id),
        })
    }
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

fn query_failed(context: &'static str) -> impl Fn(rusqlite::Error) -> Error {
    move |e| Error::query_failed(format!("{context}: {e}"))
}

fn encode_data(id: &EventId, data: &Value) -> Result<String> {
    serde_json::to_string(data)
        .map_err(|e| Error::serialization_failed(format!("event {id}: {e}")))
}

type SharedConnection = Arc<Mutex<Option<Connection>>>;

/// Event store over a SQLite database file.
#[derive(Debug)]
pub struct SqliteStore {
    path: PathBuf,
    statements: Arc<Statements>,
    conn: SharedConnection,
    lock_timeout: Duration,
    stats: StoreStats,
}

impl SqliteStore {
    /// Store at `config.store.store_path` using the configured table, batch
    /// size, lease timeout and archival.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration does not validate.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            path: config.store.store_path.clone(),
            statements: Arc::new(Statements::new(
                &config.store.table_name,
                config.consumer.consumer_select_limit,
                config.store.archive_terminal,
            )),
            conn: Arc::new(Mutex::new(None)),
            lock_timeout: config.consumer.lock_timeout(),
            stats: StoreStats::default(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of pending rows.
    ///
    /// # Errors
    ///
    /// Returns `StoreNotOpen` before `open`, or `QueryFailed`.
    pub async fn len(&self) -> Result<usize> {
        self.with_conn(|conn, sql| {
            let count: i64 = conn
                .prepare_cached(&sql.count)
                .and_then(|mut stmt| stmt.query_row([], |row| row.get(0)))
                .map_err(query_failed("Failed to count events"))?;
            usize::try_from(count).map_err(|_| Error::invalid_record("negative row count"))
        })
        .await
    }

    /// Read one pending row.
    ///
    /// # Errors
    ///
    /// Returns `StoreNotOpen` before `open`, `QueryFailed`, or `InvalidRecord`
    /// for an undecodable row.
    pub async fn get(&self, id: &EventId) -> Result<Option<Event>> {
        let id = id.clone();
        self.with_conn(move |conn, sql| {
            let record = conn
                .prepare_cached(&sql.select_one)
                .and_then(|mut stmt| {
                    stmt.query_row(params![id.as_str()], EventRecord::from_row)
                        .optional()
                })
                .map_err(query_failed("Failed to load event"))?;
            record.map(EventRecord::into_event).transpose()
        })
        .await
    }

    /// Run `op` against the open connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &Statements) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let statements = Arc::clone(&self.statements);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::connection_failed("connection lock poisoned"))?;
            let connection = guard.as_mut().ok_or(Error::StoreNotOpen)?;
            op(connection, &statements)
        })
        .await
        .map_err(|e| Error::query_failed(format!("blocking task failed: {e}")))?
        .inspect_error(|_| {
            self.stats.errors.next();
        })
    }

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn open(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let statements = Arc::clone(&self.statements);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::connection_failed("connection lock poisoned"))?;
            if guard.is_some() {
                return Ok(());
            }
            let connection = Connection::open(&path).map_err(|e| {
                Error::connection_failed(format!("Failed to open {}: {e}", path.display()))
            })?;
            connection
                .busy_timeout(BUSY_TIMEOUT)
                .map_err(|e| Error::connection_failed(format!("Failed to set busy timeout: {e}")))?;
            connection
                .query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))
                .map_err(|e| Error::connection_failed(format!("Failed to enable WAL: {e}")))?;
            connection
                .execute_batch(&statements.schema)
                .map_err(|e| Error::query_failed(format!("Failed to create schema: {e}")))?;
            *guard = Some(connection);
            info!(path = %path.display(), "Opened event store");
            Ok(())
        })
        .await
        .map_err(|e| Error::connection_failed(format!("blocking task failed: {e}")))?
    }

    async fn close(&self) {
        let conn = Arc::clone(&self.conn);
        let closed = tokio::task::spawn_blocking(move || {
            let taken = conn.lock().ok().and_then(|mut guard| guard.take());
            taken.is_some()
        })
        .await
        .unwrap_or(false);
        if closed {
            info!(path = %self.path.display(), "Closed event store");
        }
    }

    async fn save(&self, event: &mut Event) -> Result<EventId> {
        let id = EventId::generate(event.trigger_time);
        let data = encode_data(&id, &event.data)?;
        let trigger_type = event.trigger_type.clone();
        let trigger_time = event.trigger_time.timestamp_millis();
        let attempts = event.attempts;
        let created = event.created.timestamp_millis();
        let row_id = id.clone();

        self.with_conn(move |conn, sql| {
            conn.prepare_cached(&sql.insert)
                .and_then(|mut stmt| {
                    stmt.execute(params![
                        row_id.as_str(),
                        trigger_type,
                        trigger_time,
                        attempts,
                        data,
                        EventStatus::Default.code(),
                        created,
                    ])
                })
                .map_err(query_failed("Failed to save event"))?;
            Ok(())
        })
        .await?;

        event.id = id.clone();
        event.status = EventStatus::Default;
        event.owner.clear();
        event.locked = None;
        self.stats.saved.next();
        debug!(event_id = %id, "Saved event");
        Ok(id)
    }

    async fn cancel(&self, id: &EventId) -> Result<()> {
        let row_id = id.clone();
        let updated = self
            .with_conn(move |conn, sql| {
                conn.prepare_cached(&sql.cancel)
                    .and_then(|mut stmt| {
                        stmt.execute(params![
                            EventStatus::Cancel.code(),
                            Self::now_millis(),
                            row_id.as_str()
                        ])
                    })
                    .map_err(query_failed("Failed to cancel event"))
            })
            .await?;
        if updated == 0 {
            self.stats.errors.next();
            return Err(Error::event_not_found(id.as_str()));
        }
        self.stats.cancelled.next();
        Ok(())
    }

    async fn update_status(&self, id: &EventId, status: EventStatus) -> Result<()> {
        if !status.is_terminal() {
            self.stats.errors.next();
            return Err(Error::invalid_record(format!(
                "status {status} is not terminal for event {id}"
            )));
        }
        let row_id = id.clone();
        self.with_conn(move |conn, sql| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(query_failed("Failed to begin transaction"))?;
            if let Some(archive) = &sql.archive {
                tx.prepare_cached(archive)
                    .and_then(|mut stmt| {
                        stmt.execute(params![status.code(), Self::now_millis(), row_id.as_str()])
                    })
                    .map_err(query_failed("Failed to archive event"))?;
            }
            tx.prepare_cached(&sql.delete)
                .and_then(|mut stmt| stmt.execute(params![row_id.as_str()]))
                .map_err(query_failed("Failed to delete event"))?;
            tx.commit().map_err(query_failed("Failed to commit status"))
        })
        .await?;
        self.stats.completed.next();
        debug!(event_id = %id, status = %status, "Event completed");
        Ok(())
    }

    async fn update_for_retry(&self, event: &Event, retry_data: Option<&Value>) -> Result<()> {
        let data = retry_data.map(|data| encode_data(&event.id, data)).transpose()?;
        let row_id = event.id.clone();
        let trigger_time = event.trigger_time.timestamp_millis();
        let attempts = event.attempts;

        let updated = self
            .with_conn(move |conn, sql| {
                conn.prepare_cached(&sql.update_for_retry)
                    .and_then(|mut stmt| {
                        stmt.execute(params![
                            trigger_time,
                            attempts,
                            data,
                            Self::now_millis(),
                            row_id.as_str()
                        ])
                    })
                    .map_err(query_failed("Failed to update event for retry"))
            })
            .await?;
        if updated == 0 {
            self.stats.errors.next();
            return Err(Error::event_not_found(event.id.as_str()));
        }
        self.stats.retried.next();
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for SqliteStore {
    async fn declare_ownership(&self, owner: &str, seq: u32, upper_bound: &str) -> Result<usize> {
        let owner = owner.to_string();
        let upper_bound = upper_bound.to_string();
        self.with_conn(move |conn, sql| {
            conn.prepare_cached(&sql.declare_ownership)
                .and_then(|mut stmt| {
                    stmt.execute(params![owner, Self::now_millis(), seq, upper_bound])
                })
                .map_err(query_failed("Failed to declare ownership"))
        })
        .await
    }

    async fn select_claimed(
        &self,
        owner: &str,
        seq: u32,
        upper_bound: &str,
    ) -> Result<Vec<Event>> {
        let owner = owner.to_string();
        let upper_bound = upper_bound.to_string();
        self.with_conn(move |conn, sql| {
            let records = conn
                .prepare_cached(&sql.select_claimed)
                .and_then(|mut stmt| {
                    let rows = stmt.query_map(params![upper_bound, owner, seq], EventRecord::from_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()
                })
                .map_err(query_failed("Failed to select claimed events"))?;
            records.into_iter().map(EventRecord::into_event).collect()
        })
        .await
    }

    async fn reset_expired_leases(&self) -> Result<usize> {
        let timeout_ms = i64::try_from(self.lock_timeout.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Self::now_millis().saturating_sub(timeout_ms);
        let released = self
            .with_conn(move |conn, sql| {
                conn.prepare_cached(&sql.reset_expired)
                    .and_then(|mut stmt| stmt.execute(params![cutoff]))
                    .map_err(query_failed("Failed to reset expired leases"))
            })
            .await?;
        if released > 0 {
            self.stats
                .reset
                .add(u32::try_from(released).unwrap_or(u32::MAX));
            debug!(released, "Released expired leases");
        }
        Ok(released)
    }
}

#[async_trait]
impl StatProvider for SqliteStore {
    fn stat_name(&self) -> &'static str {
        "store"
    }

    async fn stat(&self, reset: bool) -> StatMap {
        self.stats.snapshot(reset)
    }
}
