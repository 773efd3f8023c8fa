//! In-process store implementing the same lease protocol as the SQLite store.
//!
//! Rows live in an id-ordered map, so the claim range scan matches the SQL
//! `id < ?` scan. Several queues in one process can share one instance to
//! behave like independent processes over a shared table. Data survives
//! `close`; only dropping the store discards it.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kairos_core::{Config, ResultExt};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::{LeaseStore, Store, StoreStats};
use crate::event::{Event, EventId, EventStatus};
use crate::stat::{StatMap, StatProvider};
use crate::{Error, Result};

#[derive(Debug)]
struct Row {
    event: Event,
    owner_seq: u32,
}

#[derive(Debug, Default)]
struct Tables {
    rows: BTreeMap<String, Row>,
    archive: Vec<Event>,
}

#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    select_limit: usize,
    lock_timeout: Duration,
    archive_terminal: bool,
    stats: StoreStats,
}

impl MemoryStore {
    /// Batch size, lease timeout and archival taken from `config`.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::with_lease(
            config.consumer.consumer_select_limit,
            config.consumer.lock_timeout(),
            config.store.archive_terminal,
        )
    }

    #[must_use]
    pub fn with_lease(select_limit: usize, lock_timeout: Duration, archive_terminal: bool) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            select_limit,
            lock_timeout,
            archive_terminal,
            stats: StoreStats::default(),
        }
    }

    /// Number of rows still pending.
    pub async fn len(&self) -> usize {
        self.tables.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tables.lock().await.rows.is_empty()
    }

    /// Snapshot of one pending row.
    pub async fn get(&self, id: &EventId) -> Option<Event> {
        self.tables
            .lock()
            .await
            .rows
            .get(id.as_str())
            .map(|row| row.event.clone())
    }

    /// Terminal events kept when archival is enabled, oldest first.
    pub async fn archived(&self) -> Vec<Event> {
        self.tables.lock().await.archive.clone()
    }

    fn lease_cutoff(&self) -> chrono::DateTime<Utc> {
        let timeout = chrono::Duration::from_std(self.lock_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        Utc::now()
            .checked_sub_signed(timeout)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
    }
}

fn below(upper_bound: &str) -> (Bound<&str>, Bound<&str>) {
    (Bound::Unbounded, Bound::Excluded(upper_bound))
}

#[async_trait]
impl Store for MemoryStore {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}

    async fn save(&self, event: &mut Event) -> Result<EventId> {
        let id = EventId::generate(event.trigger_time);
        event.id = id.clone();
        event.status = EventStatus::Default;
        event.owner.clear();
        event.locked = None;

        let row = Row {
            event: event.clone(),
            owner_seq: 0,
        };
        self.tables
            .lock()
            .await
            .rows
            .insert(id.as_str().to_string(), row);
        self.stats.saved.next();
        debug!(event_id = %id, "Saved event");
        Ok(id)
    }

    async fn cancel(&self, id: &EventId) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .rows
            .get_mut(id.as_str())
            .ok_or_else(|| Error::event_not_found(id.as_str()))
            .inspect_error(|_| {
                self.stats.errors.next();
            })?;
        row.event.status = EventStatus::Cancel;
        row.event.updated = Some(Utc::now());
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
        let mut tables = self.tables.lock().await;
        if let Some(row) = tables.rows.remove(id.as_str()) {
            if self.archive_terminal {
                let mut event = row.event;
                let now = Utc::now();
                event.status = status;
                event.completed = Some(now);
                event.updated = Some(now);
                tables.archive.push(event);
            }
        }
        self.stats.completed.next();
        Ok(())
    }

    async fn update_for_retry(&self, event: &Event, retry_data: Option<&Value>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .rows
            .get_mut(event.id.as_str())
            .ok_or_else(|| Error::event_not_found(event.id.as_str()))
            .inspect_error(|_| {
                self.stats.errors.next();
            })?;
        row.event.owner.clear();
        row.event.locked = None;
        row.owner_seq = 0;
        row.event.trigger_time = event.trigger_time;
        row.event.attempts = event.attempts;
        row.event.updated = Some(Utc::now());
        if let Some(data) = retry_data {
            row.event.data = data.clone();
        }
        self.stats.retried.next();
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn declare_ownership(&self, owner: &str, seq: u32, upper_bound: &str) -> Result<usize> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        let mut claimed = 0;
        let unowned = tables
            .rows
            .range_mut::<str, _>(below(upper_bound))
            .map(|(_, row)| row)
            .filter(|row| row.event.owner.is_empty())
            .take(self.select_limit);
        for row in unowned {
            row.event.owner = owner.to_string();
            row.event.locked = Some(now);
            row.owner_seq = seq;
            claimed += 1;
        }
        Ok(claimed)
    }

    async fn select_claimed(
        &self,
        owner: &str,
        seq: u32,
        upper_bound: &str,
    ) -> Result<Vec<Event>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .rows
            .range::<str, _>(below(upper_bound))
            .map(|(_, row)| row)
            .filter(|row| {
                row.event.owner == owner
                    && (row.owner_seq == seq || row.event.status == EventStatus::Cancel)
            })
            .map(|row| row.event.clone())
            .collect())
    }

    async fn reset_expired_leases(&self) -> Result<usize> {
        let cutoff = self.lease_cutoff();
        let mut tables = self.tables.lock().await;
        let mut released = 0;
        for row in tables.rows.values_mut() {
            let expired = row.event.locked.is_some_and(|at| at < cutoff);
            if !row.event.owner.is_empty() && expired {
                row.event.owner.clear();
                row.event.locked = None;
                released += 1;
            }
        }
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
impl StatProvider for MemoryStore {
    fn stat_name(&self) -> &'static str {
        "store"
    }

    async fn stat(&self, reset: bool) -> StatMap {
        self.stats.snapshot(reset)
    }
}
