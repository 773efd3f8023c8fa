//! Durable event storage and the lease-based claim protocol.
//!
//! Every row carries `owner`, `owner_lock_time` and `owner_seq`. A poll cycle
//! claims unowned rows below a time bound under a fresh sequence number, then
//! reads back exactly the rows stamped with that number (plus any cancelled
//! rows it owns). Rows whose lease is older than the lock timeout are released
//! by a periodic sweep so another process can claim them.

use async_trait::async_trait;
use serde_json::Value;

use crate::event::{Event, EventId, EventStatus};
use crate::seq::Seq;
use crate::stat::StatMap;
use crate::Result;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Durable event table.
#[async_trait]
pub trait Store: Send + Sync {
    /// Prepare the store for use. Idempotent.
    async fn open(&self) -> Result<()>;

    async fn close(&self);

    /// Assign an id to `event` and persist it as a pending row.
    async fn save(&self, event: &mut Event) -> Result<EventId>;

    /// Mark the row cancelled. The row stays so that a claim in flight observes it.
    async fn cancel(&self, id: &EventId) -> Result<()>;

    /// Record a terminal status; the row leaves the pending pool.
    async fn update_status(&self, id: &EventId, status: EventStatus) -> Result<()>;

    /// Release ownership and store the new trigger time and attempt count.
    /// `retry_data` replaces the payload when present.
    async fn update_for_retry(&self, event: &Event, retry_data: Option<&Value>) -> Result<()>;
}

/// The claim protocol a polling consumer drives.
#[async_trait]
pub trait LeaseStore: Store {
    /// Claim up to the configured batch size of unowned rows with `id < upper_bound`.
    /// Returns the number of rows claimed.
    async fn declare_ownership(&self, owner: &str, seq: u32, upper_bound: &str) -> Result<usize>;

    /// Rows owned by `owner` below `upper_bound` that were claimed in cycle
    /// `seq` or have been cancelled.
    async fn select_claimed(&self, owner: &str, seq: u32, upper_bound: &str)
    -> Result<Vec<Event>>;

    /// Clear ownership of every row whose lease has expired. Returns the count.
    async fn reset_expired_leases(&self) -> Result<usize>;

    /// Both claim phases for one poll cycle.
    async fn claim(&self, owner: &str, seq: u32, upper_bound: &str) -> Result<Vec<Event>> {
        self.declare_ownership(owner, seq, upper_bound).await?;
        self.select_claimed(owner, seq, upper_bound).await
    }
}

/// Operation counters shared by the store implementations.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub saved: Seq,
    pub cancelled: Seq,
    pub completed: Seq,
    pub retried: Seq,
    pub reset: Seq,
    pub errors: Seq,
}

impl StoreStats {
    #[must_use]
    pub fn snapshot(&self, reset: bool) -> StatMap {
        [
            ("saved", &self.saved),
            ("cancelled", &self.cancelled),
            ("completed", &self.completed),
            ("retried", &self.retried),
            ("reset", &self.reset),
            ("errors", &self.errors),
        ]
        .into_iter()
        .map(|(key, counter)| (key.to_string(), Value::from(counter.read(reset))))
        .collect()
    }
}
