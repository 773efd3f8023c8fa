//! Distributed delayed-event queue.
//!
//! Events are persisted with a trigger time in a shared store. Each process
//! runs a [`Queue`]: its consumer periodically claims near-due events under a
//! time-limited lease, its scheduler keeps the nearest of them in memory and
//! fires registered [`Trigger`] handlers on time, and the outcome is written
//! back. Events held by a crashed process become claimable again once their
//! lease expires, so every event fires at least once.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chrono::{Duration, Utc};
//! use kairos_queue::{Config, Event, Queue, TriggerRegistry, TriggerResult};
//!
//! # async fn run() -> kairos_queue::Result<()> {
//! let mut triggers = TriggerRegistry::new();
//! triggers.register("email", Arc::new(|event: &Event| {
//!     tracing::info!(event_id = %event.id, "sending");
//!     TriggerResult::ok()
//! }));
//!
//! let queue = Queue::sqlite(Config::load("kairos.toml")?, triggers).await?;
//! queue.start().await?;
//! queue.create("email", Utc::now() + Duration::minutes(5), serde_json::json!({"to": "a@b.c"})).await;
//! queue.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod consumer;
pub mod event;
pub mod logging;
pub mod pq;
pub mod queue;
pub mod recover;
pub mod scheduler;
pub mod seq;
pub mod shutdown;
pub mod stat;
pub mod store;
pub mod trigger;

pub use kairos_core::{Config, ConsumerConfig, Error, Result, SchedulerConfig, StoreConfig};

pub use consumer::{Batch, Consumer, PollingConsumer};
pub use event::{Event, EventId, EventStatus};
pub use queue::{Queue, QueueBuilder};
pub use scheduler::Scheduler;
pub use stat::{StatMap, StatProvider, StatRegistry};
pub use store::{LeaseStore, MemoryStore, SqliteStore, Store};
pub use trigger::{NoTrigger, Trigger, TriggerRegistry, TriggerResult};
