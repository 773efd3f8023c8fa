//! The queue facade: wiring, lifecycle, and the client operations.
//!
//! A queue ties one store, one consumer, and one scheduler together. The
//! dispatch loop receives claimed batches from the consumer and hands pending
//! events to the scheduler and cancelled ones to `Scheduler::cancel`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kairos_core::{Config, ResultExt};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::consumer::{Batch, Consumer, PollingConsumer};
use crate::event::{Event, EventId, EventStatus};
use crate::scheduler::Scheduler;
use crate::shutdown::{StopSignal, Stopper, stop_channel};
use crate::stat::{StatMap, StatProvider, StatRegistry};
use crate::store::{LeaseStore, SqliteStore, Store};
use crate::trigger::{Trigger, TriggerRegistry};
use crate::{Error, Result};

type StoreParts = (Arc<dyn Store>, Arc<dyn StatProvider>);
type ConsumerParts = (Arc<dyn Consumer>, Arc<dyn StatProvider>);

/// Assembles a [`Queue`] from its components.
pub struct QueueBuilder {
    config: Config,
    triggers: TriggerRegistry,
    store: Option<StoreParts>,
    consumer: Option<ConsumerParts>,
}

impl QueueBuilder {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            triggers: TriggerRegistry::new(),
            store: None,
            consumer: None,
        }
    }

    /// Register the handler for `trigger_type`.
    #[must_use]
    pub fn trigger(mut self, trigger_type: impl Into<String>, handler: Arc<dyn Trigger>) -> Self {
        self.triggers.register(trigger_type, handler);
        self
    }

    /// Replace the handler registry wholesale.
    #[must_use]
    pub fn triggers(mut self, triggers: TriggerRegistry) -> Self {
        self.triggers = triggers;
        self
    }

    #[must_use]
    pub fn store<S: Store + StatProvider + 'static>(mut self, store: Arc<S>) -> Self {
        let stat: Arc<dyn StatProvider> = Arc::clone(&store) as Arc<dyn StatProvider>;
        let store: Arc<dyn Store> = store;
        self.store = Some((store, stat));
        self
    }

    #[must_use]
    pub fn consumer<C: Consumer + StatProvider + 'static>(mut self, consumer: Arc<C>) -> Self {
        let stat: Arc<dyn StatProvider> = Arc::clone(&consumer) as Arc<dyn StatProvider>;
        let consumer: Arc<dyn Consumer> = consumer;
        self.consumer = Some((consumer, stat));
        self
    }

    /// Use `store` for persistence and a [`PollingConsumer`] over it for claims.
    #[must_use]
    pub fn lease_store<S: LeaseStore + StatProvider + 'static>(self, store: Arc<S>) -> Self {
        let consumer = Arc::new(PollingConsumer::new(&self.config.consumer, Arc::clone(&store)));
        self.store(store).consumer(consumer)
    }

    /// # Errors
    ///
    /// Returns `InvalidConfig` for an invalid config and `NotPopulated` when
    /// the store or consumer is missing.
    pub async fn build(self) -> Result<Queue> {
        self.config.validate()?;
        let (store, store_stat) = self.store.ok_or_else(|| Error::not_populated("store"))?;
        let (consumer, consumer_stat) =
            self.consumer.ok_or_else(|| Error::not_populated("consumer"))?;

        let scheduler = Arc::new(Scheduler::new(
            &self.config.scheduler,
            self.triggers,
            Arc::clone(&store),
        ));
        let stats = Arc::new(StatRegistry::new(self.config.stat_interval()));
        stats.register(store_stat).await;
        stats.register(consumer_stat).await;
        stats.register(Arc::clone(&scheduler) as Arc<dyn StatProvider>).await;

        Ok(Queue {
            config: self.config,
            store,
            consumer,
            scheduler,
            stats,
            events: Arc::new(Mutex::new(None)),
            stopper: Mutex::new(None),
        })
    }
}

/// A delayed-event queue.
pub struct Queue {
    config: Config,
    store: Arc<dyn Store>,
    consumer: Arc<dyn Consumer>,
    scheduler: Arc<Scheduler>,
    stats: Arc<StatRegistry>,
    events: Arc<Mutex<Option<mpsc::Receiver<Batch>>>>,
    stopper: Mutex<Option<Stopper>>,
}

impl Queue {
    #[must_use]
    pub fn builder(config: Config) -> QueueBuilder {
        QueueBuilder::new(config)
    }

    /// A queue over the SQLite table named in `config`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an invalid config.
    pub async fn sqlite(config: Config, triggers: TriggerRegistry) -> Result<Self> {
        let store = Arc::new(SqliteStore::new(&config)?);
        Self::builder(config).triggers(triggers).lease_store(store).build().await
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Open the store and start consuming, scheduling and stat logging.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` if running, or the store's error if it
    /// cannot be opened.
    pub async fn start(&self) -> Result<()> {
        let mut stopper = self.stopper.lock().await;
        if stopper.is_some() {
            return Err(Error::already_started("queue"));
        }

        self.store.open().await?;
        let events = {
            let mut slot = self.events.lock().await;
            match slot.take() {
                Some(events) => events,
                None => self
                    .consumer
                    .take_events()
                    .ok_or_else(|| Error::not_populated("consumer events"))?,
            }
        };
        if let Err(e) = Arc::clone(&self.consumer).start().await {
            *self.events.lock().await = Some(events);
            self.store.close().await;
            return Err(e);
        }
        self.stats.start().await;

        let (handle, signal) = stop_channel("queue");
        let dispatcher = Dispatcher {
            store: Arc::clone(&self.store),
            consumer: Arc::clone(&self.consumer),
            scheduler: Arc::clone(&self.scheduler),
            stats: Arc::clone(&self.stats),
            slot: Arc::clone(&self.events),
        };
        tokio::spawn(dispatcher.run(events, signal));
        *stopper = Some(handle);
        info!("Queue started");
        Ok(())
    }

    /// Stop every loop, clear resident events, and close the store.
    ///
    /// Resident events stay owned in the store and are released to other
    /// processes once their leases expire. No-op when not running.
    pub async fn stop(&self) {
        let stopper = self.stopper.lock().await.take();
        if let Some(stopper) = stopper {
            stopper.stop().await;
            info!("Queue stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.stopper.lock().await.is_some()
    }

    /// Persist a new event. Returns its id, or `None` if the save failed
    /// (the failure is logged).
    pub async fn create(
        &self,
        trigger_type: &str,
        trigger_time: DateTime<Utc>,
        data: Value,
    ) -> Option<EventId> {
        let mut event = Event::new(trigger_type, trigger_time, data);
        let id = self.store.save(&mut event).await.into_option_logged()?;
        debug!(event_id = %id, trigger_type, "Event created");
        Some(id)
    }

    /// Mark `id` cancelled. The process that owns it stops its timer on the
    /// next poll; an unclaimed event is never delivered.
    ///
    /// # Errors
    ///
    /// Returns `EventNotFound` if no pending row has this id.
    pub async fn cancel(&self, id: &EventId) -> Result<()> {
        self.store.cancel(id).await
    }

    /// Merged counters of every component, without resetting them.
    pub async fn get_stat(&self) -> StatMap {
        self.stats.collect(false).await
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

/// Owns the dispatch loop and the teardown that follows it.
struct Dispatcher {
    store: Arc<dyn Store>,
    consumer: Arc<dyn Consumer>,
    scheduler: Arc<Scheduler>,
    stats: Arc<StatRegistry>,
    slot: Arc<Mutex<Option<mpsc::Receiver<Batch>>>>,
}

impl Dispatcher {
    async fn run(self, mut events: mpsc::Receiver<Batch>, mut signal: StopSignal) {
        let ack = loop {
            tokio::select! {
                biased;
                ack = signal.requested() => break ack,
                batch = events.recv() => match batch {
                    Some(batch) => self.dispatch(batch).await,
                    None => break signal.requested().await,
                },
            }
        };

        self.stats.stop().await;
        self.consumer.stop().await;
        self.scheduler.clear().await;
        self.store.close().await;
        // keep the receiver so the queue can be started again
        *self.slot.lock().await = Some(events);
        if let Some(ack) = ack {
            ack.acknowledge();
        }
    }

    async fn dispatch(&self, batch: Batch) {
        for event in batch {
            if event.status == EventStatus::Default {
                self.scheduler.add(event).await;
            } else {
                self.scheduler.cancel(&event.id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use std::time::Duration;

    use super::*;
    use crate::store::MemoryStore;
    use crate::trigger::TriggerResult;

    fn config() -> Config {
        let mut config = Config::default();
        config.consumer.consumer_sleep_msec = 20;
        config.consumer.consumer_lock_timeout_sec = 2;
        config
    }

    #[tokio::test]
    async fn test_build_requires_store_and_consumer() {
        let missing = Queue::builder(config()).build().await;
        assert!(matches!(missing, Err(Error::NotPopulated { .. })));

        let store = Arc::new(MemoryStore::new(&config()));
        let no_consumer = Queue::builder(config()).store(store).build().await;
        assert!(matches!(no_consumer, Err(Error::NotPopulated { .. })));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut bad = config();
        bad.scheduler.max_scheduled_events = 0;
        let store = Arc::new(MemoryStore::new(&bad));
        let result = Queue::builder(bad).lease_store(store).build().await;
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_start_twice_fails_and_stop_is_idempotent() {
        let store = Arc::new(MemoryStore::new(&config()));
        let queue = Queue::builder(config()).lease_store(store).build().await.unwrap();
        queue.start().await.unwrap();
        assert!(queue.is_running().await);
        assert!(matches!(queue.start().await, Err(Error::AlreadyStarted { .. })));

        queue.stop().await;
        queue.stop().await;
        assert!(!queue.is_running().await);
    }

    #[tokio::test]
    async fn test_created_event_fires_and_completes() {
        let store = Arc::new(MemoryStore::new(&config()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |event: &Event| {
            let _ = tx.send(event.id.clone());
            TriggerResult::ok()
        };
        let queue = Queue::builder(config())
            .trigger("ping", Arc::new(handler))
            .lease_store(Arc::clone(&store))
            .build()
            .await
            .unwrap();
        queue.start().await.unwrap();

        let id = queue.create("ping", Utc::now(), Value::Null).await.unwrap();
        let fired = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap();
        assert_eq!(fired, Some(id));

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.stop().await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let store = Arc::new(MemoryStore::new(&config()));
        let queue = Queue::builder(config()).lease_store(store).build().await.unwrap();
        queue.start().await.unwrap();
        queue.stop().await;
        queue.start().await.unwrap();
        assert!(queue.is_running().await);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_event() {
        let store = Arc::new(MemoryStore::new(&config()));
        let queue = Queue::builder(config()).lease_store(store).build().await.unwrap();
        let result = queue.cancel(&EventId::from("000000000000_missing")).await;
        assert!(matches!(result, Err(Error::EventNotFound { .. })));
    }

    #[tokio::test]
    async fn test_stats_are_merged_by_component() {
        let store = Arc::new(MemoryStore::new(&config()));
        let queue = Queue::builder(config()).lease_store(store).build().await.unwrap();
        let stats = queue.get_stat().await;
        for key in ["sys.uptime_sec", "store.saved", "consumer.polls", "scheduler.capacity"] {
            assert!(stats.contains_key(key), "missing {key}");
        }
    }
}
