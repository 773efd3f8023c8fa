//! Polling consumer driving the lease claim protocol.
//!
//! Every `consumer_sleep_msec` the loop claims a batch of due events under a
//! fresh sequence number and forwards non-empty batches to the dispatcher.
//! Every `consumer_lock_timeout_sec / 4` it sweeps expired leases. Each of
//! those iterations runs inside its own failure boundary.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use kairos_core::ConsumerConfig;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::event::{Event, EventId};
use crate::recover::isolate;
use crate::seq::Seq;
use crate::shutdown::{StopSignal, Stopper, stop_channel};
use crate::stat::{StatMap, StatProvider};
use crate::store::LeaseStore;
use crate::{Error, Result};

/// Batches waiting for the dispatcher before the loop waits on it.
const HANDOFF_CAPACITY: usize = 16;

/// A claimed batch of events.
pub type Batch = Vec<Event>;

/// Source of claimed event batches for a queue.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Start producing batches.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` if the consumer is running.
    async fn start(self: Arc<Self>) -> Result<()>;

    /// Stop producing batches. Returns once no further claim can happen.
    async fn stop(&self);

    /// Take the receiving end of the batch channel. `None` after the first call.
    fn take_events(&self) -> Option<mpsc::Receiver<Batch>>;
}

/// Consumer that polls a [`LeaseStore`].
pub struct PollingConsumer<S: ?Sized> {
    owner: String,
    store: Arc<S>,
    config: ConsumerConfig,
    seq: Seq,
    polls: Seq,
    claimed: Seq,
    recovered: Seq,
    errors: Seq,
    events_tx: mpsc::Sender<Batch>,
    events_rx: StdMutex<Option<mpsc::Receiver<Batch>>>,
    stopper: Mutex<Option<Stopper>>,
}

impl<S: LeaseStore + ?Sized + 'static> PollingConsumer<S> {
    /// Owner identity is `consumer_name`, or `consumer:<uuid>` when empty.
    #[must_use]
    pub fn new(config: &ConsumerConfig, store: Arc<S>) -> Self {
        let owner = if config.consumer_name.is_empty() {
            format!("consumer:{}", Uuid::new_v4())
        } else {
            config.consumer_name.clone()
        };
        let (events_tx, events_rx) = mpsc::channel(HANDOFF_CAPACITY);
        Self {
            owner,
            store,
            config: config.clone(),
            seq: Seq::new(),
            polls: Seq::new(),
            claimed: Seq::new(),
            recovered: Seq::new(),
            errors: Seq::new(),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            stopper: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// One claim cycle: next sequence number, declare, select.
    async fn poll_once(&self) -> Batch {
        let seq = self.seq.next();
        self.polls.next();
        let horizon = chrono::Duration::from_std(self.config.time_window())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let upper_bound = EventId::upper_bound(Utc::now() + horizon);

        match self.store.claim(&self.owner, seq, &upper_bound).await {
            Ok(batch) => {
                if !batch.is_empty() {
                    self.claimed.add(u32::try_from(batch.len()).unwrap_or(u32::MAX));
                    debug!(owner = %self.owner, seq, count = batch.len(), "Claimed events");
                }
                batch
            }
            Err(e) => {
                self.errors.next();
                error!(owner = %self.owner, seq, error = %e, retryable = e.is_retryable(), "Claim failed");
                Vec::new()
            }
        }
    }

    async fn reclaim_once(&self) {
        match self.store.reset_expired_leases().await {
            Ok(0) => {}
            Ok(released) => info!(owner = %self.owner, released, "Released expired leases"),
            Err(e) => {
                self.errors.next();
                error!(owner = %self.owner, error = %e, "Lease reclaim failed");
            }
        }
    }

    /// Count and log a failure that escaped an iteration.
    fn recover(&self, iteration: &'static str, panic: &str) {
        self.recovered.next();
        error!(owner = %self.owner, iteration, panic = %panic, "Recovered from failure in consumer loop");
    }

    async fn run(self: Arc<Self>, mut signal: StopSignal) {
        let mut reclaim = tokio::time::interval(self.config.reclaim_interval());
        reclaim.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        reclaim.tick().await;
        let mut next_poll = Instant::now();

        loop {
            tokio::select! {
                biased;
                ack = signal.requested() => {
                    if let Some(ack) = ack {
                        ack.acknowledge();
                    }
                    break;
                }
                _ = reclaim.tick() => {
                    if let Err(panic) = isolate(self.reclaim_once()).await {
                        self.recover("reclaim", &panic);
                    }
                }
                () = tokio::time::sleep_until(next_poll) => {
                    let batch = match isolate(self.poll_once()).await {
                        Ok(batch) => batch,
                        Err(panic) => {
                            self.recover("poll", &panic);
                            Vec::new()
                        }
                    };
                    next_poll = Instant::now() + self.config.poll_sleep();
                    if batch.is_empty() {
                        continue;
                    }
                    let dropped = batch.len();
                    tokio::select! {
                        biased;
                        ack = signal.requested() => {
                            warn!(owner = %self.owner, dropped, "Stopped with a batch undelivered, leases will expire");
                            if let Some(ack) = ack {
                                ack.acknowledge();
                            }
                            break;
                        }
                        sent = self.events_tx.send(batch) => {
                            if sent.is_err() {
                                warn!(owner = %self.owner, "Batch receiver dropped, leases will expire");
                            }
                        }
                    }
                }
            }
        }
        info!(owner = %self.owner, "Consumer stopped");
    }
}

#[async_trait]
impl<S: LeaseStore + ?Sized + 'static> Consumer for PollingConsumer<S> {
    async fn start(self: Arc<Self>) -> Result<()> {
        let mut stopper = self.stopper.lock().await;
        if stopper.is_some() {
            return Err(Error::already_started("consumer"));
        }
        let (handle, signal) = stop_channel("consumer");
        tokio::spawn(Arc::clone(&self).run(signal));
        *stopper = Some(handle);
        info!(
            owner = %self.owner,
            sleep_ms = self.config.consumer_sleep_msec,
            window_sec = self.config.consumer_time_window_sec,
            "Consumer started"
        );
        Ok(())
    }

    async fn stop(&self) {
        let stopper = self.stopper.lock().await.take();
        if let Some(stopper) = stopper {
            stopper.stop().await;
        }
    }

    fn take_events(&self) -> Option<mpsc::Receiver<Batch>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }
}

#[async_trait]
impl<S: LeaseStore + ?Sized + 'static> StatProvider for PollingConsumer<S> {
    fn stat_name(&self) -> &'static str {
        "consumer"
    }

    async fn stat(&self, reset: bool) -> StatMap {
        StatMap::from([
            ("polls".to_string(), Value::from(self.polls.read(reset))),
            ("claimed".to_string(), Value::from(self.claimed.read(reset))),
            ("recovered".to_string(), Value::from(self.recovered.read(reset))),
            ("errors".to_string(), Value::from(self.errors.read(reset))),
        ])
    }
}

impl<S: ?Sized> std::fmt::Debug for PollingConsumer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingConsumer")
            .field("owner", &self.owner)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use std::time::Duration;

    use super::*;
    use crate::store::{MemoryStore, Store};

    fn config(name: &str) -> ConsumerConfig {
        ConsumerConfig {
            consumer_name: name.to_string(),
            consumer_lock_timeout_sec: 1,
            consumer_time_window_sec: 5,
            consumer_select_limit: 10,
            consumer_sleep_msec: 20,
        }
    }

    async fn save_due(store: &MemoryStore) -> EventId {
        let mut event = Event::new("test", Utc::now(), Value::Null);
        store.save(&mut event).await.unwrap()
    }

    #[test]
    fn test_generated_owner_when_name_empty() {
        let store = Arc::new(MemoryStore::with_lease(10, Duration::from_secs(1), false));
        let consumer = PollingConsumer::new(&config(""), Arc::clone(&store));
        assert!(consumer.owner().starts_with("consumer:"));

        let named = PollingConsumer::new(&config("worker-7"), store);
        assert_eq!(named.owner(), "worker-7");
    }

    #[tokio::test]
    async fn test_forwards_claimed_batch() {
        let store = Arc::new(MemoryStore::with_lease(10, Duration::from_secs(1), false));
        let id = save_due(&store).await;
        let consumer = Arc::new(PollingConsumer::new(&config("a"), Arc::clone(&store)));
        let mut events = consumer.take_events().unwrap();
        assert!(consumer.take_events().is_none());

        Arc::clone(&consumer).start().await.unwrap();
        let batch = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        consumer.stop().await;

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].owner, "a");
        let stats = consumer.stat(false).await;
        assert_eq!(stats.get("claimed"), Some(&Value::from(1)));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let store = Arc::new(MemoryStore::with_lease(10, Duration::from_secs(1), false));
        let consumer = Arc::new(PollingConsumer::new(&config("a"), store));
        Arc::clone(&consumer).start().await.unwrap();
        let again = Arc::clone(&consumer).start().await;
        assert!(matches!(again, Err(Error::AlreadyStarted { .. })));
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_no_claims_after_stop() {
        let store = Arc::new(MemoryStore::with_lease(10, Duration::from_secs(1), false));
        let consumer = Arc::new(PollingConsumer::new(&config("a"), Arc::clone(&store)));
        let _events = consumer.take_events();
        Arc::clone(&consumer).start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        consumer.stop().await;

        let id = save_due(&store).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.get(&id).await.unwrap().owner.is_empty());
    }

    #[tokio::test]
    async fn test_stop_while_dispatcher_is_not_reading() {
        let store = Arc::new(MemoryStore::with_lease(1, Duration::from_secs(1), false));
        for _ in 0..(HANDOFF_CAPACITY + 4) {
            save_due(&store).await;
        }
        let consumer = Arc::new(PollingConsumer::new(&config("a"), Arc::clone(&store)));
        let _events = consumer.take_events();
        Arc::clone(&consumer).start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(1), consumer.stop()).await;
        assert!(stopped.is_ok());
    }

    #[tokio::test]
    async fn test_poll_stats_count_cycles_since_reset() {
        let store = Arc::new(MemoryStore::with_lease(10, Duration::from_secs(1), false));
        let consumer = Arc::new(PollingConsumer::new(&config("a"), store));
        let _events = consumer.take_events();
        Arc::clone(&consumer).start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(110)).await;
        consumer.stop().await;

        let first = consumer.stat(true).await;
        let polls = first.get("polls").and_then(Value::as_u64).unwrap();
        assert!(polls >= 2, "expected several polls, got {polls}");
        let second = consumer.stat(false).await;
        assert_eq!(second.get("polls"), Some(&Value::from(0)));
    }
}
