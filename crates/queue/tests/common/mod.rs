//! Shared fixtures for the queue integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kairos_queue::{Config, Event, EventId, MemoryStore, Trigger, TriggerResult};

/// Install the test subscriber once; later calls are ignored.
pub fn init_logging() {
    kairos_queue::logging::init("warn");
}

/// Config with short poll and lease intervals.
pub fn fast_config(name: &str) -> Config {
    let mut config = Config::default();
    config.consumer.consumer_name = name.to_string();
    config.consumer.consumer_sleep_msec = 20;
    config.consumer.consumer_lock_timeout_sec = 1;
    config.consumer.consumer_time_window_sec = 5;
    config.scheduler.max_retry = 5;
    config
}

type Respond = dyn Fn(&Event) -> TriggerResult + Send + Sync;

/// Handler that records every invocation and answers with `respond`.
pub struct Recorder {
    fired: Mutex<Vec<(EventId, u32)>>,
    respond: Box<Respond>,
}

impl Recorder {
    pub fn new(respond: impl Fn(&Event) -> TriggerResult + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            fired: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    pub fn ok() -> Arc<Self> {
        Self::new(|_| TriggerResult::ok())
    }

    /// Every (id, attempts) pair seen so far.
    pub fn fired(&self) -> Vec<(EventId, u32)> {
        self.fired.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.fired().len()
    }

    pub fn counts_by_id(&self) -> HashMap<EventId, usize> {
        let mut counts = HashMap::new();
        for (id, _) in self.fired() {
            *counts.entry(id).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl Trigger for Recorder {
    async fn trigger(&self, event: &Event) -> TriggerResult {
        if let Ok(mut fired) = self.fired.lock() {
            fired.push((event.id.clone(), event.attempts));
        }
        (self.respond)(event)
    }
}

/// Poll `condition` every 20ms until it holds or `limit` elapses.
pub async fn wait_until<F: FnMut() -> bool>(limit: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Wait until `store` has archived `count` events.
pub async fn wait_for_archive(store: &MemoryStore, count: usize, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if store.archived().await.len() >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    store.archived().await.len() >= count
}
