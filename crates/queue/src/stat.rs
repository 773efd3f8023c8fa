//! Stat aggregation across queue components.
//!
//! Each component exposes a flat map of counters. The registry merges them
//! under `<component>.<key>` and, when an interval is configured, logs the
//! merged map periodically (reading with reset) and once more on stop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::shutdown::{StopSignal, Stopper, stop_channel};

/// Flat stat map, ordered by key for stable log output.
pub type StatMap = BTreeMap<String, Value>;

/// A component that reports counters.
#[async_trait]
pub trait StatProvider: Send + Sync {
    /// Prefix used for this component's keys in the merged map.
    fn stat_name(&self) -> &'static str;

    /// Current counters; counters are zeroed when `reset` is set.
    async fn stat(&self, reset: bool) -> StatMap;
}

/// Process-level stats: start time, uptime, collection time.
#[derive(Debug)]
pub struct SystemStat {
    started: DateTime<Utc>,
}

impl SystemStat {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Utc::now(),
        }
    }
}

impl Default for SystemStat {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatProvider for SystemStat {
    fn stat_name(&self) -> &'static str {
        "sys"
    }

    async fn stat(&self, _reset: bool) -> StatMap {
        let now = Utc::now();
        let uptime = (now - self.started).num_seconds().max(0);
        StatMap::from([
            (
                "start_time".to_string(),
                Value::from(self.started.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ),
            ("uptime_sec".to_string(), Value::from(uptime)),
            (
                "collected_time".to_string(),
                Value::from(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ),
        ])
    }
}

/// Registry of stat providers plus the optional periodic log loop.
pub struct StatRegistry {
    providers: RwLock<Vec<Arc<dyn StatProvider>>>,
    interval: Option<Duration>,
    stopper: Mutex<Option<Stopper>>,
}

impl StatRegistry {
    /// A registry that logs every `interval`, or never when `None`.
    /// The system provider is always registered.
    #[must_use]
    pub fn new(interval: Option<Duration>) -> Self {
        let system: Arc<dyn StatProvider> = Arc::new(SystemStat::new());
        Self {
            providers: RwLock::new(vec![system]),
            interval,
            stopper: Mutex::new(None),
        }
    }

    pub async fn register(&self, provider: Arc<dyn StatProvider>) {
        debug!(component = provider.stat_name(), "Registered stat provider");
        self.providers.write().await.push(provider);
    }

    /// Merge every provider's counters under `<component>.<key>`.
    pub async fn collect(&self, reset: bool) -> StatMap {
        let providers = self.providers.read().await.clone();
        let mut merged = StatMap::new();
        for provider in providers {
            let name = provider.stat_name();
            for (key, value) in provider.stat(reset).await {
                merged.insert(format!("{name}.{key}"), value);
            }
        }
        merged
    }

    /// Start the periodic log loop. No-op when no interval is configured
    /// or the loop is already running.
    pub async fn start(self: &Arc<Self>) {
        let Some(interval) = self.interval else {
            debug!("Stat logging disabled");
            return;
        };
        let mut stopper = self.stopper.lock().await;
        if stopper.is_some() {
            return;
        }
        let (handle, signal) = stop_channel("stat");
        tokio::spawn(Arc::clone(self).run(interval, signal));
        *stopper = Some(handle);
        info!(interval_sec = interval.as_secs(), "Stat logging started");
    }

    /// Stop the log loop and wait for its final log line.
    pub async fn stop(&self) {
        let stopper = self.stopper.lock().await.take();
        if let Some(stopper) = stopper {
            stopper.stop().await;
        }
    }

    async fn run(self: Arc<Self>, interval: Duration, mut signal: StopSignal) {
        let mut ticker = tokio::time::interval(interval);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                ack = signal.requested() => {
                    self.log(false).await;
                    if let Some(ack) = ack {
                        ack.acknowledge();
                    }
                    break;
                }
                _ = ticker.tick() => self.log(true).await,
            }
        }
    }

    async fn log(&self, reset: bool) {
        let stats = self.collect(reset).await;
        let rendered = serde_json::to_string(&stats).unwrap_or_default();
        info!(stats = %rendered, "Queue stats");
    }
}

impl std::fmt::Debug for StatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatRegistry")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::Seq;

    struct Hits(Seq);

    #[async_trait]
    impl StatProvider for Hits {
        fn stat_name(&self) -> &'static str {
            "hits"
        }

        async fn stat(&self, reset: bool) -> StatMap {
            StatMap::from([("count".to_string(), Value::from(self.0.read(reset)))])
        }
    }

    #[tokio::test]
    async fn test_collect_prefixes_component_name() {
        let registry = StatRegistry::new(None);
        let hits = Arc::new(Hits(Seq::new()));
        hits.0.next();
        registry.register(Arc::clone(&hits) as Arc<dyn StatProvider>).await;

        let stats = registry.collect(false).await;
        assert_eq!(stats.get("hits.count"), Some(&Value::from(1)));
        assert!(stats.contains_key("sys.uptime_sec"));
        assert!(stats.contains_key("sys.start_time"));
        assert!(stats.contains_key("sys.collected_time"));
    }

    #[tokio::test]
    async fn test_collect_with_reset_zeroes_counters() {
        let registry = StatRegistry::new(None);
        let hits = Arc::new(Hits(Seq::new()));
        hits.0.next();
        hits.0.next();
        registry.register(Arc::clone(&hits) as Arc<dyn StatProvider>).await;

        assert_eq!(registry.collect(true).await.get("hits.count"), Some(&Value::from(2)));
        assert_eq!(registry.collect(false).await.get("hits.count"), Some(&Value::from(0)));
    }

    #[tokio::test]
    async fn test_periodic_loop_resets_and_stops() {
        let registry = Arc::new(StatRegistry::new(Some(Duration::from_millis(20))));
        let hits = Arc::new(Hits(Seq::new()));
        hits.0.next();
        registry.register(Arc::clone(&hits) as Arc<dyn StatProvider>).await;

        registry.start().await;
        tokio::time::sleep(Duration::from_millis(70)).await;
        registry.stop().await;

        assert_eq!(hits.0.get(), 0);
        assert!(registry.stopper.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_loop_start_is_noop() {
        let registry = Arc::new(StatRegistry::new(None));
        registry.start().await;
        assert!(registry.stopper.lock().await.is_none());
        registry.stop().await;
    }
}
