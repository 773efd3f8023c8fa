//! Near-term event scheduler.
//!
//! Keeps the nearest events in a bounded priority queue, arms one timer per
//! resident event, runs the handler when it fires, and records the outcome in
//! the store: terminal statuses complete the event, `RETRY` releases it back to
//! the claimable pool with a later trigger time until `max_retry` is reached.
//!
//! The queue lock is held only for structural changes. Handlers always run
//! after the event has been removed and the lock released.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kairos_core::SchedulerConfig;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::backoff;
use crate::event::{Event, EventId, EventStatus};
use crate::pq::{Keyed, PriorityQueue, PushOutcome};
use crate::recover::isolate;
use crate::seq::Seq;
use crate::stat::{StatMap, StatProvider};
use crate::store::Store;
use crate::trigger::{TriggerRegistry, TriggerResult};

/// Events later than this when added count as delayed.
const LATE_THRESHOLD: Duration = Duration::from_secs(2);

/// A resident event and the timer that will fire it.
#[derive(Debug)]
struct Scheduled {
    event: Event,
    timer: Option<AbortHandle>,
}

impl Scheduled {
    /// Stop the timer, if armed, and hand back the event.
    fn disarm(self) -> Event {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        self.event
    }
}

impl Keyed for Scheduled {
    fn key(&self) -> &str {
        self.event.id.as_str()
    }
}

pub struct Scheduler {
    resident: Mutex<PriorityQueue<Scheduled>>,
    triggers: TriggerRegistry,
    store: Arc<dyn Store>,
    max_retry: u32,
    delayed: Seq,
    triggered: Seq,
    giveup: Seq,
    recovered: Seq,
}

impl Scheduler {
    #[must_use]
    pub fn new(config: &SchedulerConfig, triggers: TriggerRegistry, store: Arc<dyn Store>) -> Self {
        Self {
            resident: Mutex::new(PriorityQueue::new(config.max_scheduled_events, true)),
            triggers,
            store,
            max_retry: config.max_retry,
            delayed: Seq::new(),
            triggered: Seq::new(),
            giveup: Seq::new(),
            recovered: Seq::new(),
        }
    }

    /// Schedule `event` to fire at its trigger time.
    ///
    /// No-op if an event with the same id is already resident. When the
    /// queue is full the event is admitted only if it is sooner than the
    /// farthest resident, which is then evicted; otherwise it stays in the
    /// store until its lease expires.
    pub async fn add(self: &Arc<Self>, event: Event) {
        let id = event.id.clone();
        let trigger_time = event.trigger_time;
        let priority = event.priority();

        let mut resident = self.resident.lock().await;
        if resident.contains(id.as_str()) {
            debug!(event_id = %id, "Event already scheduled");
            return;
        }

        match resident.push(Scheduled { event, timer: None }, priority) {
            PushOutcome::Inserted { .. } => {}
            PushOutcome::Replaced { evicted, .. } => {
                let evicted = evicted.disarm();
                warn!(
                    event_id = %id,
                    evicted_id = %evicted.id,
                    "Scheduler full, evicted farthest event"
                );
            }
            PushOutcome::Rejected(_) => {
                warn!(
                    event_id = %id,
                    capacity = resident.capacity(),
                    "Scheduler full, event left in store until its lease expires"
                );
                return;
            }
            PushOutcome::Duplicate(_) => return,
        }

        // The timer handle is stored before the lock is released, so a
        // zero-delay trigger cannot remove the entry ahead of it.
        let delay = self.delay_until(&id, trigger_time);
        let timer = self.arm(id.clone(), delay);
        if let Some(slot) = resident.get_mut(id.as_str()) {
            slot.timer = Some(timer);
        }
        debug!(event_id = %id, delay_ms = millis(delay), "Event scheduled");
    }

    /// Drop `id` from the resident set, stopping its timer, and persist the
    /// cancellation. Safe for events that were never resident or already fired.
    pub async fn cancel(&self, id: &EventId) {
        let removed = self.resident.lock().await.remove(id.as_str());
        if let Some(scheduled) = removed {
            scheduled.disarm();
            debug!(event_id = %id, "Cancelled resident event");
        }
        self.complete(id, EventStatus::Cancel).await;
    }

    /// Fire `id` now. Does nothing if it is no longer resident.
    pub async fn trigger(&self, id: &EventId) {
        let removed = self.resident.lock().await.remove(id.as_str());
        let Some(scheduled) = removed else {
            debug!(event_id = %id, "Event no longer resident, skipping trigger");
            return;
        };
        // The timer being dropped here is the one running this call.
        let event = scheduled.event;

        let handler = self.triggers.resolve(&event.trigger_type);
        let result = match isolate(handler.trigger(&event)).await {
            Ok(result) => result,
            Err(panic) => {
                self.recovered.next();
                error!(
                    event_id = %event.id,
                    trigger_type = %event.trigger_type,
                    panic = %panic,
                    "Handler failed, recording event as ERROR"
                );
                self.complete(&event.id, EventStatus::Error).await;
                return;
            }
        };
        self.triggered.next();

        match result.status {
            EventStatus::Retry => self.retry(event, result).await,
            status if status.is_terminal() => self.complete(&event.id, status).await,
            other => {
                warn!(
                    event_id = %event.id,
                    status = %other,
                    "Handler returned a non-terminal status, recording ERROR"
                );
                self.complete(&event.id, EventStatus::Error).await;
            }
        }
    }

    /// Stop every resident timer and empty the queue.
    pub async fn clear(&self) {
        let mut resident = self.resident.lock().await;
        let mut cleared = 0_usize;
        while let Some(scheduled) = resident.pop() {
            scheduled.disarm();
            cleared += 1;
        }
        debug!(cleared, "Scheduler cleared");
    }

    /// Number of resident events.
    pub async fn len(&self) -> usize {
        self.resident.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.resident.lock().await.is_empty()
    }

    pub async fn contains(&self, id: &EventId) -> bool {
        self.resident.lock().await.contains(id.as_str())
    }

    async fn retry(&self, mut event: Event, result: TriggerResult) {
        if event.attempts >= self.max_retry {
            self.giveup.next();
            warn!(
                event_id = %event.id,
                attempts = event.attempts,
                "Retries exhausted, giving up"
            );
            self.complete(&event.id, EventStatus::Error).await;
            return;
        }

        event.trigger_time = result
            .trigger_time
            .unwrap_or_else(|| backoff::next_trigger_time(event.attempts));
        event.attempts = event.attempts.saturating_add(1);
        debug!(
            event_id = %event.id,
            attempts = event.attempts,
            next = %event.trigger_time,
            "Retrying event"
        );
        if let Err(e) = self
            .store
            .update_for_retry(&event, result.data.as_ref())
            .await
        {
            error!(event_id = %event.id, error = %e, "Failed to persist retry");
        }
    }

    async fn complete(&self, id: &EventId, status: EventStatus) {
        if let Err(e) = self.store.update_status(id, status).await {
            error!(event_id = %id, status = %status, error = %e, "Failed to persist status");
        }
    }

    /// Time left until `trigger_time`, zero for past events.
    fn delay_until(&self, id: &EventId, trigger_time: DateTime<Utc>) -> Duration {
        let until = trigger_time - Utc::now();
        if let Ok(delay) = until.to_std() {
            return delay;
        }
        let late = (-until).to_std().unwrap_or_default();
        if late > LATE_THRESHOLD {
            self.delayed.next();
            warn!(event_id = %id, late_ms = millis(late), "Event is late, firing now");
        }
        Duration::ZERO
    }

    fn arm(self: &Arc<Self>, id: EventId, delay: Duration) -> AbortHandle {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.trigger(&id).await;
        })
        .abort_handle()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("triggers", &self.triggers)
            .field("max_retry", &self.max_retry)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StatProvider for Scheduler {
    fn stat_name(&self) -> &'static str {
        "scheduler"
    }

    async fn stat(&self, reset: bool) -> StatMap {
        let (events, remaining) = {
            let resident = self.resident.lock().await;
            (resident.len(), resident.remaining())
        };
        StatMap::from([
            ("events".to_string(), Value::from(events)),
            ("capacity".to_string(), Value::from(remaining)),
            ("delayed".to_string(), Value::from(self.delayed.read(reset))),
            ("triggered".to_string(), Value::from(self.triggered.read(reset))),
            ("giveup".to_string(), Value::from(self.giveup.read(reset))),
            ("recovered".to_string(), Value::from(self.recovered.read(reset))),
        ])
    }
}
