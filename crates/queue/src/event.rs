//! The persisted unit of work and its status.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result};

/// Width of the zero-padded trigger-second prefix of every event id.
const ID_PREFIX_WIDTH: usize = 12;

/// Lifecycle status of an event. Persisted as an integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStatus {
    Unknown,
    /// Newly created and pending.
    Default,
    Ok,
    /// Cancelled before firing.
    Cancel,
    /// Terminal failure: giveup or crashed handler.
    Error,
    /// Handler asked for another attempt. Never a final state.
    Retry,
    /// Code outside the known range, preserved as-is.
    Extended(i64),
}

impl EventStatus {
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::Default => 1,
            Self::Ok => 2,
            Self::Cancel => 3,
            Self::Error => 4,
            Self::Retry => 5,
            Self::Extended(code) => code,
        }
    }

    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Unknown,
            1 => Self::Default,
            2 => Self::Ok,
            3 => Self::Cancel,
            4 => Self::Error,
            5 => Self::Retry,
            other => Self::Extended(other),
        }
    }

    /// Terminal statuses remove the event from the pending pool.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::Cancel | Self::Error)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Default => write!(f, "DEFAULT"),
            Self::Ok => write!(f, "OK"),
            Self::Cancel => write!(f, "CANCEL"),
            Self::Error => write!(f, "ERROR"),
            Self::Retry => write!(f, "RETRY"),
            Self::Extended(code) => write!(f, "EXTENDED({code})"),
        }
    }
}

/// Event identity: `<trigger second, zero padded>_<unique suffix>`.
///
/// The prefix makes id order equal trigger-time order, so "due before T"
/// is the range `id < EventId::upper_bound(T)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(String);

impl EventId {
    /// Generate a fresh id for an event triggering at `trigger_time`.
    #[must_use]
    pub fn generate(trigger_time: DateTime<Utc>) -> Self {
        Self(format!(
            "{}_{}",
            Self::upper_bound(trigger_time),
            Uuid::new_v4().simple()
        ))
    }

    /// Exclusive upper bound matching every id whose trigger second is before `instant`.
    #[must_use]
    pub fn upper_bound(instant: DateTime<Utc>) -> String {
        let secs = instant.timestamp().max(0);
        format!("{secs:0width$}", width = ID_PREFIX_WIDTH)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for EventId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A delayed event as stored and as handed to trigger handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Assigned by the store on save; empty before that.
    pub id: EventId,
    pub trigger_type: String,
    pub trigger_time: DateTime<Utc>,
    /// Current lease holder, empty when unclaimed.
    pub owner: String,
    pub attempts: u32,
    pub status: EventStatus,
    /// Opaque payload, interpreted only by the handler for `trigger_type`.
    pub data: Value,
    pub created: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub locked: Option<DateTime<Utc>>,
}

impl Event {
    /// A new pending event with no id yet.
    pub fn new(trigger_type: impl Into<String>, trigger_time: DateTime<Utc>, data: Value) -> Self {
        Self {
            id: EventId::default(),
            trigger_type: trigger_type.into(),
            trigger_time,
            owner: String::new(),
            attempts: 0,
            status: EventStatus::Default,
            data,
            created: Utc::now(),
            updated: None,
            completed: None,
            locked: None,
        }
    }

    /// Trigger time as nanoseconds since the epoch, saturating outside the representable range.
    #[must_use]
    pub fn priority(&self) -> i64 {
        self.trigger_time.timestamp_nanos_opt().unwrap_or_else(|| {
            if self.trigger_time.timestamp() < 0 {
                i64::MIN
            } else {
                i64::MAX
            }
        })
    }

    /// Decode the payload into the handler's own type.
    ///
    /// # Errors
    ///
    /// Returns `SerializationFailed` if the payload does not match `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| Error::serialization_failed(format!("event {}: {e}", self.id)))
    }
}
