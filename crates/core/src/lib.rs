//! Core types shared by every kairos crate.
//!
//! Errors are explicit and typed; configuration is plain serde data.

pub mod config;
pub mod error;
pub mod result;

pub use config::{Config, ConsumerConfig, SchedulerConfig, StoreConfig};
pub use error::Error;
pub use result::{Result, ResultExt};
