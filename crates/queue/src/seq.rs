//! 31-bit wrapping atomic counter.
//!
//! Used for per-cycle `owner_seq` values and for the resettable counters
//! behind every component's stats.

use std::sync::atomic::{AtomicU32, Ordering};

const MASK: u32 = 0x7fff_ffff;

#[derive(Debug, Default)]
pub struct Seq(AtomicU32);

impl Seq {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Increment and return the new value.
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::AcqRel).wrapping_add(1) & MASK
    }

    /// Add `n` and return the new value.
    pub fn add(&self, n: u32) -> u32 {
        self.0.fetch_add(n, Ordering::AcqRel).wrapping_add(n) & MASK
    }

    #[must_use]
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire) & MASK
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    /// Read the current value, zeroing it when `reset` is set.
    pub fn read(&self, reset: bool) -> u32 {
        if reset {
            self.0.swap(0, Ordering::AcqRel) & MASK
        } else {
            self.get()
        }
    }
}
