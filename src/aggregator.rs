//! Shared change counter
//!
//! The only way to touch the bounded counter is through [`ChangeAggregator::record`]
//! and [`ChangeAggregator::snapshot`]; both hold the lock just long enough to
//! update or copy out entries.

use std::sync::{Mutex, MutexGuard};

use crate::counter::BoundedKeyCounter;
use crate::error::{Result, TrimError};

#[derive(Debug)]
pub struct ChangeAggregator {
    counter: Mutex<BoundedKeyCounter<String>>,
}

impl ChangeAggregator {
    pub fn new(capacity: usize) -> Result<Self> {
        let counter = BoundedKeyCounter::new(capacity).ok_or_else(|| {
            TrimError::InvalidConfig("counter_size must be positive".to_string())
        })?;
        Ok(Self {
            counter: Mutex::new(counter),
        })
    }

    /// Count one change for `bucket`.
    pub fn record(&self, bucket: &str) {
        self.lock().insert(bucket.to_string());
    }

    /// Copy out the `n` hottest buckets, highest count first.
    pub fn snapshot(&self, n: usize) -> Vec<(String, i32)> {
        self.lock().get_highest(n)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    // A producer that panicked mid-insert leaves the map consistent, so keep
    // serving rather than poisoning every later caller.
    fn lock(&self) -> MutexGuard<'_, BoundedKeyCounter<String>> {
        self.counter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
