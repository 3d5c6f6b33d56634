use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use essentials::{debug, warn};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use super::{validate_rate, window_end, Bucket, BucketState, Response, Storage};

/// How long a bucket may sit untouched before [`InMemoryStorage::clean`] drops it.
const IDLE_RETENTION_SECS: i64 = 3600;

#[derive(Debug)]
struct Window {
    remaining: usize,
    reset: DateTime<Utc>,
    updated: DateTime<Utc>,
}

/// Bucket living entirely in process memory.
///
/// Clones share the same window.
#[derive(Clone, Debug)]
pub struct InMemoryBucket {
    capacity: usize,
    rate: Duration,
    window: Arc<Mutex<Window>>,
}

impl InMemoryBucket {
    fn new(capacity: usize, rate: Duration, now: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            capacity,
            rate,
            window: Arc::new(Mutex::new(Window {
                remaining: capacity,
                reset: window_end(now, rate)?,
                updated: now,
            })),
        })
    }

    // Every mutation leaves the window consistent, so a poisoned lock is still usable.
    fn window(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn rate(&self) -> Duration {
        self.rate
    }

    /// Same as [`Bucket::add`] but evaluated at `at` instead of the wall clock.
    ///
    /// A timestamp belonging to a window older than the current one moves
    /// the window to start at `at`. The remaining balance is kept.
    pub fn add_at(&self, amount: usize, at: DateTime<Utc>) -> Result<Response> {
        let mut window = self.window();
        window.updated = Utc::now();
        if at >= window.reset {
            window.reset = window_end(at, self.rate)?;
            window.remaining = self.capacity;
        }
        let start = window
            .reset
            .checked_sub_signed(self.rate)
            .ok_or_else(|| anyhow!("Window ending at {} is out of range", window.reset))?;
        if at < start {
            window.reset = window_end(at, self.rate)?;
        }
        let state = |window: &Window| BucketState {
            capacity: self.capacity,
            remaining: window.remaining,
            reset: window.reset,
        };
        if amount > window.remaining {
            debug!(
                amount,
                remaining = window.remaining,
                "Rejected in-memory bucket add"
            );
            return Ok(Response::Full(state(&*window)));
        }
        window.remaining -= amount;
        Ok(Response::Ok(state(&*window)))
    }

    fn idle_since(&self, threshold: DateTime<Utc>) -> bool {
        self.window().updated < threshold
    }
}

#[async_trait]
impl Bucket for InMemoryBucket {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn remaining(&self) -> usize {
        self.window().remaining
    }

    fn reset(&self) -> DateTime<Utc> {
        self.window().reset
    }

    async fn add(&self, amount: usize) -> Result<Response> {
        self.add_at(amount, Utc::now())
    }
}

/// Process-local bucket table.
///
/// Clones share the same table. Nothing is removed automatically; call
/// [`InMemoryStorage::clean`] periodically to drop idle buckets.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStorage {
    buckets: Arc<Mutex<HashMap<String, InMemoryBucket>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn buckets(&self) -> Result<MutexGuard<'_, HashMap<String, InMemoryBucket>>> {
        self.buckets
            .lock()
            .map_err(|_| anyhow!("Failed to acquire lock for in-memory buckets"))
    }

    /// Concrete handle for `name`, created on first reference.
    ///
    /// [`Storage::create`] returns the same bucket behind `dyn Bucket`; this
    /// one also exposes [`InMemoryBucket::add_at`].
    pub fn bucket(&self, name: &str, capacity: usize, rate: Duration) -> Result<InMemoryBucket> {
        validate_rate(name, rate)?;
        let mut buckets = self.buckets()?;
        if let Some(bucket) = buckets.get(name) {
            if bucket.capacity != capacity || bucket.rate != rate {
                warn!(
                    bucket = name,
                    capacity = bucket.capacity,
                    requested_capacity = capacity,
                    rate = %bucket.rate,
                    requested_rate = %rate,
                    "Bucket already exists, keeping its current capacity and window"
                );
            }
            return Ok(bucket.clone());
        }
        debug!(bucket = name, capacity, "Creating in-memory bucket");
        let bucket = InMemoryBucket::new(capacity, rate, Utc::now())?;
        buckets.insert(name.to_string(), bucket.clone());
        Ok(bucket)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.buckets()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.buckets()?.is_empty())
    }

    /// Drops every bucket that has not been touched within the last hour.
    /// Returns the number of evicted buckets.
    pub fn clean(&self) -> Result<usize> {
        self.clean_at(Utc::now())
    }

    pub fn clean_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let threshold = now
            .checked_sub_signed(Duration::seconds(IDLE_RETENTION_SECS))
            .ok_or_else(|| anyhow!("Idle threshold before {} is out of range", now))?;
        let mut buckets = self.buckets()?;
        let before = buckets.len();
        buckets.retain(|_, bucket| !bucket.idle_since(threshold));
        let evicted = before - buckets.len();
        if evicted > 0 {
            debug!(evicted, "Evicted idle in-memory buckets");
        }
        Ok(evicted)
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create(
        &self,
        name: &str,
        capacity: usize,
        rate: Duration,
    ) -> Result<Box<dyn Bucket>> {
        Ok(Box::new(self.bucket(name, capacity, rate)?))
    }
}
