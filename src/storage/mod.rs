use anyhow::{anyhow, ensure, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::time::Frequency;

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::{InMemoryBucket, InMemoryStorage};
#[cfg(feature = "redis")]
pub use redis::{RedisBucket, RedisStorage};

/// Snapshot of a bucket taken after an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketState {
    pub capacity: usize,
    pub remaining: usize,
    pub reset: DateTime<Utc>,
}

/// Outcome of [`Bucket::add`].
///
/// `Full` means the requested amount did not fit into the current window.
/// The bucket was left untouched and the carried state is the one observed
/// before the rejected decrement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Response {
    Ok(BucketState),
    Full(BucketState),
}

impl Response {
    pub fn state(&self) -> &BucketState {
        match self {
            Response::Ok(state) | Response::Full(state) => state,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Response::Full(_))
    }
}

/// A named fixed-window quota.
///
/// The window refills to `capacity` in one step once `reset` has passed;
/// there is no gradual leak in between.
#[async_trait]
pub trait Bucket: Send + Sync {
    fn capacity(&self) -> usize;

    /// Quota left in the current window, as last observed.
    fn remaining(&self) -> usize;

    /// When the current window ends, as last observed.
    fn reset(&self) -> DateTime<Utc>;

    fn state(&self) -> BucketState {
        BucketState {
            capacity: self.capacity(),
            remaining: self.remaining(),
            reset: self.reset(),
        }
    }

    /// Tries to consume `amount` units from the current window.
    async fn add(&self, amount: usize) -> Result<Response>;
}

/// Factory handing out buckets by name.
///
/// Buckets are created on first reference. Later calls for the same name
/// return the existing bucket and do not re-apply `capacity` or `rate`.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create(&self, name: &str, capacity: usize, rate: Duration)
        -> Result<Box<dyn Bucket>>;

    async fn create_with_frequency(
        &self,
        name: &str,
        frequency: &Frequency,
    ) -> Result<Box<dyn Bucket>> {
        self.create(name, frequency.amount, (&frequency.interval).into())
            .await
    }
}

pub(crate) fn validate_rate(name: &str, rate: Duration) -> Result<()> {
    ensure!(
        rate.num_milliseconds() > 0,
        "Window for bucket {} must be at least one millisecond, got {}",
        name,
        rate
    );
    ensure!(
        Utc::now()
            .checked_add_signed(rate)
            .and_then(|end| end.checked_add_signed(rate))
            .is_some(),
        "Window for bucket {} is too large: {}",
        name,
        rate
    );
    Ok(())
}

/// End of a window of length `rate` starting at `start`.
pub(crate) fn window_end(start: DateTime<Utc>, rate: Duration) -> Result<DateTime<Utc>> {
    start
        .checked_add_signed(rate)
        .ok_or_else(|| anyhow!("Window of {} starting at {} is out of range", rate, start))
}
