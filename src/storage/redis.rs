use anyhow::{Context, Result};
use async_trait::async_trait;
use bb8_redis::{
    bb8::{Pool, PooledConnection},
    redis, RedisConnectionManager,
};
use chrono::{DateTime, Duration, Utc};
use essentials::{debug, warn};
use std::sync::{Arc, Mutex, PoisonError};

use super::{validate_rate, window_end, Bucket, BucketState, Response, Storage};

const POOL_SIZE: u32 = 5;

type Connection<'a> = PooledConnection<'a, RedisConnectionManager>;

/// Buckets projected onto Redis counters.
///
/// Each bucket is a single integer key holding the amount consumed in the
/// current window. The key expires when the window ends.
#[derive(Clone)]
pub struct RedisStorage {
    pool: Pool<RedisConnectionManager>,
}

impl RedisStorage {
    pub fn new(pool: Pool<RedisConnectionManager>) -> Self {
        Self { pool }
    }

    /// Builds a pool for `url` and checks that the server answers.
    pub async fn connect(url: &str) -> Result<Self> {
        let manager = RedisConnectionManager::new(url)
            .with_context(|| format!("Invalid Redis url: {}", url))?;
        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .build(manager)
            .await
            .with_context(|| format!("Failed to build Redis pool for: {}", url))?;
        let storage = Self::new(pool);
        storage.ping().await?;
        Ok(storage)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get connection from Redis pool")?;
        redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map(|_: String| ())
            .context("Redis did not answer PING")
    }

    /// Concrete handle for `name`, attached to the counter if one exists.
    pub async fn bucket(&self, name: &str, capacity: usize, rate: Duration) -> Result<RedisBucket> {
        validate_rate(name, rate)?;
        let now = Utc::now();
        let mut conn = self.pool.get().await.with_context(|| {
            format!("Failed to get connection from Redis pool for key: {}", name)
        })?;
        let (count, ttl): (Option<i64>, i64) = redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(name)
            .cmd("PTTL")
            .arg(name)
            .query_async(&mut *conn)
            .await
            .with_context(|| format!("Failed to read bucket for key: {}", name))?;
        let bucket = RedisBucket {
            name: name.into(),
            capacity,
            rate,
            pool: self.pool.clone(),
            cache: Arc::new(Mutex::new(Cached {
                remaining: capacity,
                reset: window_end(now, rate)?,
            })),
        };
        match count {
            Some(count) => {
                let reset = bucket.reconcile(&mut conn, ttl, now).await?;
                bucket.store(bucket.project(count), reset);
                debug!(key = name, count, ttl, "Attached to existing bucket");
            }
            None => debug!(key = name, capacity, "Creating bucket"),
        }
        Ok(bucket)
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn create(
        &self,
        name: &str,
        capacity: usize,
        rate: Duration,
    ) -> Result<Box<dyn Bucket>> {
        Ok(Box::new(self.bucket(name, capacity, rate).await?))
    }
}

#[derive(Debug)]
struct Cached {
    remaining: usize,
    reset: DateTime<Utc>,
}

/// Handle to a bucket whose state lives in Redis.
///
/// The handle only caches what the last operation observed; every
/// [`Bucket::add`] re-reads the counter.
#[derive(Clone)]
pub struct RedisBucket {
    name: Arc<str>,
    capacity: usize,
    rate: Duration,
    pool: Pool<RedisConnectionManager>,
    cache: Arc<Mutex<Cached>>,
}

impl RedisBucket {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn expiry(&self) -> i64 {
        self.rate.num_milliseconds()
    }

    fn project(&self, count: i64) -> usize {
        let consumed = usize::try_from(count).unwrap_or(0);
        self.capacity - consumed.min(self.capacity)
    }

    fn store(&self, remaining: usize, reset: DateTime<Utc>) -> BucketState {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.remaining = remaining;
        cache.reset = reset;
        BucketState {
            capacity: self.capacity,
            remaining,
            reset,
        }
    }

    /// Turns a `PTTL` reply into the end of the current window.
    ///
    /// `-1` means the key lost its expiry, which would keep the window open
    /// forever, so the expiry is restored here.
    async fn reconcile(
        &self,
        conn: &mut Connection<'_>,
        ttl: i64,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        match ttl {
            -1 => {
                warn!(key = self.name(), "Bucket key has no expiry, restoring it");
                redis::cmd("PEXPIRE")
                    .arg(self.name())
                    .arg(self.expiry())
                    .query_async(&mut **conn)
                    .await
                    .map(|_: i64| ())
                    .with_context(|| format!("Failed to set expiry for key: {}", self.name))?;
                window_end(now, self.rate)
            }
            ttl if ttl < 0 => Ok(now),
            ttl => window_end(now, Duration::milliseconds(ttl)),
        }
    }

    async fn reconcile_stale_reset(
        &self,
        conn: &mut Connection<'_>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let reset = self.reset();
        if reset > now {
            return Ok(reset);
        }
        let ttl: i64 = redis::cmd("PTTL")
            .arg(self.name())
            .query_async(&mut **conn)
            .await
            .with_context(|| format!("Failed to read expiry for key: {}", self.name))?;
        self.reconcile(conn, ttl, now).await
    }
}

#[async_trait]
impl Bucket for RedisBucket {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn remaining(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remaining
    }

    fn reset(&self) -> DateTime<Utc> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).reset
    }

    async fn add(&self, amount: usize) -> Result<Response> {
        let mut conn = self.pool.get().await.with_context(|| {
            format!("Failed to get connection from Redis pool for key: {}", self.name)
        })?;
        let now = Utc::now();
        let count: Option<i64> = redis::cmd("GET")
            .arg(self.name())
            .query_async(&mut *conn)
            .await
            .with_context(|| format!("Failed to read counter for key: {}", self.name))?;
        let remaining = count.map_or(self.capacity, |count| self.project(count));
        if amount > remaining {
            let reset = self.reconcile_stale_reset(&mut conn, now).await?;
            debug!(key = self.name(), amount, remaining, "Bucket is full");
            return Ok(Response::Full(self.store(remaining, reset)));
        }
        // The key is created together with its expiry, so it cannot outlive the window.
        let (count, ttl): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.name())
            .arg(0)
            .arg("PX")
            .arg(self.expiry())
            .arg("NX")
            .ignore()
            .cmd("INCRBY")
            .arg(self.name())
            .arg(amount)
            .cmd("PTTL")
            .arg(self.name())
            .query_async(&mut *conn)
            .await
            .with_context(|| format!("Failed to increment counter for key: {}", self.name))?;
        let reset = self.reconcile(&mut conn, ttl, now).await?;
        Ok(Response::Ok(self.store(self.project(count), reset)))
    }
}
