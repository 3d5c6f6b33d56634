//! Fixed-window quota buckets with interchangeable storage.
//!
//! A bucket holds `capacity` units per window. [`Bucket::add`] either takes
//! units out of the current window or reports [`Response::Full`] without
//! touching it. Once the window has passed, the bucket refills in one step.
//!
//! [`InMemoryStorage`] keeps buckets in process memory. `RedisStorage`
//! (feature `redis`) projects them onto Redis counters so several processes
//! share the same quota.
//!
//! # Example usage
//!
//! ```
//! use chrono::Duration;
//! use quota_bucket::{Bucket, InMemoryStorage, Response, Storage};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! essentials::install();
//! let storage = InMemoryStorage::new();
//! let bucket = storage.create("api", 10, Duration::seconds(1)).await?;
//! match bucket.add(4).await? {
//!     Response::Ok(state) => assert_eq!(state.remaining, 6),
//!     Response::Full(state) => println!("retry at {}", state.reset),
//! }
//! assert!(bucket.add(7).await?.is_full());
//! assert_eq!(bucket.remaining(), 6);
//! # Ok(())
//! # }
//! ```
mod storage;
pub mod time;

pub use storage::{Bucket, BucketState, InMemoryBucket, InMemoryStorage, Response, Storage};
#[cfg(feature = "redis")]
pub use storage::{RedisBucket, RedisStorage};
