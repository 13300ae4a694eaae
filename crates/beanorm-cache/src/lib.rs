//! Server cache manager for beanorm.
//!
//! Three independent cache spaces per entity type:
//!
//! - bean cache: [`EntityId`](beanorm_core::EntityId) to immutable [`BeanSnapshot`](beanorm_core::BeanSnapshot)
//! - query cache: [`QueryCacheKey`] to [`QueryResultSnapshot`]
//! - natural-key cache: natural key value to id
//!
//! Each region is a concurrent map with size, idle and ttl limits checked
//! lazily on access. Committed writes invalidate through
//! [`CacheManager::on_commit`].
//!
//! # Design
//!
//! - **No global lock**: regions sit on `DashMap`; only size eviction takes a
//!   short per-region lock on the insertion-order queue, and unbounded
//!   regions skip it entirely.
//! - **Lazy expiry**: idle and ttl limits are checked by the lookup that finds
//!   an entry; [`CacheManager::trim`] is an optional sweep.
//! - **Commit-only invalidation**: nothing here is touched by a transaction
//!   that rolls back.
//! - **Injectable time**: a [`ManualClock`] makes expiry deterministic in tests.
//!
//! # Example
//!
//! ```rust
//! use beanorm_cache::{CacheRegion, ManualClock};
//! use beanorm_core::CachePolicy;
//! use std::time::Duration;
//!
//! let clock = ManualClock::new();
//! let region: CacheRegion<u32, &str> =
//!     CacheRegion::new("customer", CachePolicy::cached().max_ttl(1_000), clock.clone());
//! region.put(7, "ada");
//! assert_eq!(region.get(&7), Some("ada"));
//!
//! clock.advance(Duration::from_secs(2));
//! assert_eq!(region.get(&7), None);
//! assert_eq!(region.stats().evictions, 1);
//! ```

pub mod clock;
pub mod manager;
pub mod region;
pub mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::{CacheManager, EntityCacheStats, NaturalKey, QueryCacheKey, QueryResultSnapshot};
pub use region::CacheRegion;
pub use stats::{CacheStats, CacheStatsSnapshot};
