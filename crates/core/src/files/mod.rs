//! File delivery: remote links, proxied streams, or a bounded local cache.

pub mod cache;
pub mod delivery;
pub mod store;

pub use cache::{CacheEntry, CacheKey, CacheLimits, CacheState, FileCache};
pub use delivery::{Delivery, FileDelivery};
pub use store::{sanitize_filename, sanitize_id, LocalStore};
