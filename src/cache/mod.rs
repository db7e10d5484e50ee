//! Metadata-aware download cache
//!
//! Generated files are keyed by `FileId` and validated against a fingerprint
//! of the metadata they embed. See `service::DownloadCache` for the request
//! path and `evictor::LruEvictor` for size bounding.

pub mod evictor;
pub mod locks;
pub mod service;
pub mod store;

pub use evictor::{EvictionReport, LruEvictor};
pub use locks::{KeyGuard, KeyedLocks};
pub use service::{CacheStats, DownloadCache};
pub use store::{CacheEntry, CacheStore, SweepReport};
