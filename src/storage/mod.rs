//! Data storage and persistence

pub mod cache;


pub use cache::{CacheMetadata, CacheParams, CacheStats, CacheStore, CacheWarmer, WarmReport};
