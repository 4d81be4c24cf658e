//! Season Extractor
//!
//! Pulls per-player weekly stats for one season from several independent
//! sources, memoizes raw results on disk, throttles requests per domain and
//! merges everything into one validated dataset.

pub mod cancel;
pub mod client;
pub mod config;
pub mod data;
pub mod error;
pub mod ingester;
pub mod monitor;
pub mod orchestrator;
pub mod storage;
pub mod types;

#[cfg(test)]
mod error_tests;
