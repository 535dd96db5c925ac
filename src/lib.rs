#![forbid(unsafe_code)]

//! Public entry point for the newtube metadata cache.
//!
//! The crate keeps a local SQLite copy of YouTube video metadata: records are
//! fetched on a cache miss, bumped on every read, and refreshed either on
//! request or by the daily stale-record batch. The binaries under `src/bin`
//! wire the cache to a JSON API and to cron-style one-shot runs.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod provider;
pub mod scheduler;
pub mod security;
