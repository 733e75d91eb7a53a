//! Feed ingestion pipeline.
//!
//! Feeds are fetched on a schedule, their entries normalized, checked for
//! duplicates, run through user-defined visibility rules and stored in SQLite.
//!
//! - [`scheduler`] - recurring, bounded dispatch of per-feed cycles
//! - [`pipeline`] - one fetch-to-storage cycle for one feed
//! - [`feed`] - HTTP fetching, format decoding and entry normalization
//! - [`dedup`] - link/title/content duplicate detection
//! - [`filter`] - include/exclude rules
//! - [`storage`] - SQLite persistence and units of work
//! - [`config`] - TOML configuration

pub mod config;
pub mod dedup;
pub mod feed;
pub mod filter;
pub mod pipeline;
pub mod scheduler;
pub mod storage;
pub mod util;
