//! Song cache store and eviction engine for a streaming music bot.
//!
//! - [`cache`]: song records, locks, eviction and download sessions
//! - [`storage`]: durable JSON table behind [`cache::SongDb`]
//! - [`config`]: environment-driven configuration

pub mod cache;
pub mod config;
pub mod error;
pub mod storage;

pub use error::{Result, SongDbError};
