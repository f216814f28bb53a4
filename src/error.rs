use thiserror::Error;

use crate::cache::{LockId, SongId};

/// Errors returned by the song store, its lock table and the eviction manager.
///
/// The validation variants (`UnknownSong`, `UnknownLock`, `InvalidChunk*`) never
/// leave partial effects behind: the store is exactly as it was before the call.
#[derive(Error, Debug)]
pub enum SongDbError {
    #[error("Song does not exist in song database: {0}")]
    UnknownSong(SongId),

    #[error("Lock does not exist in song database: {0}")]
    UnknownLock(LockId),

    /// The song's chunk data is being deleted; retry once eviction finishes.
    #[error("Song is being evicted from the cache: {0}")]
    Evicting(SongId),

    #[error(
        "Cache exhausted: {requested} bytes requested, {cached} bytes cached of a {budget} byte budget"
    )]
    CacheExhausted {
        requested: u64,
        budget: u64,
        cached: u64,
    },

    #[error("Invalid chunk index: {0}")]
    InvalidChunkIndex(i64),

    #[error("Invalid chunk range: start {start}, end {end}")]
    InvalidChunkRange { start: i64, end: i64 },

    #[error("Song database is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SongDbError>;
