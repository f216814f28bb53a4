//! # Cache Module
//!
//! Song cache store and eviction engine for the music bot.
//!
//! This module tracks, for every song, how much of its audio has been
//! downloaded to disk, who is currently depending on that data, and enough
//! metadata to show it without asking the origin again. It keeps the total
//! cached bytes under a configured budget by evicting the least valuable
//! songs that nobody holds a lock on.
//!
//! ## Components
//!
//! - **[`RecordStore`]**: in-memory table of [`SongRecord`]s with an
//!   incrementally maintained total of cached bytes
//! - **[`LockTable`]**: reference-counting locks that protect a song from eviction
//! - **[`SongDb`]**: the public operation set; validates every call and persists
//!   the table through [`crate::storage::JsonStorage`]
//! - **[`EvictionManager`]**: consulted before new chunk data is written; hands
//!   out a [`SpaceReservation`] that holds the budget until the write lands
//! - **[`CacheSession`]**: one download pass, holding a lock while it writes
//!
//! ## Concurrency
//!
//! Each record is serialized by its own map entry lock. Eviction marks a record
//! under that lock, deletes the chunk data with the lock released, then
//! finalizes the record, so a slow delete never blocks other songs. A song
//! cannot be locked while it is marked.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use song_cache::cache::{EvictionConfig, EvictionManager, SongDb, SongId};
//! use std::sync::Arc;
//!
//! # async fn example() -> song_cache::Result<()> {
//! let db = Arc::new(SongDb::open("data/songs.json").await?);
//! let eviction = EvictionManager::new(
//!     Arc::clone(&db),
//!     EvictionConfig {
//!         cache_dir: "cache".into(),
//!         cache_size_bytes: 512 << 20,
//!     },
//! );
//!
//! let id = SongId::from_parts("yt", "M1vsdF4VfUo");
//! db.cache_song(&id, "M1vsdF4VfUo")?;
//! let lock = db.lock_song(&id)?;
//!
//! let reservation = eviction.ensure_space(64 * 1024).await?;
//! db.set_chunk_range(&id, 0, 0)?;
//! db.set_size_bytes(&id, reservation.bytes())?;
//! drop(reservation);
//!
//! lock.release()?;
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod eviction;
pub mod locks;
pub mod record;
pub mod session;
pub mod song_db;
pub mod store;

pub use eviction::{
    ChunkStore, EvictionConfig, EvictionManager, EvictionReport, FsChunkStore, SpaceReservation,
};
pub use locks::{LockId, LockTable, SongLock};
pub use record::{CacheInfo, SongId, SongInfo, SongRecord};
pub use session::CacheSession;
pub use song_db::{SongDb, SongDbStats};
pub use store::{EvictionCandidate, RecordStore};
