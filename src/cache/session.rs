use std::sync::Arc;
use tracing::{debug, info};

use super::eviction::EvictionManager;
use super::locks::SongLock;
use super::record::{CacheInfo, SongId, NO_CHUNK};
use super::song_db::SongDb;
use crate::error::{Result, SongDbError};

/// One download pass of a song into the cache.
///
/// Holds a [`SongLock`] for its whole lifetime, so the song cannot be evicted
/// while chunks are being written, and the lock is released even if the
/// session is cancelled or fails halfway.
pub struct CacheSession {
    db: Arc<SongDb>,
    eviction: Arc<EvictionManager>,
    lock: SongLock,
    start_chunk: i64,
    next_chunk: i64,
    fresh: bool,
}

impl CacheSession {
    /// Caches the song at `cache_location` and locks it.
    ///
    /// If the already cached range reaches `start_chunk`, the pass resumes after
    /// its last chunk; otherwise a fresh range starting at `start_chunk` replaces it
    /// once the first chunk lands.
    pub fn begin(
        db: Arc<SongDb>,
        eviction: Arc<EvictionManager>,
        id: &SongId,
        cache_location: &str,
        start_chunk: i64,
    ) -> Result<Self> {
        if start_chunk < 0 {
            return Err(SongDbError::InvalidChunkIndex(start_chunk));
        }

        db.cache_song(id, cache_location)?;
        let lock = db.lock_song(id)?;
        let info = db.get_cache_info(id)?;

        let resumes = info.start_chunk != NO_CHUNK
            && info.start_chunk <= start_chunk
            && start_chunk <= info.end_chunk + 1;

        let session = if resumes {
            debug!("▶️ Reanudando {} desde el chunk {}", id, info.end_chunk + 1);
            Self {
                db,
                eviction,
                lock,
                start_chunk: info.start_chunk,
                next_chunk: info.end_chunk + 1,
                fresh: false,
            }
        } else {
            debug!("▶️ Nueva pasada de {} desde el chunk {}", id, start_chunk);
            Self {
                db,
                eviction,
                lock,
                start_chunk,
                next_chunk: start_chunk,
                fresh: true,
            }
        };
        Ok(session)
    }

    pub fn song(&self) -> &SongId {
        self.lock.song()
    }

    pub fn start_chunk(&self) -> i64 {
        self.start_chunk
    }

    /// Index the next appended chunk will get.
    pub fn next_chunk(&self) -> i64 {
        self.next_chunk
    }

    /// Reserves room for `bytes` and records the next contiguous chunk.
    /// Returns the index of the recorded chunk.
    pub async fn append_chunk(&mut self, bytes: u64) -> Result<i64> {
        // Held until the bytes are recorded below
        let _reservation = self.eviction.ensure_space(bytes).await?;

        let id = self.lock.song();
        let index = self.next_chunk;
        if self.fresh {
            self.db.set_chunk_range(id, self.start_chunk, index)?;
            self.db.set_size_bytes(id, bytes)?;
            self.fresh = false;
        } else {
            self.db.extend_cached_range(id, index, bytes)?;
        }

        self.next_chunk += 1;
        Ok(index)
    }

    /// Ends the session, releasing its lock. Returns the final cache state.
    pub fn finish(self) -> Result<CacheInfo> {
        let info = self.db.get_cache_info(self.lock.song())?;
        info!(
            "✅ Sesión terminada para {}: chunks {}..={}, {} bytes",
            self.lock.song(),
            info.start_chunk,
            info.end_chunk,
            info.size_bytes
        );
        self.lock.release()?;
        Ok(info)
    }
}
