use num_format::{Locale, ToFormattedString};
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::locks::{LockId, LockTable, SongLock};
use super::record::{valid_chunk_index, valid_chunk_range, CacheInfo, SongId, SongInfo, NO_CHUNK};
use super::store::{EvictionCandidate, RecordStore};
use crate::error::{Result, SongDbError};
use crate::storage::{JsonStorage, SongTable};

/// Song cache database: the single entry point for song records and locks.
///
/// Every operation on a record runs under that record's lock, so lock changes,
/// setters and eviction bookkeeping never interleave on the same song. None of
/// the record operations touch the disk; durability comes from [`SongDb::flush`],
/// the maintenance task and [`SongDb::close`].
#[derive(Debug)]
pub struct SongDb {
    store: RecordStore,
    locks: LockTable,
    storage: JsonStorage,
    closed: AtomicBool,
    flush_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl SongDb {
    /// Opens (or creates) the song table stored at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let storage = JsonStorage::new(path).await?;
        let table = storage.load().await?;
        let store = RecordStore::from_records(table.songs);
        let locks = LockTable::restore(&store, table.locks, table.next_lock);

        info!(
            "🗄️ Song DB abierta: {} canciones, {} locks, {} bytes en caché",
            store.len(),
            locks.active_locks(),
            store.total_size_bytes().to_formatted_string(&Locale::en)
        );

        Ok(Self {
            store,
            locks,
            storage,
            closed: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            maintenance: Mutex::new(None),
        })
    }

    // Cache state

    /// Marks the song cached at `cache_location`, creating its record on first use.
    /// Recorded progress (chunk range, size, playbacks) is kept on re-cache.
    pub fn cache_song(&self, id: &SongId, cache_location: &str) -> Result<()> {
        self.ensure_open()?;
        self.store.cache_song(id, cache_location);
        debug!("📥 Canción cacheada: {} en {}", id, cache_location);
        Ok(())
    }

    /// Clears the `cached` flag. Location and numeric fields are preserved.
    pub fn uncache_song(&self, id: &SongId) -> Result<()> {
        self.ensure_open()?;
        self.store.update(id, |record| record.cached = false)?;
        debug!("📤 Canción descacheada: {}", id);
        Ok(())
    }

    pub fn get_cache_info(&self, id: &SongId) -> Result<CacheInfo> {
        self.ensure_open()?;
        self.store.read(id, |record| record.cache_info())
    }

    pub fn set_start_chunk(&self, id: &SongId, start_chunk: i64) -> Result<()> {
        self.ensure_open()?;
        if !valid_chunk_index(start_chunk) {
            return Err(SongDbError::InvalidChunkIndex(start_chunk));
        }
        self.store.update(id, |record| {
            record.start_chunk = start_chunk;
            record.touch();
        })
    }

    pub fn set_end_chunk(&self, id: &SongId, end_chunk: i64) -> Result<()> {
        self.ensure_open()?;
        if !valid_chunk_index(end_chunk) {
            return Err(SongDbError::InvalidChunkIndex(end_chunk));
        }
        self.store.update(id, |record| {
            record.end_chunk = end_chunk;
            record.touch();
        })
    }

    /// Sets both bounds of the cached range at once.
    pub fn set_chunk_range(&self, id: &SongId, start_chunk: i64, end_chunk: i64) -> Result<()> {
        self.ensure_open()?;
        if !valid_chunk_range(start_chunk, end_chunk) {
            return Err(SongDbError::InvalidChunkRange {
                start: start_chunk,
                end: end_chunk,
            });
        }
        self.store.update(id, |record| {
            record.start_chunk = start_chunk;
            record.end_chunk = end_chunk;
            record.touch();
        })
    }

    pub fn set_size_bytes(&self, id: &SongId, size_bytes: u64) -> Result<()> {
        self.ensure_open()?;
        self.store.update(id, |record| {
            record.size_bytes = size_bytes;
            record.touch();
        })
    }

    /// Moves `end_chunk` forward and adds `added_bytes` to `size_bytes` in one step.
    /// Fails with `InvalidChunkRange` if no range has been started.
    pub fn extend_cached_range(&self, id: &SongId, end_chunk: i64, added_bytes: u64) -> Result<()> {
        self.ensure_open()?;
        self.store.try_update(id, |record| {
            if record.start_chunk == NO_CHUNK || !valid_chunk_range(record.start_chunk, end_chunk) {
                return Err(SongDbError::InvalidChunkRange {
                    start: record.start_chunk,
                    end: end_chunk,
                });
            }
            record.end_chunk = end_chunk;
            record.size_bytes += added_bytes;
            record.touch();
            Ok(())
        })
    }

    /// Adds one playback and returns the new count.
    pub fn increment_playbacks(&self, id: &SongId) -> Result<u64> {
        self.ensure_open()?;
        self.store.update(id, |record| {
            record.playbacks += 1;
            record.touch();
            record.playbacks
        })
    }

    // Metadata

    pub fn get_song_info(&self, id: &SongId) -> Result<SongInfo> {
        self.ensure_open()?;
        self.store.read(id, |record| record.song_info())
    }

    pub fn set_link(&self, id: &SongId, link: &str) -> Result<()> {
        self.ensure_open()?;
        self.store.update(id, |record| record.link = link.to_string())
    }

    pub fn set_thumbnail_url(&self, id: &SongId, thumbnail_url: &str) -> Result<()> {
        self.ensure_open()?;
        self.store
            .update(id, |record| record.thumbnail_url = thumbnail_url.to_string())
    }

    pub fn set_title(&self, id: &SongId, title: &str) -> Result<()> {
        self.ensure_open()?;
        self.store.update(id, |record| record.title = title.to_string())
    }

    pub fn set_artist(&self, id: &SongId, artist: &str) -> Result<()> {
        self.ensure_open()?;
        self.store.update(id, |record| record.artist = artist.to_string())
    }

    /// Duration in seconds; `-1` for unknown or live.
    pub fn set_duration(&self, id: &SongId, duration: i64) -> Result<()> {
        self.ensure_open()?;
        self.store.update(id, |record| record.duration = duration)
    }

    // Locks

    pub fn add_lock(&self, id: &SongId) -> Result<LockId> {
        self.ensure_open()?;
        self.locks.add_lock(&self.store, id)
    }

    pub fn remove_lock(&self, lock: LockId) -> Result<()> {
        self.ensure_open()?;
        self.locks.remove_lock(&self.store, lock).map(|_| ())
    }

    /// `true` while at least one lock references the song. Unknown songs are unlocked.
    pub fn is_locked(&self, id: &SongId) -> bool {
        self.store.is_locked(id)
    }

    /// Adds a lock that is removed when the returned guard is dropped.
    /// Fails with `Evicting` while the song's chunk data is being deleted.
    pub fn lock_song(self: &Arc<Self>, id: &SongId) -> Result<SongLock> {
        let lock = self.add_lock(id)?;
        Ok(SongLock::new(Arc::clone(self), id.clone(), lock))
    }

    // Accounting

    /// Bytes held by cached songs, maintained incrementally.
    pub fn total_size_bytes(&self) -> u64 {
        self.store.total_size_bytes()
    }

    /// Full-scan consistency check of [`SongDb::total_size_bytes`]; returns the drift corrected.
    pub fn verify_total_size(&self) -> i64 {
        self.store.verify_total_size()
    }

    pub fn stats(&self) -> SongDbStats {
        SongDbStats {
            songs: self.store.len(),
            cached_songs: self.store.cached_songs(),
            locked_songs: self.store.locked_songs(),
            active_locks: self.locks.active_locks(),
            total_size_bytes: self.store.total_size_bytes(),
        }
    }

    // Eviction hooks

    pub(crate) fn eviction_candidates(&self) -> Result<Vec<EvictionCandidate>> {
        self.ensure_open()?;
        Ok(self.store.eviction_candidates())
    }

    pub(crate) fn begin_eviction(&self, id: &SongId) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self.store.begin_eviction(id))
    }

    pub(crate) fn abort_eviction(&self, id: &SongId) {
        self.store.abort_eviction(id);
    }

    pub(crate) fn finish_eviction(&self, id: &SongId) -> Result<u64> {
        self.store.finish_eviction(id)
    }

    // Durability

    /// Writes the table to disk if anything changed since the last flush.
    pub async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.flush_inner().await
    }

    /// Starts the background task that flushes every `flush_every` and checks
    /// the size aggregate every `check_every`. Stopped by [`SongDb::close`].
    pub fn spawn_maintenance(self: &Arc<Self>, flush_every: Duration, check_every: Duration) {
        let db = Arc::clone(self);
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut flush_tick = interval(flush_every);
            let mut check_tick = interval(check_every);
            flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            check_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // el primer tick es inmediato
            check_tick.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = flush_tick.tick() => {
                        if let Err(e) = db.flush_inner().await {
                            error!("❌ Error guardando la tabla de canciones: {}", e);
                        }
                    }
                    _ = check_tick.tick() => {
                        db.verify_total_size();
                    }
                }
            }
            debug!("Tarea de mantenimiento detenida");
        });

        if let Some(previous) = self.maintenance.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Flushes pending state and releases the instance. Later operations fail with `Closed`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.cancel();
        let handle = self.maintenance.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("❌ La tarea de mantenimiento terminó con error: {}", e);
            }
        }

        // Forzar escritura final aunque no haya cambios pendientes
        self.store.mark_dirty();
        self.flush_inner().await?;
        info!("🔒 Song DB cerrada ({} canciones)", self.store.len());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn flush_inner(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        if !self.store.take_dirty() {
            return Ok(());
        }

        let (locks, next_lock) = self.locks.snapshot();
        let table = SongTable {
            songs: self.store.snapshot(),
            locks,
            next_lock,
        };
        if let Err(e) = self.storage.save(&table).await {
            self.store.mark_dirty();
            return Err(e);
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(SongDbError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Snapshot of table and lock counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SongDbStats {
    pub songs: usize,
    pub cached_songs: usize,
    pub locked_songs: usize,
    pub active_locks: usize,
    pub total_size_bytes: u64,
}

impl fmt::Display for SongDbStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "🎵 Song DB Stats:\n\
             📝 Songs: {} ({} cached)\n\
             🔒 Locks: {} on {} songs\n\
             📦 Cached Size: {} bytes ({:.2} MiB)",
            self.songs,
            self.cached_songs,
            self.active_locks,
            self.locked_songs,
            self.total_size_bytes.to_formatted_string(&Locale::en),
            self.total_size_bytes as f64 / (1u64 << 20) as f64
        )
    }
}
