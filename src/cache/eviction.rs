use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::record::SongId;
use super::song_db::SongDb;
use crate::error::{Result, SongDbError};

/// Where chunk files live and how many bytes they may take in total.
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Relative cache locations are resolved against this directory
    pub cache_dir: PathBuf,
    pub cache_size_bytes: u64,
}

/// Removal of a song's chunk data from disk.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Removes the file or directory at `location`. Missing data is not an error.
    async fn remove(&self, location: &Path) -> io::Result<()>;
}

/// [`ChunkStore`] backed by the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsChunkStore;

#[async_trait]
impl ChunkStore for FsChunkStore {
    async fn remove(&self, location: &Path) -> io::Result<()> {
        match fs::metadata(location).await {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(location).await,
            Ok(_) => fs::remove_file(location).await,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Songs evicted by one [`EvictionManager::ensure_space`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: Vec<SongId>,
    pub freed_bytes: u64,
}

/// Budget held for an approved write that has not landed in the store yet.
///
/// Counts against the budget until dropped. Drop it once the written bytes
/// are recorded with `set_size_bytes` or `extend_cached_range`, or when the
/// write is abandoned.
#[derive(Debug)]
pub struct SpaceReservation {
    reserved: Arc<AtomicU64>,
    bytes: u64,
    report: EvictionReport,
}

impl SpaceReservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// What was evicted to make room.
    pub fn report(&self) -> &EvictionReport {
        &self.report
    }
}

impl Drop for SpaceReservation {
    fn drop(&mut self) {
        self.reserved.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

/// Keeps the cached bytes of all songs under the configured budget.
///
/// Consulted before new chunk data is written. When the write would exceed the
/// budget, unlocked cached songs are evicted in order of ascending value (fewest
/// playbacks, then least recently used) until it fits.
pub struct EvictionManager {
    db: Arc<SongDb>,
    config: EvictionConfig,
    chunks: Arc<dyn ChunkStore>,
    // Bytes aprobados que todavía no están en el store
    reserved: Arc<AtomicU64>,
    // Una sola pasada de desalojo a la vez
    running: Mutex<()>,
}

impl EvictionManager {
    pub fn new(db: Arc<SongDb>, config: EvictionConfig) -> Self {
        Self::with_chunk_store(db, config, Arc::new(FsChunkStore))
    }

    pub fn with_chunk_store(
        db: Arc<SongDb>,
        config: EvictionConfig,
        chunks: Arc<dyn ChunkStore>,
    ) -> Self {
        Self {
            db,
            config,
            chunks,
            reserved: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(()),
        }
    }

    pub fn budget(&self) -> u64 {
        self.config.cache_size_bytes
    }

    /// Bytes approved by [`EvictionManager::ensure_space`] whose reservation is still alive.
    pub fn reserved_bytes(&self) -> u64 {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Approves `incoming_bytes` of new chunk data, evicting songs if needed,
    /// and reserves them until the returned [`SpaceReservation`] is dropped.
    ///
    /// Fails with `CacheExhausted`, before evicting anything, when even evicting
    /// every unlocked song would not make room. Locked songs are never touched.
    pub async fn ensure_space(&self, incoming_bytes: u64) -> Result<SpaceReservation> {
        let _running = self.running.lock().await;
        let report = self.make_room(incoming_bytes).await?;

        self.reserved.fetch_add(incoming_bytes, Ordering::SeqCst);
        Ok(SpaceReservation {
            reserved: Arc::clone(&self.reserved),
            bytes: incoming_bytes,
            report,
        })
    }

    async fn make_room(&self, incoming_bytes: u64) -> Result<EvictionReport> {
        let mut report = EvictionReport::default();
        if self.fits(incoming_bytes) {
            return Ok(report);
        }

        let candidates = self.db.eviction_candidates()?;
        let reclaimable: u64 = candidates.iter().map(|c| c.size_bytes).sum();
        let floor = self
            .committed()
            .saturating_sub(reclaimable)
            .saturating_add(incoming_bytes);
        if floor > self.budget() {
            return Err(self.exhausted(incoming_bytes));
        }

        for candidate in candidates {
            if self.fits(incoming_bytes) {
                break;
            }

            // Marcar y soltar el registro antes de tocar el disco
            let Some(location) = self.db.begin_eviction(&candidate.id)? else {
                debug!("Candidato {} ya no es desalojable", candidate.id);
                continue;
            };

            let path = self.resolve(&location);
            if let Err(e) = self.chunks.remove(&path).await {
                self.db.abort_eviction(&candidate.id);
                error!("❌ Error borrando {} de {}: {}", path.display(), candidate.id, e);
                return Err(e.into());
            }

            let freed = self.db.finish_eviction(&candidate.id)?;
            info!(
                "🗑️ Canción desalojada: {} ({} bytes, {} reproducciones)",
                candidate.id, freed, candidate.playbacks
            );
            report.freed_bytes += freed;
            report.evicted.push(candidate.id);
        }

        if self.fits(incoming_bytes) {
            Ok(report)
        } else {
            Err(self.exhausted(incoming_bytes))
        }
    }

    /// Absolute path of a song's chunk data.
    pub fn resolve(&self, cache_location: &str) -> PathBuf {
        let location = Path::new(cache_location);
        if location.is_absolute() {
            location.to_path_buf()
        } else {
            self.config.cache_dir.join(location)
        }
    }

    /// Cached bytes plus outstanding reservations.
    fn committed(&self) -> u64 {
        self.db
            .total_size_bytes()
            .saturating_add(self.reserved_bytes())
    }

    fn fits(&self, incoming_bytes: u64) -> bool {
        self.committed()
            .checked_add(incoming_bytes)
            .is_some_and(|projected| projected <= self.budget())
    }

    fn exhausted(&self, incoming_bytes: u64) -> SongDbError {
        let cached = self.db.total_size_bytes();
        warn!(
            "⚠️ Caché agotada: se piden {} bytes con {} de {} en uso ({} reservados)",
            incoming_bytes,
            cached,
            self.budget(),
            self.reserved_bytes()
        );
        SongDbError::CacheExhausted {
            requested: incoming_bytes,
            budget: self.budget(),
            cached,
        }
    }
}
