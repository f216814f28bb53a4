use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry as MapEntry, DashMap};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

use super::record::{SongId, SongRecord, NO_CHUNK};
use crate::error::{Result, SongDbError};

/// Estado en memoria de una canción. Solo `record` se guarda tal cual; `locks` se
/// reconstruye desde la tabla de locks al abrir.
#[derive(Debug)]
struct Entry {
    record: SongRecord,
    locks: usize,
    evicting: bool,
}

impl Entry {
    fn new(record: SongRecord) -> Self {
        Self {
            record,
            locks: 0,
            evicting: false,
        }
    }
}

/// Song eligible for eviction, as seen when candidates were ranked.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionCandidate {
    pub id: SongId,
    pub playbacks: u64,
    pub last_used: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Durable table of song records.
///
/// Each entry is guarded by its `DashMap` shard lock, so every mutation of a
/// record (lock count included) is serialized with every other mutation of the
/// same record. The aggregate of cached bytes is kept incrementally.
#[derive(Debug, Default)]
pub struct RecordStore {
    entries: DashMap<SongId, Entry>,
    total_size_bytes: AtomicU64,
    /// Bumped on every change to the aggregate; lets the consistency scan detect races.
    accounting_epoch: AtomicU64,
    dirty: AtomicBool,
}

impl RecordStore {
    pub fn from_records(records: BTreeMap<SongId, SongRecord>) -> Self {
        let store = Self::default();
        let mut total = 0u64;
        for (id, record) in records {
            total += record.accounted_bytes();
            store.entries.insert(id, Entry::new(record));
        }
        store.total_size_bytes.store(total, Ordering::SeqCst);
        store
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &SongId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.total_size_bytes.load(Ordering::SeqCst)
    }

    /// Creates the record or marks it cached again at `cache_location`.
    /// Chunk range, size and playbacks of an existing record are left alone.
    pub fn cache_song(&self, id: &SongId, cache_location: &str) {
        match self.entries.entry(id.clone()) {
            MapEntry::Occupied(mut occupied) => {
                let record = &mut occupied.get_mut().record;
                let before = record.accounted_bytes();
                record.cached = true;
                record.cache_location = cache_location.to_string();
                record.touch();
                self.adjust_total(before, record.accounted_bytes());
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(SongRecord::new_cached(cache_location)));
            }
        }
        self.mark_dirty();
    }

    /// Reads the record; `UnknownSong` if absent.
    pub fn read<T>(&self, id: &SongId, f: impl FnOnce(&SongRecord) -> T) -> Result<T> {
        self.entries
            .get(id)
            .map(|entry| f(&entry.record))
            .ok_or_else(|| SongDbError::UnknownSong(id.clone()))
    }

    /// Mutates the record under its entry lock and keeps the aggregate in step.
    pub fn update<T>(&self, id: &SongId, f: impl FnOnce(&mut SongRecord) -> T) -> Result<T> {
        self.try_update(id, |record| Ok(f(record)))
    }

    /// Like [`RecordStore::update`], but `f` may reject the current record.
    /// The check and the write happen under the same entry lock; on `Err` the
    /// record must be left untouched.
    pub fn try_update<T>(
        &self,
        id: &SongId,
        f: impl FnOnce(&mut SongRecord) -> Result<T>,
    ) -> Result<T> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SongDbError::UnknownSong(id.clone()))?;
        let before = entry.record.accounted_bytes();
        let out = f(&mut entry.record)?;
        self.adjust_total(before, entry.record.accounted_bytes());
        drop(entry);

        self.mark_dirty();
        Ok(out)
    }

    /// Counts one more lock on the song. Refused while its chunk data is being
    /// deleted, so nobody starts depending on bytes that are going away.
    pub fn acquire_lock(&self, id: &SongId) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SongDbError::UnknownSong(id.clone()))?;
        if entry.evicting {
            return Err(SongDbError::Evicting(id.clone()));
        }
        entry.locks += 1;
        entry.record.touch();
        drop(entry);

        self.mark_dirty();
        Ok(())
    }

    pub fn release_lock(&self, id: &SongId) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.locks = entry.locks.saturating_sub(1);
        }
        self.mark_dirty();
    }

    /// Counts a lock loaded from disk. `false` if the song has no record.
    pub(crate) fn restore_lock(&self, id: &SongId) -> bool {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.locks += 1;
                true
            }
            None => false,
        }
    }

    /// `false` for songs that were never cached.
    pub fn is_locked(&self, id: &SongId) -> bool {
        self.entries.get(id).is_some_and(|entry| entry.locks > 0)
    }

    pub fn lock_count(&self, id: &SongId) -> usize {
        self.entries.get(id).map_or(0, |entry| entry.locks)
    }

    /// Cached, unlocked songs holding bytes, least valuable first:
    /// fewest playbacks, then least recently used, then identifier order.
    pub fn eviction_candidates(&self) -> Vec<EvictionCandidate> {
        let mut candidates: Vec<EvictionCandidate> = self
            .entries
            .iter()
            .filter(|entry| {
                entry.record.cached
                    && entry.record.size_bytes > 0
                    && entry.locks == 0
                    && !entry.evicting
            })
            .map(|entry| EvictionCandidate {
                id: entry.key().clone(),
                playbacks: entry.record.playbacks,
                last_used: entry.record.last_used,
                size_bytes: entry.record.size_bytes,
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.playbacks
                .cmp(&b.playbacks)
                .then(a.last_used.cmp(&b.last_used))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates
    }

    /// Marks the song as being evicted if it is still cached and unlocked.
    /// Returns its cache location, or `None` if it is no longer eligible.
    pub fn begin_eviction(&self, id: &SongId) -> Option<String> {
        let mut entry = self.entries.get_mut(id)?;
        if !entry.record.cached || entry.locks > 0 || entry.evicting {
            return None;
        }
        entry.evicting = true;
        Some(entry.record.cache_location.clone())
    }

    pub fn abort_eviction(&self, id: &SongId) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.evicting = false;
        }
    }

    /// Uncaches the song and resets its chunk range and size; the bytes are gone.
    /// Returns the number of bytes released from the aggregate.
    pub fn finish_eviction(&self, id: &SongId) -> Result<u64> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SongDbError::UnknownSong(id.clone()))?;
        let freed = entry.record.accounted_bytes();

        let record = &mut entry.record;
        record.cached = false;
        record.start_chunk = NO_CHUNK;
        record.end_chunk = NO_CHUNK;
        record.size_bytes = 0;
        entry.evicting = false;

        self.adjust_total(freed, 0);
        drop(entry);

        self.mark_dirty();
        Ok(freed)
    }

    /// Copy of every record, ordered by identifier.
    pub fn snapshot(&self) -> BTreeMap<SongId, SongRecord> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.record.clone()))
            .collect()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Clears the dirty flag, returning whether it was set.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    /// Recomputes the aggregate by a full scan and corrects the counter on drift.
    /// Returns `scanned - counted`; a scan raced by a concurrent change is skipped.
    pub fn verify_total_size(&self) -> i64 {
        let epoch = self.accounting_epoch.load(Ordering::SeqCst);
        let counted = self.total_size_bytes();
        let scanned: u64 = self
            .entries
            .iter()
            .map(|entry| entry.record.accounted_bytes())
            .sum();

        if self.accounting_epoch.load(Ordering::SeqCst) != epoch {
            debug!("Verificación de tamaño omitida: la caché cambió durante el escaneo");
            return 0;
        }

        let drift = (scanned as i128 - counted as i128) as i64;
        if drift != 0
            && self
                .total_size_bytes
                .compare_exchange(counted, scanned, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            warn!(
                "⚖️ Tamaño total corregido: contador {} bytes, escaneo {} bytes",
                counted, scanned
            );
        }
        drift
    }

    pub fn cached_songs(&self) -> usize {
        self.entries.iter().filter(|e| e.record.cached).count()
    }

    pub fn locked_songs(&self) -> usize {
        self.entries.iter().filter(|e| e.locks > 0).count()
    }

    fn adjust_total(&self, before: u64, after: u64) {
        if after == before {
            return;
        }
        if after > before {
            self.total_size_bytes
                .fetch_add(after - before, Ordering::SeqCst);
        } else {
            self.total_size_bytes
                .fetch_sub(before - after, Ordering::SeqCst);
        }
        self.accounting_epoch.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn song(raw: &str) -> SongId {
        SongId::from(raw)
    }

    fn cached_with_size(store: &RecordStore, raw: &str, size: u64, playbacks: u64) {
        store.cache_song(&song(raw), &format!("cache/{}", raw));
        store
            .update(&song(raw), |r| {
                r.size_bytes = size;
                r.playbacks = playbacks;
            })
            .unwrap();
    }

    #[test]
    fn test_total_follows_cached_flag() {
        let store = RecordStore::default();
        cached_with_size(&store, "yt$A", 100, 0);
        cached_with_size(&store, "yt$B", 50, 0);
        assert_eq!(store.total_size_bytes(), 150);

        store.update(&song("yt$B"), |r| r.cached = false).unwrap();
        assert_eq!(store.total_size_bytes(), 100);

        // re-cache brings the preserved size back into the budget
        store.cache_song(&song("yt$B"), "cache/other");
        assert_eq!(store.total_size_bytes(), 150);
        assert_eq!(store.verify_total_size(), 0);
    }

    #[test]
    fn test_candidates_skip_locked_and_empty_songs() {
        let store = RecordStore::default();
        cached_with_size(&store, "yt$popular", 10, 9);
        cached_with_size(&store, "yt$locked", 10, 0);
        cached_with_size(&store, "yt$rare", 10, 1);
        store.cache_song(&song("yt$empty"), "cache/empty");
        store.acquire_lock(&song("yt$locked")).unwrap();

        let order: Vec<String> = store
            .eviction_candidates()
            .into_iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(order, vec!["yt$rare".to_string(), "yt$popular".to_string()]);
    }

    #[test]
    fn test_eviction_marks_and_resets() {
        let store = RecordStore::default();
        cached_with_size(&store, "yt$A", 64, 2);
        store
            .update(&song("yt$A"), |r| {
                r.start_chunk = 0;
                r.end_chunk = 7;
            })
            .unwrap();

        assert_eq!(store.begin_eviction(&song("yt$A")), Some("cache/yt$A".to_string()));
        // already being evicted
        assert_eq!(store.begin_eviction(&song("yt$A")), None);
        assert!(store.eviction_candidates().is_empty());

        assert_eq!(store.finish_eviction(&song("yt$A")).unwrap(), 64);
        let info = store.read(&song("yt$A"), |r| r.cache_info()).unwrap();
        assert!(!info.cached);
        assert_eq!((info.start_chunk, info.end_chunk, info.size_bytes), (-1, -1, 0));
        assert_eq!(info.playbacks, 2);
        assert_eq!(store.total_size_bytes(), 0);
    }

    #[test]
    fn test_locked_song_cannot_begin_eviction() {
        let store = RecordStore::default();
        cached_with_size(&store, "yt$A", 64, 0);
        store.acquire_lock(&song("yt$A")).unwrap();
        assert_eq!(store.begin_eviction(&song("yt$A")), None);

        store.release_lock(&song("yt$A"));
        assert!(store.begin_eviction(&song("yt$A")).is_some());
        store.abort_eviction(&song("yt$A"));
        assert_eq!(store.eviction_candidates().len(), 1);
    }

    #[test]
    fn test_song_under_eviction_cannot_be_locked() {
        let store = RecordStore::default();
        cached_with_size(&store, "yt$A", 64, 0);
        assert!(store.begin_eviction(&song("yt$A")).is_some());

        assert!(matches!(
            store.acquire_lock(&song("yt$A")),
            Err(SongDbError::Evicting(ref id)) if *id == song("yt$A")
        ));
        assert_eq!(store.lock_count(&song("yt$A")), 0);

        store.finish_eviction(&song("yt$A")).unwrap();
        store.acquire_lock(&song("yt$A")).unwrap();
        assert!(store.is_locked(&song("yt$A")));
    }

    #[test]
    fn test_rejected_update_changes_nothing() {
        let store = RecordStore::default();
        cached_with_size(&store, "yt$A", 64, 0);
        store.take_dirty();

        let result: Result<()> = store.try_update(&song("yt$A"), |r| {
            if r.start_chunk == NO_CHUNK {
                return Err(SongDbError::InvalidChunkRange {
                    start: r.start_chunk,
                    end: 4,
                });
            }
            r.end_chunk = 4;
            Ok(())
        });
        assert!(result.is_err());
        assert!(!store.take_dirty());
        assert_eq!(store.read(&song("yt$A"), |r| r.end_chunk).unwrap(), NO_CHUNK);
        assert_eq!(store.total_size_bytes(), 64);
    }

    #[test]
    fn test_verify_corrects_drift() {
        let store = RecordStore::default();
        cached_with_size(&store, "yt$A", 64, 0);
        store.total_size_bytes.store(10, Ordering::SeqCst);

        assert_eq!(store.verify_total_size(), 54);
        assert_eq!(store.total_size_bytes(), 64);
    }

    #[test]
    fn test_dirty_flag() {
        let store = RecordStore::default();
        assert!(!store.take_dirty());
        store.cache_song(&song("yt$A"), "cache/0");
        assert!(store.take_dirty());
        assert!(!store.take_dirty());
        assert!(store.update(&song("yt$missing"), |r| r.playbacks += 1).is_err());
        assert!(!store.take_dirty());
    }
}
