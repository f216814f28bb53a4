use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::record::SongId;
use super::song_db::SongDb;
use super::store::RecordStore;
use crate::error::{Result, SongDbError};

/// Opaque token returned by `add_lock`.
///
/// The high 32 bits are a random generation chosen when a table is first
/// created. The counter is persisted with the locks, so a token is never handed
/// out twice, not even across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(u64);

impl LockId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Reference-counting registry of held locks.
///
/// The per-song count lives in the record store entry so that taking a lock and
/// starting an eviction are serialized on the same record. Held locks are saved
/// with the song table and survive a restart.
#[derive(Debug)]
pub struct LockTable {
    next: AtomicU64,
    holders: DashMap<LockId, SongId>,
}

impl LockTable {
    pub fn new() -> Self {
        let generation = u64::from(fastrand::u32(..)) << 32;
        Self {
            next: AtomicU64::new(generation | 1),
            holders: DashMap::new(),
        }
    }

    /// Rebuilds the table from locks loaded from disk, counting each one on its
    /// song. `next_lock == 0` means no counter was stored yet.
    pub fn restore(store: &RecordStore, held: BTreeMap<LockId, SongId>, next_lock: u64) -> Self {
        let table = Self::new();
        let mut next = if next_lock == 0 {
            table.next.load(Ordering::SeqCst)
        } else {
            next_lock
        };

        for (lock, song) in held {
            next = next.max(lock.0.saturating_add(1));
            if !store.restore_lock(&song) {
                warn!("Lock {} apunta a una canción inexistente ({}), descartado", lock, song);
                continue;
            }
            table.holders.insert(lock, song);
        }

        table.next.store(next, Ordering::SeqCst);
        table
    }

    /// Held locks and the next token to hand out, as saved to disk.
    pub fn snapshot(&self) -> (BTreeMap<LockId, SongId>, u64) {
        let held = self
            .holders
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        (held, self.next.load(Ordering::SeqCst))
    }

    pub fn add_lock(&self, store: &RecordStore, song: &SongId) -> Result<LockId> {
        store.acquire_lock(song)?;

        let lock = LockId(self.next.fetch_add(1, Ordering::SeqCst));
        self.holders.insert(lock, song.clone());
        debug!("🔒 Lock {} agregado para {}", lock, song);
        Ok(lock)
    }

    pub fn remove_lock(&self, store: &RecordStore, lock: LockId) -> Result<SongId> {
        let (_, song) = self
            .holders
            .remove(&lock)
            .ok_or(SongDbError::UnknownLock(lock))?;
        store.release_lock(&song);
        debug!("🔓 Lock {} liberado para {}", lock, song);
        Ok(song)
    }

    pub fn active_locks(&self) -> usize {
        self.holders.len()
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped lock on a song: released exactly once, when dropped or via [`SongLock::release`].
///
/// Download and playback sessions hold one of these for as long as they read or
/// extend the song's cached bytes, so cancellation never leaks a lock.
#[derive(Debug)]
pub struct SongLock {
    db: Arc<SongDb>,
    song: SongId,
    lock: Option<LockId>,
}

impl SongLock {
    pub(crate) fn new(db: Arc<SongDb>, song: SongId, lock: LockId) -> Self {
        Self {
            db,
            song,
            lock: Some(lock),
        }
    }

    pub fn song(&self) -> &SongId {
        &self.song
    }

    pub fn lock_id(&self) -> Option<LockId> {
        self.lock
    }

    pub fn release(mut self) -> Result<()> {
        match self.lock.take() {
            Some(lock) => self.db.remove_lock(lock),
            None => Ok(()),
        }
    }
}

impl Drop for SongLock {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        // the lock stays in the table saved by close()
        if self.db.is_closed() {
            return;
        }
        if let Err(e) = self.db.remove_lock(lock) {
            error!("❌ Error liberando lock {} de {}: {}", lock, self.song, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_reference_count_law() {
        let store = RecordStore::default();
        let locks = LockTable::new();
        let song = SongId::from("yt$M1vsdF4VfUo");
        store.cache_song(&song, "cache/location0");

        assert!(!store.is_locked(&song));
        let first = locks.add_lock(&store, &song).unwrap();
        let second = locks.add_lock(&store, &song).unwrap();
        assert_ne!(first, second);
        assert_eq!(store.lock_count(&song), 2);

        assert_eq!(locks.remove_lock(&store, first).unwrap(), song);
        assert!(store.is_locked(&song));
        locks.remove_lock(&store, second).unwrap();
        assert!(!store.is_locked(&song));
        assert_eq!(locks.active_locks(), 0);
    }

    #[test]
    fn test_unknown_song_and_lock() {
        let store = RecordStore::default();
        let locks = LockTable::new();
        let song = SongId::from("yt$M1vsdF4VfUo");
        store.cache_song(&song, "cache/location0");

        assert!(matches!(
            locks.add_lock(&store, &SongId::from("yt$IK-IlYIQvcU")),
            Err(SongDbError::UnknownSong(_))
        ));

        let lock = locks.add_lock(&store, &song).unwrap();
        let bogus = LockId::from_raw(lock.as_raw() + 1);
        assert!(matches!(
            locks.remove_lock(&store, bogus),
            Err(SongDbError::UnknownLock(id)) if id == bogus
        ));
        assert!(store.is_locked(&song));

        // a token is only valid once
        locks.remove_lock(&store, lock).unwrap();
        assert!(locks.remove_lock(&store, lock).is_err());
    }

    #[test]
    fn test_lock_ids_start_after_generation() {
        let a = LockTable::new();
        let b = LockTable::new();
        let store = RecordStore::default();
        let song = SongId::from("yt$A");
        store.cache_song(&song, "cache/0");

        let from_a = a.add_lock(&store, &song).unwrap();
        // low bits restart at 1 in every table, high bits are random
        assert_eq!(from_a.as_raw() & 0xffff_ffff, 1);
        let from_b = b.add_lock(&store, &song).unwrap();
        assert_eq!(from_b.as_raw() & 0xffff_ffff, 1);
    }

    #[test]
    fn test_restore_counts_held_locks() {
        let store = RecordStore::default();
        let song = SongId::from("yt$IK-IlYIQvcU");
        store.cache_song(&song, "cache/location1");

        let mut held = BTreeMap::new();
        held.insert(LockId::from_raw(7), song.clone());
        held.insert(LockId::from_raw(9), song.clone());
        held.insert(LockId::from_raw(3), SongId::from("yt$gone"));
        let locks = LockTable::restore(&store, held, 5);

        assert_eq!(store.lock_count(&song), 2);
        assert_eq!(locks.active_locks(), 2);
        // never below a restored token
        let fresh = locks.add_lock(&store, &song).unwrap();
        assert_eq!(fresh.as_raw(), 10);

        locks.remove_lock(&store, LockId::from_raw(7)).unwrap();
        locks.remove_lock(&store, LockId::from_raw(9)).unwrap();
        locks.remove_lock(&store, fresh).unwrap();
        assert!(!store.is_locked(&song));
        assert_eq!(locks.snapshot(), (BTreeMap::new(), 11));
    }
}
