use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::cache::{LockId, SongId, SongRecord};
use crate::error::Result;

/// Versión del formato en disco. La v1 no guardaba locks.
const TABLE_VERSION: u32 = 2;

/// Everything [`JsonStorage`] keeps: song records plus the held locks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SongTable {
    pub songs: BTreeMap<SongId, SongRecord>,
    pub locks: BTreeMap<LockId, SongId>,
    /// Next lock token to hand out; `0` when none was stored
    pub next_lock: u64,
}

/// Tabla de canciones tal como se escribe en disco
#[derive(Debug, Deserialize)]
struct StoredTable {
    version: u32,
    songs: BTreeMap<SongId, SongRecord>,
    #[serde(default)]
    locks: BTreeMap<LockId, SongId>,
    #[serde(default)]
    next_lock: u64,
}

#[derive(Debug, Serialize)]
struct StoredTableRef<'a> {
    version: u32,
    songs: &'a BTreeMap<SongId, SongRecord>,
    locks: &'a BTreeMap<LockId, SongId>,
    next_lock: u64,
}

/// Almacenamiento de la tabla de canciones en un único archivo JSON.
///
/// Cada escritura va primero a un archivo temporal hermano y luego se renombra
/// sobre el anterior, así que un crash deja la tabla vieja o la nueva, nunca
/// una a medias.
#[derive(Debug, Clone)]
pub struct JsonStorage {
    path: PathBuf,
}

impl JsonStorage {
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        // Crear directorio de datos si no existe
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let storage = Self { path };

        // Restos de una escritura interrumpida
        let tmp = storage.tmp_path();
        if fs::try_exists(&tmp).await? {
            warn!("🧹 Eliminando tabla temporal abandonada: {}", tmp.display());
            fs::remove_file(&tmp).await?;
        }

        info!("📁 Storage inicializado en: {}", storage.path.display());
        Ok(storage)
    }

    /// Handle for reading an existing table without preparing its directory.
    pub fn inspect(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the stored table. A missing file is an empty table.
    pub async fn load(&self) -> Result<SongTable> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No existe tabla de canciones en {}", self.path.display());
                return Ok(SongTable::default());
            }
            Err(e) => return Err(e.into()),
        };

        let stored: StoredTable = serde_json::from_slice(&content)?;
        if stored.version > TABLE_VERSION {
            warn!(
                "Tabla de canciones con versión {} (soportada hasta {})",
                stored.version, TABLE_VERSION
            );
        }

        let table = SongTable {
            songs: stored.songs,
            locks: stored.locks,
            next_lock: stored.next_lock,
        };
        info!(
            "📂 Cargadas {} canciones y {} locks desde disco",
            table.songs.len(),
            table.locks.len()
        );
        Ok(table)
    }

    /// Replaces the stored table with `table`.
    pub async fn save(&self, table: &SongTable) -> Result<()> {
        let content = serde_json::to_vec_pretty(&StoredTableRef {
            version: TABLE_VERSION,
            songs: &table.songs,
            locks: &table.locks,
            next_lock: table.next_lock,
        })?;

        let tmp = self.tmp_path();
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;

        debug!(
            "💾 Tabla guardada: {} canciones, {} locks, {} bytes",
            table.songs.len(),
            table.locks.len(),
            content.len()
        );
        Ok(())
    }

    /// Obtiene estadísticas de almacenamiento
    pub async fn get_storage_stats(&self) -> Result<StorageStats> {
        let total_size_bytes = match fs::metadata(&self.path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        Ok(StorageStats {
            table_path: self.path.clone(),
            total_size_bytes,
        })
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Estadísticas de almacenamiento
#[derive(Debug)]
pub struct StorageStats {
    pub table_path: PathBuf,
    pub total_size_bytes: u64,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "📊 Storage Stats:\n\
             📁 Table: {}\n\
             📦 Total Size: {} bytes ({:.2} KB)",
            self.table_path.display(),
            self.total_size_bytes,
            self.total_size_bytes as f64 / 1024.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_missing_table_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path().join("data").join("songs.json"))
            .await
            .unwrap();

        assert_eq!(storage.load().await.unwrap(), SongTable::default());
        assert_eq!(storage.get_storage_stats().await.unwrap().total_size_bytes, 0);
    }

    #[tokio::test]
    async fn test_save_replaces_table_and_keeps_sentinels() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path().join("songs.json")).await.unwrap();

        let mut table = SongTable::default();
        let mut played = SongRecord::new_cached("cache/location0");
        played.start_chunk = 0;
        played.end_chunk = 212;
        played.size_bytes = 128;
        played.playbacks = 3;
        table.songs.insert(SongId::from("yt$M1vsdF4VfUo"), played);
        table
            .songs
            .insert(SongId::from("yt$IK-IlYIQvcU"), SongRecord::new_cached("cache/location1"));
        table
            .locks
            .insert(LockId::from_raw(41), SongId::from("yt$IK-IlYIQvcU"));
        table.next_lock = 42;
        storage.save(&table).await.unwrap();

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded, table);
        assert!(!storage.tmp_path().exists());

        table.songs.remove(&SongId::from("yt$M1vsdF4VfUo"));
        table.locks.clear();
        storage.save(&table).await.unwrap();
        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded.songs.len(), 1);
        assert!(loaded.locks.is_empty());
    }

    #[tokio::test]
    async fn test_stale_tmp_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("songs.json");
        std::fs::write(dir.path().join("songs.json.tmp"), b"{ partial").unwrap();

        let storage = JsonStorage::new(&path).await.unwrap();
        assert!(!storage.tmp_path().exists());
        assert!(storage.load().await.unwrap().songs.is_empty());
    }

    #[tokio::test]
    async fn test_loads_table_without_locks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("songs.json");
        let record = serde_json::to_value(SongRecord::new_cached("cache/location0")).unwrap();
        let v1 = serde_json::json!({
            "version": 1,
            "songs": { "yt$M1vsdF4VfUo": record },
        });
        std::fs::write(&path, serde_json::to_vec(&v1).unwrap()).unwrap();

        let table = JsonStorage::new(&path).await.unwrap().load().await.unwrap();
        assert_eq!(table.songs.len(), 1);
        assert!(table.locks.is_empty());
        assert_eq!(table.next_lock, 0);
    }

    #[tokio::test]
    async fn test_corrupt_table_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("songs.json");
        std::fs::write(&path, b"not json").unwrap();

        let storage = JsonStorage::new(&path).await.unwrap();
        assert!(storage.load().await.is_err());
    }
}
