use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separador entre el tipo de fuente y el id nativo (`yt$<videoId>`)
const SOURCE_SEPARATOR: char = '$';

/// Chunk index meaning "nothing cached yet".
pub const NO_CHUNK: i64 = -1;

/// Duration meaning "unknown or live".
pub const UNKNOWN_DURATION: i64 = -1;

pub const UNKNOWN_TEXT: &str = "Unknown";

/// Stable key of a song: a source tag and the source-native id, e.g. `yt$M1vsdF4VfUo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SongId(String);

impl SongId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn from_parts(source_tag: &str, native_id: &str) -> Self {
        Self(format!("{}{}{}", source_tag, SOURCE_SEPARATOR, native_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SongId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SongId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for SongId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Persisted state of one song: cache bookkeeping plus descriptive metadata.
///
/// Every field is stored exactly, sentinels included (`-1` chunk indices and
/// duration, empty link/thumbnail, `"Unknown"` title/artist).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongRecord {
    pub cached: bool,
    pub cache_location: String,
    pub start_chunk: i64,
    pub end_chunk: i64,
    pub size_bytes: u64,
    pub playbacks: u64,
    pub link: String,
    pub thumbnail_url: String,
    pub title: String,
    pub artist: String,
    pub duration: i64,
    /// Used to break `playbacks` ties when ranking eviction candidates.
    #[serde(default = "Utc::now")]
    pub last_used: DateTime<Utc>,
}

impl SongRecord {
    /// Record created by the first `cache_song` call.
    pub fn new_cached(cache_location: impl Into<String>) -> Self {
        Self {
            cached: true,
            cache_location: cache_location.into(),
            start_chunk: NO_CHUNK,
            end_chunk: NO_CHUNK,
            size_bytes: 0,
            playbacks: 0,
            link: String::new(),
            thumbnail_url: String::new(),
            title: UNKNOWN_TEXT.to_string(),
            artist: UNKNOWN_TEXT.to_string(),
            duration: UNKNOWN_DURATION,
            last_used: Utc::now(),
        }
    }

    pub fn cache_info(&self) -> CacheInfo {
        CacheInfo {
            cached: self.cached,
            cache_location: self.cache_location.clone(),
            start_chunk: self.start_chunk,
            end_chunk: self.end_chunk,
            size_bytes: self.size_bytes,
            playbacks: self.playbacks,
        }
    }

    pub fn song_info(&self) -> SongInfo {
        SongInfo {
            link: self.link.clone(),
            thumbnail_url: self.thumbnail_url.clone(),
            title: self.title.clone(),
            artist: self.artist.clone(),
            duration: self.duration,
        }
    }

    /// Bytes this record contributes to the cache budget.
    pub fn accounted_bytes(&self) -> u64 {
        if self.cached {
            self.size_bytes
        } else {
            0
        }
    }

    pub fn touch(&mut self) {
        self.last_used = Utc::now();
    }
}

/// Snapshot returned by `get_cache_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub cached: bool,
    pub cache_location: String,
    pub start_chunk: i64,
    pub end_chunk: i64,
    pub size_bytes: u64,
    pub playbacks: u64,
}

/// Snapshot returned by `get_song_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongInfo {
    pub link: String,
    pub thumbnail_url: String,
    pub title: String,
    pub artist: String,
    pub duration: i64,
}

/// Accepts `-1` or any non-negative index.
pub(crate) fn valid_chunk_index(index: i64) -> bool {
    index >= NO_CHUNK
}

/// Both bounds unset together, or `0 <= start <= end`.
pub(crate) fn valid_chunk_range(start: i64, end: i64) -> bool {
    (start == NO_CHUNK && end == NO_CHUNK) || (0 <= start && start <= end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_song_id_parts() {
        let id = SongId::from_parts("yt", "M1vsdF4VfUo");
        assert_eq!(id.as_str(), "yt$M1vsdF4VfUo");
        assert_eq!(id, SongId::from("yt$M1vsdF4VfUo"));
    }

    #[test]
    fn test_new_record_defaults() {
        let record = SongRecord::new_cached("cache/location0");
        assert_eq!(
            record.cache_info(),
            CacheInfo {
                cached: true,
                cache_location: "cache/location0".to_string(),
                start_chunk: -1,
                end_chunk: -1,
                size_bytes: 0,
                playbacks: 0,
            }
        );
        assert_eq!(
            record.song_info(),
            SongInfo {
                link: String::new(),
                thumbnail_url: String::new(),
                title: "Unknown".to_string(),
                artist: "Unknown".to_string(),
                duration: -1,
            }
        );
    }

    #[test]
    fn test_chunk_range_validation() {
        assert!(valid_chunk_range(-1, -1));
        assert!(valid_chunk_range(0, 0));
        assert!(valid_chunk_range(3, 212));
        assert!(!valid_chunk_range(-1, 4));
        assert!(!valid_chunk_range(5, 4));
        assert!(valid_chunk_index(-1));
        assert!(!valid_chunk_index(-2));
    }

    #[test]
    fn test_uncached_record_is_not_accounted() {
        let mut record = SongRecord::new_cached("cache/0");
        record.size_bytes = 128;
        assert_eq!(record.accounted_bytes(), 128);
        record.cached = false;
        assert_eq!(record.accounted_bytes(), 0);
    }
}
