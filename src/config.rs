use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::EvictionConfig;

const MIB: u64 = 1 << 20;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Paths
    pub song_db_path: PathBuf,
    pub cache_dir: PathBuf,

    // Caché
    pub cache_size_bytes: u64,

    // Streaming (milisegundos entre chunks)
    pub chunk_timing: u64,
    pub nightcore_chunk_timing: u64,

    // Mantenimiento
    pub flush_interval_ms: u64,
    pub consistency_check_interval_secs: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        // Create directories if they don't exist
        if let Some(parent) = config.song_db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(&config.cache_dir)?;

        Ok(config)
    }

    /// Builds and validates a configuration from `lookup`, falling back to defaults
    /// for every unset or blank variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            song_db_path: var("SONG_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.song_db_path),
            cache_dir: var("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),

            cache_size_bytes: match var("MAX_CACHESIZE_MIB") {
                Some(mib) => parse::<u64>("MAX_CACHESIZE_MIB", &mib)?
                    .checked_mul(MIB)
                    .context("MAX_CACHESIZE_MIB is too large")?,
                None => defaults.cache_size_bytes,
            },

            chunk_timing: parse_or(&var, "CHUNK_TIMING_MS", defaults.chunk_timing)?,
            nightcore_chunk_timing: parse_or(
                &var,
                "NIGHTCORE_CHUNK_TIMING_MS",
                defaults.nightcore_chunk_timing,
            )?,

            flush_interval_ms: parse_or(&var, "FLUSH_INTERVAL_MS", defaults.flush_interval_ms)?,
            consistency_check_interval_secs: parse_or(
                &var,
                "CONSISTENCY_CHECK_INTERVAL_SECS",
                defaults.consistency_check_interval_secs,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Cache budget must be greater than 0
    /// - Chunk timings must be greater than 0
    /// - Maintenance intervals must be greater than 0
    pub fn validate(&self) -> Result<()> {
        if self.cache_size_bytes == 0 {
            anyhow::bail!("Cache size must be greater than 0");
        }

        if self.chunk_timing == 0 || self.nightcore_chunk_timing == 0 {
            anyhow::bail!(
                "Chunk timings must be greater than 0, got: {}ms / {}ms",
                self.chunk_timing,
                self.nightcore_chunk_timing
            );
        }

        if self.flush_interval_ms == 0 {
            anyhow::bail!("Flush interval must be greater than 0");
        }

        if self.consistency_check_interval_secs == 0 {
            anyhow::bail!("Consistency check interval must be greater than 0");
        }

        Ok(())
    }

    pub fn eviction_config(&self) -> EvictionConfig {
        EvictionConfig {
            cache_dir: self.cache_dir.clone(),
            cache_size_bytes: self.cache_size_bytes,
        }
    }

    /// Time between chunk fetches, shorter for nightcore playback.
    pub fn chunk_interval(&self, nightcore: bool) -> Duration {
        Duration::from_millis(if nightcore {
            self.nightcore_chunk_timing
        } else {
            self.chunk_timing
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn consistency_check_interval(&self) -> Duration {
        Duration::from_secs(self.consistency_check_interval_secs)
    }

    /// Returns a summary of the current configuration for logging.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Song DB: {}\n  \
            Cache: {} ({} MiB budget)\n  \
            Chunks: every {} (nightcore {})\n  \
            Maintenance: flush every {}, check every {}",
            self.song_db_path.display(),
            self.cache_dir.display(),
            self.cache_size_bytes / MIB,
            humantime::format_duration(self.chunk_interval(false)),
            humantime::format_duration(self.chunk_interval(true)),
            humantime::format_duration(self.flush_interval()),
            humantime::format_duration(self.consistency_check_interval()),
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            song_db_path: "./data/songs.json".into(),
            cache_dir: "./cache".into(),

            cache_size_bytes: 1024 * MIB, // 1 GiB

            chunk_timing: 100,
            nightcore_chunk_timing: 80,

            flush_interval_ms: 1000,
            consistency_check_interval_secs: 300,
        }
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", key, raw))
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    var(key).map_or(Ok(default), |raw| parse(key, &raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.cache_size_bytes, 1024 * MIB);
        assert_eq!(config.chunk_interval(false), Duration::from_millis(100));
        assert_eq!(config.chunk_interval(true), Duration::from_millis(80));
        assert_eq!(config.song_db_path, PathBuf::from("./data/songs.json"));
    }

    #[test]
    fn test_reads_environment() {
        let config = Config::from_lookup(lookup(&[
            ("CACHE_DIR", "/tmp/music"),
            ("MAX_CACHESIZE_MIB", "256"),
            ("CHUNK_TIMING_MS", "120"),
            ("FLUSH_INTERVAL_MS", " "),
        ]))
        .unwrap();

        assert_eq!(config.cache_dir, PathBuf::from("/tmp/music"));
        assert_eq!(config.cache_size_bytes, 256 << 20);
        assert_eq!(config.chunk_timing, 120);
        // blank falls back to the default
        assert_eq!(config.flush_interval_ms, 1000);

        let eviction = config.eviction_config();
        assert_eq!(eviction.cache_size_bytes, 256 << 20);
        assert_eq!(eviction.cache_dir, PathBuf::from("/tmp/music"));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(Config::from_lookup(lookup(&[("MAX_CACHESIZE_MIB", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("MAX_CACHESIZE_MIB", "lots")])).is_err());
        assert!(Config::from_lookup(lookup(&[("NIGHTCORE_CHUNK_TIMING_MS", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("MAX_CACHESIZE_MIB", "18446744073709551615")])).is_err());
    }

    #[test]
    fn test_summary_mentions_budget() {
        let summary = Config::default().summary();
        assert!(summary.contains("1024 MiB budget"));
        assert!(summary.contains("every 100ms"));
    }
}
