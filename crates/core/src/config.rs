//! Database configuration.
//!
//! All recognised options, defaulted to sane values. Normally built in code;
//! `DbConfig::from_toml_str` covers deployments that ship a config file.

use crate::error::{Result, ThemisError};
use serde::{Deserialize, Serialize};

/// Block compression codec for the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// No compression.
    None,
    /// LZ4 frame compression: fast, modest ratio.
    Lz4,
    /// Zstandard: slower, better ratio.
    #[default]
    Zstd,
}

/// WAL fsync policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalFsync {
    /// fsync on every commit.
    Always,
    /// fsync at most once per interval; commits in between flush to the OS.
    EveryNMs(u64),
    /// Never fsync from the commit path; the OS decides.
    Off,
}

impl Default for WalFsync {
    fn default() -> Self {
        WalFsync::EveryNMs(100)
    }
}

/// Recognised configuration options.
///
/// Unknown keys in a TOML source are rejected so typos fail loudly at open
/// time rather than silently running on defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DbConfig {
    /// Codec for newly written storage segments.
    pub compression_default: Compression,
    /// Codec for fully compacted (bottommost) segments; `None` falls back to
    /// `compression_default`.
    pub compression_bottommost: Option<Compression>,

    /// Memtable size before a segment roll, in MiB.
    pub memtable_size_mb: usize,
    /// Block cache budget, in MiB.
    pub block_cache_size_mb: usize,
    /// Write buffer size in bytes for log appends.
    pub write_buffer_size: usize,
    /// Number of write buffers kept before backpressure.
    pub max_write_buffer_number: usize,
    /// Worker threads shared by the background pools.
    pub max_background_jobs: usize,

    /// Whether the WAL is written at all. Disabled means no crash durability.
    pub enable_wal: bool,
    /// WAL fsync policy.
    pub wal_fsync: WalFsync,

    /// Upper bound on pessimistic lock waits.
    pub txn_lock_wait_timeout_ms: u64,

    /// Push upstream whitelists into ANN search instead of postfiltering.
    pub whitelist_prefilter_enabled: bool,
    /// First candidate list size as a multiple of `k`.
    pub whitelist_initial_factor: usize,
    /// Floor for the first candidate list size.
    pub whitelist_min_candidates: usize,
    /// Attempts before giving up enlarging the candidate list.
    pub whitelist_max_attempts: usize,
    /// Candidate list growth per attempt.
    pub whitelist_growth_factor: f64,

    /// Overfetch multiplier for postfiltered ANN (`k' = k * factor`).
    pub vector_overfetch_factor: f64,
    /// Default HNSW `ef_search` when the query has no override.
    pub vector_ef_search_default: usize,

    /// Spatial-first planning threshold on query-MBR / total-bounds area.
    pub bbox_ratio_threshold: f64,
    /// Composite-first planning threshold on equality-prefix selectivity.
    pub composite_selectivity_threshold: f64,

    /// Interval between TTL expiry sweeps.
    pub ttl_sweep_interval_ms: u64,
    /// Changefeed retention bound in bytes. 0 disables trimming by size.
    pub changefeed_retention_bytes: u64,
    /// Changefeed retention bound by record age. 0 disables trimming by age.
    pub changefeed_retention_ms: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            compression_default: Compression::Zstd,
            compression_bottommost: None,
            memtable_size_mb: 64,
            block_cache_size_mb: 128,
            write_buffer_size: 4 * 1024 * 1024,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            enable_wal: true,
            wal_fsync: WalFsync::default(),
            txn_lock_wait_timeout_ms: 5_000,
            whitelist_prefilter_enabled: true,
            whitelist_initial_factor: 4,
            whitelist_min_candidates: 64,
            whitelist_max_attempts: 4,
            whitelist_growth_factor: 2.0,
            vector_overfetch_factor: 3.0,
            vector_ef_search_default: 64,
            bbox_ratio_threshold: 0.3,
            composite_selectivity_threshold: 0.01,
            ttl_sweep_interval_ms: 1_000,
            changefeed_retention_bytes: 0,
            changefeed_retention_ms: 0,
        }
    }
}

impl DbConfig {
    /// Parse from TOML. Unknown keys and invalid values are rejected.
    pub fn from_toml_str(source: &str) -> Result<DbConfig> {
        let config: DbConfig = toml::from_str(source)
            .map_err(|e| ThemisError::invalid_value(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.whitelist_growth_factor <= 1.0 {
            return Err(ThemisError::invalid_value(
                "whitelist_growth_factor must be > 1.0",
            ));
        }
        if self.whitelist_initial_factor == 0 || self.whitelist_max_attempts == 0 {
            return Err(ThemisError::invalid_value(
                "whitelist prefilter factors must be positive",
            ));
        }
        if self.vector_overfetch_factor < 1.0 {
            return Err(ThemisError::invalid_value(
                "vector_overfetch_factor must be >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.bbox_ratio_threshold)
            || !(0.0..=1.0).contains(&self.composite_selectivity_threshold)
        {
            return Err(ThemisError::invalid_value(
                "planner thresholds must be in [0, 1]",
            ));
        }
        if self.memtable_size_mb == 0 || self.max_background_jobs == 0 {
            return Err(ThemisError::invalid_value(
                "memtable_size_mb and max_background_jobs must be positive",
            ));
        }
        Ok(())
    }

    /// The codec used for bottommost segments.
    pub fn bottommost_compression(&self) -> Compression {
        self.compression_bottommost.unwrap_or(self.compression_default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        DbConfig::default().validate().unwrap();
    }

    #[test]
    fn toml_round_trip() {
        let cfg = DbConfig::from_toml_str(
            r#"
            compression_default = "lz4"
            memtable_size_mb = 16
            txn_lock_wait_timeout_ms = 250
            whitelist_prefilter_enabled = false
            wal_fsync = "always"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.compression_default, Compression::Lz4);
        assert_eq!(cfg.memtable_size_mb, 16);
        assert_eq!(cfg.txn_lock_wait_timeout_ms, 250);
        assert!(!cfg.whitelist_prefilter_enabled);
        assert_eq!(cfg.wal_fsync, WalFsync::Always);
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(DbConfig::from_toml_str("no_such_option = 3").is_err());
    }

    #[test]
    fn bad_growth_factor_rejected() {
        let mut cfg = DbConfig::default();
        cfg.whitelist_growth_factor = 0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bottommost_falls_back() {
        let mut cfg = DbConfig::default();
        assert_eq!(cfg.bottommost_compression(), Compression::Zstd);
        cfg.compression_bottommost = Some(Compression::None);
        assert_eq!(cfg.bottommost_compression(), Compression::None);
    }
}
