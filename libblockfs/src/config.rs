use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{BackpressureDiskLimiter, BackpressureParams, DiskLimiter, StaticDiskLimiter, statvfs_free_space};
use crate::retrieval::DEFAULT_MAX_PREFETCHES;
use crate::splitter::BlockSplitterSimple;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub splitter: SplitterConfig,
    pub retrieval: RetrievalConfig,
    pub clean_cache: CleanCacheConfig,
    pub disk_cache: DiskCacheConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitterConfig {
    // bytes per leaf block
    pub max_size: usize,
    pub max_ptrs_per_block: usize,
    // encoded block changes above this go into their own block
    pub block_changes_max_size: u64,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            max_size: 512 * 1024,
            max_ptrs_per_block: 128,
            block_changes_max_size: 8 * 1024,
        }
    }
}

impl SplitterConfig {
    pub fn build(&self) -> Result<BlockSplitterSimple> {
        Ok(BlockSplitterSimple::new(
            self.max_size,
            self.max_ptrs_per_block,
            self.block_changes_max_size,
        )?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub workers: usize,
    // prefetches in flight; 0 turns prefetching off
    pub max_prefetches: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            max_prefetches: DEFAULT_MAX_PREFETCHES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanCacheConfig {
    // max number of decoded blocks
    pub capacity: u64,
}

impl Default for CleanCacheConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskCacheConfig {
    // None keeps no disk cache
    pub dir: Option<PathBuf>,
    pub limiter: LimiterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LimiterConfig {
    Static {
        byte_limit: i64,
        file_limit: i64,
    },
    Backpressure {
        #[serde(default = "default_min_threshold")]
        min_threshold: f64,
        #[serde(default = "default_max_threshold")]
        max_threshold: f64,
        #[serde(default = "default_limit_frac")]
        byte_frac: f64,
        #[serde(default = "default_limit_frac")]
        file_frac: f64,
        #[serde(default = "default_byte_limit")]
        byte_limit: i64,
        #[serde(default = "default_file_limit")]
        file_limit: i64,
        #[serde(default = "default_max_delay_ms")]
        max_delay_ms: u64,
    },
}

fn default_min_threshold() -> f64 {
    BackpressureParams::default().min_threshold
}

fn default_max_threshold() -> f64 {
    BackpressureParams::default().max_threshold
}

fn default_limit_frac() -> f64 {
    BackpressureParams::default().byte_frac
}

fn default_byte_limit() -> i64 {
    BackpressureParams::default().byte_limit
}

fn default_file_limit() -> i64 {
    BackpressureParams::default().file_limit
}

fn default_max_delay_ms() -> u64 {
    BackpressureParams::default().max_delay.as_millis() as u64
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self::Backpressure {
            min_threshold: default_min_threshold(),
            max_threshold: default_max_threshold(),
            byte_frac: default_limit_frac(),
            file_frac: default_limit_frac(),
            byte_limit: default_byte_limit(),
            file_limit: default_file_limit(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl LimiterConfig {
    /// Build the limiter for a disk cache living under `dir`.
    pub fn build(&self, dir: PathBuf) -> Result<Arc<dyn DiskLimiter>> {
        match *self {
            LimiterConfig::Static { byte_limit, file_limit } => {
                Ok(Arc::new(StaticDiskLimiter::new(byte_limit, file_limit)))
            }
            LimiterConfig::Backpressure {
                min_threshold,
                max_threshold,
                byte_frac,
                file_frac,
                byte_limit,
                file_limit,
                max_delay_ms,
            } => {
                let params = BackpressureParams {
                    min_threshold,
                    max_threshold,
                    byte_frac,
                    file_frac,
                    byte_limit,
                    file_limit,
                    max_delay: Duration::from_millis(max_delay_ms),
                };
                let limiter = BackpressureDiskLimiter::new(params, statvfs_free_space(dir))
                    .context("Failed to build backpressure disk limiter")?;
                Ok(Arc::new(limiter))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_parallel_puts: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { max_parallel_puts: 10 }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.splitter.build()?;
        if self.clean_cache.capacity == 0 {
            bail!("clean_cache.capacity must be > 0");
        }
        if self.sync.max_parallel_puts == 0 {
            bail!("sync.max_parallel_puts must be > 0");
        }
        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<Config> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    cfg.validate()?;
    Ok(cfg)
}
