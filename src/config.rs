//! Configuration types for patch-dl

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Derive the default worker-pool size from host parallelism.
///
/// Returns `max(2, available_parallelism / 4)`. The divisor is deliberately
/// conservative: checksum lanes contend on the storage device and CPU cache,
/// and download lanes gain nothing from connection counts beyond a handful.
/// The floor of 2 keeps small machines from degrading to serial execution.
pub fn default_worker_count() -> usize {
    let parallelism = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    (parallelism / 4).max(2)
}

/// Checksum validation configuration
///
/// Groups settings for the parallel checksum validator. Used as a nested
/// sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Number of parallel validation lanes (default: `max(2, cpus / 4)`)
    #[serde(default = "default_worker_count")]
    pub concurrency: usize,

    /// Read chunk size in bytes for streaming digests (default: 64 KiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            concurrency: default_worker_count(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// Download scheduler configuration
///
/// Groups settings for the competitive-pull download worker pool. Used as a
/// nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Number of concurrent download workers (default: `max(2, cpus / 4)`)
    #[serde(default = "default_worker_count")]
    pub concurrency: usize,

    /// Capacity of the per-file network-to-disk chunk channel (default: 8)
    ///
    /// Bounds how far the socket read can run ahead of the disk write; a slow
    /// disk stalls the network read only once this many chunks are in flight.
    #[serde(default = "default_write_buffer_chunks")]
    pub write_buffer_chunks: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: default_worker_count(),
            write_buffer_chunks: default_write_buffer_chunks(),
        }
    }
}

/// Retry configuration for the built-in exponential backoff policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 1s)
    #[serde(default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Upper bound on any single retry delay (default: 60s)
    #[serde(default = "default_max_delay")]
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each retry (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays to prevent thundering herd (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration for a patch flow
///
/// Works out of the box with `Config { base_dir, ..Default::default() }`;
/// every knob has a sensible default.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Root directory of the managed content tree (default: "./content")
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Manifest filename inside `base_dir` (default: "manifest.json")
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,

    /// Checksum validation settings
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Download scheduler settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Retry/backoff settings for the built-in policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Time window over which download/validation speed is averaged
    /// (default: 1s)
    #[serde(default = "default_speed_window")]
    pub speed_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            manifest_name: default_manifest_name(),
            validation: ValidationConfig::default(),
            download: DownloadConfig::default(),
            retry: RetryConfig::default(),
            speed_window: default_speed_window(),
        }
    }
}

impl Config {
    /// Full path of the local manifest file
    pub fn manifest_path(&self) -> PathBuf {
        self.base_dir.join(&self.manifest_name)
    }
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("./content")
}

fn default_manifest_name() -> String {
    "manifest.json".to_string()
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_write_buffer_chunks() -> usize {
    8
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_speed_window() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}
