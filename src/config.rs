//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default block size for volume data (2 MiB)
pub const DEFAULT_BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// Default namespace root under which all paths are composed
pub const DEFAULT_BASE: &str = "backupstore";

/// Configuration for a backup store instance.
///
/// One immutable value per engine, injected at construction. The `base`
/// prefixes every path handed to the storage driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStoreConfig {
    /// Namespace root on the backend
    pub base: String,
    /// Fixed block size in bytes; the final block of a volume may be short
    pub block_size: usize,
    /// Retry policy for transient driver failures
    pub retry: RetryConfig,
}

impl Default for BackupStoreConfig {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE.to_string(),
            block_size: DEFAULT_BLOCK_SIZE,
            retry: RetryConfig::default(),
        }
    }
}

/// Bounded retry policy applied at the driver boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first
    pub attempts: u32,
    /// Linear backoff between attempts, in milliseconds
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 200,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}
