//! Storage driver contract and helpers
//!
//! Every backend interaction in the crate goes through [`BackupStoreDriver`].
//! The engine never talks to a backend directly, so adding a backend means
//! implementing this one trait.

use crate::config::RetryConfig;
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use tracing::warn;

/// Uniform operations against a hierarchical namespace on a remote backend.
///
/// `write` must publish atomically: a concurrent reader sees either the
/// complete object or nothing. Backends typically stage to a temporary key
/// and rename, or use a conditional put. The engine additionally assumes
/// read-after-write consistency for a given path.
pub trait BackupStoreDriver: Send + Sync {
    /// Short tag identifying the backend ("memory", "s3", "nfs", ...)
    fn kind(&self) -> &str;

    /// Names of the immediate children under `path`.
    fn list(&self, path: &str) -> Result<Vec<String>>;

    /// Read the object at `path`; [`Error::NotFound`] when absent.
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Create or overwrite the object at `path`.
    fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Remove `path`, recursively for subtrees. Removing an absent path
    /// succeeds.
    fn remove(&self, path: &str) -> Result<()>;

    /// Existence probe for an object or subtree.
    fn exists(&self, path: &str) -> bool;
}

/// Run `op` with bounded retries for transient driver failures.
///
/// Only [`Error::Driver`] is retried; validation and integrity errors
/// surface immediately.
pub fn with_retries<T, F>(retry: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < retry.attempts => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    what, attempt, retry.attempts, e
                );
                attempt += 1;
                std::thread::sleep(retry.backoff());
            }
            other => return other,
        }
    }
}

/// In-memory driver for tests and local experimentation.
///
/// Keys are `/`-separated paths; a "directory" is any shared key prefix.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().expect("driver lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

impl BackupStoreDriver for MemoryDriver {
    fn kind(&self) -> &str {
        "memory"
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", normalize(path));
        let objects = self.objects.read().expect("driver lock poisoned");
        let mut names = BTreeSet::new();
        for key in objects.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                match rest.split('/').next() {
                    Some(name) if !name.is_empty() => {
                        names.insert(name.to_string());
                    }
                    _ => {}
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let objects = self.objects.read().expect("driver lock poisoned");
        objects
            .get(normalize(path))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                path: path.to_string(),
            })
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut objects = self.objects.write().expect("driver lock poisoned");
        objects.insert(normalize(path).to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let prefix = format!("{}/", path);
        let mut objects = self.objects.write().expect("driver lock poisoned");
        objects.remove(path);
        objects.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        let path = normalize(path);
        let prefix = format!("{}/", path);
        let objects = self.objects.read().expect("driver lock poisoned");
        objects.contains_key(path) || objects.keys().any(|key| key.starts_with(&prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_memory_driver_read_write() {
        let driver = MemoryDriver::new();
        driver.write("a/b/c", b"data").unwrap();

        assert_eq!(driver.read("a/b/c").unwrap(), b"data");
        assert!(driver.exists("a/b/c"));
        assert!(driver.exists("a/b"));
        assert!(!driver.exists("a/x"));
    }

    #[test]
    fn test_memory_driver_read_absent() {
        let driver = MemoryDriver::new();
        let err = driver.read("missing").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_memory_driver_list_immediate_children() {
        let driver = MemoryDriver::new();
        driver.write("root/one/file", b"1").unwrap();
        driver.write("root/two", b"2").unwrap();
        driver.write("root/one/nested/file", b"3").unwrap();
        driver.write("other/file", b"4").unwrap();

        assert_eq!(driver.list("root").unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn test_memory_driver_remove_subtree() {
        let driver = MemoryDriver::new();
        driver.write("tree/a", b"1").unwrap();
        driver.write("tree/b/c", b"2").unwrap();
        driver.write("keep", b"3").unwrap();

        driver.remove("tree").unwrap();
        assert!(!driver.exists("tree"));
        assert!(driver.exists("keep"));

        // removing an absent path succeeds
        driver.remove("tree").unwrap();
    }

    #[test]
    fn test_with_retries_gives_up() {
        let retry = RetryConfig {
            attempts: 3,
            backoff_ms: 0,
        };
        let mut calls = 0;
        let result: Result<()> = with_retries(&retry, "test op", || {
            calls += 1;
            Err(Error::Driver {
                path: "p".to_string(),
                reason: "transient".to_string(),
            })
        });

        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_with_retries_does_not_retry_fatal() {
        let retry = RetryConfig {
            attempts: 3,
            backoff_ms: 0,
        };
        let mut calls = 0;
        let result: Result<()> = with_retries(&retry, "test op", || {
            calls += 1;
            Err(Error::ChecksumMismatch {
                expected: "a".to_string(),
                actual: "b".to_string(),
            })
        });

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_with_retries_recovers() {
        let retry = RetryConfig {
            attempts: 3,
            backoff_ms: 0,
        };
        let mut calls = 0;
        let result = with_retries(&retry, "test op", || {
            calls += 1;
            if calls < 2 {
                Err(Error::Driver {
                    path: "p".to_string(),
                    reason: "transient".to_string(),
                })
            } else {
                Ok(42)
            }
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 2);
    }
}
