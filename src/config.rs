use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the backend bucket store.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Directory holding the commit log and lock file.
    pub dir: PathBuf,

    /// Fsync the commit log on every durable commit (default: true).
    /// Disabling trades crash safety for speed; useful in tests.
    pub fsync: bool,
}

/// Configuration for the MVCC store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Backend configuration.
    pub backend: BackendConfig,

    /// Number of rows scanned per chunk while rebuilding the key index on
    /// recovery (default: 10000).
    pub restore_chunk_size: usize,

    /// Number of revision keys processed per compaction sweep batch
    /// (default: 10000).
    pub compaction_batch_size: usize,

    /// Pause between compaction sweep batches, keeping the batch lock
    /// available to writers (default: 100ms).
    pub compaction_batch_interval: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./mvstore"),
            fsync: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            restore_chunk_size: 10000,
            compaction_batch_size: 10000,
            compaction_batch_interval: Duration::from_millis(100),
        }
    }
}

impl BackendConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Toggle fsync on durable commit
    pub fn fsync(mut self, enabled: bool) -> Self {
        self.fsync = enabled;
        self
    }
}

impl StoreConfig {
    /// Create a new config with the given backend directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendConfig::new(dir),
            ..Default::default()
        }
    }

    /// Set the recovery scan chunk size
    pub fn restore_chunk_size(mut self, size: usize) -> Self {
        self.restore_chunk_size = size;
        self
    }

    /// Set the compaction sweep batch size
    pub fn compaction_batch_size(mut self, size: usize) -> Self {
        self.compaction_batch_size = size;
        self
    }

    /// Set the pause between compaction sweep batches
    pub fn compaction_batch_interval(mut self, interval: Duration) -> Self {
        self.compaction_batch_interval = interval;
        self
    }

    /// Configure the backend
    pub fn backend(mut self, config: BackendConfig) -> Self {
        self.backend = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.restore_chunk_size, 10000);
        assert_eq!(config.compaction_batch_size, 10000);
        assert_eq!(config.compaction_batch_interval, Duration::from_millis(100));
        assert!(config.backend.fsync);
    }

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::new("/tmp/test")
            .restore_chunk_size(100)
            .compaction_batch_size(50)
            .compaction_batch_interval(Duration::from_millis(5))
            .backend(BackendConfig::new("/tmp/test").fsync(false));

        assert_eq!(config.backend.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.restore_chunk_size, 100);
        assert_eq!(config.compaction_batch_size, 50);
        assert!(!config.backend.fsync);
    }
}
