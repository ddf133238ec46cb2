//! Transactional bucket store.
//!
//! The backend keeps named buckets of byte keys in concurrent ordered maps
//! and makes committed batches durable through an append-only, checksummed
//! commit log. It is not itself MVCC-aware: it provides ordered byte storage
//! with one exclusive batch writer, concurrent snapshot-free readers, and an
//! atomic durable commit. Mutations staged through the batch transaction are
//! visible to readers immediately; the store's revision protocol decides when
//! readers may observe them, and `force_commit` decides when they are
//! durable.

pub mod log;

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use crossbeam_skiplist::SkipMap;

use crate::config::BackendConfig;
use crate::error::Result;
use crate::flock::FileLock;
use crate::hasher::Hasher;
use log::{CommitLog, LogOp};

const LOCK_FILE: &str = "mvstore.lock";
const LOG_FILE: &str = "commit.log";

type Bucket = Arc<SkipMap<Vec<u8>, Vec<u8>>>;

/// A `(bucket, key)` pair excluded from [`Backend::hash`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IgnoreKey {
    pub bucket: String,
    pub key: Vec<u8>,
}

impl IgnoreKey {
    pub fn new(bucket: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

#[derive(Default)]
struct BatchLock {
    held: Mutex<bool>,
    cv: Condvar,
}

impl BatchLock {
    fn acquire(&self) {
        let mut held = self.held.lock().unwrap();
        while *held {
            held = self.cv.wait(held).unwrap();
        }
        *held = true;
    }

    fn release(&self) {
        *self.held.lock().unwrap() = false;
        self.cv.notify_one();
    }
}

/// Durable bucket store shared by one batch writer and many readers.
pub struct Backend {
    buckets: RwLock<BTreeMap<String, Bucket>>,
    /// Operations staged since the last commit, in staging order.
    pending: Mutex<Vec<LogOp>>,
    log: Mutex<CommitLog>,
    batch: BatchLock,
    _lock: FileLock,
}

impl Backend {
    /// Opens the backend directory, replaying the commit log into memory.
    pub fn open(config: &BackendConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.dir)?;
        let lock = FileLock::acquire(config.dir.join(LOCK_FILE))?;

        let mut log = CommitLog::open(config.dir.join(LOG_FILE), config.fsync)?;
        let batches = log.replay()?;

        let backend = Self {
            buckets: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(Vec::new()),
            log: Mutex::new(log),
            batch: BatchLock::default(),
            _lock: lock,
        };
        let mut replayed = 0;
        for batch in batches {
            replayed += batch.len();
            for op in batch {
                backend.apply(op);
            }
        }
        if replayed > 0 {
            tracing::debug!(ops = replayed, "replayed commit log");
        }

        Ok(Arc::new(backend))
    }

    /// Creates the named bucket if it does not exist.
    pub fn create_bucket(&self, name: &str) {
        self.buckets
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(SkipMap::new()));
    }

    /// Acquires the exclusive batch transaction. Writers serialize on this
    /// lock; the returned handle releases it on drop.
    pub fn batch_tx(self: &Arc<Self>) -> BatchTx {
        self.batch.acquire();
        BatchTx {
            backend: Arc::clone(self),
        }
    }

    /// Opens a read transaction. Readers never block the batch writer.
    pub fn read_tx(self: &Arc<Self>) -> ReadTx {
        ReadTx {
            backend: Arc::clone(self),
        }
    }

    /// Flushes the staged batch to the commit log and durably commits it.
    /// Subsequent staging starts a fresh batch.
    pub fn force_commit(&self) -> Result<()> {
        self.batch.acquire();
        let result = self.commit_pending();
        self.batch.release();
        result
    }

    /// Deterministic digest over every bucket entry in (bucket name, key)
    /// order, excluding entries in `ignores`.
    pub fn hash(&self, ignores: &HashSet<IgnoreKey>) -> u64 {
        let buckets = self.buckets.read().unwrap();
        let mut hasher = Hasher::new();
        for (name, bucket) in buckets.iter() {
            for entry in bucket.iter() {
                let ignored = ignores
                    .iter()
                    .any(|ig| ig.bucket == *name && ig.key == *entry.key());
                if ignored {
                    continue;
                }
                hasher.update(name.as_bytes(), entry.key(), entry.value());
            }
        }
        hasher.finish()
    }

    fn commit_pending(&self) -> Result<()> {
        let ops = {
            let mut pending = self.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        if ops.is_empty() {
            return Ok(());
        }
        self.log.lock().unwrap().append(&ops)
    }

    fn bucket(&self, name: &str) -> Bucket {
        let buckets = self.buckets.read().unwrap();
        match buckets.get(name) {
            Some(bucket) => Arc::clone(bucket),
            None => panic!("bucket {name:?} does not exist"),
        }
    }

    fn apply(&self, op: LogOp) {
        match op {
            LogOp::Put { bucket, key, value } => {
                self.create_bucket(&bucket);
                self.bucket(&bucket).insert(key, value);
            }
            LogOp::Delete { bucket, key } => {
                self.create_bucket(&bucket);
                self.bucket(&bucket).remove(&key);
            }
        }
    }

    fn range_bucket(
        &self,
        bucket: &str,
        start: &[u8],
        end: Option<&[u8]>,
        limit: i64,
    ) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let bucket = self.bucket(bucket);
        let mut keys = Vec::new();
        let mut values = Vec::new();

        match end {
            // Point lookup.
            None => {
                if let Some(entry) = bucket.get(start) {
                    keys.push(entry.key().clone());
                    values.push(entry.value().clone());
                }
            }
            Some(end) => {
                for entry in bucket.range(start.to_vec()..end.to_vec()) {
                    keys.push(entry.key().clone());
                    values.push(entry.value().clone());
                    if limit > 0 && keys.len() as i64 >= limit {
                        break;
                    }
                }
            }
        }

        (keys, values)
    }
}

/// The exclusive write transaction. Mutations are applied to the in-memory
/// buckets immediately and staged for the next durable commit.
pub struct BatchTx {
    backend: Arc<Backend>,
}

impl BatchTx {
    pub fn put(&self, bucket: &str, key: &[u8], value: &[u8]) {
        self.backend.bucket(bucket).insert(key.to_vec(), value.to_vec());
        self.backend.pending.lock().unwrap().push(LogOp::Put {
            bucket: bucket.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    pub fn delete(&self, bucket: &str, key: &[u8]) {
        self.backend.bucket(bucket).remove(key);
        self.backend.pending.lock().unwrap().push(LogOp::Delete {
            bucket: bucket.to_string(),
            key: key.to_vec(),
        });
    }

    /// Returns keys and values in `[start, end)` in ascending key order.
    /// `end == None` is a point lookup at `start`; `limit <= 0` means no
    /// limit.
    pub fn range(
        &self,
        bucket: &str,
        start: &[u8],
        end: Option<&[u8]>,
        limit: i64,
    ) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        self.backend.range_bucket(bucket, start, end, limit)
    }
}

impl Drop for BatchTx {
    fn drop(&mut self) {
        self.backend.batch.release();
    }
}

/// A read transaction. Range reads may run concurrently with each other and
/// with the batch writer.
pub struct ReadTx {
    backend: Arc<Backend>,
}

impl ReadTx {
    /// Same contract as [`BatchTx::range`].
    pub fn range(
        &self,
        bucket: &str,
        start: &[u8],
        end: Option<&[u8]>,
        limit: i64,
    ) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        self.backend.range_bucket(bucket, start, end, limit)
    }
}
