use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};

use crate::backend::{Backend, BatchTx, IgnoreKey};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::index::TreeIndex;
use crate::lease::Lessor;
use crate::revision::Revision;
use crate::scheduler::{FifoScheduler, Job, Notify};
use crate::store::{compaction, recovery, ReadTxn, ReadView, WriteTxn, WriteView};

/// Bucket holding revision-keyed rows.
pub const KEY_BUCKET: &str = "key";
/// Bucket holding the fixed-name metadata entries.
pub const META_BUCKET: &str = "meta";

pub(super) const CONSISTENT_INDEX_KEY: &[u8] = b"consistent_index";
pub(super) const SCHEDULED_COMPACT_KEY: &[u8] = b"scheduledCompactRev";
pub(super) const FINISHED_COMPACT_KEY: &[u8] = b"finishedCompactRev";

/// Supplies the replicated-log offset of the entry currently being applied,
/// persisted with every write commit for exactly-once replay.
pub trait ConsistentIndexGetter: Send + Sync {
    fn consistent_index(&self) -> u64;
}

/// The hash ignore set: the consistent index may advance outside the
/// store's own command stream, so peers exclude it from digests.
pub fn default_ignores() -> HashSet<IgnoreKey> {
    let mut ignores = HashSet::new();
    ignores.insert(IgnoreKey::new(META_BUCKET, CONSISTENT_INDEX_KEY));
    ignores
}

/// Revision counters, guarded together so readers snapshot a coherent pair.
#[derive(Debug, Clone, Copy)]
pub(super) struct RevState {
    /// Revision of the last completed write transaction.
    pub current_rev: i64,
    /// Main revision of the last compaction; -1 until one completes.
    pub compact_main_rev: i64,
}

/// Outcome of [`Store::compact`].
///
/// A request at or below the compacted revision is an error for the caller
/// (the history is gone), but it still returns a completion handle routed
/// through the job queue so callers can wait for in-flight compaction work
/// to drain even on a no-op.
pub enum Compaction {
    /// The sweep was scheduled; notified when it completes.
    Scheduled(Notify),
    /// The revision was already compacted; notified once the queue drains.
    AlreadyCompacted(Notify),
}

impl Compaction {
    pub fn done(&self) -> &Notify {
        match self {
            Compaction::Scheduled(done) => done,
            Compaction::AlreadyCompacted(done) => done,
        }
    }
}

/// The MVCC store.
///
/// Lock order is `mu` → backend batch lock → `rev`; the write transaction
/// guard encodes the release order so callers cannot violate it.
pub struct Store {
    pub(super) config: StoreConfig,

    /// Read-locked by every transaction, write-locked by store-wide
    /// operations (restore, commit, compact) so those serialize against all
    /// transaction I/O.
    pub(super) mu: RwLock<()>,

    backend: RwLock<Arc<Backend>>,
    pub(super) index: TreeIndex,

    pub(super) lessor: Option<Arc<dyn Lessor>>,
    ig: Option<Arc<dyn ConsistentIndexGetter>>,

    /// Guards the revision counters. Write-locked at end of write
    /// transaction and by compact; read-locked when a read transaction
    /// snapshots its revision range.
    pub(super) rev: RwLock<RevState>,

    /// Cache of the persisted consistent index for lock-free lookups.
    consistent_index: AtomicU64,

    ignores: HashSet<IgnoreKey>,

    /// The current scheduler generation; replaced on restore, taken on
    /// close.
    pub(super) sched: Mutex<Option<FifoScheduler>>,

    closed: AtomicBool,

    /// Self-reference for jobs that must find the store's current scheduler.
    pub(super) weak: Weak<Store>,
}

impl Store {
    /// Opens the store, recovering all state from the backend directory.
    /// Corrupt rows in durable state are fatal and abort the process.
    pub fn open(
        config: StoreConfig,
        lessor: Option<Arc<dyn Lessor>>,
        ig: Option<Arc<dyn ConsistentIndexGetter>>,
    ) -> Result<Arc<Self>> {
        let backend = Backend::open(&config.backend)?;
        backend.create_bucket(KEY_BUCKET);
        backend.create_bucket(META_BUCKET);

        let store = Arc::new_cyclic(|weak| Self {
            config,
            mu: RwLock::new(()),
            backend: RwLock::new(backend),
            index: TreeIndex::new(),
            lessor,
            ig,
            rev: RwLock::new(RevState {
                current_rev: 1,
                compact_main_rev: -1,
            }),
            consistent_index: AtomicU64::new(0),
            ignores: default_ignores(),
            sched: Mutex::new(Some(FifoScheduler::new())),
            closed: AtomicBool::new(false),
            weak: weak.clone(),
        });

        if let Some(lessor) = &store.lessor {
            let weak = store.weak.clone();
            lessor.set_range_deleter(Box::new(move |start, end| {
                let store = weak.upgrade().ok_or(Error::Closed)?;
                let mut txn = store.write()?;
                let (n, _) = txn.delete_range(start, end);
                txn.end();
                Ok(n)
            }));
        }

        recovery::restore(&store)?;
        Ok(store)
    }

    /// Begins a read transaction at the current revision.
    pub fn read(&self) -> Result<ReadTxn<'_>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let permit = self.mu.read()?;
        let backend = self.backend();
        let (compact_rev, cur_rev) = {
            let rev = self.rev.read()?;
            (rev.compact_main_rev, rev.current_rev)
        };
        Ok(ReadTxn::new(self, backend.read_tx(), cur_rev, compact_rev, permit))
    }

    /// Begins the write transaction. Writers serialize on the backend batch
    /// lock; the store read permit only gates against store-wide operations.
    pub fn write(&self) -> Result<WriteTxn<'_>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let permit = self.mu.read()?;
        let backend = self.backend();
        let batch = backend.batch_tx();
        let begin_rev = self.rev.read()?.current_rev;
        Ok(WriteTxn::new(self, batch, begin_rev, permit))
    }

    /// A facade for one-shot reads.
    pub fn read_view(&self) -> ReadView<'_> {
        ReadView::new(self)
    }

    /// A facade for one-shot writes.
    pub fn write_view(&self) -> WriteView<'_> {
        WriteView::new(self)
    }

    /// Force-commits the backend and digests all buckets minus the ignore
    /// set, paired with the revision the digest covers.
    pub fn hash(&self) -> Result<(u64, i64)> {
        let backend = self.backend();
        backend.force_commit()?;
        let hash = backend.hash(&self.ignores);
        let rev = self.rev.read()?.current_rev;
        Ok((hash, rev))
    }

    /// Persists the consistent index and durably commits the backend,
    /// outside any write transaction.
    pub fn commit(&self) -> Result<()> {
        let _permit = self.mu.write()?;
        let backend = self.backend();
        let batch = backend.batch_tx();
        self.save_index(&batch);
        drop(batch);
        backend.force_commit()
    }

    /// Schedules compaction at `rev`.
    ///
    /// Fails with `FutureRev` beyond the current revision. A request at or
    /// below the compacted revision yields [`Compaction::AlreadyCompacted`];
    /// see that type for the waiting contract.
    pub fn compact(&self, rev: i64) -> Result<Compaction> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let _permit = self.mu.write()?;
        self.compact_inner(rev)
    }

    /// Compaction body, used with `mu` already held (or the store not yet
    /// shared, during recovery).
    pub(super) fn compact_inner(&self, rev: i64) -> Result<Compaction> {
        let mut revs = self.rev.write()?;

        if rev <= revs.compact_main_rev {
            let done = Notify::new();
            self.schedule(compaction::barrier_job(self.weak.clone(), done.clone()));
            return Ok(Compaction::AlreadyCompacted(done));
        }
        if rev > revs.current_rev {
            return Err(Error::FutureRev);
        }

        let start = Instant::now();
        revs.compact_main_rev = rev;

        let backend = self.backend();
        let batch = backend.batch_tx();
        batch.put(
            META_BUCKET,
            SCHEDULED_COMPACT_KEY,
            &Revision::new(rev, 0).to_bytes(),
        );
        drop(batch);
        // The intent must be durable before any row is deleted, so recovery
        // can resume an interrupted sweep.
        backend.force_commit()?;

        let keep = self.index.compact(rev);
        let done = Notify::new();
        self.schedule(compaction::sweep_job(
            self.weak.clone(),
            backend,
            self.config.clone(),
            rev,
            keep,
            done.clone(),
        ));

        tracing::info!(rev, elapsed = ?start.elapsed(), "scheduled compaction");
        Ok(Compaction::Scheduled(done))
    }

    /// Resets in-memory state and recovers from `backend`, resuming any
    /// interrupted compaction. Serializes against every transaction; no
    /// reads are served until recovery has completed.
    pub fn restore(&self, backend: Arc<Backend>) -> Result<()> {
        let _permit = self.mu.write()?;

        self.stop_scheduler();
        backend.create_bucket(KEY_BUCKET);
        backend.create_bucket(META_BUCKET);

        self.consistent_index.store(0, Ordering::SeqCst);
        *self.backend.write()? = backend;
        self.index.clear();
        *self.rev.write()? = RevState {
            current_rev: 1,
            compact_main_rev: -1,
        };
        *self.sched.lock()? = Some(FifoScheduler::new());

        recovery::restore(self)
    }

    /// Stops the scheduler and durably commits the backend. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_scheduler();
        self.backend().force_commit()
    }

    /// The persisted replicated-log offset. Served from the atomic cache;
    /// falls back to the backend the first time.
    pub fn consistent_index(&self) -> u64 {
        let cached = self.consistent_index.load(Ordering::Acquire);
        if cached > 0 {
            return cached;
        }
        let (_, values) = self
            .backend()
            .read_tx()
            .range(META_BUCKET, CONSISTENT_INDEX_KEY, None, 0);
        let Some(value) = values.first() else {
            return 0;
        };
        if value.len() != 8 {
            panic!("malformed consistent index entry of {} bytes", value.len());
        }
        let index = BigEndian::read_u64(value);
        self.consistent_index.store(index, Ordering::Release);
        index
    }

    /// Stages the consistent index into the batch and refreshes the cache.
    pub(super) fn save_index(&self, batch: &BatchTx) {
        let Some(ig) = &self.ig else { return };
        let index = ig.consistent_index();
        let mut buf = [0; 8];
        BigEndian::write_u64(&mut buf, index);
        batch.put(META_BUCKET, CONSISTENT_INDEX_KEY, &buf);
        self.consistent_index.store(index, Ordering::Release);
    }

    pub(super) fn backend(&self) -> Arc<Backend> {
        self.backend.read().unwrap().clone()
    }

    pub(super) fn schedule(&self, job: Job) -> bool {
        match self.sched.lock().unwrap().as_ref() {
            Some(sched) => sched.schedule(job),
            None => false,
        }
    }

    fn stop_scheduler(&self) {
        let sched = self.sched.lock().unwrap().take();
        if let Some(sched) = sched {
            sched.stop();
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Background jobs must not outlive the store. Durability is the
        // caller's call via close(); a plain drop keeps crash semantics.
        self.stop_scheduler();
    }
}
