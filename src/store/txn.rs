use std::sync::RwLockReadGuard;

use crate::backend::{BatchTx, ReadTx};
use crate::encoding::Value;
use crate::error::{Error, Result};
use crate::index::TreeIndex;
use crate::kv::{KeyValue, LeaseId, RangeOptions, RangeResult, NO_LEASE};
use crate::lease::LeaseItem;
use crate::revision::{rev_bytes_range, Revision};
use crate::store::store::{Store, KEY_BUCKET};

/// A read transaction: a consistent view of the store over the revision
/// range `(compacted, current]` snapshotted at begin.
pub struct ReadTxn<'s> {
    tx: ReadTx,
    store: &'s Store,
    cur_rev: i64,
    compact_rev: i64,
    _permit: RwLockReadGuard<'s, ()>,
}

impl<'s> ReadTxn<'s> {
    pub(super) fn new(
        store: &'s Store,
        tx: ReadTx,
        cur_rev: i64,
        compact_rev: i64,
        permit: RwLockReadGuard<'s, ()>,
    ) -> Self {
        Self {
            tx,
            store,
            cur_rev,
            compact_rev,
            _permit: permit,
        }
    }

    /// The first queryable revision.
    pub fn first_rev(&self) -> i64 {
        self.compact_rev + 1
    }

    /// The current revision as of transaction begin.
    pub fn rev(&self) -> i64 {
        self.cur_rev
    }

    /// Reads keys in `[start, end)` at `opts.rev` (current revision when
    /// `<= 0`). An empty `end` is a single-key lookup.
    pub fn range(&self, start: &[u8], end: &[u8], opts: RangeOptions) -> Result<RangeResult> {
        range_keys(
            &self.store.index,
            self.cur_rev,
            self.compact_rev,
            start,
            end,
            opts,
            |rev| {
                let (start, end) = rev_bytes_range(rev);
                let (_, values) = self.tx.range(KEY_BUCKET, &start, Some(&end), 0);
                values
            },
        )
    }
}

/// The exclusive write transaction. Mutations stage rows under the pending
/// revision `begin_rev + 1`; ending the transaction makes that revision
/// current.
///
/// Field order encodes the unlock order: the batch lock is released before
/// the store read permit.
pub struct WriteTxn<'s> {
    batch: BatchTx,
    store: &'s Store,
    begin_rev: i64,
    changes: usize,
    _permit: RwLockReadGuard<'s, ()>,
}

impl<'s> WriteTxn<'s> {
    pub(super) fn new(
        store: &'s Store,
        batch: BatchTx,
        begin_rev: i64,
        permit: RwLockReadGuard<'s, ()>,
    ) -> Self {
        Self {
            batch,
            store,
            begin_rev,
            changes: 0,
            _permit: permit,
        }
    }

    /// The revision the transaction's mutations will commit at.
    pub fn rev(&self) -> i64 {
        self.begin_rev
    }

    /// Writes `key = value`, bound to `lease` when non-zero. Returns the
    /// revision the write commits at.
    ///
    /// Lease bookkeeping failures are fatal: the row is already staged, so
    /// continuing would desynchronize the lessor from the store.
    pub fn put(&mut self, key: &[u8], value: &[u8], lease: LeaseId) -> i64 {
        let rev = self.begin_rev + 1;
        let mut create_rev = rev;
        let mut version = 1;
        let mut old_lease = NO_LEASE;

        // An existing key keeps its creation revision and counts up its
        // version; its previous lease binding is replaced.
        if let Ok((modified, created, ver)) = self.store.index.get(key, rev) {
            create_rev = created.main;
            version = ver + 1;
            if self.store.lessor.is_some() {
                old_lease = self.stored_record(modified).lease;
            }
        }

        let idx_rev = Revision::new(rev, self.changes as i64);
        let kv = KeyValue {
            key: key.to_vec(),
            value: value.to_vec(),
            create_revision: create_rev,
            mod_revision: rev,
            version,
            lease,
        };
        self.batch.put(KEY_BUCKET, &idx_rev.to_bytes(), &kv.encode());
        self.store.index.put(key, idx_rev);
        self.changes += 1;

        if old_lease != NO_LEASE {
            let lessor = self.store.lessor.as_ref().unwrap();
            if let Err(err) = lessor.detach(old_lease, &[LeaseItem::new(key)]) {
                panic!("failed to detach old lease from key: {err}");
            }
        }
        if lease != NO_LEASE {
            let Some(lessor) = self.store.lessor.as_ref() else {
                panic!("no lessor to attach lease");
            };
            if let Err(err) = lessor.attach(lease, &[LeaseItem::new(key)]) {
                panic!("failed to attach lease to key: {err}");
            }
        }

        rev
    }

    /// Deletes every key in `[start, end)` present at the in-flight
    /// revision. Returns the number of deleted keys and the revision the
    /// deletes commit at (unchanged when nothing matched).
    pub fn delete_range(&mut self, start: &[u8], end: &[u8]) -> (i64, i64) {
        let mut rrev = self.begin_rev;
        if self.changes > 0 {
            rrev += 1;
        }
        let end = if end.is_empty() { None } else { Some(end) };
        let (keys, _) = self.store.index.range(start, end, rrev);
        if keys.is_empty() {
            return (0, self.begin_rev);
        }
        for key in &keys {
            self.delete(key);
        }
        (keys.len() as i64, self.begin_rev + 1)
    }

    /// Reads within the transaction, observing its own staged mutations.
    pub fn range(&self, start: &[u8], end: &[u8], opts: RangeOptions) -> Result<RangeResult> {
        let mut rrev = self.begin_rev;
        if self.changes > 0 {
            rrev += 1;
        }
        let compact_rev = self.store.rev.read().unwrap().compact_main_rev;
        range_keys(
            &self.store.index,
            rrev,
            compact_rev,
            start,
            end,
            opts,
            |rev| {
                let (start, end) = rev_bytes_range(rev);
                let (_, values) = self.batch.range(KEY_BUCKET, &start, Some(&end), 0);
                values
            },
        )
    }

    /// Commits the transaction: persists the consistent index, advances the
    /// current revision, and releases the locks in the documented order.
    pub fn end(self) {
        if self.changes > 0 {
            self.store.save_index(&self.batch);
            let mut rev = self.store.rev.write().unwrap();
            rev.current_rev += 1;
            // The revision lock is released here, before the batch lock and
            // the store permit (dropped with self), so a reader that sees
            // the new revision finds the staged batch in the backend.
            drop(rev);
        }
    }

    fn delete(&mut self, key: &[u8]) {
        let idx_rev = Revision::new(self.begin_rev + 1, self.changes as i64);

        // The old binding must be looked up before the index tombstone hides
        // the record.
        let mut old_lease = NO_LEASE;
        if self.store.lessor.is_some() {
            if let Ok((modified, _, _)) = self.store.index.get(key, self.begin_rev + 1) {
                old_lease = self.stored_record(modified).lease;
            }
        }

        // A tombstone row records only the key, so recovery can attribute
        // the deletion.
        let kv = KeyValue {
            key: key.to_vec(),
            ..Default::default()
        };
        self.batch
            .put(KEY_BUCKET, &idx_rev.to_tombstone_bytes(), &kv.encode());
        if let Err(err) = self.store.index.tombstone(key, idx_rev) {
            panic!("cannot tombstone existing key {key:?}: {err}");
        }
        self.changes += 1;

        if old_lease != NO_LEASE {
            let lessor = self.store.lessor.as_ref().unwrap();
            if let Err(err) = lessor.detach(old_lease, &[LeaseItem::new(key)]) {
                panic!("failed to detach lease from deleted key: {err}");
            }
        }
    }

    /// Fetches the stored record at `rev`. The index said it exists, so a
    /// missing or undecodable row is corruption.
    fn stored_record(&self, rev: Revision) -> KeyValue {
        let (start, end) = rev_bytes_range(rev);
        let (_, values) = self.batch.range(KEY_BUCKET, &start, Some(&end), 0);
        decode_row(rev, &values)
    }
}

/// Resolves a range through the key index and fetches each row with
/// `fetch`, which returns the backend values stored at one revision.
fn range_keys(
    index: &TreeIndex,
    cur_rev: i64,
    compact_rev: i64,
    start: &[u8],
    end: &[u8],
    opts: RangeOptions,
    fetch: impl Fn(Revision) -> Vec<Vec<u8>>,
) -> Result<RangeResult> {
    let mut rev = opts.rev;
    if rev > cur_rev {
        return Err(Error::FutureRev);
    }
    if rev <= 0 {
        rev = cur_rev;
    }
    if rev < compact_rev {
        return Err(Error::Compacted);
    }

    let end = if end.is_empty() { None } else { Some(end) };
    let (_, revpairs) = index.range(start, end, rev);
    if revpairs.is_empty() {
        return Ok(RangeResult {
            kvs: Vec::new(),
            count: 0,
            rev: cur_rev,
        });
    }
    if opts.count_only {
        return Ok(RangeResult {
            kvs: Vec::new(),
            count: revpairs.len(),
            rev: cur_rev,
        });
    }

    let mut kvs = Vec::new();
    for revpair in &revpairs {
        let values = fetch(*revpair);
        kvs.push(decode_row(*revpair, &values));
        if opts.limit > 0 && kvs.len() as i64 >= opts.limit {
            break;
        }
    }
    Ok(RangeResult {
        kvs,
        count: revpairs.len(),
        rev: cur_rev,
    })
}

/// Decodes the single row the index promised at `rev`. Durable state that
/// contradicts the index is unrecoverable.
fn decode_row(rev: Revision, values: &[Vec<u8>]) -> KeyValue {
    if values.len() != 1 {
        panic!(
            "revision ({}, {}) has {} backend rows, expected exactly one",
            rev.main,
            rev.sub,
            values.len()
        );
    }
    match KeyValue::decode(&values[0]) {
        Ok(kv) => kv,
        Err(err) => panic!("cannot decode stored record at ({}, {}): {err}", rev.main, rev.sub),
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{BackendConfig, StoreConfig};
    use crate::kv::{RangeOptions, NO_LEASE};
    use crate::store::Store;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Arc<Store> {
        let config =
            StoreConfig::new(dir.path()).backend(BackendConfig::new(dir.path()).fsync(false));
        Store::open(config, None, None).expect("failed to open store")
    }

    #[test]
    fn test_multiple_mutations_share_one_revision() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut txn = store.write().unwrap();
        txn.put(b"a", b"1", NO_LEASE);
        txn.put(b"b", b"2", NO_LEASE);
        txn.put(b"c", b"3", NO_LEASE);
        txn.end();

        // One transaction advances the revision once.
        assert_eq!(store.read_view().rev().unwrap(), 2);
        let result = store
            .read_view()
            .range(b"a", b"z", RangeOptions::default())
            .unwrap();
        assert_eq!(result.kvs.len(), 3);
        for kv in &result.kvs {
            assert_eq!(kv.mod_revision, 2);
        }
    }

    #[test]
    fn test_write_txn_reads_its_own_writes() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut txn = store.write().unwrap();
        txn.put(b"a", b"1", NO_LEASE);
        let result = txn.range(b"a", b"z", RangeOptions::default()).unwrap();
        assert_eq!(result.kvs.len(), 1);
        assert_eq!(result.kvs[0].value, b"1");

        // The staged write also resolves for delete_range within the txn.
        let (n, _) = txn.delete_range(b"a", b"z");
        assert_eq!(n, 1);
        txn.end();

        assert_eq!(store.read_view().rev().unwrap(), 2);
        let result = store
            .read_view()
            .range(b"a", b"z", RangeOptions::default())
            .unwrap();
        assert!(result.kvs.is_empty());
    }

    #[test]
    fn test_reader_at_old_revision_misses_later_writes() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.write_view().put(b"a", b"1", NO_LEASE).unwrap();
        let reader = store.read().unwrap();
        assert_eq!(reader.rev(), 2);
        drop(reader);

        store.write_view().put(b"a", b"2", NO_LEASE).unwrap();

        // A range pinned to the old revision still answers from history.
        let result = store
            .read_view()
            .range(
                b"a",
                b"z",
                RangeOptions {
                    rev: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(result.kvs[0].value, b"1");
        assert_eq!(result.rev, 3);
    }

    #[test]
    fn test_abandoned_txn_does_not_advance_revision() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let txn = store.write().unwrap();
        drop(txn);
        assert_eq!(store.read_view().rev().unwrap(), 1);
    }
}
