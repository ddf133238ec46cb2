//! In-memory key index.
//!
//! Maps every user key to its [`KeyRecord`], the history of revisions that
//! wrote the key. The index is what turns a `(key, at_revision)` question
//! into the exact backend row holding the answer. It is kept in an ordered
//! map so range reads scan keys in byte order, and rebuilt from the backend
//! on recovery.

pub mod key;

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::RwLock;

use itertools::Itertools;

use crate::error::Result;
use crate::revision::Revision;
pub use key::{Generation, KeyRecord};

/// Ordered index over every user key with recorded history.
///
/// Thread-safe: reads take a shared lock, mutations an exclusive one.
/// Writers are additionally serialized by the store's backend batch lock.
pub struct TreeIndex {
    tree: RwLock<BTreeMap<Vec<u8>, KeyRecord>>,
}

impl TreeIndex {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
        }
    }

    /// Records a write of `key` at `rev`, creating the record if absent.
    pub fn put(&self, key: &[u8], rev: Revision) {
        let mut tree = self.tree.write().unwrap();
        match tree.get_mut(key) {
            Some(record) => record.put(rev),
            None => {
                let mut record = KeyRecord::new(key.to_vec());
                record.put(rev);
                tree.insert(key.to_vec(), record);
            }
        }
    }

    /// Continues a record from a stored row during recovery: appends to an
    /// existing record, or seeds a new one with the row's create revision
    /// and version.
    pub fn restore(&self, key: &[u8], created: Revision, modified: Revision, version: i64) {
        let mut tree = self.tree.write().unwrap();
        match tree.get_mut(key) {
            Some(record) => record.put(modified),
            None => {
                let mut record = KeyRecord::new(key.to_vec());
                record.restore(created, modified, version);
                tree.insert(key.to_vec(), record);
            }
        }
    }

    /// Closes the key's current generation at `rev`. Fails with NotFound if
    /// the key has no record or does not currently exist.
    pub fn tombstone(&self, key: &[u8], rev: Revision) -> Result<()> {
        let mut tree = self.tree.write().unwrap();
        match tree.get_mut(key) {
            Some(record) => record.tombstone(rev),
            None => Err(crate::error::Error::NotFound),
        }
    }

    /// Finds `(modified, created, version)` for `key` as of `at_rev`.
    pub fn get(&self, key: &[u8], at_rev: i64) -> Result<(Revision, Revision, i64)> {
        let tree = self.tree.read().unwrap();
        match tree.get(key) {
            Some(record) => record.get(at_rev),
            None => Err(crate::error::Error::NotFound),
        }
    }

    /// Returns the keys present at `at_rev` in `[key, end)` in ascending key
    /// order, with the revision to fetch each one at. `end == None` is a
    /// single-key lookup.
    pub fn range(
        &self,
        key: &[u8],
        end: Option<&[u8]>,
        at_rev: i64,
    ) -> (Vec<Vec<u8>>, Vec<Revision>) {
        let end = match end {
            Some(end) => end,
            None => {
                return match self.get(key, at_rev) {
                    Ok((modified, _, _)) => (vec![key.to_vec()], vec![modified]),
                    Err(_) => (Vec::new(), Vec::new()),
                }
            }
        };

        let tree = self.tree.read().unwrap();
        let mut keys = Vec::new();
        let mut revs = Vec::new();
        let bounds = (Bound::Included(key), Bound::Excluded(end));
        for (k, record) in tree.range::<[u8], _>(bounds) {
            if let Ok((modified, _, _)) = record.get(at_rev) {
                keys.push(k.clone());
                revs.push(modified);
            }
        }
        (keys, revs)
    }

    /// Returns every revision at or after `since_rev` recorded for keys in
    /// `[key, end)`, ordered by revision. Used by watch catch-up.
    pub fn range_since(&self, key: &[u8], end: Option<&[u8]>, since_rev: i64) -> Vec<Revision> {
        let tree = self.tree.read().unwrap();

        let end = match end {
            Some(end) => end,
            None => {
                return match tree.get(key) {
                    Some(record) => record.since(since_rev),
                    None => Vec::new(),
                }
            }
        };

        let bounds = (Bound::Included(key), Bound::Excluded(end));
        tree.range::<[u8], _>(bounds)
            .flat_map(|(_, record)| record.since(since_rev))
            .sorted()
            .collect()
    }

    /// Drops history at or below `at_rev` from every record, removing
    /// records left without history. Returns the set of revisions that must
    /// stay in the backend; every other row at revisions `<= at_rev` is
    /// removable.
    pub fn compact(&self, at_rev: i64) -> HashSet<Revision> {
        let mut available = HashSet::new();
        tracing::info!(rev = at_rev, "compacting key index");
        let mut tree = self.tree.write().unwrap();
        tree.retain(|_, record| {
            record.compact(at_rev, &mut available);
            !record.is_empty()
        });
        available
    }

    /// Drops every record. Used when recovery rebuilds the index.
    pub fn clear(&self) {
        self.tree.write().unwrap().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tree.read().unwrap().len()
    }
}

impl Default for TreeIndex {
    fn default() -> Self {
        Self::new()
    }
}
