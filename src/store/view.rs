use crate::error::Result;
use crate::kv::{LeaseId, RangeOptions, RangeResult};
use crate::store::Store;

/// One-shot read operations. Each call opens a read transaction, performs
/// the operation, and ends the transaction, so callers never touch the
/// store's lock protocol.
pub struct ReadView<'s> {
    store: &'s Store,
}

impl<'s> ReadView<'s> {
    pub(super) fn new(store: &'s Store) -> Self {
        Self { store }
    }

    /// The first queryable revision. Reading below it fails with
    /// `Compacted`.
    pub fn first_rev(&self) -> Result<i64> {
        Ok(self.store.read()?.first_rev())
    }

    /// The current revision.
    pub fn rev(&self) -> Result<i64> {
        Ok(self.store.read()?.rev())
    }

    /// Reads keys in `[start, end)`; see [`crate::RangeOptions`].
    pub fn range(&self, start: &[u8], end: &[u8], opts: RangeOptions) -> Result<RangeResult> {
        self.store.read()?.range(start, end, opts)
    }
}

/// One-shot write operations; each one is a full write transaction.
pub struct WriteView<'s> {
    store: &'s Store,
}

impl<'s> WriteView<'s> {
    pub(super) fn new(store: &'s Store) -> Self {
        Self { store }
    }

    /// Writes `key = value` bound to `lease`, returning the revision the
    /// write committed at.
    pub fn put(&self, key: &[u8], value: &[u8], lease: LeaseId) -> Result<i64> {
        let mut txn = self.store.write()?;
        let rev = txn.put(key, value, lease);
        txn.end();
        Ok(rev)
    }

    /// Deletes keys in `[start, end)`, returning the number deleted and the
    /// revision the deletes committed at.
    pub fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<(i64, i64)> {
        let mut txn = self.store.write()?;
        let result = txn.delete_range(start, end);
        txn.end();
        Ok(result)
    }
}
