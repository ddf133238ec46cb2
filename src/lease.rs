use crate::error::Result;
use crate::kv::LeaseId;

/// A key bound to a lease.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LeaseItem {
    pub key: Vec<u8>,
}

impl LeaseItem {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }
}

/// Deletes every key in `[start, end)` through a store write transaction,
/// returning the number of deleted keys. Installed on the lessor so that an
/// expiring lease can remove its attached keys.
pub type RangeDeleter = Box<dyn Fn(&[u8], &[u8]) -> Result<i64> + Send + Sync>;

/// The lease manager as seen by the store.
///
/// The store attaches a key to its lease on put, detaches it on overwrite
/// and delete, and re-attaches surviving bindings after recovery. Lease
/// bookkeeping itself (grants, expiry) lives outside the store.
pub trait Lessor: Send + Sync {
    /// Binds `items` to the lease.
    fn attach(&self, id: LeaseId, items: &[LeaseItem]) -> Result<()>;

    /// Removes the binding of `items` from the lease.
    fn detach(&self, id: LeaseId, items: &[LeaseItem]) -> Result<()>;

    /// Installs the callback the lessor invokes when a lease expires, to
    /// delete all attached keys.
    fn set_range_deleter(&self, deleter: RangeDeleter);
}
