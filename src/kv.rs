use serde::{Deserialize, Serialize};

/// A lease identifier. 0 means the key is not bound to any lease.
pub type LeaseId = i64;

/// The absence of a lease.
pub const NO_LEASE: LeaseId = 0;

/// The record stored in the backend under each revision key.
///
/// The modify revision is implicit in the revision key the record is stored
/// under. Tombstone rows store a record carrying only the user key so that
/// recovery can attribute the deletion to its key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Main revision of the write that created the current generation.
    pub create_revision: i64,
    /// Main revision of the write that produced this record.
    pub mod_revision: i64,
    /// 1 at creation, incremented by every overwrite within a generation.
    pub version: i64,
    pub lease: LeaseId,
}

/// Options for a range read.
#[derive(Clone, Copy, Debug, Default)]
pub struct RangeOptions {
    /// Maximum number of records to return. 0 means no limit.
    pub limit: i64,
    /// Revision to read at. Values <= 0 read at the current revision.
    pub rev: i64,
    /// Count matching records without fetching them.
    pub count_only: bool,
}

/// The result of a range read.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RangeResult {
    pub kvs: Vec<KeyValue>,
    /// The revision the range was answered at.
    pub rev: i64,
    /// Total number of matching records, disregarding `limit`.
    pub count: usize,
}
