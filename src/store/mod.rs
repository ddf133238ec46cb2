//! Multi-version key-value store.
//!
//! This module orchestrates the storage core: user keys live under a
//! monotonically increasing revision space, reads are answered at any
//! non-compacted revision, and superseded versions are physically reclaimed
//! by a background sweep.
//!
//! # Architecture
//!
//! ```text
//!           ┌────────────┐     ┌─────────────┐
//!  writes──▶│ Write txn  │────▶│  Key index  │ (ordered, in-memory)
//!           └─────┬──────┘     └──────▲──────┘
//!                 │ revision rows     │ rebuild on recovery
//!                 ▼                   │
//!           ┌────────────┐     ┌──────┴──────┐
//!           │  Backend   │◀────│  Read txn   │◀──reads
//!           │ (buckets + │     └─────────────┘
//!           │ commit log)│
//!           └─────▲──────┘
//!                 │ sweep deletes superseded rows
//!           ┌─────┴──────┐
//!           │  FIFO      │
//!           │ scheduler  │
//!           └────────────┘
//! ```
//!
//! # Write path
//!
//! A write transaction takes the store's read permit, the backend batch
//! lock, and stages one row per mutation under a 16-byte (live) or 17-byte
//! (tombstone) revision key while updating the key index. Ending the
//! transaction persists the consistent index, bumps the current revision,
//! and releases locks in revision-lock, batch-lock, permit order so a
//! reader that observes the new revision always sees the staged batch.
//!
//! # Read path
//!
//! A read transaction snapshots `(compacted revision + 1, current
//! revision)` and resolves keys through the index, fetching each row from
//! the backend by its revision key. Reads below the compacted revision fail
//! with `Compacted`, reads above the current revision with `FutureRev`.
//!
//! # Compaction
//!
//! `compact(rev)` records the intent durably, prunes the key index, and
//! schedules a sweep that deletes every unretained row at revisions at or
//! below `rev`, in batches, before durably marking the compaction finished.
//! Recovery resumes an interrupted sweep from the recorded intent.

pub mod compaction;
pub mod recovery;
pub mod store;
pub mod txn;
pub mod view;

pub use store::{default_ignores, Compaction, ConsistentIndexGetter, Store};
pub use txn::{ReadTxn, WriteTxn};
pub use view::{ReadView, WriteView};
