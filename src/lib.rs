pub mod backend;
pub mod config;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod index;
pub mod kv;
pub mod lease;
pub mod revision;
pub mod scheduler;
pub mod store;

pub use config::{BackendConfig, StoreConfig};
pub use error::{Error, Result};
pub use kv::{KeyValue, LeaseId, RangeOptions, RangeResult, NO_LEASE};
pub use revision::Revision;
pub use store::{Compaction, ConsistentIndexGetter, Store};
