use std::collections::HashMap;
use std::sync::mpsc;
use std::thread;

use crate::encoding::Value;
use crate::error::Result;
use crate::kv::{KeyValue, LeaseId, NO_LEASE};
use crate::lease::LeaseItem;
use crate::revision::{self, Revision};
use crate::store::store::{
    Store, FINISHED_COMPACT_KEY, KEY_BUCKET, META_BUCKET, SCHEDULED_COMPACT_KEY,
};

/// One parsed backend row, in revision order.
struct RestoreRow {
    rev: Revision,
    tombstone: bool,
    key: Vec<u8>,
    create_rev: i64,
    version: i64,
}

/// Rebuilds all in-memory state from the backend: seeds the compaction
/// marks, replays every revision row into the key index, re-attaches
/// leases, and resumes an interrupted compaction.
///
/// Must not race transactions: callers either hold the store's write lock
/// or have not shared the store yet. Unparseable durable rows are fatal.
pub(super) fn restore(store: &Store) -> Result<()> {
    let backend = store.backend();
    let tx = backend.read_tx();

    let mut compact_main_rev = -1;
    let (_, finished) = tx.range(META_BUCKET, FINISHED_COMPACT_KEY, None, 0);
    if let Some(value) = finished.first() {
        compact_main_rev = decode_meta_rev(value).main;
        tracing::info!(rev = compact_main_rev, "restored compacted revision");
    }
    let mut scheduled_compact = 0;
    let (_, scheduled) = tx.range(META_BUCKET, SCHEDULED_COMPACT_KEY, None, 0);
    if let Some(value) = scheduled.first() {
        scheduled_compact = decode_meta_rev(value).main;
    }

    let mut key_to_lease: HashMap<Vec<u8>, LeaseId> = HashMap::new();
    let mut current_rev = 1i64;

    let chunk_size = store.config.restore_chunk_size;
    let mut min = Revision::new(1, 0).to_bytes();
    let max = Revision::new(i64::MAX, i64::MAX).to_bytes();

    // The index is rebuilt concurrently: this thread scans and parses rows,
    // the builder thread applies them in revision order. The bounded channel
    // keeps at most one chunk in flight so rows do not pile up in memory;
    // dropping the sender shuts the builder down.
    thread::scope(|scope| {
        let (chunk_tx, chunk_rx) = mpsc::sync_channel::<Vec<RestoreRow>>(1);
        let index = &store.index;
        let builder = scope.spawn(move || {
            for chunk in chunk_rx {
                for row in chunk {
                    if row.tombstone {
                        if index.tombstone(&row.key, row.rev).is_err() {
                            tracing::warn!(
                                key = ?row.key,
                                rev = row.rev.main,
                                "dropping tombstone for unknown key"
                            );
                        }
                    } else {
                        index.restore(
                            &row.key,
                            Revision::new(row.create_rev, 0),
                            row.rev,
                            row.version,
                        );
                    }
                }
            }
        });

        loop {
            let (keys, values) = tx.range(KEY_BUCKET, &min, Some(&max), chunk_size as i64);
            if keys.is_empty() {
                break;
            }

            let mut last_rev = Revision::default();
            let mut rows = Vec::with_capacity(keys.len());
            for (key, value) in keys.iter().zip(values.iter()) {
                let rev = match Revision::from_bytes(key) {
                    Ok(rev) => rev,
                    Err(err) => panic!("invalid revision key in backend: {err}"),
                };
                let kv = match KeyValue::decode(value) {
                    Ok(kv) => kv,
                    Err(err) => panic!(
                        "cannot decode stored record at ({}, {}): {err}",
                        rev.main, rev.sub
                    ),
                };

                current_rev = rev.main;
                last_rev = rev;
                let tombstone = revision::is_tombstone(key);
                if tombstone || kv.lease == NO_LEASE {
                    key_to_lease.remove(&kv.key);
                } else {
                    key_to_lease.insert(kv.key.clone(), kv.lease);
                }

                rows.push(RestoreRow {
                    rev,
                    tombstone,
                    key: kv.key,
                    create_rev: kv.create_revision,
                    version: kv.version,
                });
            }

            let fetched = keys.len();
            if chunk_tx.send(rows).is_err() {
                break;
            }
            if fetched < chunk_size {
                // A partial chunk is the final chunk.
                break;
            }
            min = Revision::new(last_rev.main, last_rev.sub + 1).to_bytes();
        }

        drop(chunk_tx);
        if let Err(panic) = builder.join() {
            std::panic::resume_unwind(panic);
        }
    });

    {
        let mut rev = store.rev.write()?;
        rev.compact_main_rev = compact_main_rev;
        rev.current_rev = current_rev.max(1);
        // Every key at or below the compaction may have been deleted; the
        // compacted revision is then the true current revision.
        if rev.current_rev < compact_main_rev {
            rev.current_rev = compact_main_rev;
        }
    }
    if scheduled_compact <= compact_main_rev {
        scheduled_compact = 0;
    }

    for (key, lease) in key_to_lease {
        let Some(lessor) = &store.lessor else {
            panic!("no lessor to attach lease");
        };
        if let Err(err) = lessor.attach(lease, &[LeaseItem { key }]) {
            tracing::error!(error = %err, "failed to re-attach lease during recovery");
        }
    }

    if scheduled_compact != 0 && store.compact_inner(scheduled_compact).is_ok() {
        tracing::info!(rev = scheduled_compact, "resume scheduled compaction");
    }

    Ok(())
}

fn decode_meta_rev(value: &[u8]) -> Revision {
    match Revision::from_bytes(value) {
        Ok(rev) => rev,
        Err(err) => panic!("cannot decode compaction mark: {err}"),
    }
}
