use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};

use crate::backend::Backend;
use crate::config::StoreConfig;
use crate::revision::Revision;
use crate::scheduler::{CancelToken, Job, Notify};
use crate::store::store::{Store, FINISHED_COMPACT_KEY, KEY_BUCKET, META_BUCKET};

/// The sweep job: physically deletes every unretained revision row at or
/// below `compact_rev`, then marks the compaction finished and notifies.
/// If canceled mid-way it falls back to the barrier so a later scheduler
/// generation can still resolve the waiter.
pub(super) fn sweep_job(
    store: Weak<Store>,
    backend: Arc<Backend>,
    config: StoreConfig,
    compact_rev: i64,
    keep: HashSet<Revision>,
    done: Notify,
) -> Job {
    Box::new(move |ctx| {
        if ctx.canceled.is_canceled() {
            retry_barrier(&store, &done);
            return;
        }
        if run_sweep(&backend, &config, compact_rev, &keep, &ctx.canceled) {
            done.notify();
        } else {
            retry_barrier(&store, &done);
        }
    })
}

/// A barrier job resolves its waiter once the queue reaches it. When the
/// scheduler is stopping it re-schedules itself onto the store's current
/// scheduler; if the store has stopped for good the waiter is abandoned.
pub(super) fn barrier_job(store: Weak<Store>, done: Notify) -> Job {
    Box::new(move |ctx| {
        if !ctx.canceled.is_canceled() {
            done.notify();
            return;
        }
        retry_barrier(&store, &done);
    })
}

fn retry_barrier(store: &Weak<Store>, done: &Notify) {
    let Some(store) = store.upgrade() else { return };
    let requeued = store.schedule(barrier_job(store.weak.clone(), done.clone()));
    if !requeued {
        tracing::debug!("abandoning compaction barrier on stopped store");
    }
}

/// Deletes unretained rows in batches, pausing between batches so the batch
/// lock stays available to writers. Returns false when canceled before
/// finishing. Backend commit failures here are fatal: partial deletion with
/// no durable progress mark cannot be reasoned about.
fn run_sweep(
    backend: &Arc<Backend>,
    config: &StoreConfig,
    compact_rev: i64,
    keep: &HashSet<Revision>,
    canceled: &CancelToken,
) -> bool {
    let total_start = Instant::now();

    // An 8-byte end bound: every 16- or 17-byte key whose main revision is
    // at most compact_rev sorts below it.
    let mut end = [0; 8];
    BigEndian::write_i64(&mut end, compact_rev + 1);

    let batch_size = config.compaction_batch_size as i64;
    let mut last = vec![0; 8];
    loop {
        let mut rev = Revision::default();

        let batch = backend.batch_tx();
        let (keys, _) = batch.range(KEY_BUCKET, &last, Some(&end), batch_size);
        for key in &keys {
            rev = match Revision::from_bytes(key) {
                Ok(rev) => rev,
                Err(err) => panic!("invalid revision key in backend: {err}"),
            };
            if !keep.contains(&rev) {
                batch.delete(KEY_BUCKET, key);
            }
        }

        if (keys.len() as i64) < batch_size {
            batch.put(
                META_BUCKET,
                FINISHED_COMPACT_KEY,
                &Revision::new(compact_rev, 0).to_bytes(),
            );
            drop(batch);
            if let Err(err) = backend.force_commit() {
                panic!("failed to commit finished compaction: {err}");
            }
            tracing::info!(
                rev = compact_rev,
                elapsed = ?total_start.elapsed(),
                "finished scheduled compaction"
            );
            return true;
        }

        // Resume after the last processed revision; commit the deletes
        // instead of letting them pile up in one batch.
        last = Revision::new(rev.main, rev.sub + 1).to_bytes();
        drop(batch);
        if let Err(err) = backend.force_commit() {
            panic!("failed to commit compaction batch: {err}");
        }

        if canceled.is_canceled() {
            tracing::info!(rev = compact_rev, "compaction sweep canceled");
            return false;
        }
        std::thread::sleep(config.compaction_batch_interval);
    }
}
