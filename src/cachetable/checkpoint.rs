//! Checkpoint coordination.
//!
//! A checkpoint drives every pair dirtied before `lsn` to storage and then
//! runs each cachefile's checkpoint hook. The capture pass walks the whole
//! table under the coarse mutex, so the set of pairs belonging to the
//! checkpoint is decided atomically: pages dirtied after the walk belong
//! to the next epoch. Captured pairs are redirected to a private
//! completion queue and drained with the mutex released, so clients and
//! workers run concurrently with the writeback.

use super::*;
use crate::pairtable::NIL;

impl CacheTable {
    /// Runs one checkpoint at `lsn`.
    ///
    /// Single-flight: a checkpoint that finds another in progress returns
    /// without doing anything. Writes performed for the checkpoint carry
    /// `needs_rename` when they would otherwise overwrite a page image the
    /// checkpoint still depends on.
    pub fn checkpoint(&self, lsn: Lsn) -> CacheResult<()> {
        let shared = &self.shared;
        let mut guard = shared.mutex.lock();
        if guard.checkpointing {
            return Ok(());
        }
        guard.checkpointing = true;
        guard.lsn_of_checkpoint = lsn;

        let cq = Arc::new(WorkQueue::new());
        let mut nfound = 0usize;
        let mut evicted = Vec::new();

        // capture pass: one atomic walk of every bucket chain
        for b in 0..guard.table.bucket_count() {
            let mut slot = guard.table.bucket_head(b);
            while slot != NIL {
                let next = guard.table.hash_next(slot);
                let (state, dirty, owned) = {
                    let p = guard.table.pair(slot);
                    (p.state, p.dirty, p.cq.is_some())
                };
                // a pair already redirected to another queue belongs to a
                // per-file drain or a pending remove; its owner writes it out
                if owned {
                    slot = next;
                    continue;
                }
                match state {
                    PairState::Idle => {
                        guard.table.pair_mut(slot).cq = Some(Arc::clone(&cq));
                        nfound += 1;
                        if dirty {
                            CacheShared::flush_and_maybe_remove(shared, &mut guard, slot, false, &mut evicted);
                        } else {
                            // nothing to write; the pair just reports in
                            let _ = cq.enqueue(slot);
                        }
                    }
                    PairState::Writing => {
                        // an eviction already has it in flight; claim the
                        // completion so the write counts for this epoch
                        guard.table.pair_mut(slot).cq = Some(Arc::clone(&cq));
                        nfound += 1;
                    }
                    PairState::Reading | PairState::Invalid => {}
                }
                slot = next;
            }
        }

        // drain pass: wait for every captured pair, mutex released
        for _ in 0..nfound {
            match MutexGuard::unlocked(&mut guard, || cq.dequeue()) {
                Ok(slot) => {
                    if let Some(ev) = shared.finalize_redirected(&mut guard, slot) {
                        evicted.push(ev);
                    }
                }
                Err(_) => break,
            }
        }
        guard.checkpointing = false;
        guard.table.maybe_shrink();
        let files: Vec<Arc<Cachefile>> = guard.files.clone();
        drop(guard);

        for ev in evicted {
            shared.destroy_evicted(ev);
        }
        for cf in files {
            cf.io().checkpoint(&cf, lsn)?;
        }
        Ok(())
    }
}
