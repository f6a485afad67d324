//! Transactions over the recursive journal lock.
//!
//! A thread holds at most one running transaction; nested starts on the
//! same thread rejoin it and only the outermost [`Transaction::done`]
//! commits. A nested abort dooms the whole transaction: the outermost
//! `done` then aborts and reports [`BfsError::Aborted`].

use crate::{Counters, Journal, TxnState};
use bfs_block::{BlockCache, BlockRef, BlockRefMut};
use bfs_error::{BfsError, Result};
use bfs_types::lock_order::{self, LevelToken, LockLevel};
use bfs_types::{BlockNumber, TxnId};
use parking_lot::ReentrantMutexGuard;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Observer for the end of the outermost transaction.
pub trait TransactionListener: Send + Sync {
    /// `success` is false when the transaction aborted.
    fn transaction_done(&self, success: bool);
}

/// A writable block tied to the transaction that dirtied it. The borrow
/// keeps the guard from outliving [`Transaction::done`] or
/// [`Transaction::abort`].
pub struct TxnBlockMut<'t> {
    inner: BlockRefMut,
    _txn: PhantomData<&'t ()>,
}

impl TxnBlockMut<'_> {
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.inner.block()
    }
}

impl Deref for TxnBlockMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner
    }
}

impl DerefMut for TxnBlockMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.inner
    }
}

impl std::fmt::Debug for TxnBlockMut<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnBlockMut")
            .field("block", &self.block())
            .finish_non_exhaustive()
    }
}

/// Handle on the running transaction of the current thread.
///
/// Dropping it without [`done`](Self::done) aborts. Must not be held across
/// a nested [`start`](Self::start) together with a block guard: separation
/// snapshots every dirty block.
pub struct Transaction<'j> {
    journal: &'j Journal,
    state: ReentrantMutexGuard<'j, RefCell<TxnState>>,
    finished: bool,
    _level: LevelToken,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Transaction")
            .field("txn", &state.cache_txn)
            .field("depth", &state.depth)
            .field("doomed", &state.doomed)
            .finish_non_exhaustive()
    }
}

impl<'j> Transaction<'j> {
    /// Start a transaction, or rejoin the one this thread is running.
    ///
    /// With `allow_subtransactions`, a rejoin first separates the work done
    /// so far into its own log entry once it reaches the configured size.
    pub fn start(journal: &'j Journal, allow_subtransactions: bool) -> Result<Self> {
        let level = lock_order::enter(LockLevel::Journal);
        let state = journal.lock.lock();
        journal.begin(&state, allow_subtransactions)?;
        Ok(Self {
            journal,
            state,
            finished: false,
            _level: level,
        })
    }

    /// Cache transaction that currently collects dirty blocks. Changes when
    /// a nested start separates the transaction.
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.state.borrow().cache_txn.unwrap_or(TxnId(0))
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.state.borrow().depth
    }

    #[must_use]
    pub fn is_doomed(&self) -> bool {
        self.state.borrow().doomed
    }

    #[must_use]
    pub fn journal(&self) -> &'j Journal {
        self.journal
    }

    #[must_use]
    pub fn cache(&self) -> &'j Arc<BlockCache> {
        self.journal.cache()
    }

    pub fn get(&self, block: BlockNumber) -> Result<BlockRef> {
        self.cache().get(block)
    }

    /// Writable access; the block joins this transaction.
    pub fn get_writable(&self, block: BlockNumber) -> Result<TxnBlockMut<'_>> {
        let inner = self.cache().get_writable(self.id(), block)?;
        Ok(TxnBlockMut {
            inner,
            _txn: PhantomData,
        })
    }

    /// Writable access to a zero-filled block whose old content is
    /// irrelevant (freshly allocated).
    pub fn get_empty(&self, block: BlockNumber) -> Result<TxnBlockMut<'_>> {
        let inner = self.cache().get_empty(self.id(), block)?;
        Ok(TxnBlockMut {
            inner,
            _txn: PhantomData,
        })
    }

    /// Register `listener` for the end of the outermost transaction. A
    /// listener already registered is not added twice.
    pub fn add_listener(&self, listener: Arc<dyn TransactionListener>) {
        let mut state = self.state.borrow_mut();
        let known = state
            .listeners
            .iter()
            .any(|existing| std::ptr::addr_eq(Arc::as_ptr(existing), Arc::as_ptr(&listener)));
        if !known {
            state.listeners.push(listener);
        }
    }

    /// Finish this level. The outermost level commits.
    pub fn done(mut self) -> Result<()> {
        self.finished = true;
        self.journal.end(&self.state, true)
    }

    /// Abort this level. Aborting a nested level dooms the whole
    /// transaction.
    pub fn abort(mut self) {
        self.finished = true;
        if let Err(err) = self.journal.end(&self.state, false) {
            warn!(target: "bfs::journal", error = %err, "journal_abort_failed");
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(target: "bfs::journal", txn = self.id().0, "journal_txn_dropped");
            if let Err(err) = self.journal.end(&self.state, false) {
                warn!(target: "bfs::journal", error = %err, "journal_abort_failed");
            }
        }
    }
}

impl Journal {
    fn begin(&self, cell: &RefCell<TxnState>, allow_subtransactions: bool) -> Result<()> {
        let shared = &self.shared;
        let mut state = cell.borrow_mut();
        if state.depth == 0 {
            shared.cache.health().check_writable()?;
            shared.ensure_start_room()?;
            let txn = shared.cache.start_transaction();
            state.depth = 1;
            state.cache_txn = Some(txn);
            state.doomed = false;
            trace!(target: "bfs::journal", txn = txn.0, "journal_txn_start");
            return Ok(());
        }

        if allow_subtransactions && !state.doomed {
            if let Some(txn) = state.cache_txn {
                if shared.cache.transaction_block_count(txn) >= shared.config.separate_threshold_blocks
                {
                    let result = shared.commit(txn);
                    if result.is_err() {
                        shared.cache.abort_transaction(txn);
                        state.doomed = true;
                    }
                    state.cache_txn = Some(shared.cache.start_transaction());
                    let seq = result?;
                    Counters::bump(&shared.counters.separations, 1);
                    debug!(
                        target: "bfs::journal",
                        txn = txn.0,
                        seq = seq.map_or(0, |seq| seq.0),
                        "journal_txn_separated"
                    );
                }
            }
        }
        state.depth += 1;
        Ok(())
    }

    fn end(&self, cell: &RefCell<TxnState>, success: bool) -> Result<()> {
        let shared = &self.shared;
        let mut state = cell.borrow_mut();
        if state.depth > 1 {
            state.depth -= 1;
            if !success && !state.doomed {
                state.doomed = true;
                debug!(target: "bfs::journal", depth = state.depth, "journal_nested_abort");
            }
            return Ok(());
        }

        state.depth = 0;
        let txn = state.cache_txn.take();
        let listeners = std::mem::take(&mut state.listeners);
        let doomed = std::mem::replace(&mut state.doomed, false) || !success;
        drop(state);
        let Some(txn) = txn else {
            return Err(BfsError::Invariant(
                "transaction ended without a cache transaction".to_owned(),
            ));
        };

        let outcome = if doomed {
            shared.cache.abort_transaction(txn);
            Counters::bump(&shared.counters.aborts, 1);
            debug!(target: "bfs::journal", txn = txn.0, "journal_txn_abort");
            if success { Err(BfsError::Aborted) } else { Ok(()) }
        } else {
            match shared.commit(txn) {
                Ok(_) => Ok(()),
                Err(err) => {
                    shared.cache.abort_transaction(txn);
                    Counters::bump(&shared.counters.aborts, 1);
                    warn!(target: "bfs::journal", txn = txn.0, error = %err, "journal_commit_failed");
                    Err(err)
                }
            }
        };
        let committed = !doomed && outcome.is_ok();
        for listener in &listeners {
            listener.transaction_done(committed);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{journal, journal_on, manual};
    use crate::JournalConfig;
    use bfs_block::{BlockDevice, mem_block_device};
    use parking_lot::Mutex;
    use std::sync::Barrier;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        outcomes: Mutex<Vec<bool>>,
    }

    impl TransactionListener for Recorder {
        fn transaction_done(&self, success: bool) {
            self.outcomes.lock().push(success);
        }
    }

    #[test]
    fn nested_start_rejoins_outer_transaction() {
        let (_device, journal) = journal(32);
        let outer = Transaction::start(&journal, false).unwrap();
        outer.get_writable(BlockNumber(100)).unwrap().fill(1);
        {
            let inner = Transaction::start(&journal, false).unwrap();
            assert_eq!(inner.id(), outer.id());
            assert_eq!(inner.depth(), 2);
            inner.get_writable(BlockNumber(101)).unwrap().fill(2);
            inner.done().unwrap();
        }
        assert_eq!(journal.stats().commits, 0, "nested done must not commit");
        outer.done().unwrap();
        assert_eq!(journal.stats().commits, 1);
        assert_eq!(journal.log_usage().used, 3);
    }

    #[test]
    fn nested_abort_dooms_outer_transaction() {
        let (_device, journal) = journal(32);
        let outer = Transaction::start(&journal, false).unwrap();
        outer.get_writable(BlockNumber(100)).unwrap().fill(1);
        Transaction::start(&journal, false).unwrap().abort();
        assert!(outer.is_doomed());
        assert!(matches!(outer.done(), Err(BfsError::Aborted)));
        assert_eq!(journal.cache().get(BlockNumber(100)).unwrap()[0], 0);
        assert_eq!(journal.log_usage().used, 0);
    }

    #[test]
    fn drop_without_done_aborts() {
        let (_device, journal) = journal(32);
        {
            let txn = Transaction::start(&journal, false).unwrap();
            txn.get_writable(BlockNumber(100)).unwrap().fill(0xEE);
        }
        assert_eq!(journal.cache().get(BlockNumber(100)).unwrap()[0], 0);
        assert_eq!(journal.stats().aborts, 1);
        // The lock was released.
        Transaction::start(&journal, false).unwrap().done().unwrap();
    }

    #[test]
    fn listeners_hear_the_outcome_once() {
        let (_device, journal) = journal(32);
        let recorder = Arc::new(Recorder::default());

        let txn = Transaction::start(&journal, false).unwrap();
        txn.add_listener(recorder.clone());
        txn.add_listener(recorder.clone());
        txn.get_writable(BlockNumber(100)).unwrap().fill(1);
        txn.done().unwrap();

        let txn = Transaction::start(&journal, false).unwrap();
        txn.add_listener(recorder.clone());
        txn.abort();

        assert_eq!(*recorder.outcomes.lock(), vec![true, false]);
    }

    #[test]
    fn large_transaction_is_separated_on_nested_start() {
        let device: Arc<dyn BlockDevice> = Arc::new(mem_block_device(1024, 2048).unwrap());
        let journal = journal_on(
            device,
            64,
            JournalConfig {
                separate_threshold_blocks: 4,
                ..manual()
            },
        );
        let outer = Transaction::start(&journal, false).unwrap();
        let first = outer.id();
        for block in 100..105 {
            outer.get_writable(BlockNumber(block)).unwrap().fill(1);
        }
        let inner = Transaction::start(&journal, true).unwrap();
        assert_ne!(inner.id(), first);
        assert_eq!(journal.stats().separations, 1);
        assert_eq!(journal.log_usage().pending_entries, 1);
        inner.get_writable(BlockNumber(200)).unwrap().fill(2);
        inner.done().unwrap();
        outer.done().unwrap();
        assert_eq!(journal.log_usage().pending_entries, 2);
    }

    #[test]
    fn other_threads_wait_for_the_outermost_end() {
        let (_device, journal) = journal(64);
        let journal = Arc::new(journal);
        let barrier = Arc::new(Barrier::new(2));

        let outer = Transaction::start(&journal, false).unwrap();
        outer.get_writable(BlockNumber(100)).unwrap().fill(1);

        let worker = {
            let journal = Arc::clone(&journal);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let txn = Transaction::start(&journal, false).unwrap();
                // Sees the committed state of the first transaction.
                let seen = txn.get(BlockNumber(100)).unwrap()[0];
                txn.get_writable(BlockNumber(101)).unwrap().fill(2);
                txn.done().unwrap();
                seen
            })
        };
        barrier.wait();
        thread::sleep(std::time::Duration::from_millis(20));
        outer.done().unwrap();
        assert_eq!(worker.join().unwrap(), 1);
        assert_eq!(journal.stats().commits, 2);
    }
}
