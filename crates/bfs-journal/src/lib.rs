#![forbid(unsafe_code)]
//! Write-ahead journal.
//!
//! Every metadata change happens inside a [`Transaction`]. Committing one
//! writes the dirty blocks to the circular log, syncs, publishes the new log
//! head in the journal header, and syncs again. Only then may the blocks
//! reach their final locations, which the background flusher (or
//! [`Journal::flush`]) does before advancing the log tail.
//!
//! ```text
//!   Transaction::done
//!        │ run arrays + shadow data ──▶ log area ──sync──▶ header(log_end) ──sync
//!        ▼
//!   pending entries ──flusher──▶ final locations ──sync──▶ header(log_start) ──sync
//! ```
//!
//! After a crash, [`replay`] re-applies every entry between the tail and the
//! head. Replaying the same log twice yields the same image.

mod flusher;
pub mod format;
mod replay;
mod transaction;

pub use format::{JournalHeader, LogLayout};
pub use replay::{ReplayReport, replay};
pub use transaction::{Transaction, TransactionListener, TxnBlockMut};

use bfs_block::{BlockCache, BlockDevice};
use bfs_error::{BfsError, Result};
use bfs_types::{BlockNumber, LogSequence, TxnId, VolumeGeometry};
use format::RunArray;
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Starts are admitted without a forced flush while at least this share of
/// the log is free.
const START_RESERVE_PERCENT: u64 = 10;

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Wake the flusher once this share of the log is in use.
    pub high_water_percent: u8,
    /// Flush after this long without a high-water wake-up.
    pub flush_interval: Duration,
    /// A nested start that allows sub-transactions separates the running
    /// transaction once it holds this many dirty blocks.
    pub separate_threshold_blocks: usize,
    /// Spawn the background flusher. Without it, entries reach their final
    /// locations only through [`Journal::flush`] or log exhaustion.
    pub start_flusher: bool,
    /// Extra attempts for a failed device sync before the volume is
    /// escalated to read-only.
    pub sync_retries: u32,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            high_water_percent: 50,
            flush_interval: Duration::from_secs(5),
            separate_threshold_blocks: 256,
            start_flusher: true,
            sync_retries: 2,
        }
    }
}

impl JournalConfig {
    fn validate(&self) -> Result<()> {
        if self.high_water_percent == 0 || self.high_water_percent > 100 {
            return Err(BfsError::InvalidArgument(format!(
                "high_water_percent must be in 1..=100, got {}",
                self.high_water_percent
            )));
        }
        if self.separate_threshold_blocks == 0 {
            return Err(BfsError::InvalidArgument(
                "separate_threshold_blocks must be > 0".to_owned(),
            ));
        }
        Ok(())
    }
}

// ── Statistics ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalStats {
    /// Log entries written (separated parts included).
    pub commits: u64,
    /// Outermost transactions that committed without dirty blocks.
    pub empty_commits: u64,
    pub aborts: u64,
    pub separations: u64,
    /// Log blocks written (run arrays and shadow data).
    pub log_blocks_written: u64,
    pub flushes: u64,
    /// Flushes forced by log exhaustion on the foreground path.
    pub forced_flushes: u64,
    pub entries_flushed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    commits: AtomicU64,
    empty_commits: AtomicU64,
    aborts: AtomicU64,
    separations: AtomicU64,
    log_blocks_written: AtomicU64,
    flushes: AtomicU64,
    forced_flushes: AtomicU64,
    entries_flushed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> JournalStats {
        JournalStats {
            commits: self.commits.load(Ordering::Relaxed),
            empty_commits: self.empty_commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            separations: self.separations.load(Ordering::Relaxed),
            log_blocks_written: self.log_blocks_written.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            forced_flushes: self.forced_flushes.load(Ordering::Relaxed),
            entries_flushed: self.entries_flushed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time log occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogUsage {
    pub used: u64,
    pub capacity: u64,
    /// Committed entries not yet written to their final locations.
    pub pending_entries: usize,
    pub next_sequence: LogSequence,
}

// ── Shared state ────────────────────────────────────────────────────────────

/// A committed entry whose blocks still wait for their final-location write.
#[derive(Debug)]
struct PendingEntry {
    sequence: LogSequence,
    /// Log position one past the entry's last block.
    end: u64,
    blocks: Vec<(BlockNumber, Vec<u8>)>,
}

#[derive(Debug)]
struct LogState {
    header: JournalHeader,
    pending: VecDeque<Arc<PendingEntry>>,
    flush_requested: bool,
    shutdown: bool,
}

/// State shared between foreground transactions and the flusher thread.
/// The flusher never touches the journal lock.
pub(crate) struct Shared {
    cache: Arc<BlockCache>,
    layout: LogLayout,
    geometry: VolumeGeometry,
    config: JournalConfig,
    log: Mutex<LogState>,
    wake: Condvar,
    /// Serializes final-location flushes.
    flush_lock: Mutex<()>,
    counters: Counters,
}

impl Shared {
    fn device(&self) -> &Arc<dyn BlockDevice> {
        self.cache.device()
    }

    /// Log an I/O failure and escalate the volume to read-only.
    fn fail(&self, op: &'static str, err: BfsError) -> BfsError {
        error!(target: "bfs::journal", op, error = %err, "journal_io_failed");
        self.cache
            .health()
            .escalate(&format!("journal {op} failed: {err}"));
        err
    }

    fn sync(&self, op: &'static str) -> Result<()> {
        let mut attempt = 0_u32;
        loop {
            match self.device().sync() {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.config.sync_retries => {
                    attempt += 1;
                    warn!(target: "bfs::journal", op, attempt, error = %err, "journal_sync_retry");
                }
                Err(err) => return Err(self.fail(op, err)),
            }
        }
    }

    fn write_log_block(&self, pos: u64, data: &[u8]) -> Result<()> {
        let block = self.layout.physical(pos);
        trace!(target: "bfs::journal", pos, block = block.0, "journal_log_block_write");
        self.device()
            .write_block(block, data)
            .map_err(|err| self.fail("log_write", err))
    }

    /// Write and sync the journal header. Callers hold the log lock.
    fn write_header(&self, header: &JournalHeader) -> Result<()> {
        let encoded = format::encode_header(header, self.cache.block_size());
        self.device()
            .write_block(self.layout.header_block, &encoded)
            .map_err(|err| self.fail("header_write", err))?;
        self.sync("header_sync")
    }

    fn free_log_blocks(&self) -> u64 {
        self.layout.log_size - self.log.lock().header.used()
    }

    fn request_flush(&self) {
        self.log.lock().flush_requested = true;
        self.wake.notify_one();
    }

    /// Flush synchronously unless `needed` log blocks are already free.
    fn make_room(&self, needed: u64) -> Result<()> {
        let free = self.free_log_blocks();
        if free >= needed {
            return Ok(());
        }
        warn!(target: "bfs::journal", needed, free, "journal_forced_flush");
        Counters::bump(&self.counters.forced_flushes, 1);
        self.flush()?;
        let free = self.free_log_blocks();
        if free >= needed {
            Ok(())
        } else {
            Err(BfsError::TransactionTooLarge {
                needed,
                capacity: self.layout.log_size,
            })
        }
    }

    fn ensure_start_room(&self) -> Result<()> {
        let reserve = (self.layout.log_size * START_RESERVE_PERCENT / 100).max(1);
        self.make_room(reserve)
    }

    /// Write the dirty blocks of `txn` as one log entry and pin them in the
    /// cache under its sequence. Returns `None` for an empty transaction.
    ///
    /// On error the caller aborts `txn`; nothing becomes visible on disk
    /// unless the header write went through.
    fn commit(&self, txn: TxnId) -> Result<Option<LogSequence>> {
        let blocks = self.cache.transaction_blocks(txn)?;
        if blocks.is_empty() {
            self.cache.commit_transaction(txn, LogSequence(0));
            Counters::bump(&self.counters.empty_commits, 1);
            return Ok(None);
        }
        let block_size = self.cache.block_size();
        let numbers: Vec<BlockNumber> = blocks.iter().map(|(block, _)| *block).collect();
        let plan = format::plan_entry(&self.geometry, block_size, &numbers)?;
        let needed = (plan.len() + blocks.len()) as u64;
        if needed > self.layout.log_size {
            return Err(BfsError::TransactionTooLarge {
                needed,
                capacity: self.layout.log_size,
            });
        }
        self.make_room(needed)?;

        let (sequence, start) = {
            let log = self.log.lock();
            (log.header.next_sequence, log.header.log_end)
        };
        let mut pos = start;
        for (index, array) in plan.iter().enumerate() {
            let data = &blocks[array.data_start..array.data_end];
            let data_crc = data
                .iter()
                .fold(0, |crc, (_, bytes)| crc32c::crc32c_append(crc, bytes));
            let encoded = format::encode_run_array(
                &RunArray {
                    sequence,
                    last: index + 1 == plan.len(),
                    data_crc,
                    runs: array.runs.clone(),
                },
                block_size,
            )?;
            self.write_log_block(pos, &encoded)?;
            pos += 1;
            for (_, bytes) in data {
                self.write_log_block(pos, bytes)?;
                pos += 1;
            }
        }
        self.sync("log_sync")?;

        let block_count = blocks.len();
        let used = {
            let mut log = self.log.lock();
            let mut header = log.header;
            header.log_end = pos;
            header.next_sequence = sequence.next();
            self.write_header(&header)?;
            log.header = header;
            self.cache.commit_transaction(txn, sequence);
            log.pending.push_back(Arc::new(PendingEntry {
                sequence,
                end: pos,
                blocks,
            }));
            header.used()
        };

        Counters::bump(&self.counters.commits, 1);
        Counters::bump(&self.counters.log_blocks_written, needed);
        debug!(
            target: "bfs::journal",
            seq = sequence.0,
            txn = txn.0,
            blocks = block_count,
            arrays = plan.len(),
            log_used = used,
            "journal_commit"
        );
        if used * 100 >= self.layout.log_size * u64::from(self.config.high_water_percent) {
            self.request_flush();
        }
        Ok(Some(sequence))
    }

    /// Write every pending entry to its final location, sync, then advance
    /// the log tail past them. Returns the number of entries flushed.
    fn flush(&self) -> Result<usize> {
        let _flushing = self.flush_lock.lock();
        let entries: Vec<Arc<PendingEntry>> = self.log.lock().pending.iter().cloned().collect();
        let Some(newest) = entries.last() else {
            return Ok(0);
        };
        self.cache.health().check_writable()?;

        // Later entries overwrite earlier ones; only the newest copy of each
        // block needs to reach the disk.
        let mut latest: BTreeMap<BlockNumber, &[u8]> = BTreeMap::new();
        for entry in &entries {
            for (block, bytes) in &entry.blocks {
                latest.insert(*block, bytes.as_slice());
            }
        }
        for (block, bytes) in &latest {
            self.device()
                .write_block(*block, bytes)
                .map_err(|err| self.fail("flush_write", err))?;
        }
        self.sync("flush_sync")?;

        let log_start = {
            let mut log = self.log.lock();
            let mut header = log.header;
            header.log_start = newest.end;
            self.write_header(&header)?;
            log.header = header;
            while log
                .pending
                .front()
                .is_some_and(|entry| entry.sequence <= newest.sequence)
            {
                log.pending.pop_front();
            }
            header.log_start
        };
        for entry in &entries {
            for (block, _) in &entry.blocks {
                self.cache.unpin(*block, entry.sequence);
            }
        }

        Counters::bump(&self.counters.flushes, 1);
        Counters::bump(&self.counters.entries_flushed, entries.len() as u64);
        debug!(
            target: "bfs::journal",
            entries = entries.len(),
            blocks = latest.len(),
            log_start,
            "journal_flush"
        );
        Ok(entries.len())
    }
}

// ── Journal ─────────────────────────────────────────────────────────────────

/// Per-thread view of the running transaction, guarded by the recursive
/// journal lock.
#[derive(Default)]
pub(crate) struct TxnState {
    depth: u32,
    cache_txn: Option<TxnId>,
    doomed: bool,
    listeners: Vec<Arc<dyn TransactionListener>>,
}

pub struct Journal {
    shared: Arc<Shared>,
    lock: ReentrantMutex<RefCell<TxnState>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("layout", &self.shared.layout)
            .field("usage", &self.log_usage())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Write an empty journal header for a freshly formatted log area.
pub fn initialize_log(device: &dyn BlockDevice, layout: &LogLayout) -> Result<()> {
    let block_size = usize::try_from(device.block_size())
        .map_err(|_| BfsError::Format("block_size does not fit usize".to_owned()))?;
    let header = JournalHeader::empty(layout.log_size);
    device.write_block(
        layout.header_block,
        &format::encode_header(&header, block_size),
    )?;
    device.sync()?;
    info!(
        target: "bfs::journal",
        header_block = layout.header_block.0,
        log_size = layout.log_size,
        "journal_initialized"
    );
    Ok(())
}

impl Journal {
    /// Open the journal over a log that has already been replayed.
    pub fn open(
        cache: Arc<BlockCache>,
        layout: LogLayout,
        geometry: VolumeGeometry,
        config: JournalConfig,
    ) -> Result<Self> {
        config.validate()?;
        let raw = cache.device().read_block(layout.header_block)?;
        let header = format::decode_header(raw.as_slice(), layout.header_block)?;
        if header.log_size != layout.log_size {
            return Err(BfsError::Format(format!(
                "journal header log_size {} disagrees with log area of {} blocks",
                header.log_size, layout.log_size
            )));
        }
        if !header.is_empty() {
            return Err(BfsError::Invariant(format!(
                "journal holds {} unreplayed blocks; replay before opening",
                header.used()
            )));
        }

        let start_flusher = config.start_flusher && cache.health().is_writable();
        let shared = Arc::new(Shared {
            cache,
            layout,
            geometry,
            config,
            log: Mutex::new(LogState {
                header,
                pending: VecDeque::new(),
                flush_requested: false,
                shutdown: false,
            }),
            wake: Condvar::new(),
            flush_lock: Mutex::new(()),
            counters: Counters::default(),
        });
        let flusher = if start_flusher {
            Some(flusher::spawn(Arc::clone(&shared))?)
        } else {
            None
        };
        info!(
            target: "bfs::journal",
            header_block = layout.header_block.0,
            log_size = layout.log_size,
            next_seq = header.next_sequence.0,
            flusher = flusher.is_some(),
            "journal_open"
        );
        Ok(Self {
            shared,
            lock: ReentrantMutex::new(RefCell::new(TxnState::default())),
            flusher: Mutex::new(flusher),
        })
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.shared.cache
    }

    #[must_use]
    pub fn layout(&self) -> &LogLayout {
        &self.shared.layout
    }

    #[must_use]
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.shared.geometry
    }

    #[must_use]
    pub fn config(&self) -> &JournalConfig {
        &self.shared.config
    }

    /// Write all committed entries to their final locations and reclaim
    /// their log space.
    pub fn flush(&self) -> Result<usize> {
        self.shared.flush()
    }

    #[must_use]
    pub fn log_usage(&self) -> LogUsage {
        let log = self.shared.log.lock();
        LogUsage {
            used: log.header.used(),
            capacity: self.shared.layout.log_size,
            pending_entries: log.pending.len(),
            next_sequence: log.header.next_sequence,
        }
    }

    #[must_use]
    pub fn stats(&self) -> JournalStats {
        self.shared.counters.snapshot()
    }

    /// Stop the flusher thread without flushing. Idempotent.
    pub fn shutdown(&self) {
        self.shared.log.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.flusher.lock().take() {
            if handle.join().is_err() {
                error!(target: "bfs::journal", "journal_flusher_panicked");
            }
        }
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.shutdown();
    }
}
