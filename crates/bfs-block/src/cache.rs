//! Transaction-aware block cache.
//!
//! Blocks are handed out through scoped guards: [`BlockRef`] for shared
//! reads and [`BlockRefMut`] for exclusive writes. Taking a writable guard
//! registers the block with a cache transaction and snapshots its
//! pre-transaction content, so an abort can put it back.
//!
//! Lifecycle of a block's dirty state:
//!
//! ```text
//! clean ──get_writable(txn)──▶ owned by txn ──commit(seq)──▶ pinned(seq) ──unpin──▶ clean
//!                                   │
//!                                   └──abort──▶ restored (or invalidated)
//! ```
//!
//! The cache never writes a block to the device itself. Owned and pinned
//! blocks are exempt from replacement, which keeps uncommitted data off the
//! disk and keeps committed-but-unflushed data from being re-read stale.
//!
//! Lock order inside the cache: slot data lock → slot meta lock →
//! transaction registry. The table lock is only held for map and ARC
//! bookkeeping and never while waiting on a data lock that someone else may
//! hold.

use crate::arc::ArcState;
use crate::{BlockDevice, VolumeHealth};
use bfs_error::{BfsError, Result};
use bfs_types::{BlockNumber, LogSequence, TxnId};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

type BlockData = Option<Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Clean blocks kept resident before ARC replacement kicks in.
    pub capacity_blocks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_blocks: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resident: usize,
}

/// Content to put back if the owning transaction aborts.
#[derive(Debug, Default)]
enum Original {
    #[default]
    None,
    Bytes(Vec<u8>),
    /// Block was zero-filled without reading the device; abort drops it.
    Unread,
}

#[derive(Debug, Default)]
struct SlotMeta {
    owner: Option<TxnId>,
    original: Original,
    pinned: Option<LogSequence>,
}

#[derive(Debug, Default)]
struct Slot {
    data: Arc<RwLock<BlockData>>,
    meta: Mutex<SlotMeta>,
}

impl Slot {
    /// Only the table references it, no guard is live, and it carries no
    /// transaction state.
    fn evictable(slot: &Arc<Self>) -> bool {
        Arc::strong_count(slot) == 1
            && Arc::strong_count(&slot.data) == 1
            && slot
                .meta
                .try_lock()
                .is_some_and(|meta| meta.owner.is_none() && meta.pinned.is_none())
    }
}

#[derive(Debug)]
struct SlotTable {
    map: HashMap<BlockNumber, Arc<Slot>>,
    arc: ArcState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fill {
    Read,
    Zero,
}

/// Shared read access to a cached block. Dropping it releases the block.
pub struct BlockRef {
    block: BlockNumber,
    guard: ArcRwLockReadGuard<RawRwLock, BlockData>,
}

impl BlockRef {
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }
}

impl Deref for BlockRef {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        (*self.guard).as_deref().unwrap_or_default()
    }
}

impl std::fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRef").field("block", &self.block).finish()
    }
}

/// Exclusive write access to a block registered with a transaction.
pub struct BlockRefMut {
    block: BlockNumber,
    guard: ArcRwLockWriteGuard<RawRwLock, BlockData>,
}

impl BlockRefMut {
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }
}

impl Deref for BlockRefMut {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        (*self.guard).as_deref().unwrap_or_default()
    }
}

impl DerefMut for BlockRefMut {
    fn deref_mut(&mut self) -> &mut [u8] {
        (*self.guard).as_deref_mut().unwrap_or_default()
    }
}

impl std::fmt::Debug for BlockRefMut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRefMut")
            .field("block", &self.block)
            .finish()
    }
}

pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    health: Arc<VolumeHealth>,
    table: Mutex<SlotTable>,
    txns: Mutex<HashMap<TxnId, BTreeSet<BlockNumber>>>,
    next_txn: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("block_size", &self.block_size)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl BlockCache {
    pub fn new(
        device: Arc<dyn BlockDevice>,
        config: &CacheConfig,
        health: Arc<VolumeHealth>,
    ) -> Result<Self> {
        if config.capacity_blocks == 0 {
            return Err(BfsError::InvalidArgument(
                "cache capacity_blocks must be > 0".to_owned(),
            ));
        }
        let block_size = usize::try_from(device.block_size())
            .map_err(|_| BfsError::Format("block_size does not fit usize".to_owned()))?;
        Ok(Self {
            device,
            block_size,
            health,
            table: Mutex::new(SlotTable {
                map: HashMap::new(),
                arc: ArcState::new(config.capacity_blocks),
            }),
            txns: Mutex::new(HashMap::new()),
            next_txn: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    #[must_use]
    pub fn health(&self) -> &Arc<VolumeHealth> {
        &self.health
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.device.block_count()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resident: self.table.lock().map.len(),
        }
    }

    fn check_range(&self, block: BlockNumber) -> Result<()> {
        if block.0 >= self.device.block_count() {
            return Err(BfsError::InvalidArgument(format!(
                "block {block} outside device of {} blocks",
                self.device.block_count()
            )));
        }
        Ok(())
    }

    fn make_room(&self, table: &mut SlotTable, incoming: BlockNumber) {
        let SlotTable { map, arc } = table;
        let victims = arc.on_insert(incoming, &|candidate| {
            candidate != incoming && map.get(&candidate).is_some_and(Slot::evictable)
        });
        for victim in victims {
            let _ = map.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(target: "bfs::cache", block = victim.0, "cache_evict");
        }
    }

    fn discard(&self, block: BlockNumber, slot: &Arc<Slot>) {
        let mut table = self.table.lock();
        if table.map.get(&block).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            let _ = table.map.remove(&block);
            table.arc.forget(block);
        }
    }

    /// Find or load the slot for `block`. The boolean is true when this call
    /// created the slot (and filled it per `fill`).
    ///
    /// The creating thread holds the slot's write lock while it reads the
    /// device, so concurrent readers of the same block wait for that one
    /// fetch instead of issuing their own.
    fn lookup(&self, block: BlockNumber, fill: Fill) -> Result<(Arc<Slot>, bool)> {
        self.check_range(block)?;
        loop {
            let (slot, loader) = {
                let mut table = self.table.lock();
                if let Some(slot) = table.map.get(&block) {
                    let slot = Arc::clone(slot);
                    table.arc.on_hit(block);
                    (slot, None)
                } else {
                    let slot = Arc::new(Slot::default());
                    let loader = slot.data.write_arc();
                    table.map.insert(block, Arc::clone(&slot));
                    self.make_room(&mut table, block);
                    (slot, Some(loader))
                }
            };

            if let Some(mut loader) = loader {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let filled = match fill {
                    Fill::Zero => Ok(vec![0_u8; self.block_size]),
                    Fill::Read => self.device.read_block(block).map(crate::BlockBuf::into_inner),
                };
                return match filled {
                    Ok(bytes) => {
                        *loader = Some(bytes);
                        drop(loader);
                        trace!(target: "bfs::cache", block = block.0, ?fill, "cache_fill");
                        Ok((slot, true))
                    }
                    Err(err) => {
                        drop(loader);
                        self.discard(block, &slot);
                        Err(err)
                    }
                };
            }

            if slot.data.read().is_some() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok((slot, false));
            }
            // The loader failed or the block was invalidated; start over.
        }
    }

    /// Scoped shared read access.
    pub fn get(&self, block: BlockNumber) -> Result<BlockRef> {
        loop {
            let (slot, _) = self.lookup(block, Fill::Read)?;
            let guard = slot.data.read_arc();
            if guard.is_some() {
                return Ok(BlockRef { block, guard });
            }
        }
    }

    /// Scoped write access; registers `block` with `txn`.
    pub fn get_writable(&self, txn: TxnId, block: BlockNumber) -> Result<BlockRefMut> {
        self.health.check_writable()?;
        loop {
            let (slot, _) = self.lookup(block, Fill::Read)?;
            let guard = slot.data.write_arc();
            let Some(bytes) = (*guard).as_ref() else {
                continue;
            };
            self.register(txn, block, &slot, || Original::Bytes(bytes.clone()))?;
            return Ok(BlockRefMut { block, guard });
        }
    }

    /// Scoped write access to a zero-filled block, skipping the device read.
    /// Used for freshly allocated blocks whose old content is irrelevant.
    pub fn get_empty(&self, txn: TxnId, block: BlockNumber) -> Result<BlockRefMut> {
        self.health.check_writable()?;
        loop {
            let (slot, fresh) = self.lookup(block, Fill::Zero)?;
            let mut guard = slot.data.write_arc();
            let Some(bytes) = (*guard).as_mut() else {
                continue;
            };
            if fresh {
                self.register(txn, block, &slot, || Original::Unread)?;
            } else {
                self.register(txn, block, &slot, || Original::Bytes(bytes.clone()))?;
                bytes.fill(0);
            }
            return Ok(BlockRefMut { block, guard });
        }
    }

    fn register(
        &self,
        txn: TxnId,
        block: BlockNumber,
        slot: &Slot,
        original: impl FnOnce() -> Original,
    ) -> Result<()> {
        let mut meta = slot.meta.lock();
        match meta.owner {
            Some(owner) if owner == txn => return Ok(()),
            Some(owner) => {
                return Err(BfsError::Invariant(format!(
                    "block {block} already owned by {owner}, requested by {txn}"
                )));
            }
            None => {}
        }
        let mut txns = self.txns.lock();
        let Some(blocks) = txns.get_mut(&txn) else {
            return Err(BfsError::Invariant(format!(
                "{txn} is not an open cache transaction"
            )));
        };
        blocks.insert(block);
        drop(txns);
        meta.owner = Some(txn);
        meta.original = original();
        trace!(target: "bfs::cache", block = block.0, txn = txn.0, "cache_block_dirtied");
        Ok(())
    }

    // ── Cache transactions ─────────────────────────────────────────────────

    pub fn start_transaction(&self) -> TxnId {
        let txn = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed));
        self.txns.lock().insert(txn, BTreeSet::new());
        debug!(target: "bfs::cache", txn = txn.0, "cache_txn_start");
        txn
    }

    /// Number of blocks currently registered with `txn`.
    #[must_use]
    pub fn transaction_block_count(&self, txn: TxnId) -> usize {
        self.txns.lock().get(&txn).map_or(0, BTreeSet::len)
    }

    fn resident_slot(&self, block: BlockNumber) -> Option<Arc<Slot>> {
        self.table.lock().map.get(&block).cloned()
    }

    /// Snapshot of every block registered with `txn`, in block order.
    ///
    /// Must not be called while the calling thread holds a guard on one of
    /// those blocks.
    pub fn transaction_blocks(&self, txn: TxnId) -> Result<Vec<(BlockNumber, Vec<u8>)>> {
        let blocks: Vec<BlockNumber> = self
            .txns
            .lock()
            .get(&txn)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(blocks.len());
        for block in blocks {
            let slot = self.resident_slot(block).ok_or_else(|| {
                BfsError::Invariant(format!("dirty block {block} of {txn} left the cache"))
            })?;
            let data = slot.data.read();
            let bytes = (*data).as_ref().ok_or_else(|| {
                BfsError::Invariant(format!("dirty block {block} of {txn} has no data"))
            })?;
            out.push((block, bytes.clone()));
        }
        Ok(out)
    }

    /// Mark every block of `txn` as committed in log entry `seq`. The blocks
    /// stay pinned until [`unpin`](Self::unpin) is called with a sequence at
    /// least as new.
    pub fn commit_transaction(&self, txn: TxnId, seq: LogSequence) {
        let blocks = self.txns.lock().remove(&txn).unwrap_or_default();
        let count = blocks.len();
        for block in blocks {
            if let Some(slot) = self.resident_slot(block) {
                let mut meta = slot.meta.lock();
                meta.owner = None;
                meta.original = Original::None;
                meta.pinned = Some(meta.pinned.map_or(seq, |old| old.max(seq)));
            }
        }
        debug!(target: "bfs::cache", txn = txn.0, seq = seq.0, blocks = count, "cache_txn_commit");
    }

    /// Put back the pre-transaction content of every block of `txn`.
    pub fn abort_transaction(&self, txn: TxnId) {
        let blocks = self.txns.lock().remove(&txn).unwrap_or_default();
        let count = blocks.len();
        for block in blocks {
            let Some(slot) = self.resident_slot(block) else {
                continue;
            };
            let mut data = slot.data.write();
            let mut meta = slot.meta.lock();
            if meta.owner != Some(txn) {
                continue;
            }
            meta.owner = None;
            match std::mem::take(&mut meta.original) {
                Original::Bytes(bytes) => *data = Some(bytes),
                Original::Unread => {
                    *data = None;
                    drop(meta);
                    drop(data);
                    self.discard(block, &slot);
                }
                Original::None => {}
            }
        }
        debug!(target: "bfs::cache", txn = txn.0, blocks = count, "cache_txn_abort");
    }

    /// Release the pin on `block` if it was pinned by `seq` or earlier.
    pub fn unpin(&self, block: BlockNumber, seq: LogSequence) {
        if let Some(slot) = self.resident_slot(block) {
            let mut meta = slot.meta.lock();
            if meta.pinned.is_some_and(|pinned| pinned <= seq) {
                meta.pinned = None;
            }
        }
    }

    /// Blocks currently pinned by committed, unflushed log entries.
    #[must_use]
    pub fn pinned_count(&self) -> usize {
        let slots: Vec<Arc<Slot>> = self.table.lock().map.values().cloned().collect();
        slots
            .iter()
            .filter(|slot| slot.meta.lock().pinned.is_some())
            .count()
    }
}
