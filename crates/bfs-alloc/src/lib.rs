#![forbid(unsafe_code)]
//! Block allocation over per-group free bitmaps.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on group bitmaps, LSB-first within
//!    each byte. Bit `i` of group `g` covers block `(g << ag_shift) + i`.
//! 2. **GroupInfo**: cached per-group free count and largest free range,
//!    kept exact so groups that cannot satisfy a request are skipped
//!    without touching their bitmap.
//! 3. **BlockAllocator**: best-fit allocation across groups in wrap-around
//!    order from the hint, falling back to the largest partial run.
//!
//! Bitmap blocks are only modified through the running [`Transaction`], so
//! every allocation is journaled with the metadata that references it. If
//! the transaction aborts, the cache restores the bitmap blocks and a
//! transaction listener rebuilds the summaries of the groups it touched.

use bfs_block::BlockCache;
use bfs_error::{BfsError, Result};
use bfs_journal::{Transaction, TransactionListener};
use bfs_types::lock_order::{self, LockLevel};
use bfs_types::{BlockNumber, BlockRun, GroupNumber, VolumeGeometry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice. Bits past the slice read as free.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0_u32;

    for idx in 0..full_bytes {
        free += bitmap.get(idx).map_or(8, |byte| byte.count_zeros());
    }
    for bit in 0..remainder {
        if !bitmap_get(bitmap, count - remainder + bit) {
            free += 1;
        }
    }
    free
}

/// Find the first free (zero) bit in the first `count` bits of `bitmap`,
/// starting from `start` and wrapping around.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    let start = start.min(count);
    (start..count)
        .chain(0..start)
        .find(|&idx| !bitmap_get(bitmap, idx))
}

/// Find the first `n` contiguous free bits in the first `count` bits.
#[must_use]
pub fn bitmap_find_contiguous(bitmap: &[u8], count: u32, n: u32) -> Option<u32> {
    if n == 0 {
        return Some(0);
    }
    free_ranges(bitmap, count)
        .into_iter()
        .find(|&(_, len)| len >= n)
        .map(|(start, _)| start)
}

/// Maximal runs of free bits in the first `count` bits, as `(start, len)`
/// in ascending order.
#[must_use]
pub fn free_ranges(bitmap: &[u8], count: u32) -> Vec<(u32, u32)> {
    let mut ranges = Vec::new();
    let mut open: Option<u32> = None;
    let mut idx = 0_u32;
    while idx < count {
        // Whole bytes short-circuit the common full / empty cases.
        if idx % 8 == 0 && idx + 8 <= count {
            match bitmap.get((idx / 8) as usize).copied().unwrap_or(0) {
                0xFF => {
                    if let Some(start) = open.take() {
                        ranges.push((start, idx - start));
                    }
                    idx += 8;
                    continue;
                }
                0 => {
                    open.get_or_insert(idx);
                    idx += 8;
                    continue;
                }
                _ => {}
            }
        }
        if bitmap_get(bitmap, idx) {
            if let Some(start) = open.take() {
                ranges.push((start, idx - start));
            }
        } else {
            open.get_or_insert(idx);
        }
        idx += 1;
    }
    if let Some(start) = open {
        ranges.push((start, count - start));
    }
    ranges
}

/// Length of the longest free range in the first `count` bits.
#[must_use]
pub fn largest_free_range(bitmap: &[u8], count: u32) -> u32 {
    free_ranges(bitmap, count)
        .into_iter()
        .map(|(_, len)| len)
        .max()
        .unwrap_or(0)
}

/// Where to place `n` bits: at `hint` itself when `n` free bits start
/// there, otherwise at the start of the shortest free range holding at
/// least `n` bits. Among equal lengths the first range starting at or after
/// `hint` wins, wrapping around to the start of the bitmap.
#[must_use]
pub fn bitmap_best_fit(bitmap: &[u8], count: u32, n: u32, hint: u32) -> Option<u32> {
    if n > 0
        && hint.checked_add(n).is_some_and(|end| end <= count)
        && (hint..hint + n).all(|idx| !bitmap_get(bitmap, idx))
    {
        return Some(hint);
    }
    free_ranges(bitmap, count)
        .into_iter()
        .filter(|&(_, len)| len >= n)
        .min_by_key(|&(start, len)| (len, start < hint, start))
        .map(|(start, _)| start)
}

// ── Requests ────────────────────────────────────────────────────────────────

/// Where to start looking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocHint {
    pub group: u32,
    pub start: u16,
}

impl AllocHint {
    /// Hint pointing at `block`, typically the owner's own location.
    #[must_use]
    pub fn near(geometry: &VolumeGeometry, block: BlockNumber) -> Self {
        let group = geometry.group_of(block).0;
        let offset = block.0 & (geometry.blocks_per_group() - 1);
        Self {
            group,
            start: u16::try_from(offset).unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocRequest {
    /// Blocks wanted.
    pub count: u32,
    /// Smallest acceptable partial run.
    pub minimum: u32,
    pub hint: AllocHint,
}

impl AllocRequest {
    /// Exactly `count` blocks or nothing.
    #[must_use]
    pub fn exact(count: u32) -> Self {
        Self {
            count,
            minimum: count,
            hint: AllocHint::default(),
        }
    }

    /// `count` blocks, or the largest free run of at least `minimum`.
    #[must_use]
    pub fn at_least(count: u32, minimum: u32) -> Self {
        Self {
            count,
            minimum,
            hint: AllocHint::default(),
        }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: AllocHint) -> Self {
        self.hint = hint;
        self
    }

    fn validate(&self, geometry: &VolumeGeometry) -> Result<()> {
        let limit = geometry
            .blocks_per_group()
            .min(u64::from(u16::MAX));
        if self.count == 0 || u64::from(self.count) > limit {
            return Err(BfsError::InvalidArgument(format!(
                "allocation of {} blocks outside 1..={limit}",
                self.count
            )));
        }
        if self.minimum == 0 || self.minimum > self.count {
            return Err(BfsError::InvalidArgument(format!(
                "allocation minimum {} outside 1..={}",
                self.minimum, self.count
            )));
        }
        Ok(())
    }
}

// ── Group summaries ─────────────────────────────────────────────────────────

/// Cached per-group statistics, rebuilt from the bitmap on open and after
/// an abort.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub free: u32,
    pub largest: u32,
}

impl GroupInfo {
    fn scan(bitmap: &[u8], count: u32) -> Self {
        Self {
            free: bitmap_count_free(bitmap, count),
            largest: largest_free_range(bitmap, count),
        }
    }
}

#[derive(Debug, Default)]
struct AllocState {
    groups: Vec<GroupInfo>,
    /// Groups modified by the running transaction.
    touched: BTreeSet<u32>,
}

// ── Snapshot ────────────────────────────────────────────────────────────────

/// Read-only copy of every group bitmap, for consistency checkers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapSnapshot {
    geometry: VolumeGeometry,
    bitmaps: Vec<Vec<u8>>,
}

impl BitmapSnapshot {
    #[must_use]
    pub fn is_used(&self, block: BlockNumber) -> bool {
        if block.0 >= self.geometry.num_blocks {
            return false;
        }
        let group = self.geometry.group_of(block).0 as usize;
        let bit = u32::try_from(block.0 & (self.geometry.blocks_per_group() - 1)).unwrap_or(0);
        self.bitmaps
            .get(group)
            .is_some_and(|bitmap| bitmap_get(bitmap, bit))
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.bitmaps
            .iter()
            .enumerate()
            .map(|(group, bitmap)| {
                let count = self
                    .geometry
                    .blocks_in_group(GroupNumber(u32::try_from(group).unwrap_or(u32::MAX)));
                u64::from(bitmap_count_free(bitmap, count))
            })
            .sum()
    }

    #[must_use]
    pub fn used_blocks(&self) -> u64 {
        self.geometry.num_blocks - self.free_blocks()
    }

    #[must_use]
    pub fn group_bitmap(&self, group: GroupNumber) -> Option<&[u8]> {
        self.bitmaps.get(group.0 as usize).map(Vec::as_slice)
    }
}

// ── Block allocator ─────────────────────────────────────────────────────────

struct Inner {
    cache: Arc<BlockCache>,
    geometry: VolumeGeometry,
    state: Mutex<AllocState>,
}

impl Inner {
    fn bits_per_block(&self) -> u32 {
        self.geometry.block_size.get() * 8
    }

    fn group_limit(&self, group: u32) -> u32 {
        self.geometry.blocks_in_group(GroupNumber(group))
    }

    fn read_bitmap(&self, group: u32) -> Result<Vec<u8>> {
        let first = self.geometry.bitmap_block(GroupNumber(group));
        let blocks = self.geometry.bitmap_blocks_per_group();
        let mut bitmap = Vec::with_capacity(self.cache.block_size() * blocks as usize);
        for index in 0..blocks {
            let block = self.cache.get(BlockNumber(first.0 + index))?;
            bitmap.extend_from_slice(&block);
        }
        Ok(bitmap)
    }

    fn scan_group(&self, group: u32) -> Result<GroupInfo> {
        let bitmap = self.read_bitmap(group)?;
        Ok(GroupInfo::scan(&bitmap, self.group_limit(group)))
    }

    /// Set or clear `len` bits from `start` in `group` through `txn`.
    fn write_bits(
        &self,
        txn: &Transaction<'_>,
        group: u32,
        start: u32,
        len: u32,
        used: bool,
    ) -> Result<()> {
        let per_block = self.bits_per_block();
        let first = self.geometry.bitmap_block(GroupNumber(group));
        let end = start + len;
        let mut bit = start;
        while bit < end {
            let index = bit / per_block;
            let stop = ((index + 1) * per_block).min(end);
            let mut block = txn.get_writable(BlockNumber(first.0 + u64::from(index)))?;
            for global in bit..stop {
                let local = global - index * per_block;
                if used {
                    bitmap_set(&mut block, local);
                } else {
                    bitmap_clear(&mut block, local);
                }
            }
            bit = stop;
        }
        Ok(())
    }

    fn run(&self, group: u32, start: u32, len: u32) -> Result<BlockRun> {
        let start = u16::try_from(start)
            .map_err(|_| BfsError::Invariant(format!("run start {start} exceeds u16")))?;
        let len = u16::try_from(len)
            .map_err(|_| BfsError::Invariant(format!("run length {len} exceeds u16")))?;
        Ok(BlockRun::new(group, start, len))
    }
}

impl TransactionListener for Inner {
    fn transaction_done(&self, success: bool) {
        let _level = lock_order::enter(LockLevel::Allocator);
        let mut state = self.state.lock();
        let touched = std::mem::take(&mut state.touched);
        if success {
            return;
        }
        for group in &touched {
            match self.scan_group(*group) {
                Ok(info) => state.groups[*group as usize] = info,
                Err(err) => {
                    error!(target: "bfs::alloc", group, error = %err, "alloc_rescan_failed");
                    self.cache
                        .health()
                        .escalate(&format!("allocator rescan of group {group} failed: {err}"));
                }
            }
        }
        debug!(target: "bfs::alloc", groups = touched.len(), "alloc_rescanned_after_abort");
    }
}

/// Allocator for one volume. Cheap to share behind an `Arc`.
pub struct BlockAllocator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("groups", &self.inner.geometry.num_groups())
            .field("free_blocks", &self.free_blocks())
            .finish_non_exhaustive()
    }
}

impl BlockAllocator {
    /// Load the group summaries from the bitmaps reachable through `cache`.
    pub fn open(cache: Arc<BlockCache>, geometry: VolumeGeometry) -> Result<Self> {
        if cache.block_size() != geometry.block_size.bytes() {
            return Err(BfsError::Format(format!(
                "cache block size {} does not match volume block size {}",
                cache.block_size(),
                geometry.block_size
            )));
        }
        let inner = Inner {
            cache,
            geometry,
            state: Mutex::new(AllocState::default()),
        };
        let mut groups = Vec::with_capacity(geometry.num_groups() as usize);
        for group in 0..geometry.num_groups() {
            groups.push(inner.scan_group(group)?);
        }
        let free: u64 = groups.iter().map(|info| u64::from(info.free)).sum();
        inner.state.lock().groups = groups;
        info!(
            target: "bfs::alloc",
            groups = geometry.num_groups(),
            free_blocks = free,
            "alloc_open"
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.inner.geometry
    }

    fn track(&self, txn: &Transaction<'_>, state: &mut AllocState, group: u32) {
        state.touched.insert(group);
        let listener: Arc<dyn TransactionListener> = self.inner.clone();
        txn.add_listener(listener);
    }

    /// Mark `len` bits from `start` used. `bitmap` is the group's current
    /// content and is updated in place.
    fn claim(
        &self,
        txn: &Transaction<'_>,
        state: &mut AllocState,
        group: u32,
        bitmap: &mut [u8],
        start: u32,
        len: u32,
    ) -> Result<BlockRun> {
        let run = self.inner.run(group, start, len)?;
        if let Some(bit) = (start..start + len).find(|&bit| bitmap_get(bitmap, bit)) {
            return Err(BfsError::Invariant(format!(
                "group {group} bit {bit} already in use while claiming {run}"
            )));
        }
        self.track(txn, state, group);
        self.inner.write_bits(txn, group, start, len, true)?;
        for bit in start..start + len {
            bitmap_set(bitmap, bit);
        }
        let info = &mut state.groups[group as usize];
        info.free -= len;
        info.largest = largest_free_range(bitmap, self.inner.group_limit(group));
        trace!(target: "bfs::alloc", group, start, len, "alloc_run");
        Ok(run)
    }

    /// Allocate a run per `request` within `txn`.
    pub fn allocate(&self, txn: &Transaction<'_>, request: AllocRequest) -> Result<BlockRun> {
        request.validate(&self.inner.geometry)?;
        let _level = lock_order::enter(LockLevel::Allocator);
        let mut state = self.inner.state.lock();
        let num_groups = self.inner.geometry.num_groups();
        let first_group = request.hint.group % num_groups;

        let mut partial: Option<(u32, u32)> = None;
        for step in 0..num_groups {
            let group = (first_group + step) % num_groups;
            let info = state.groups[group as usize];
            if info.largest >= request.count {
                let mut bitmap = self.inner.read_bitmap(group)?;
                let hint = if step == 0 {
                    u32::from(request.hint.start)
                } else {
                    0
                };
                let limit = self.inner.group_limit(group);
                let start = bitmap_best_fit(&bitmap, limit, request.count, hint).ok_or_else(|| {
                    BfsError::Invariant(format!(
                        "group {group} summary promises {} free blocks in a row",
                        info.largest
                    ))
                })?;
                return self.claim(txn, &mut state, group, &mut bitmap, start, request.count);
            }
            if info.largest >= request.minimum && partial.is_none_or(|(_, len)| info.largest > len)
            {
                partial = Some((group, info.largest));
            }
        }

        if let Some((group, len)) = partial {
            let mut bitmap = self.inner.read_bitmap(group)?;
            let limit = self.inner.group_limit(group);
            let start = bitmap_best_fit(&bitmap, limit, len, 0).ok_or_else(|| {
                BfsError::Invariant(format!("group {group} summary promises {len} free blocks"))
            })?;
            debug!(
                target: "bfs::alloc",
                group,
                wanted = request.count,
                got = len,
                "alloc_partial_run"
            );
            return self.claim(txn, &mut state, group, &mut bitmap, start, len);
        }

        warn!(
            target: "bfs::alloc",
            count = request.count,
            minimum = request.minimum,
            "alloc_no_space"
        );
        Err(BfsError::NoSpace)
    }

    /// Mark a specific run used, e.g. fixed metadata placed at format time.
    pub fn allocate_run(&self, txn: &Transaction<'_>, run: BlockRun) -> Result<()> {
        self.check_bounds(&run)?;
        let _level = lock_order::enter(LockLevel::Allocator);
        let mut state = self.inner.state.lock();
        let mut bitmap = self.inner.read_bitmap(run.group)?;
        if (u32::from(run.start)..run.end()).any(|bit| bitmap_get(&bitmap, bit)) {
            return Err(BfsError::InvalidArgument(format!("run {run} is already in use")));
        }
        self.claim(
            txn,
            &mut state,
            run.group,
            &mut bitmap,
            u32::from(run.start),
            u32::from(run.length),
        )?;
        Ok(())
    }

    /// Return `run` to the free pool.
    ///
    /// Every bit must currently be set; freeing a free block is corruption
    /// and escalates the volume to read-only.
    pub fn free(&self, txn: &Transaction<'_>, run: BlockRun) -> Result<()> {
        self.check_bounds(&run)?;
        let _level = lock_order::enter(LockLevel::Allocator);
        let mut state = self.inner.state.lock();
        let group = run.group;
        let start = u32::from(run.start);
        let len = u32::from(run.length);
        let mut bitmap = self.inner.read_bitmap(group)?;
        if let Some(bit) = (start..start + len).find(|&bit| !bitmap_get(&bitmap, bit)) {
            let block = self.inner.geometry.run_start(&run).0 + u64::from(bit - start);
            return Err(self.inner.cache.health().note(BfsError::BadData {
                block,
                detail: format!("freeing unallocated block in run {run}"),
            }));
        }

        self.track(txn, &mut state, group);
        self.inner.write_bits(txn, group, start, len, false)?;
        for bit in start..start + len {
            bitmap_clear(&mut bitmap, bit);
        }

        // Widen over neighbouring free bits to keep the largest-range hint
        // exact without a full rescan.
        let limit = self.inner.group_limit(group);
        let mut low = start;
        while low > 0 && !bitmap_get(&bitmap, low - 1) {
            low -= 1;
        }
        let mut high = start + len;
        while high < limit && !bitmap_get(&bitmap, high) {
            high += 1;
        }
        let info = &mut state.groups[group as usize];
        info.free += len;
        info.largest = info.largest.max(high - low);
        trace!(
            target: "bfs::alloc",
            group,
            start,
            len,
            coalesced = high - low,
            "alloc_free"
        );
        Ok(())
    }

    fn check_bounds(&self, run: &BlockRun) -> Result<()> {
        if run.is_empty() {
            return Err(BfsError::InvalidArgument(format!("empty run {run}")));
        }
        self.inner
            .geometry
            .validate_run(run)
            .map_err(|err| BfsError::InvalidArgument(format!("run {run}: {err}")))
    }

    /// True when every block of `run` is marked used.
    pub fn is_allocated(&self, run: BlockRun) -> Result<bool> {
        self.check_bounds(&run)?;
        let _level = lock_order::enter(LockLevel::Allocator);
        let _state = self.inner.state.lock();
        let bitmap = self.inner.read_bitmap(run.group)?;
        Ok((u32::from(run.start)..run.end()).all(|bit| bitmap_get(&bitmap, bit)))
    }

    /// `BadData` unless every block of `run` is used (`expect_used`) or
    /// every block is free.
    pub fn check_run(&self, run: BlockRun, expect_used: bool) -> Result<()> {
        self.check_bounds(&run)?;
        let _level = lock_order::enter(LockLevel::Allocator);
        let _state = self.inner.state.lock();
        let bitmap = self.inner.read_bitmap(run.group)?;
        let start = u32::from(run.start);
        if let Some(bit) = (start..run.end()).find(|&bit| bitmap_get(&bitmap, bit) != expect_used) {
            let state = if expect_used { "free" } else { "in use" };
            return Err(BfsError::BadData {
                block: self.inner.geometry.run_start(&run).0 + u64::from(bit - start),
                detail: format!("block of run {run} is unexpectedly {state}"),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.inner
            .state
            .lock()
            .groups
            .iter()
            .map(|info| u64::from(info.free))
            .sum()
    }

    #[must_use]
    pub fn used_blocks(&self) -> u64 {
        self.inner.geometry.num_blocks - self.free_blocks()
    }

    #[must_use]
    pub fn group_info(&self, group: GroupNumber) -> Option<GroupInfo> {
        self.inner.state.lock().groups.get(group.0 as usize).copied()
    }

    /// Copy every group bitmap under the allocator lock.
    pub fn bitmap_snapshot(&self) -> Result<BitmapSnapshot> {
        let _level = lock_order::enter(LockLevel::Allocator);
        let _state = self.inner.state.lock();
        let bitmaps = (0..self.inner.geometry.num_groups())
            .map(|group| self.inner.read_bitmap(group))
            .collect::<Result<Vec<_>>>()?;
        Ok(BitmapSnapshot {
            geometry: self.inner.geometry,
            bitmaps,
        })
    }

    /// Compare the cached summaries with a fresh scan of every bitmap.
    pub fn check_consistency(&self) -> Result<()> {
        let _level = lock_order::enter(LockLevel::Allocator);
        let state = self.inner.state.lock();
        for (group, cached) in (0..self.inner.geometry.num_groups()).zip(&state.groups) {
            let actual = self.inner.scan_group(group)?;
            if actual != *cached {
                return Err(BfsError::Invariant(format!(
                    "group {group} summary {cached:?} disagrees with bitmap {actual:?}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_block::{BlockDevice, CacheConfig, VolumeHealth, mem_block_device};
    use bfs_journal::{Journal, JournalConfig, LogLayout, initialize_log};
    use bfs_types::BlockSize;
    use proptest::prelude::*;

    const BLOCKS: u64 = 4096;
    const LOG: LogLayout = LogLayout {
        header_block: BlockNumber(3800),
        log_size: 200,
    };

    struct Fixture {
        journal: Journal,
        alloc: BlockAllocator,
    }

    fn geometry() -> VolumeGeometry {
        VolumeGeometry::new(BlockSize::new(1024).unwrap(), BLOCKS, 10).unwrap()
    }

    /// Four groups of 1024 blocks; block 0, the bitmaps (1..=4) and the log
    /// are reserved.
    fn fixture() -> Fixture {
        let device: Arc<dyn BlockDevice> = Arc::new(mem_block_device(1024, BLOCKS).unwrap());
        initialize_log(device.as_ref(), &LOG).unwrap();
        let cache = Arc::new(
            BlockCache::new(
                device,
                &CacheConfig::default(),
                Arc::new(VolumeHealth::default()),
            )
            .unwrap(),
        );
        let journal = Journal::open(
            Arc::clone(&cache),
            LOG,
            geometry(),
            JournalConfig {
                start_flusher: false,
                ..JournalConfig::default()
            },
        )
        .unwrap();
        let alloc = BlockAllocator::open(cache, geometry()).unwrap();
        let txn = Transaction::start(&journal, false).unwrap();
        alloc.allocate_run(&txn, BlockRun::new(0, 0, 5)).unwrap();
        alloc.allocate_run(&txn, BlockRun::new(3, 728, 201)).unwrap();
        txn.done().unwrap();
        Fixture { journal, alloc }
    }

    fn in_txn<T>(fx: &Fixture, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let txn = Transaction::start(&fx.journal, false)?;
        let value = f(&txn)?;
        txn.done()?;
        Ok(value)
    }

    // ── Bitmap helpers ─────────────────────────────────────────────────────

    #[test]
    fn bitmap_bits_are_lsb_first() {
        let mut bm = vec![0_u8; 4];
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 9);
        assert_eq!(bm[0], 0b0000_0001);
        assert_eq!(bm[1], 0b0000_0010);
        assert!(bitmap_get(&bm, 9));
        bitmap_clear(&mut bm, 9);
        assert!(!bitmap_get(&bm, 9));
        assert!(!bitmap_get(&bm, 1000), "past the end reads free");
    }

    #[test]
    fn bitmap_count_free_respects_count() {
        let bm = vec![0b1010_1010_u8, 0xFF, 0x00];
        assert_eq!(bitmap_count_free(&bm, 8), 4);
        assert_eq!(bitmap_count_free(&bm, 16), 4);
        assert_eq!(bitmap_count_free(&bm, 20), 8);
        assert_eq!(bitmap_count_free(&bm, 3), 2);
    }

    #[test]
    fn bitmap_find_free_wraps() {
        let mut bm = vec![0xFF_u8; 2];
        bitmap_clear(&mut bm, 2);
        assert_eq!(bitmap_find_free(&bm, 16, 5), Some(2));
        assert_eq!(bitmap_find_free(&bm, 16, 0), Some(2));
        bitmap_set(&mut bm, 2);
        assert_eq!(bitmap_find_free(&bm, 16, 0), None);
    }

    #[test]
    fn free_ranges_and_best_fit() {
        // free: 0..3, 5..10, 12..16 (count 16)
        let mut bm = vec![0_u8; 2];
        for bit in [3, 4, 10, 11] {
            bitmap_set(&mut bm, bit);
        }
        assert_eq!(free_ranges(&bm, 16), vec![(0, 3), (5, 5), (12, 4)]);
        assert_eq!(largest_free_range(&bm, 16), 5);
        assert_eq!(bitmap_find_contiguous(&bm, 16, 4), Some(5));
        assert_eq!(bitmap_best_fit(&bm, 16, 4, 0), Some(12));
        assert_eq!(bitmap_best_fit(&bm, 16, 3, 0), Some(0));
        assert_eq!(bitmap_best_fit(&bm, 16, 6, 0), None);
        // A hint with room wins outright.
        assert_eq!(bitmap_best_fit(&bm, 16, 3, 6), Some(6));
        assert_eq!(bitmap_best_fit(&bm, 16, 4, 0), Some(12));
    }

    #[test]
    fn best_fit_ties_follow_the_hint() {
        // free: 0..3 and 8..11
        let mut bm = vec![0xFF_u8; 2];
        for bit in [0, 1, 2, 8, 9, 10] {
            bitmap_clear(&mut bm, bit);
        }
        assert_eq!(bitmap_best_fit(&bm, 16, 3, 5), Some(8));
        assert_eq!(bitmap_best_fit(&bm, 16, 3, 12), Some(0));
    }

    #[test]
    fn free_ranges_crosses_whole_bytes() {
        let mut bm = vec![0xFF_u8, 0, 0, 0xFF];
        bitmap_clear(&mut bm, 7);
        bitmap_clear(&mut bm, 24);
        assert_eq!(free_ranges(&bm, 32), vec![(7, 18)]);
        assert_eq!(free_ranges(&bm, 12), vec![(7, 5)]);
    }

    // ── Allocator ──────────────────────────────────────────────────────────

    #[test]
    fn open_reports_reserved_space() {
        let fx = fixture();
        assert_eq!(fx.alloc.used_blocks(), 206);
        assert_eq!(fx.alloc.group_info(GroupNumber(0)).unwrap().largest, 1019);
        fx.alloc.check_consistency().unwrap();
    }

    #[test]
    fn allocation_honours_hint_group_and_start() {
        let fx = fixture();
        let run = in_txn(&fx, |txn| {
            fx.alloc.allocate(
                txn,
                AllocRequest::exact(4).with_hint(AllocHint { group: 2, start: 0 }),
            )
        })
        .unwrap();
        assert_eq!(run, BlockRun::new(2, 0, 4));
        assert!(fx.alloc.is_allocated(run).unwrap());
    }

    #[test]
    fn allocation_prefers_the_shortest_fitting_range() {
        let fx = fixture();
        // Group 1: carve holes of 3 and 6 blocks next to a 24-block tail.
        let run = in_txn(&fx, |txn| {
            fx.alloc.allocate(
                txn,
                AllocRequest::exact(1000).with_hint(AllocHint { group: 1, start: 0 }),
            )
        })
        .unwrap();
        assert_eq!(run, BlockRun::new(1, 0, 1000));
        in_txn(&fx, |txn| {
            fx.alloc.free(txn, BlockRun::new(1, 10, 6))?;
            fx.alloc.free(txn, BlockRun::new(1, 100, 3))
        })
        .unwrap();
        // Holes in group 1: 10..16 (6), 100..103 (3), 1000..1024 (24).
        let pick = in_txn(&fx, |txn| {
            fx.alloc.allocate(
                txn,
                AllocRequest::exact(3).with_hint(AllocHint { group: 1, start: 0 }),
            )
        })
        .unwrap();
        assert_eq!(pick, BlockRun::new(1, 100, 3));
        fx.alloc.check_consistency().unwrap();
    }

    #[test]
    fn full_groups_are_skipped_in_wrap_around_order() {
        let fx = fixture();
        // Fill group 3 (1024 - 201 log blocks = 823 free, in two ranges).
        in_txn(&fx, |txn| {
            fx.alloc.allocate_run(txn, BlockRun::new(3, 0, 728))?;
            fx.alloc.allocate_run(txn, BlockRun::new(3, 929, 95))
        })
        .unwrap();
        let run = in_txn(&fx, |txn| {
            fx.alloc.allocate(
                txn,
                AllocRequest::exact(2).with_hint(AllocHint { group: 3, start: 0 }),
            )
        })
        .unwrap();
        assert_eq!(run.group, 0, "wraps from the last group to the first");
    }

    #[test]
    fn partial_run_when_nothing_fits() {
        let fx = fixture();
        // Leave only scattered 10-block holes everywhere.
        in_txn(&fx, |txn| {
            for group in 0..4_u32 {
                loop {
                    match fx.alloc.allocate(
                        txn,
                        AllocRequest::exact(20).with_hint(AllocHint { group, start: 0 }),
                    ) {
                        Ok(run) if run.group == group => {
                            fx.alloc.free(txn, BlockRun::new(run.group, run.start, 10))?;
                        }
                        Ok(run) => {
                            fx.alloc.free(txn, run)?;
                            break;
                        }
                        Err(BfsError::NoSpace) => break,
                        Err(err) => return Err(err),
                    }
                }
            }
            Ok(())
        })
        .unwrap();
        let largest = (0..4)
            .map(|g| fx.alloc.group_info(GroupNumber(g)).unwrap().largest)
            .max()
            .unwrap();
        assert!(largest < 20);

        let run = in_txn(&fx, |txn| fx.alloc.allocate(txn, AllocRequest::at_least(20, 5))).unwrap();
        assert_eq!(u32::from(run.length), largest);
        let err = in_txn(&fx, |txn| fx.alloc.allocate(txn, AllocRequest::exact(largest + 1)))
            .unwrap_err();
        assert!(matches!(err, BfsError::NoSpace));
        fx.alloc.check_consistency().unwrap();
    }

    #[test]
    fn free_coalesces_neighbours_into_the_largest_hint() {
        let fx = fixture();
        let (a, b) = in_txn(&fx, |txn| {
            let hint = AllocHint { group: 2, start: 0 };
            let a = fx.alloc.allocate(txn, AllocRequest::exact(512).with_hint(hint))?;
            let b = fx.alloc.allocate(txn, AllocRequest::exact(512).with_hint(hint))?;
            Ok((a, b))
        })
        .unwrap();
        assert_eq!(fx.alloc.group_info(GroupNumber(2)).unwrap().largest, 0);
        in_txn(&fx, |txn| fx.alloc.free(txn, a)).unwrap();
        assert_eq!(fx.alloc.group_info(GroupNumber(2)).unwrap().largest, 512);
        in_txn(&fx, |txn| fx.alloc.free(txn, b)).unwrap();
        assert_eq!(fx.alloc.group_info(GroupNumber(2)).unwrap().largest, 1024);
    }

    #[test]
    fn double_free_is_corruption_and_escalates() {
        let fx = fixture();
        let err = in_txn(&fx, |txn| fx.alloc.free(txn, BlockRun::new(1, 50, 2))).unwrap_err();
        assert!(matches!(err, BfsError::BadData { block: 1074, .. }), "{err}");
        assert!(!fx.journal.cache().health().is_writable());
    }

    #[test]
    fn abort_rebuilds_group_summaries() {
        let fx = fixture();
        let before = fx.alloc.bitmap_snapshot().unwrap();
        let free = fx.alloc.free_blocks();
        {
            let txn = Transaction::start(&fx.journal, false).unwrap();
            fx.alloc.allocate(&txn, AllocRequest::exact(64)).unwrap();
            assert_eq!(fx.alloc.free_blocks(), free - 64);
            txn.abort();
        }
        assert_eq!(fx.alloc.free_blocks(), free);
        assert_eq!(fx.alloc.bitmap_snapshot().unwrap(), before);
        fx.alloc.check_consistency().unwrap();
    }

    #[test]
    fn committed_bitmap_reaches_disk_after_flush() {
        let fx = fixture();
        let run = in_txn(&fx, |txn| {
            fx.alloc.allocate(
                txn,
                AllocRequest::exact(3).with_hint(AllocHint { group: 1, start: 8 }),
            )
        })
        .unwrap();
        assert_eq!(run, BlockRun::new(1, 8, 3));
        fx.journal.flush().unwrap();
        let raw = fx
            .journal
            .cache()
            .device()
            .read_block(geometry().bitmap_block(GroupNumber(1)))
            .unwrap();
        assert_eq!(raw.as_slice()[1], 0b0000_0111);
    }

    #[test]
    fn snapshot_and_run_checks() {
        let fx = fixture();
        let snapshot = fx.alloc.bitmap_snapshot().unwrap();
        assert!(snapshot.is_used(BlockNumber(0)));
        assert!(snapshot.is_used(BlockNumber(3800)));
        assert!(!snapshot.is_used(BlockNumber(5)));
        assert_eq!(snapshot.used_blocks(), 206);
        assert_eq!(snapshot.free_blocks(), BLOCKS - 206);
        fx.alloc.check_run(BlockRun::new(0, 0, 5), true).unwrap();
        fx.alloc.check_run(BlockRun::new(0, 5, 100), false).unwrap();
        assert!(fx.alloc.check_run(BlockRun::new(0, 3, 4), true).is_err());
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let fx = fixture();
        for request in [
            AllocRequest::exact(0),
            AllocRequest::at_least(4, 5),
            AllocRequest::exact(70_000),
        ] {
            let err = in_txn(&fx, |txn| fx.alloc.allocate(txn, request)).unwrap_err();
            assert!(matches!(err, BfsError::InvalidArgument(_)), "{request:?}");
        }
        let err = in_txn(&fx, |txn| fx.alloc.free(txn, BlockRun::new(9, 0, 1))).unwrap_err();
        assert!(matches!(err, BfsError::InvalidArgument(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn allocate_then_free_restores_the_bitmap(
            ops in proptest::collection::vec((1_u32..64, 0_u32..4, 0_u16..1024, any::<bool>()), 1..40),
        ) {
            let fx = fixture();
            let initial = fx.alloc.bitmap_snapshot().unwrap();
            let mut live: Vec<BlockRun> = Vec::new();
            for (count, group, start, free_one) in ops {
                if free_one && !live.is_empty() {
                    let run = live.swap_remove(usize::from(start) % live.len());
                    in_txn(&fx, |txn| fx.alloc.free(txn, run)).unwrap();
                } else {
                    let request = AllocRequest::at_least(count, 1)
                        .with_hint(AllocHint { group, start });
                    let run = in_txn(&fx, |txn| fx.alloc.allocate(txn, request)).unwrap();
                    prop_assert!(run.length >= 1 && u32::from(run.length) <= count);
                    live.push(run);
                }
                fx.alloc.check_consistency().unwrap();
            }
            for run in live.drain(..) {
                in_txn(&fx, |txn| fx.alloc.free(txn, run)).unwrap();
            }
            prop_assert_eq!(fx.alloc.bitmap_snapshot().unwrap(), initial);
        }
    }
}
