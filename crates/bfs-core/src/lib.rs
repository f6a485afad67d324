#![forbid(unsafe_code)]
//! Volume lifecycle and component wiring.
//!
//! A [`Volume`] bundles the block cache, journal, block allocator and the
//! root index tree of one formatted device:
//!
//! ```text
//! block 0        superblock (offset 512)
//! 1..            allocation group bitmaps
//! log area       journal header + circular log
//! ...            tree nodes and everything else, via the allocator
//! ```
//!
//! [`Volume::mount`] is the only place the log is replayed. A volume that
//! is dropped without [`Volume::unmount`] stays marked dirty; the next
//! mount replays whatever the log still holds.
//!
//! # Opening a volume
//!
//! ```ignore
//! let device: Arc<dyn BlockDevice> = Arc::new(mem_block_device(1024, 16_384)?);
//! Volume::format(&device, &FormatOptions::default())?;
//! let volume = Volume::mount(device, &MountOptions::default())?;
//! let txn = volume.start_transaction()?;
//! volume.root_index().insert(&txn, &volume.nodes(), b"key", 7)?;
//! txn.done()?;
//! volume.unmount()?;
//! ```

pub mod superblock;

pub use bfs_alloc::{AllocHint, AllocRequest, BitmapSnapshot, BlockAllocator, GroupInfo};
pub use bfs_block::{
    BlockCache, BlockDevice, ByteBlockDevice, ByteDevice, CacheConfig, CacheStats,
    FailingBlockDevice, FileByteDevice, HealthState, MemByteDevice, VolumeHealth,
    mem_block_device,
};
pub use bfs_btree::{
    BPlusTree, Direction, KeyType, MAX_KEY_LENGTH, MAX_VALUE, NodeAllocator, TreeIterator,
    TreeOptions, TreeStats,
};
pub use bfs_error::{BfsError, Result};
pub use bfs_journal::{
    Journal, JournalConfig, JournalStats, LogLayout, LogUsage, ReplayReport, Transaction,
    TransactionListener,
};
pub use bfs_types::{BlockNumber, BlockRun, BlockSize, GroupNumber, VolumeGeometry};
pub use superblock::{Superblock, VolumeState};

use bfs_journal::format::decode_header;
use bfs_journal::{initialize_log, replay};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use superblock::{SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE, region_of, write_into_block};
use tracing::{debug, info, warn};

// ── Options ─────────────────────────────────────────────────────────────────

/// Parameters for [`Volume::format`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    pub name: String,
    /// Must match the device block size.
    pub block_size: u32,
    /// Allocation groups hold `1 << ag_shift` blocks.
    pub ag_shift: u32,
    /// Log area length: the journal header plus the circular log.
    pub log_blocks: u16,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            name: "bfs".to_owned(),
            block_size: 2048,
            ag_shift: 13,
            log_blocks: 2049,
        }
    }
}

/// Options controlling how a volume is mounted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    /// Refuse all writes. A read-only mount never replays, so the log must
    /// already be empty.
    pub read_only: bool,
    pub cache: CacheConfig,
    pub journal: JournalConfig,
}

/// Point-in-time counters of a mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub health: HealthState,
    pub free_blocks: u64,
    pub used_blocks: u64,
    pub cache: CacheStats,
    pub journal: JournalStats,
    pub log: LogUsage,
}

// ── Tree nodes from the allocator ───────────────────────────────────────────

/// Lends the block allocator to trees for node allocation.
#[derive(Debug, Clone, Copy)]
pub struct TreeNodes<'a> {
    allocator: &'a BlockAllocator,
}

impl<'a> TreeNodes<'a> {
    #[must_use]
    pub fn new(allocator: &'a BlockAllocator) -> Self {
        Self { allocator }
    }
}

impl NodeAllocator for TreeNodes<'_> {
    fn allocate_node(&self, txn: &Transaction<'_>, near: BlockNumber) -> Result<BlockNumber> {
        let geometry = self.allocator.geometry();
        let run = self.allocator.allocate(
            txn,
            AllocRequest::exact(1).with_hint(AllocHint::near(geometry, near)),
        )?;
        Ok(geometry.run_start(&run))
    }

    fn free_node(&self, txn: &Transaction<'_>, block: BlockNumber) -> Result<()> {
        let run = self
            .allocator
            .geometry()
            .run_for(block, 1)
            .map_err(|err| BfsError::InvalidArgument(format!("tree node {block}: {err}")))?;
        self.allocator.free(txn, run)
    }
}

// ── Volume ──────────────────────────────────────────────────────────────────

/// A mounted volume.
pub struct Volume {
    device: Arc<dyn BlockDevice>,
    superblock: Mutex<Superblock>,
    health: Arc<VolumeHealth>,
    journal: Journal,
    allocator: BlockAllocator,
    root_index: BPlusTree,
    replay: ReplayReport,
    was_clean: bool,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("superblock", &*self.superblock.lock())
            .field("health", &self.health.state())
            .field("replay", &self.replay)
            .finish_non_exhaustive()
    }
}

fn write_superblock(device: &dyn BlockDevice, superblock: &Superblock) -> Result<()> {
    let region = superblock.encode_region()?;
    let mut block = device.read_block(BlockNumber(0))?.into_inner();
    if block.len() < SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE {
        return Err(BfsError::Format(format!(
            "block 0 holds only {} bytes",
            block.len()
        )));
    }
    write_into_block(&mut block, &region);
    device.write_block(BlockNumber(0), &block)?;
    device.sync()
}

/// Runs covering blocks `0..end`, split at group boundaries.
fn leading_runs(geometry: &VolumeGeometry, end: u64) -> Result<Vec<BlockRun>> {
    let mut runs = Vec::new();
    let mut next = 0_u64;
    while next < end {
        let group_end = (next | (geometry.blocks_per_group() - 1)) + 1;
        let stop = end.min(group_end).min(next + u64::from(u16::MAX));
        let length = u16::try_from(stop - next).unwrap_or(u16::MAX);
        let run = geometry
            .run_for(BlockNumber(next), length)
            .map_err(|err| BfsError::Format(format!("reserved area: {err}")))?;
        runs.push(run);
        next += u64::from(length);
    }
    Ok(runs)
}

impl Volume {
    // ── Format ──────────────────────────────────────────────────────────────

    /// Write an empty volume onto `device`: superblock, zeroed bitmaps with
    /// the metadata area marked used, an empty log, and an empty root index.
    pub fn format(device: &Arc<dyn BlockDevice>, options: &FormatOptions) -> Result<Superblock> {
        if options.name.len() > superblock::MAX_NAME_LENGTH {
            return Err(BfsError::InvalidArgument(format!(
                "volume name of {} bytes exceeds {}",
                options.name.len(),
                superblock::MAX_NAME_LENGTH
            )));
        }
        if device.block_size() != options.block_size {
            return Err(BfsError::InvalidArgument(format!(
                "device uses {}-byte blocks, format asked for {}",
                device.block_size(),
                options.block_size
            )));
        }
        let block_size = BlockSize::new(options.block_size)
            .map_err(|err| BfsError::InvalidArgument(format!("block size: {err}")))?;
        let geometry = VolumeGeometry::new(block_size, device.block_count(), options.ag_shift)
            .map_err(|err| BfsError::InvalidArgument(format!("geometry: {err}")))?;

        let log_start = VolumeGeometry::BITMAP_START + geometry.bitmap_region_blocks();
        let log_run = geometry
            .run_for(BlockNumber(log_start), options.log_blocks)
            .map_err(|err| {
                BfsError::InvalidArgument(format!(
                    "log area of {} blocks at {log_start}: {err}",
                    options.log_blocks
                ))
            })?;
        let layout = LogLayout::from_run(&geometry, &log_run)?;
        let metadata_end = log_start + u64::from(options.log_blocks);
        if metadata_end + 2 > geometry.num_blocks {
            return Err(BfsError::NoSpace);
        }

        let zero = vec![0_u8; block_size.bytes()];
        for block in 0..log_start {
            device.write_block(BlockNumber(block), &zero)?;
        }
        initialize_log(device.as_ref(), &layout)?;

        let root_header = {
            let health = Arc::new(VolumeHealth::default());
            let cache = Arc::new(BlockCache::new(
                Arc::clone(device),
                &CacheConfig::default(),
                health,
            )?);
            let journal = Journal::open(
                Arc::clone(&cache),
                layout,
                geometry,
                JournalConfig {
                    start_flusher: false,
                    ..JournalConfig::default()
                },
            )?;
            let allocator = BlockAllocator::open(cache, geometry)?;
            let txn = Transaction::start(&journal, false)?;
            for run in leading_runs(&geometry, metadata_end)? {
                allocator.allocate_run(&txn, run)?;
            }
            let root = BPlusTree::create(&txn, &TreeNodes::new(&allocator), TreeOptions::default())?;
            txn.done()?;
            journal.flush()?;
            journal.shutdown();
            (root.header_block(), allocator.used_blocks())
        };

        let superblock = Superblock {
            name: options.name.clone(),
            block_size: block_size.get(),
            block_shift: block_size.shift(),
            num_blocks: geometry.num_blocks,
            used_blocks: root_header.1,
            ag_shift: geometry.ag_shift,
            num_groups: geometry.num_groups(),
            state: VolumeState::Clean,
            log_blocks: log_run,
            root_index: geometry
                .run_for(root_header.0, 1)
                .map_err(|err| BfsError::Invariant(format!("root index block: {err}")))?,
        };
        write_superblock(device.as_ref(), &superblock)?;
        info!(
            target: "bfs::volume",
            name = %superblock.name,
            blocks = superblock.num_blocks,
            groups = superblock.num_groups,
            log = %superblock.log_blocks,
            root_index = root_header.0.0,
            "volume_format"
        );
        Ok(superblock)
    }

    /// Create an image file of `len` bytes and format it.
    pub fn format_file(path: impl AsRef<Path>, len: u64, options: &FormatOptions) -> Result<()> {
        let file = FileByteDevice::create(path.as_ref(), len)?;
        let device: Arc<dyn BlockDevice> = Arc::new(ByteBlockDevice::new(file, options.block_size)?);
        Self::format(&device, options)?;
        Ok(())
    }

    // ── Mount ───────────────────────────────────────────────────────────────

    /// Mount the volume on `device`, replaying the log first unless
    /// mounting read-only.
    pub fn mount(device: Arc<dyn BlockDevice>, options: &MountOptions) -> Result<Self> {
        let block0 = device.read_block(BlockNumber(0))?;
        let mut superblock = Superblock::parse_region(region_of(block0.as_slice())?)?;
        if superblock.block_size != device.block_size() {
            return Err(BfsError::Format(format!(
                "volume uses {}-byte blocks, device {}",
                superblock.block_size,
                device.block_size()
            )));
        }
        if superblock.num_blocks > device.block_count() {
            return Err(BfsError::Format(format!(
                "volume spans {} blocks, device holds {}",
                superblock.num_blocks,
                device.block_count()
            )));
        }
        let geometry = superblock.geometry()?;
        let layout = LogLayout::from_run(&geometry, &superblock.log_blocks)?;
        let was_clean = superblock.state == VolumeState::Clean;

        let report = if options.read_only {
            let raw = device.read_block(layout.header_block)?;
            let header = decode_header(raw.as_slice(), layout.header_block)?;
            if !header.is_empty() {
                warn!(
                    target: "bfs::volume",
                    pending = header.used(),
                    "volume_read_only_needs_replay"
                );
                return Err(BfsError::ReadOnly);
            }
            ReplayReport::default()
        } else {
            replay(device.as_ref(), &layout, &geometry)?
        };

        let health = Arc::new(VolumeHealth::new(if options.read_only {
            HealthState::ReadOnlyMount
        } else {
            HealthState::Healthy
        }));
        let cache = Arc::new(BlockCache::new(
            Arc::clone(&device),
            &options.cache,
            Arc::clone(&health),
        )?);
        let journal = Journal::open(
            Arc::clone(&cache),
            layout,
            geometry,
            options.journal.clone(),
        )?;
        let allocator = BlockAllocator::open(Arc::clone(&cache), geometry)?;
        let root_index = BPlusTree::open(cache, geometry.run_start(&superblock.root_index))?;

        let used = allocator.used_blocks();
        if used != superblock.used_blocks {
            warn!(
                target: "bfs::volume",
                recorded = superblock.used_blocks,
                counted = used,
                "volume_used_blocks_corrected"
            );
            superblock.used_blocks = used;
        }
        if !options.read_only {
            superblock.state = VolumeState::Dirty;
            write_superblock(device.as_ref(), &superblock)?;
        }
        info!(
            target: "bfs::volume",
            name = %superblock.name,
            read_only = options.read_only,
            was_clean,
            replayed_entries = report.entries,
            free_blocks = allocator.free_blocks(),
            "volume_mount"
        );
        Ok(Self {
            device,
            superblock: Mutex::new(superblock),
            health,
            journal,
            allocator,
            root_index,
            replay: report,
            was_clean,
        })
    }

    /// Open and mount an image file.
    pub fn open_file(path: impl AsRef<Path>, options: &MountOptions) -> Result<Self> {
        let file = FileByteDevice::open(path.as_ref())?;
        if !file.is_writable() && !options.read_only {
            return Err(BfsError::ReadOnly);
        }
        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        file.read_exact_at(SUPERBLOCK_OFFSET as u64, &mut region)?;
        let superblock = Superblock::parse_region(&region)?;
        let device: Arc<dyn BlockDevice> =
            Arc::new(ByteBlockDevice::new(file, superblock.block_size)?);
        Self::mount(device, options)
    }

    /// Flush the journal, record a clean state and release the volume.
    pub fn unmount(self) -> Result<()> {
        if self.health.is_writable() {
            self.journal.flush()?;
            self.journal.shutdown();
            let mut superblock = self.superblock.lock().clone();
            superblock.used_blocks = self.allocator.used_blocks();
            superblock.state = VolumeState::Clean;
            write_superblock(self.device.as_ref(), &superblock)?;
        } else {
            self.journal.shutdown();
        }
        info!(
            target: "bfs::volume",
            health = ?self.health.state(),
            "volume_unmount"
        );
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.superblock.lock().clone()
    }

    #[must_use]
    pub fn geometry(&self) -> &VolumeGeometry {
        self.journal.geometry()
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
    pub fn is_read_only(&self) -> bool {
        !self.health.is_writable()
    }

    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BlockCache> {
        self.journal.cache()
    }

    #[must_use]
    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    /// Node source for trees on this volume.
    #[must_use]
    pub fn nodes(&self) -> TreeNodes<'_> {
        TreeNodes::new(&self.allocator)
    }

    /// Name-to-tree index created at format time.
    #[must_use]
    pub fn root_index(&self) -> &BPlusTree {
        &self.root_index
    }

    /// What the mount-time replay did.
    #[must_use]
    pub fn replay_report(&self) -> ReplayReport {
        self.replay
    }

    /// False when the previous session ended without an unmount.
    #[must_use]
    pub fn was_clean(&self) -> bool {
        self.was_clean
    }

    #[must_use]
    pub fn stats(&self) -> VolumeStats {
        VolumeStats {
            health: self.health.state(),
            free_blocks: self.allocator.free_blocks(),
            used_blocks: self.allocator.used_blocks(),
            cache: self.cache().stats(),
            journal: self.journal.stats(),
            log: self.journal.log_usage(),
        }
    }

    // ── Transactions and trees ──────────────────────────────────────────────

    /// Start a transaction. Blocks while another thread's transaction runs.
    pub fn start_transaction(&self) -> Result<Transaction<'_>> {
        self.health.check_writable()?;
        Transaction::start(&self.journal, false)
    }

    /// Start a transaction that may be split off from an enclosing one
    /// once that has grown large.
    pub fn start_subtransaction(&self) -> Result<Transaction<'_>> {
        self.health.check_writable()?;
        Transaction::start(&self.journal, true)
    }

    /// Write committed transactions to their final locations.
    pub fn sync(&self) -> Result<()> {
        let flushed = self.journal.flush()?;
        debug!(target: "bfs::volume", entries = flushed, "volume_sync");
        Ok(())
    }

    pub fn create_tree(&self, txn: &Transaction<'_>, options: TreeOptions) -> Result<BPlusTree> {
        BPlusTree::create(txn, &self.nodes(), options)
    }

    pub fn open_tree(&self, header_block: BlockNumber) -> Result<BPlusTree> {
        BPlusTree::open(Arc::clone(self.cache()), header_block)
    }

    /// Create a tree and record it in the root index under `name`.
    pub fn create_named_tree(
        &self,
        txn: &Transaction<'_>,
        name: &str,
        options: TreeOptions,
    ) -> Result<BPlusTree> {
        let tree = self.create_tree(txn, options)?;
        let header = i64::try_from(tree.header_block().0)
            .map_err(|_| BfsError::Invariant(format!("tree header {}", tree.header_block())))?;
        self.root_index
            .insert(txn, &self.nodes(), name.as_bytes(), header)?;
        debug!(target: "bfs::volume", name, header = tree.header_block().0, "volume_tree_created");
        Ok(tree)
    }

    /// Open the tree recorded in the root index under `name`.
    pub fn open_named_tree(&self, name: &str) -> Result<BPlusTree> {
        let header = self.root_index.find(name.as_bytes())?;
        let block = u64::try_from(header).map_err(|_| BfsError::BadData {
            block: self.root_index.header_block().0,
            detail: format!("root index entry {name:?} holds {header}"),
        })?;
        self.open_tree(BlockNumber(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> FormatOptions {
        FormatOptions {
            name: "unit".to_owned(),
            block_size: 1024,
            ag_shift: 13,
            log_blocks: 257,
        }
    }

    fn device() -> Arc<dyn BlockDevice> {
        Arc::new(mem_block_device(1024, 16_384).unwrap())
    }

    #[test]
    fn leading_runs_split_at_group_boundaries() {
        let geometry = VolumeGeometry::new(BlockSize::new(1024).unwrap(), 16_384, 13).unwrap();
        assert_eq!(leading_runs(&geometry, 5).unwrap(), vec![BlockRun::new(0, 0, 5)]);
        assert_eq!(
            leading_runs(&geometry, 8200).unwrap(),
            vec![BlockRun::new(0, 0, 8192), BlockRun::new(1, 0, 8)]
        );
        assert!(leading_runs(&geometry, 0).unwrap().is_empty());
    }

    #[test]
    fn format_reserves_metadata_and_creates_the_root_index() {
        let device = device();
        let sb = Volume::format(&device, &options()).unwrap();
        assert_eq!(sb.num_groups, 2);
        // Superblock, two bitmap blocks, the log area, and the root index
        // header plus its leaf.
        assert_eq!(sb.log_blocks, BlockRun::new(0, 3, 257));
        assert_eq!(sb.used_blocks, 3 + 257 + 2);

        let volume = Volume::mount(device, &MountOptions::default()).unwrap();
        assert!(volume.was_clean());
        assert_eq!(volume.allocator().used_blocks(), sb.used_blocks);
        let snapshot = volume.allocator().bitmap_snapshot().unwrap();
        for block in 0..260 {
            assert!(snapshot.is_used(BlockNumber(block)), "block {block}");
        }
        assert_eq!(volume.root_index().validate().unwrap().keys, 0);
        volume.allocator().check_consistency().unwrap();
        volume.unmount().unwrap();
    }

    #[test]
    fn format_rejects_bad_parameters() {
        let device = device();
        let wrong_size = FormatOptions {
            block_size: 2048,
            ..options()
        };
        assert!(matches!(
            Volume::format(&device, &wrong_size),
            Err(BfsError::InvalidArgument(_))
        ));
        let long_log = FormatOptions {
            log_blocks: 9000,
            ..options()
        };
        assert!(matches!(
            Volume::format(&device, &long_log),
            Err(BfsError::InvalidArgument(_))
        ));
        let long_name = FormatOptions {
            name: "n".repeat(32),
            ..options()
        };
        assert!(Volume::format(&device, &long_name).is_err());
    }

    #[test]
    fn mount_marks_dirty_until_unmount() {
        let device = device();
        Volume::format(&device, &options()).unwrap();
        let volume = Volume::mount(Arc::clone(&device), &MountOptions::default()).unwrap();
        assert_eq!(volume.superblock().state, VolumeState::Dirty);
        drop(volume);

        let volume = Volume::mount(Arc::clone(&device), &MountOptions::default()).unwrap();
        assert!(!volume.was_clean(), "dropped without unmount");
        volume.unmount().unwrap();

        let volume = Volume::mount(device, &MountOptions::default()).unwrap();
        assert!(volume.was_clean());
    }

    #[test]
    fn read_only_mount_refuses_transactions() {
        let device = device();
        Volume::format(&device, &options()).unwrap();
        let volume = Volume::mount(
            Arc::clone(&device),
            &MountOptions {
                read_only: true,
                ..MountOptions::default()
            },
        )
        .unwrap();
        assert!(volume.is_read_only());
        assert!(matches!(volume.start_transaction(), Err(BfsError::ReadOnly)));
        assert_eq!(volume.superblock().state, VolumeState::Clean);
        volume.unmount().unwrap();
    }

    #[test]
    fn named_trees_survive_a_remount() {
        let device = device();
        Volume::format(&device, &options()).unwrap();
        let volume = Volume::mount(Arc::clone(&device), &MountOptions::default()).unwrap();
        let txn = volume.start_transaction().unwrap();
        let tree = volume
            .create_named_tree(&txn, "sizes", TreeOptions {
                key_type: KeyType::Int64,
                allow_duplicates: true,
            })
            .unwrap();
        tree.insert(&txn, &volume.nodes(), &5_i64.to_le_bytes(), 50).unwrap();
        tree.insert(&txn, &volume.nodes(), &5_i64.to_le_bytes(), 51).unwrap();
        txn.done().unwrap();
        volume.unmount().unwrap();

        let volume = Volume::mount(device, &MountOptions::default()).unwrap();
        let tree = volume.open_named_tree("sizes").unwrap();
        assert_eq!(tree.key_type(), KeyType::Int64);
        assert_eq!(tree.find_all(&5_i64.to_le_bytes()).unwrap(), vec![50, 51]);
        assert!(matches!(
            volume.open_named_tree("missing"),
            Err(BfsError::NotFound)
        ));
    }

    #[test]
    fn tree_nodes_come_from_the_allocator() {
        let device = device();
        Volume::format(&device, &options()).unwrap();
        let volume = Volume::mount(device, &MountOptions::default()).unwrap();
        let before = volume.allocator().used_blocks();
        let txn = volume.start_transaction().unwrap();
        let nodes = volume.nodes();
        let block = nodes.allocate_node(&txn, BlockNumber(9000)).unwrap();
        assert_eq!(volume.geometry().group_of(block), GroupNumber(1));
        assert_eq!(volume.allocator().used_blocks(), before + 1);
        nodes.free_node(&txn, block).unwrap();
        txn.done().unwrap();
        assert_eq!(volume.allocator().used_blocks(), before);
    }
}
