#![forbid(unsafe_code)]
//! Crash-consistency tests for the journal.
//!
//! Scenarios:
//! 1. Power loss at every point of a commit: after replay a transaction is
//!    either fully present or fully absent.
//! 2. Entries spanning several run arrays replay intact.
//! 3. Concurrent committers serialize and every commit survives a crash.

use bfs_block::{
    BlockCache, BlockDevice, ByteBlockDevice, CacheConfig, FailingBlockDevice, MemByteDevice,
    VolumeHealth, mem_block_device,
};
use bfs_error::BfsError;
use bfs_journal::{Journal, JournalConfig, LogLayout, Transaction, initialize_log, replay};
use bfs_types::{BlockNumber, BlockSize, VolumeGeometry};
use std::sync::{Arc, Barrier};
use std::thread;

const BLOCK_SIZE: u32 = 1024;
const BLOCKS: u64 = 4096;
const LOG: LogLayout = LogLayout {
    header_block: BlockNumber(3000),
    log_size: 512,
};

fn geometry() -> VolumeGeometry {
    VolumeGeometry::new(BlockSize::new(BLOCK_SIZE).unwrap(), BLOCKS, 11).unwrap()
}

fn config() -> JournalConfig {
    JournalConfig {
        start_flusher: false,
        sync_retries: 0,
        ..JournalConfig::default()
    }
}

fn open(device: Arc<dyn BlockDevice>) -> Journal {
    let cache = BlockCache::new(
        device,
        &CacheConfig::default(),
        Arc::new(VolumeHealth::default()),
    )
    .unwrap();
    Journal::open(Arc::new(cache), LOG, geometry(), config()).unwrap()
}

fn byte_at(device: &dyn BlockDevice, block: u64) -> u8 {
    device.read_block(BlockNumber(block)).unwrap().as_slice()[0]
}

// ---------------------------------------------------------------------------
// Scenario 1: all-or-nothing under power loss
// ---------------------------------------------------------------------------

const TOUCHED: [u64; 3] = [100, 101, 2100];

fn commit_with_budget(budget: u64) -> (ByteBlockDevice<MemByteDevice>, bool) {
    let device = mem_block_device(BLOCK_SIZE, BLOCKS).unwrap();
    initialize_log(&device, &LOG).unwrap();
    let failing = Arc::new(FailingBlockDevice::new(device));
    let journal = open(failing.clone());
    failing.fail_after(budget);

    let txn = Transaction::start(&journal, false).unwrap();
    for block in TOUCHED {
        txn.get_writable(BlockNumber(block)).unwrap().fill(0x77);
    }
    let committed = txn.done().is_ok();
    drop(journal);

    let failing = Arc::try_unwrap(failing).unwrap_or_else(|_| panic!("journal still holds the device"));
    let image = mem_block_device(BLOCK_SIZE, BLOCKS).unwrap();
    for block in 0..BLOCKS {
        let bytes = failing.inner().read_block(BlockNumber(block)).unwrap();
        image.write_block(BlockNumber(block), bytes.as_slice()).unwrap();
    }
    (image, committed)
}

#[test]
fn power_loss_at_every_write_is_all_or_nothing() {
    // run array + 2 data runs worth of blocks + header = 5 writes.
    for budget in 0..=6 {
        let (image, committed) = commit_with_budget(budget);
        replay(&image, &LOG, &geometry()).unwrap();
        let values: Vec<u8> = TOUCHED.iter().map(|b| byte_at(&image, *b)).collect();
        assert!(
            values.iter().all(|v| *v == 0) || values.iter().all(|v| *v == 0x77),
            "budget {budget}: torn transaction {values:?}"
        );
        if committed {
            assert_eq!(values, vec![0x77; 3], "budget {budget}: acknowledged commit lost");
        }
    }
}

#[test]
fn failed_commit_leaves_volume_read_only() {
    let device = mem_block_device(BLOCK_SIZE, BLOCKS).unwrap();
    initialize_log(&device, &LOG).unwrap();
    let failing = Arc::new(FailingBlockDevice::new(device));
    let journal = open(failing.clone());
    failing.fail_after(2);

    let txn = Transaction::start(&journal, false).unwrap();
    txn.get_writable(BlockNumber(100)).unwrap().fill(1);
    txn.get_writable(BlockNumber(900)).unwrap().fill(1);
    assert!(matches!(txn.done(), Err(BfsError::Io(_))));
    assert!(matches!(
        Transaction::start(&journal, false),
        Err(BfsError::ReadOnly)
    ));
    assert!(journal.cache().health().reason().is_some());
}

// ---------------------------------------------------------------------------
// Scenario 2: multi-array entries
// ---------------------------------------------------------------------------

#[test]
fn entry_spanning_several_run_arrays_replays() {
    let device: Arc<dyn BlockDevice> = Arc::new(mem_block_device(BLOCK_SIZE, BLOCKS).unwrap());
    initialize_log(device.as_ref(), &LOG).unwrap();
    let journal = open(Arc::clone(&device));

    // Every other block: 200 single-block runs, more than one array holds.
    let txn = Transaction::start(&journal, false).unwrap();
    for i in 0..200_u64 {
        let mut block = txn.get_writable(BlockNumber(10 + i * 2)).unwrap();
        block.fill(u8::try_from(i % 251).unwrap() + 1);
    }
    txn.done().unwrap();
    assert_eq!(journal.log_usage().used, 202);
    drop(journal);

    let report = replay(device.as_ref(), &LOG, &geometry()).unwrap();
    assert_eq!(report.entries, 1);
    assert_eq!(report.blocks, 200);
    for i in 0..200_u64 {
        assert_eq!(
            byte_at(device.as_ref(), 10 + i * 2),
            u8::try_from(i % 251).unwrap() + 1
        );
    }
}

// ---------------------------------------------------------------------------
// Scenario 3: concurrent committers
// ---------------------------------------------------------------------------

#[test]
fn concurrent_commits_all_survive_a_crash() {
    let device: Arc<dyn BlockDevice> = Arc::new(mem_block_device(BLOCK_SIZE, BLOCKS).unwrap());
    initialize_log(device.as_ref(), &LOG).unwrap();
    let journal = Arc::new(open(Arc::clone(&device)));
    let threads = 4_u64;
    let per_thread = 20_u64;
    let barrier = Arc::new(Barrier::new(threads as usize));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let journal = Arc::clone(&journal);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..per_thread {
                    let txn = Transaction::start(&journal, false).unwrap();
                    let block = BlockNumber(100 + t * per_thread + i);
                    txn.get_writable(block).unwrap().fill(u8::try_from(t + 1).unwrap());
                    txn.done().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(journal.stats().commits, threads * per_thread);
    drop(journal);

    replay(device.as_ref(), &LOG, &geometry()).unwrap();
    for t in 0..threads {
        for i in 0..per_thread {
            assert_eq!(
                byte_at(device.as_ref(), 100 + t * per_thread + i),
                u8::try_from(t + 1).unwrap()
            );
        }
    }
}
