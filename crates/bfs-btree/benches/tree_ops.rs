//! Benchmark: point lookups, iteration and journaled inserts on a 1 KiB-node
//! tree held in a memory-backed volume.

use bfs_block::{BlockCache, BlockDevice, CacheConfig, VolumeHealth, mem_block_device};
use bfs_btree::{BPlusTree, Direction, NodeAllocator, TreeOptions};
use bfs_error::Result;
use bfs_journal::{Journal, JournalConfig, LogLayout, Transaction, initialize_log};
use bfs_types::{BlockNumber, BlockSize, VolumeGeometry};
use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use parking_lot::Mutex;
use std::sync::Arc;

const BLOCKS: u64 = 65_536;
const KEYS: u32 = 5_000;
const LOG: LogLayout = LogLayout {
    header_block: BlockNumber(60_000),
    log_size: 4_096,
};

struct Counter(Mutex<u64>);

impl NodeAllocator for Counter {
    fn allocate_node(&self, _txn: &Transaction<'_>, _near: BlockNumber) -> Result<BlockNumber> {
        let mut next = self.0.lock();
        *next += 1;
        Ok(BlockNumber(*next))
    }

    fn free_node(&self, _txn: &Transaction<'_>, _block: BlockNumber) -> Result<()> {
        Ok(())
    }
}

fn key(n: u32) -> Vec<u8> {
    format!("bench-{n:08}").into_bytes()
}

fn volume() -> Journal {
    let device: Arc<dyn BlockDevice> = Arc::new(mem_block_device(1024, BLOCKS).unwrap());
    initialize_log(device.as_ref(), &LOG).unwrap();
    let cache = Arc::new(
        BlockCache::new(
            device,
            &CacheConfig {
                capacity_blocks: 16_384,
            },
            Arc::new(VolumeHealth::default()),
        )
        .unwrap(),
    );
    let geometry = VolumeGeometry::new(BlockSize::new(1024).unwrap(), BLOCKS, 13).unwrap();
    Journal::open(
        cache,
        LOG,
        geometry,
        JournalConfig {
            start_flusher: false,
            ..JournalConfig::default()
        },
    )
    .unwrap()
}

fn populated(journal: &Journal, nodes: &Counter) -> BPlusTree {
    let txn = Transaction::start(journal, false).unwrap();
    let tree = BPlusTree::create(&txn, nodes, TreeOptions::default()).unwrap();
    txn.done().unwrap();
    for chunk in (0..KEYS).collect::<Vec<_>>().chunks(250) {
        let txn = Transaction::start(journal, false).unwrap();
        for n in chunk {
            tree.insert(&txn, nodes, &key(*n), i64::from(*n)).unwrap();
        }
        txn.done().unwrap();
        journal.flush().unwrap();
    }
    tree
}

fn bench_reads(c: &mut Criterion) {
    let journal = volume();
    let nodes = Counter(Mutex::new(16));
    let tree = populated(&journal, &nodes);
    let mut group = c.benchmark_group("btree_read");

    group.bench_function("find", |b| {
        let mut n = 0_u32;
        b.iter(|| {
            n = (n + 7_919) % KEYS;
            black_box(tree.find(black_box(&key(n))).unwrap())
        });
    });
    group.bench_function("iterate_forward", |b| {
        b.iter(|| black_box(tree.iter(Direction::Forward).count()));
    });

    group.finish();
}

fn bench_inserts(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_write");
    group.sample_size(20);

    group.bench_function("insert_100_one_txn", |b| {
        b.iter_batched(
            || {
                let journal = volume();
                let nodes = Counter(Mutex::new(16));
                let txn = Transaction::start(&journal, false).unwrap();
                let tree = BPlusTree::create(&txn, &nodes, TreeOptions::default()).unwrap();
                txn.done().unwrap();
                (journal, nodes, tree)
            },
            |(journal, nodes, tree)| {
                let txn = Transaction::start(&journal, false).unwrap();
                for n in 0..100 {
                    tree.insert(&txn, &nodes, &key(n), 1).unwrap();
                }
                txn.done().unwrap();
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_reads, bench_inserts);
criterion_main!(benches);
