//! On-disk log format.
//!
//! The log area is one contiguous block range:
//!
//! ```text
//! [header block][ circular log: log_size blocks ........................ ]
//!                 ^ entry: [run array][data]...[run array(last)][data]
//! ```
//!
//! # Journal header (block 0 of the log area)
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | magic `0x4A524E4C` |
//! | 4 | 4 | version |
//! | 8 | 8 | log_size (circular blocks) |
//! | 16 | 8 | log_start (monotonic position of the oldest live block) |
//! | 24 | 8 | log_end (monotonic position one past the newest live block) |
//! | 32 | 8 | next_sequence |
//! | 40 | 4 | crc32c of bytes 0..40 |
//!
//! Positions grow without bound; the physical block of position `p` is
//! `first_log_block + p % log_size`. `log_start == log_end` means empty.
//!
//! # Run array block
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | magic `0x52554E41` |
//! | 4 | 4 | count (runs in this array) |
//! | 8 | 4 | max_runs |
//! | 12 | 4 | flags (bit 0: last array of the entry) |
//! | 16 | 8 | sequence |
//! | 24 | 4 | crc32c of the data blocks that follow |
//! | 28 | 4 | crc32c of bytes 0..28 and the run table |
//! | 32 | 8·count | block runs `{group u32, start u16, length u16}` |
//!
//! The data blocks of every run follow the array in run order.

use bfs_error::{BfsError, Result};
use bfs_types::{
    BlockNumber, BlockRun, LogSequence, ParseError, VolumeGeometry, expect_magic_u32, read_le_u32,
    read_le_u64,
};

pub const JOURNAL_MAGIC: u32 = 0x4A52_4E4C;
pub const JOURNAL_VERSION: u32 = 1;
pub const RUN_ARRAY_MAGIC: u32 = 0x5255_4E41;
pub const RUN_ARRAY_HEADER_SIZE: usize = 32;
pub const FLAG_LAST_ARRAY: u32 = 1;

const HEADER_CRC_OFFSET: usize = 40;

fn bad(block: BlockNumber, detail: impl Into<String>) -> BfsError {
    BfsError::BadData {
        block: block.0,
        detail: detail.into(),
    }
}

fn parse(block: BlockNumber, what: &str) -> impl Fn(ParseError) -> BfsError + '_ {
    move |err| bad(block, format!("{what}: {err}"))
}

/// Where the log lives on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLayout {
    pub header_block: BlockNumber,
    /// Blocks in the circular area (excluding the header).
    pub log_size: u64,
}

impl LogLayout {
    /// Layout for a log area described by `run` (header + circular area).
    pub fn from_run(geometry: &VolumeGeometry, run: &BlockRun) -> Result<Self> {
        if run.length < 3 {
            return Err(BfsError::Format(format!(
                "log area {run} too small: need a header and at least two log blocks"
            )));
        }
        geometry
            .validate_run(run)
            .map_err(|err| BfsError::Format(format!("log area {run}: {err}")))?;
        Ok(Self {
            header_block: geometry.run_start(run),
            log_size: u64::from(run.length) - 1,
        })
    }

    #[must_use]
    pub fn first_log_block(&self) -> BlockNumber {
        BlockNumber(self.header_block.0 + 1)
    }

    /// Physical block backing monotonic log position `pos`.
    #[must_use]
    pub fn physical(&self, pos: u64) -> BlockNumber {
        BlockNumber(self.first_log_block().0 + pos % self.log_size)
    }

    /// True when `block` falls inside the log area (header included).
    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        block.0 >= self.header_block.0 && block.0 <= self.header_block.0 + self.log_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub log_size: u64,
    pub log_start: u64,
    pub log_end: u64,
    pub next_sequence: LogSequence,
}

impl JournalHeader {
    #[must_use]
    pub fn empty(log_size: u64) -> Self {
        Self {
            log_size,
            log_start: 0,
            log_end: 0,
            next_sequence: LogSequence(1),
        }
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.log_end - self.log_start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log_start == self.log_end
    }
}

#[must_use]
pub fn encode_header(header: &JournalHeader, block_size: usize) -> Vec<u8> {
    let mut buf = vec![0_u8; block_size];
    buf[0..4].copy_from_slice(&JOURNAL_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&JOURNAL_VERSION.to_le_bytes());
    buf[8..16].copy_from_slice(&header.log_size.to_le_bytes());
    buf[16..24].copy_from_slice(&header.log_start.to_le_bytes());
    buf[24..32].copy_from_slice(&header.log_end.to_le_bytes());
    buf[32..40].copy_from_slice(&header.next_sequence.0.to_le_bytes());
    let crc = crc32c::crc32c(&buf[..HEADER_CRC_OFFSET]);
    buf[HEADER_CRC_OFFSET..HEADER_CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
    buf
}

pub fn decode_header(buf: &[u8], block: BlockNumber) -> Result<JournalHeader> {
    expect_magic_u32(buf, 0, JOURNAL_MAGIC).map_err(parse(block, "journal header"))?;
    let version = read_le_u32(buf, 4).map_err(parse(block, "journal version"))?;
    if version != JOURNAL_VERSION {
        return Err(bad(block, format!("unsupported journal version {version}")));
    }
    let stored = read_le_u32(buf, HEADER_CRC_OFFSET).map_err(parse(block, "journal crc"))?;
    let actual = crc32c::crc32c(&buf[..HEADER_CRC_OFFSET]);
    if stored != actual {
        return Err(bad(
            block,
            format!("journal header crc mismatch: stored={stored:#x} actual={actual:#x}"),
        ));
    }
    let header = JournalHeader {
        log_size: read_le_u64(buf, 8).map_err(parse(block, "log_size"))?,
        log_start: read_le_u64(buf, 16).map_err(parse(block, "log_start"))?,
        log_end: read_le_u64(buf, 24).map_err(parse(block, "log_end"))?,
        next_sequence: LogSequence(read_le_u64(buf, 32).map_err(parse(block, "next_sequence"))?),
    };
    if header.log_end < header.log_start || header.used() > header.log_size {
        return Err(bad(
            block,
            format!(
                "log bounds inconsistent: start={} end={} size={}",
                header.log_start, header.log_end, header.log_size
            ),
        ));
    }
    Ok(header)
}

/// Decoded run array block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArray {
    pub sequence: LogSequence,
    pub last: bool,
    pub data_crc: u32,
    pub runs: Vec<BlockRun>,
}

impl RunArray {
    /// Total data blocks described by the runs.
    #[must_use]
    pub fn data_blocks(&self) -> u64 {
        self.runs.iter().map(|run| u64::from(run.length)).sum()
    }
}

/// Runs that fit in one run-array block.
#[must_use]
pub fn max_runs(block_size: usize) -> usize {
    (block_size - RUN_ARRAY_HEADER_SIZE) / BlockRun::ENCODED_SIZE
}

fn run_array_crc(buf: &[u8], count: usize) -> u32 {
    let crc = crc32c::crc32c(&buf[..28]);
    let table_end = RUN_ARRAY_HEADER_SIZE + count * BlockRun::ENCODED_SIZE;
    crc32c::crc32c_append(crc, &buf[RUN_ARRAY_HEADER_SIZE..table_end])
}

pub fn encode_run_array(array: &RunArray, block_size: usize) -> Result<Vec<u8>> {
    let max = max_runs(block_size);
    if array.runs.is_empty() || array.runs.len() > max {
        return Err(BfsError::Invariant(format!(
            "run array holds {} runs, limit is 1..={max}",
            array.runs.len()
        )));
    }
    let mut buf = vec![0_u8; block_size];
    let count = u32::try_from(array.runs.len())
        .map_err(|_| BfsError::Invariant("run count exceeds u32".to_owned()))?;
    let max_u32 = u32::try_from(max)
        .map_err(|_| BfsError::Invariant("max_runs exceeds u32".to_owned()))?;
    buf[0..4].copy_from_slice(&RUN_ARRAY_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&count.to_le_bytes());
    buf[8..12].copy_from_slice(&max_u32.to_le_bytes());
    let flags = if array.last { FLAG_LAST_ARRAY } else { 0 };
    buf[12..16].copy_from_slice(&flags.to_le_bytes());
    buf[16..24].copy_from_slice(&array.sequence.0.to_le_bytes());
    buf[24..28].copy_from_slice(&array.data_crc.to_le_bytes());
    for (i, run) in array.runs.iter().enumerate() {
        run.encode_into(&mut buf, RUN_ARRAY_HEADER_SIZE + i * BlockRun::ENCODED_SIZE)
            .map_err(|err| BfsError::Invariant(format!("run encode: {err}")))?;
    }
    let crc = run_array_crc(&buf, array.runs.len());
    buf[28..32].copy_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

pub fn decode_run_array(buf: &[u8], block: BlockNumber) -> Result<RunArray> {
    expect_magic_u32(buf, 0, RUN_ARRAY_MAGIC).map_err(parse(block, "run array"))?;
    let count = read_le_u32(buf, 4).map_err(parse(block, "run count"))? as usize;
    let max = read_le_u32(buf, 8).map_err(parse(block, "max_runs"))? as usize;
    if count == 0 || count > max || max > max_runs(buf.len()) {
        return Err(bad(
            block,
            format!("run count {count} out of bounds (max_runs={max})"),
        ));
    }
    let stored = read_le_u32(buf, 28).map_err(parse(block, "run array crc"))?;
    let actual = run_array_crc(buf, count);
    if stored != actual {
        return Err(bad(
            block,
            format!("run array crc mismatch: stored={stored:#x} actual={actual:#x}"),
        ));
    }
    let flags = read_le_u32(buf, 12).map_err(parse(block, "flags"))?;
    let mut runs = Vec::with_capacity(count);
    for i in 0..count {
        let run = BlockRun::decode(buf, RUN_ARRAY_HEADER_SIZE + i * BlockRun::ENCODED_SIZE)
            .map_err(parse(block, "block run"))?;
        if run.is_empty() {
            return Err(bad(block, format!("empty block run at index {i}")));
        }
        runs.push(run);
    }
    Ok(RunArray {
        sequence: LogSequence(read_le_u64(buf, 16).map_err(parse(block, "sequence"))?),
        last: flags & FLAG_LAST_ARRAY != 0,
        data_crc: read_le_u32(buf, 24).map_err(parse(block, "data crc"))?,
        runs,
    })
}

/// One run array of an entry being written, covering
/// `blocks[data_start..data_end]` of the sorted dirty set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedArray {
    pub runs: Vec<BlockRun>,
    pub data_start: usize,
    pub data_end: usize,
}

/// Coalesce sorted dirty blocks into runs and split them into arrays that
/// each fit one block.
pub(crate) fn plan_entry(
    geometry: &VolumeGeometry,
    block_size: usize,
    blocks: &[BlockNumber],
) -> Result<Vec<PlannedArray>> {
    let mut runs: Vec<(BlockRun, usize)> = Vec::new();
    for (index, block) in blocks.iter().enumerate() {
        if let Some((run, _)) = runs.last_mut() {
            let next = geometry.run_start(run).0 + u64::from(run.length);
            let same_group = geometry.group_of(*block).0 == run.group;
            if *block == BlockNumber(next) && same_group && run.length < u16::MAX {
                run.length += 1;
                continue;
            }
        }
        let run = geometry
            .run_for(*block, 1)
            .map_err(|err| BfsError::Invariant(format!("dirty block {block}: {err}")))?;
        runs.push((run, index));
    }

    let per_array = max_runs(block_size);
    let mut arrays = Vec::new();
    for chunk in runs.chunks(per_array) {
        let data_start = chunk[0].1;
        let data_end = chunk
            .iter()
            .map(|(run, start)| start + usize::from(run.length))
            .max()
            .unwrap_or(data_start);
        arrays.push(PlannedArray {
            runs: chunk.iter().map(|(run, _)| *run).collect(),
            data_start,
            data_end,
        });
    }
    Ok(arrays)
}
