#![forbid(unsafe_code)]
//! Shared value types for the BFS storage core.
//!
//! Block and group numbers, block runs, volume geometry, and the
//! little-endian decode helpers every on-disk structure is parsed with.

pub mod lock_order;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Sentinel stored in on-disk `i64` link fields that point nowhere.
pub const NULL_LINK: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Allocation group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Cache-level transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Sequence number of a committed log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogSequence(pub u64);

/// Validated block size (power of two in 1024..=8192).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub const MIN: u32 = 1024;
    pub const MAX: u32 = 8192;

    /// Create a `BlockSize` if `value` is a power of two in [1024, 8192].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=8192",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size as a buffer length.
    #[must_use]
    pub fn bytes(self) -> usize {
        self.0 as usize
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }
}

/// Contiguous extent inside one allocation group.
///
/// On disk this is 8 bytes: `group: u32`, `start: u16`, `length: u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRun {
    pub group: u32,
    pub start: u16,
    pub length: u16,
}

impl BlockRun {
    pub const ENCODED_SIZE: usize = 8;

    #[must_use]
    pub fn new(group: u32, start: u16, length: u16) -> Self {
        Self {
            group,
            start,
            length,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Start offset one past the last block of the run, group-relative.
    #[must_use]
    pub fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.length)
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            group: read_le_u32(data, offset)?,
            start: read_le_u16(data, offset + 4)?,
            length: read_le_u16(data, offset + 6)?,
        })
    }

    /// Write the run into `buf[offset..offset + 8]`.
    pub fn encode_into(&self, buf: &mut [u8], offset: usize) -> Result<(), ParseError> {
        ensure_slice(buf, offset, Self::ENCODED_SIZE)?;
        buf[offset..offset + 4].copy_from_slice(&self.group.to_le_bytes());
        buf[offset + 4..offset + 6].copy_from_slice(&self.start.to_le_bytes());
        buf[offset + 6..offset + 8].copy_from_slice(&self.length.to_le_bytes());
        Ok(())
    }
}

/// Volume geometry: block size, block count, and allocation-group layout.
///
/// Group `g` covers blocks `[g << ag_shift, (g + 1) << ag_shift)`; the last
/// group may be short. Group bitmaps are stored back to back starting at
/// block 1, each `bitmap_blocks_per_group()` blocks long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGeometry {
    pub block_size: BlockSize,
    pub num_blocks: u64,
    pub ag_shift: u32,
}

impl VolumeGeometry {
    /// Largest supported group: `BlockRun::start` is a `u16`.
    pub const MAX_AG_SHIFT: u32 = 16;
    pub const MIN_AG_SHIFT: u32 = 10;
    pub const BITMAP_START: u64 = 1;

    pub fn new(block_size: BlockSize, num_blocks: u64, ag_shift: u32) -> Result<Self, ParseError> {
        if !(Self::MIN_AG_SHIFT..=Self::MAX_AG_SHIFT).contains(&ag_shift) {
            return Err(ParseError::InvalidField {
                field: "ag_shift",
                reason: "must be in 10..=16",
            });
        }
        if num_blocks == 0 {
            return Err(ParseError::InvalidField {
                field: "num_blocks",
                reason: "must be non-zero",
            });
        }
        let geometry = Self {
            block_size,
            num_blocks,
            ag_shift,
        };
        if u32::try_from(geometry.num_groups_u64()).is_err() {
            return Err(ParseError::IntegerConversion {
                field: "num_groups",
            });
        }
        Ok(geometry)
    }

    #[must_use]
    pub fn blocks_per_group(&self) -> u64 {
        1_u64 << self.ag_shift
    }

    fn num_groups_u64(&self) -> u64 {
        self.num_blocks.div_ceil(self.blocks_per_group())
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn num_groups(&self) -> u32 {
        // Range-checked in `new`.
        self.num_groups_u64() as u32
    }

    /// Number of blocks in `group` (the last group may be short).
    #[must_use]
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let start = u64::from(group.0) << self.ag_shift;
        let remaining = self.num_blocks.saturating_sub(start);
        let blocks = remaining.min(self.blocks_per_group());
        u32::try_from(blocks).unwrap_or(0)
    }

    /// Bitmap blocks needed to describe one full group.
    #[must_use]
    pub fn bitmap_blocks_per_group(&self) -> u64 {
        let bits_per_block = u64::from(self.block_size.get()) * 8;
        self.blocks_per_group().div_ceil(bits_per_block)
    }

    /// First bitmap block of `group`.
    #[must_use]
    pub fn bitmap_block(&self, group: GroupNumber) -> BlockNumber {
        BlockNumber(Self::BITMAP_START + u64::from(group.0) * self.bitmap_blocks_per_group())
    }

    /// Total blocks occupied by the bitmap region.
    #[must_use]
    pub fn bitmap_region_blocks(&self) -> u64 {
        u64::from(self.num_groups()) * self.bitmap_blocks_per_group()
    }

    /// Group containing `block`.
    #[must_use]
    pub fn group_of(&self, block: BlockNumber) -> GroupNumber {
        GroupNumber(u32::try_from(block.0 >> self.ag_shift).unwrap_or(u32::MAX))
    }

    /// Absolute first block of `run`.
    #[must_use]
    pub fn run_start(&self, run: &BlockRun) -> BlockNumber {
        BlockNumber((u64::from(run.group) << self.ag_shift) + u64::from(run.start))
    }

    /// Express `length` blocks starting at `block` as a run.
    ///
    /// Fails when the range crosses a group boundary or leaves the volume.
    pub fn run_for(&self, block: BlockNumber, length: u16) -> Result<BlockRun, ParseError> {
        let end = block.0.checked_add(u64::from(length)).ok_or(ParseError::InvalidField {
            field: "block_run",
            reason: "range overflow",
        })?;
        if end > self.num_blocks {
            return Err(ParseError::InvalidField {
                field: "block_run",
                reason: "run extends past the volume",
            });
        }
        let group = self.group_of(block);
        let offset = block.0 & (self.blocks_per_group() - 1);
        if offset + u64::from(length) > self.blocks_per_group() {
            return Err(ParseError::InvalidField {
                field: "block_run",
                reason: "run crosses an allocation group boundary",
            });
        }
        let start = u16::try_from(offset).map_err(|_| ParseError::IntegerConversion {
            field: "block_run.start",
        })?;
        Ok(BlockRun::new(group.0, start, length))
    }

    /// Check that `run` lies inside its group and the volume.
    pub fn validate_run(&self, run: &BlockRun) -> Result<(), ParseError> {
        if run.group >= self.num_groups() {
            return Err(ParseError::InvalidField {
                field: "block_run.group",
                reason: "group out of range",
            });
        }
        if run.end() > self.blocks_in_group(GroupNumber(run.group)) {
            return Err(ParseError::InvalidField {
                field: "block_run.length",
                reason: "run extends past its group",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(i64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Check a little-endian `u32` magic at `offset`.
pub fn expect_magic_u32(data: &[u8], offset: usize, expected: u32) -> Result<(), ParseError> {
    let actual = read_le_u32(data, offset)?;
    if actual != expected {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(expected),
            actual: u64::from(actual),
        });
    }
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Decode an on-disk link field into a block number (`NULL_LINK` → `None`).
#[must_use]
pub fn link_to_block(link: i64) -> Option<BlockNumber> {
    u64::try_from(link).ok().map(BlockNumber)
}

/// Encode an optional block number as an on-disk link field.
#[must_use]
pub fn block_to_link(block: Option<BlockNumber>) -> i64 {
    block
        .and_then(|b| i64::try_from(b.0).ok())
        .unwrap_or(NULL_LINK)
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

impl fmt::Display for LogSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{}", self.group, self.start, self.length)
    }
}

// ── Checked arithmetic helpers ──────────────────────────────────────────────

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Subtract a block count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, count: u64) -> Option<Self> {
        self.0.checked_sub(count).map(Self)
    }
}

impl LogSequence {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}
