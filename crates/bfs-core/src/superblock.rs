//! Volume superblock.
//!
//! Stored in block 0 at byte offset 512, little-endian:
//!
//! ```text
//! 0   name [u8; 32]       32  magic1 u32         36  byte order u32
//! 40  block size u32      44  block shift u32    48  num blocks u64
//! 56  used blocks u64     64  magic2 u32         68  ag shift u32
//! 72  num groups u32      76  flags u32          80  log area run
//! 88  magic3 u32          92  root index run     100 crc32c of 0..100
//! ```

use bfs_error::{BfsError, Result};
use bfs_types::{
    BlockRun, BlockSize, ParseError, VolumeGeometry, expect_magic_u32, read_le_u32, read_le_u64,
    trim_nul_padded,
};
use serde::{Deserialize, Serialize};

/// Byte offset of the superblock inside block 0.
pub const SUPERBLOCK_OFFSET: usize = 512;
/// Bytes reserved for the superblock.
pub const SUPERBLOCK_SIZE: usize = 512;
/// Longest volume name; one byte of the field stays NUL.
pub const MAX_NAME_LENGTH: usize = 31;

pub const SUPER_MAGIC1: u32 = 0x4246_5331;
pub const SUPER_MAGIC2: u32 = 0xDD12_1031;
pub const SUPER_MAGIC3: u32 = 0x15B6_830E;
pub const BYTE_ORDER: u32 = 0x4249_4745;

const FLAG_CLEAN: u32 = 0x4246_5343;
const FLAG_DIRTY: u32 = 0x4246_5344;

const NAME_LEN: usize = 32;
const CHECKSUM_AT: usize = 100;

/// Whether the volume was unmounted cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeState {
    Clean,
    Dirty,
}

impl VolumeState {
    fn code(self) -> u32 {
        match self {
            Self::Clean => FLAG_CLEAN,
            Self::Dirty => FLAG_DIRTY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub name: String,
    pub block_size: u32,
    pub block_shift: u32,
    pub num_blocks: u64,
    pub used_blocks: u64,
    pub ag_shift: u32,
    pub num_groups: u32,
    pub state: VolumeState,
    /// Journal header block followed by the circular log.
    pub log_blocks: BlockRun,
    /// Header block of the root index tree.
    pub root_index: BlockRun,
}

fn bad(detail: impl Into<String>) -> BfsError {
    BfsError::BadData {
        block: 0,
        detail: detail.into(),
    }
}

fn parse(what: &'static str) -> impl Fn(ParseError) -> BfsError {
    move |err| bad(format!("superblock {what}: {err}"))
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

impl Superblock {
    /// Decode and check a superblock region (`SUPERBLOCK_SIZE` bytes read
    /// from `SUPERBLOCK_OFFSET`).
    ///
    /// Wrong magic numbers mean "not a volume" (`Format`); a checksum or
    /// field mismatch on a recognised superblock is `BadData`.
    pub fn parse_region(region: &[u8]) -> Result<Self> {
        let not_ours = |err: ParseError| BfsError::Format(format!("not a volume: {err}"));
        expect_magic_u32(region, 32, SUPER_MAGIC1).map_err(not_ours)?;
        expect_magic_u32(region, 36, BYTE_ORDER).map_err(not_ours)?;
        expect_magic_u32(region, 64, SUPER_MAGIC2).map_err(not_ours)?;
        expect_magic_u32(region, 88, SUPER_MAGIC3).map_err(not_ours)?;

        let stored = read_le_u32(region, CHECKSUM_AT).map_err(parse("checksum"))?;
        let computed = crc32c::crc32c(&region[..CHECKSUM_AT]);
        if stored != computed {
            return Err(bad(format!(
                "superblock checksum {stored:#010x}, computed {computed:#010x}"
            )));
        }

        let flags = read_le_u32(region, 76).map_err(parse("flags"))?;
        let state = match flags {
            FLAG_CLEAN => VolumeState::Clean,
            FLAG_DIRTY => VolumeState::Dirty,
            other => return Err(bad(format!("unknown superblock flags {other:#x}"))),
        };
        let superblock = Self {
            name: trim_nul_padded(&region[..NAME_LEN]),
            block_size: read_le_u32(region, 40).map_err(parse("block size"))?,
            block_shift: read_le_u32(region, 44).map_err(parse("block shift"))?,
            num_blocks: read_le_u64(region, 48).map_err(parse("block count"))?,
            used_blocks: read_le_u64(region, 56).map_err(parse("used blocks"))?,
            ag_shift: read_le_u32(region, 68).map_err(parse("ag shift"))?,
            num_groups: read_le_u32(region, 72).map_err(parse("group count"))?,
            state,
            log_blocks: BlockRun::decode(region, 80).map_err(parse("log area"))?,
            root_index: BlockRun::decode(region, 92).map_err(parse("root index"))?,
        };
        superblock.geometry()?;
        Ok(superblock)
    }

    /// Encode into a `SUPERBLOCK_SIZE` region with a fresh checksum.
    pub fn encode_region(&self) -> Result<Vec<u8>> {
        if self.name.len() > MAX_NAME_LENGTH {
            return Err(BfsError::InvalidArgument(format!(
                "volume name of {} bytes exceeds {MAX_NAME_LENGTH}",
                self.name.len()
            )));
        }
        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        region[..self.name.len()].copy_from_slice(self.name.as_bytes());
        put_u32(&mut region, 32, SUPER_MAGIC1);
        put_u32(&mut region, 36, BYTE_ORDER);
        put_u32(&mut region, 40, self.block_size);
        put_u32(&mut region, 44, self.block_shift);
        put_u64(&mut region, 48, self.num_blocks);
        put_u64(&mut region, 56, self.used_blocks);
        put_u32(&mut region, 64, SUPER_MAGIC2);
        put_u32(&mut region, 68, self.ag_shift);
        put_u32(&mut region, 72, self.num_groups);
        put_u32(&mut region, 76, self.state.code());
        self.log_blocks
            .encode_into(&mut region, 80)
            .map_err(|err| BfsError::Invariant(err.to_string()))?;
        put_u32(&mut region, 88, SUPER_MAGIC3);
        self.root_index
            .encode_into(&mut region, 92)
            .map_err(|err| BfsError::Invariant(err.to_string()))?;
        let checksum = crc32c::crc32c(&region[..CHECKSUM_AT]);
        put_u32(&mut region, CHECKSUM_AT, checksum);
        Ok(region)
    }

    /// Geometry described by the superblock, after cross-checking the
    /// redundant fields.
    pub fn geometry(&self) -> Result<VolumeGeometry> {
        let block_size = BlockSize::new(self.block_size).map_err(parse("block size"))?;
        if block_size.shift() != self.block_shift {
            return Err(bad(format!(
                "block shift {} does not match block size {}",
                self.block_shift, self.block_size
            )));
        }
        let geometry = VolumeGeometry::new(block_size, self.num_blocks, self.ag_shift)
            .map_err(parse("geometry"))?;
        if geometry.num_groups() != self.num_groups {
            return Err(bad(format!(
                "superblock records {} groups, geometry gives {}",
                self.num_groups,
                geometry.num_groups()
            )));
        }
        if self.used_blocks > self.num_blocks {
            return Err(bad(format!(
                "{} used blocks on a {}-block volume",
                self.used_blocks, self.num_blocks
            )));
        }
        geometry
            .validate_run(&self.log_blocks)
            .map_err(parse("log area"))?;
        geometry
            .validate_run(&self.root_index)
            .map_err(parse("root index"))?;
        if self.root_index.length != 1 {
            return Err(bad(format!("root index run {} is not one block", self.root_index)));
        }
        Ok(geometry)
    }
}

/// Place a superblock region into a copy of block 0.
pub(crate) fn write_into_block(block: &mut [u8], region: &[u8]) {
    block[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE].copy_from_slice(region);
}

/// The superblock region of block 0.
pub(crate) fn region_of(block: &[u8]) -> Result<&[u8]> {
    block
        .get(SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE)
        .ok_or_else(|| BfsError::Format(format!("block 0 holds only {} bytes", block.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        Superblock {
            name: "scratch".to_owned(),
            block_size: 2048,
            block_shift: 11,
            num_blocks: 20_000,
            used_blocks: 600,
            ag_shift: 13,
            num_groups: 3,
            state: VolumeState::Dirty,
            log_blocks: BlockRun::new(0, 4, 513),
            root_index: BlockRun::new(0, 517, 1),
        }
    }

    #[test]
    fn region_round_trip() {
        let sb = sample();
        let region = sb.encode_region().unwrap();
        assert_eq!(region.len(), SUPERBLOCK_SIZE);
        assert_eq!(&region[..7], b"scratch");
        assert_eq!(&region[32..36], &SUPER_MAGIC1.to_le_bytes());
        assert_eq!(Superblock::parse_region(&region).unwrap(), sb);
        assert_eq!(sb.geometry().unwrap().num_groups(), 3);
    }

    #[test]
    fn wrong_magic_is_a_format_error() {
        let mut region = sample().encode_region().unwrap();
        region[88] ^= 0xFF;
        assert!(matches!(
            Superblock::parse_region(&region),
            Err(BfsError::Format(_))
        ));
        assert!(matches!(
            Superblock::parse_region(&[0_u8; SUPERBLOCK_SIZE]),
            Err(BfsError::Format(_))
        ));
    }

    #[test]
    fn damage_is_caught_by_the_checksum() {
        let mut region = sample().encode_region().unwrap();
        region[50] ^= 1;
        let err = Superblock::parse_region(&region).unwrap_err();
        assert!(err.is_corruption(), "{err}");
    }

    #[test]
    fn inconsistent_fields_are_rejected() {
        let mut sb = sample();
        sb.num_groups = 4;
        let region = sb.encode_region().unwrap();
        assert!(Superblock::parse_region(&region).unwrap_err().is_corruption());

        let mut sb = sample();
        sb.block_shift = 10;
        assert!(sb.geometry().unwrap_err().is_corruption());

        let mut sb = sample();
        sb.root_index = BlockRun::new(5, 0, 1);
        assert!(sb.geometry().unwrap_err().is_corruption());

        let mut sb = sample();
        sb.name = "x".repeat(40);
        assert!(matches!(sb.encode_region(), Err(BfsError::InvalidArgument(_))));
    }
}
