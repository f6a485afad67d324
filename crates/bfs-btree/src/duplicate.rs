//! Storage for keys holding more than one value.
//!
//! A leaf value is either a plain value or a tagged link:
//!
//! ```text
//! bits 63..62  type (0 = value, 2 = duplicate node, 3 = fragment)
//! bits 61..10  block number
//! bits  9..0   fragment index
//! ```
//!
//! Up to [`MAX_FRAGMENT_VALUES`] duplicates live in a 64-byte fragment
//! `{count i64, 7 values}` packed with other keys' fragments into a shared
//! fragment node. Larger lists move to a chain of duplicate nodes, each
//! `{magic, left, right, count, values...}`.

use crate::node::{bad, parse, put_i64, put_u32};
use bfs_error::Result;
use bfs_types::{BlockNumber, NULL_LINK, expect_magic_u32, read_le_i64, read_le_u32};

pub(crate) const FRAGMENT_MAGIC: u32 = 0x4652_4147;
pub(crate) const DUPLICATE_MAGIC: u32 = 0x4455_5050;

/// Values a single fragment holds.
pub const MAX_FRAGMENT_VALUES: usize = 7;
/// Largest value a tree stores; the top two bits are reserved for links.
pub const MAX_VALUE: i64 = (1 << 62) - 1;

const FRAGMENT_SIZE: usize = 64;
const FRAGMENT_HEADER: usize = 8;
const DUPLICATE_HEADER: usize = 32;

const TYPE_SHIFT: u32 = 62;
const TYPE_DUPLICATE_NODE: u64 = 2;
const TYPE_FRAGMENT: u64 = 3;
const INDEX_BITS: u32 = 10;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const BLOCK_MASK: u64 = (1 << (TYPE_SHIFT - INDEX_BITS)) - 1;

/// What a leaf value slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueSlot {
    Single(i64),
    Fragment { block: BlockNumber, index: usize },
    Duplicates { first: BlockNumber },
}

impl ValueSlot {
    pub(crate) fn decode(raw: i64, leaf: BlockNumber) -> Result<Self> {
        let bits = to_bits(raw);
        let block = BlockNumber((bits >> INDEX_BITS) & BLOCK_MASK);
        let index = usize::try_from(bits & INDEX_MASK).unwrap_or(usize::MAX);
        match bits >> TYPE_SHIFT {
            0 => Ok(Self::Single(raw)),
            TYPE_DUPLICATE_NODE if index == 0 => Ok(Self::Duplicates { first: block }),
            TYPE_FRAGMENT => Ok(Self::Fragment { block, index }),
            _ => Err(bad(leaf, format!("value {raw:#x} is not a valid duplicate link"))),
        }
    }

    pub(crate) fn encode(self) -> i64 {
        let bits = match self {
            Self::Single(value) => return value,
            Self::Fragment { block, index } => {
                (TYPE_FRAGMENT << TYPE_SHIFT)
                    | ((block.0 & BLOCK_MASK) << INDEX_BITS)
                    | (index as u64 & INDEX_MASK)
            }
            Self::Duplicates { first } => {
                (TYPE_DUPLICATE_NODE << TYPE_SHIFT) | ((first.0 & BLOCK_MASK) << INDEX_BITS)
            }
        };
        i64::from_ne_bytes(bits.to_ne_bytes())
    }
}

/// Bit pattern of a raw slot; the tag lives in the sign bits.
fn to_bits(raw: i64) -> u64 {
    u64::from_ne_bytes(raw.to_ne_bytes())
}

// ── Fragment nodes ──────────────────────────────────────────────────────────

/// A shared block of fragments. An empty slot is free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FragmentNode {
    pub(crate) slots: Vec<Vec<i64>>,
}

impl FragmentNode {
    pub(crate) fn slots_per_node(node_size: usize) -> usize {
        (node_size - FRAGMENT_HEADER) / FRAGMENT_SIZE
    }

    pub(crate) fn empty(node_size: usize) -> Self {
        Self {
            slots: vec![Vec::new(); Self::slots_per_node(node_size)],
        }
    }

    pub(crate) fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Vec::is_empty)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.iter().all(Vec::is_empty)
    }

    pub(crate) fn used(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.is_empty()).count()
    }

    pub(crate) fn decode(buf: &[u8], block: BlockNumber) -> Result<Self> {
        expect_magic_u32(buf, 0, FRAGMENT_MAGIC).map_err(parse(block, "fragment node"))?;
        let used = read_le_u32(buf, 4).map_err(parse(block, "fragment use count"))? as usize;
        let mut slots = Vec::with_capacity(Self::slots_per_node(buf.len()));
        for index in 0..Self::slots_per_node(buf.len()) {
            let at = FRAGMENT_HEADER + index * FRAGMENT_SIZE;
            let count = read_le_i64(buf, at).map_err(parse(block, "fragment count"))?;
            let count = usize::try_from(count)
                .ok()
                .filter(|count| *count <= MAX_FRAGMENT_VALUES)
                .ok_or_else(|| bad(block, format!("fragment {index} holds {count} values")))?;
            let values = (0..count)
                .map(|i| read_le_i64(buf, at + 8 + 8 * i).map_err(parse(block, "fragment value")))
                .collect::<Result<Vec<_>>>()?;
            slots.push(values);
        }
        let node = Self { slots };
        if node.used() != used {
            return Err(bad(
                block,
                format!("fragment node claims {used} fragments, holds {}", node.used()),
            ));
        }
        Ok(node)
    }

    pub(crate) fn encode(&self, node_size: usize) -> Vec<u8> {
        let mut buf = vec![0_u8; node_size];
        put_u32(&mut buf, 0, FRAGMENT_MAGIC);
        put_u32(&mut buf, 4, u32::try_from(self.used()).unwrap_or(u32::MAX));
        for (index, values) in self.slots.iter().enumerate() {
            let at = FRAGMENT_HEADER + index * FRAGMENT_SIZE;
            put_i64(&mut buf, at, i64::try_from(values.len()).unwrap_or(0));
            for (i, value) in values.iter().enumerate() {
                put_i64(&mut buf, at + 8 + 8 * i, *value);
            }
        }
        buf
    }
}

// ── Duplicate nodes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DuplicateNode {
    pub(crate) left: i64,
    pub(crate) right: i64,
    pub(crate) values: Vec<i64>,
}

impl DuplicateNode {
    pub(crate) fn capacity(node_size: usize) -> usize {
        (node_size - DUPLICATE_HEADER) / 8
    }

    pub(crate) fn new(values: Vec<i64>) -> Self {
        Self {
            left: NULL_LINK,
            right: NULL_LINK,
            values,
        }
    }

    pub(crate) fn decode(buf: &[u8], block: BlockNumber) -> Result<Self> {
        expect_magic_u32(buf, 0, DUPLICATE_MAGIC).map_err(parse(block, "duplicate node"))?;
        let left = read_le_i64(buf, 8).map_err(parse(block, "duplicate left link"))?;
        let right = read_le_i64(buf, 16).map_err(parse(block, "duplicate right link"))?;
        let count = read_le_i64(buf, 24).map_err(parse(block, "duplicate count"))?;
        let count = usize::try_from(count)
            .ok()
            .filter(|count| (1..=Self::capacity(buf.len())).contains(count))
            .ok_or_else(|| bad(block, format!("duplicate node holds {count} values")))?;
        let values = (0..count)
            .map(|i| {
                read_le_i64(buf, DUPLICATE_HEADER + 8 * i).map_err(parse(block, "duplicate value"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            left,
            right,
            values,
        })
    }

    pub(crate) fn encode(&self, node_size: usize) -> Vec<u8> {
        let mut buf = vec![0_u8; node_size];
        put_u32(&mut buf, 0, DUPLICATE_MAGIC);
        put_i64(&mut buf, 8, self.left);
        put_i64(&mut buf, 16, self.right);
        put_i64(&mut buf, 24, i64::try_from(self.values.len()).unwrap_or(0));
        for (i, value) in self.values.iter().enumerate() {
            put_i64(&mut buf, DUPLICATE_HEADER + 8 * i, *value);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_carry_type_block_and_index() {
        let fragment = ValueSlot::Fragment {
            block: BlockNumber(0x1234),
            index: 9,
        };
        let raw = fragment.encode();
        assert!(raw < 0, "tagged links use the sign bits");
        assert_eq!(to_bits(raw) >> 62, 3);
        assert_eq!((to_bits(raw) >> 10) & 0xFFFF, 0x1234);
        assert_eq!(ValueSlot::decode(raw, BlockNumber(1)).unwrap(), fragment);

        let dup = ValueSlot::Duplicates {
            first: BlockNumber(88),
        };
        assert_eq!(to_bits(dup.encode()) >> 62, 2);
        assert_eq!(ValueSlot::decode(dup.encode(), BlockNumber(1)).unwrap(), dup);

        assert_eq!(
            ValueSlot::decode(MAX_VALUE, BlockNumber(1)).unwrap(),
            ValueSlot::Single(MAX_VALUE)
        );
        assert!(ValueSlot::decode(1 << 62, BlockNumber(1)).is_err());
    }

    #[test]
    fn fragment_node_round_trip() {
        let mut node = FragmentNode::empty(1024);
        assert_eq!(node.slots.len(), 15);
        node.slots[0] = vec![1, 2];
        node.slots[3] = vec![7; MAX_FRAGMENT_VALUES];
        assert_eq!(node.free_slot(), Some(1));
        let buf = node.encode(1024);
        assert_eq!(FragmentNode::decode(&buf, BlockNumber(4)).unwrap(), node);

        let mut bad_count = buf.clone();
        bad_count[8] = 8;
        assert!(FragmentNode::decode(&bad_count, BlockNumber(4)).unwrap_err().is_corruption());
        let mut bad_used = buf;
        bad_used[4] = 5;
        assert!(FragmentNode::decode(&bad_used, BlockNumber(4)).unwrap_err().is_corruption());
    }

    #[test]
    fn duplicate_node_round_trip() {
        let mut node = DuplicateNode::new((0..124).collect());
        node.right = 55;
        assert_eq!(DuplicateNode::capacity(1024), 124);
        let buf = node.encode(1024);
        assert_eq!(DuplicateNode::decode(&buf, BlockNumber(6)).unwrap(), node);
        let empty = DuplicateNode::new(Vec::new()).encode(1024);
        assert!(DuplicateNode::decode(&empty, BlockNumber(6)).unwrap_err().is_corruption());
    }
}
