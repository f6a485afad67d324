//! Node block codec.
//!
//! ```text
//! 0   magic u32          4  key count u16     6  all key length u16
//! 8   left link i64      16 right link i64    24 overflow link i64
//! 32  key-length table   (u16 cumulative end offsets, one per key)
//!     key bytes
//!     padding to 8
//!     value table        (i64, one per key)
//! ```
//!
//! A leaf has `overflow == -1`. In an internal node value `i` is the child
//! holding keys below key `i`, and the overflow link is the child holding
//! keys at or above the last key. Free nodes carry `overflow == -2` and
//! chain through their right link.

use bfs_error::{BfsError, Result};
use bfs_types::{BlockNumber, NULL_LINK, ParseError, expect_magic_u32, read_le_i64, read_le_u16};

pub(crate) const NODE_MAGIC: u32 = 0x4E50_5442;
pub(crate) const NODE_HEADER_SIZE: usize = 32;
/// Overflow link of a node sitting on the free list.
pub(crate) const FREE_LINK: i64 = -2;

pub(crate) fn bad(block: BlockNumber, detail: impl Into<String>) -> BfsError {
    BfsError::BadData {
        block: block.0,
        detail: detail.into(),
    }
}

pub(crate) fn parse(block: BlockNumber, what: &'static str) -> impl Fn(ParseError) -> BfsError {
    move |err| bad(block, format!("{what}: {err}"))
}

pub(crate) fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_i64(buf: &mut [u8], offset: usize, value: i64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn align8(offset: usize) -> usize {
    (offset + 7) & !7
}

/// Bytes one entry adds to a node: its length slot, key bytes and value.
pub(crate) fn entry_size(key: &[u8]) -> usize {
    2 + key.len() + 8
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Node {
    pub(crate) left: i64,
    pub(crate) right: i64,
    pub(crate) leaf: bool,
    pub(crate) keys: Vec<Vec<u8>>,
    /// Leaf: one value per key. Internal: one child per key, then the
    /// overflow child.
    pub(crate) values: Vec<i64>,
}

impl Node {
    pub(crate) fn empty_leaf() -> Self {
        Self {
            left: NULL_LINK,
            right: NULL_LINK,
            leaf: true,
            keys: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Internal node with a single overflow child.
    pub(crate) fn root_over(child: i64) -> Self {
        Self {
            left: NULL_LINK,
            right: NULL_LINK,
            leaf: false,
            keys: Vec::new(),
            values: vec![child],
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    fn key_bytes(&self) -> usize {
        self.keys.iter().map(Vec::len).sum()
    }

    /// Bytes the encoded node occupies.
    pub(crate) fn used_bytes(&self) -> usize {
        let n = self.keys.len();
        align8(NODE_HEADER_SIZE + 2 * n + self.key_bytes()) + 8 * n
    }

    pub(crate) fn fits(&self, node_size: usize) -> bool {
        self.used_bytes() <= node_size
    }

    /// Child link of an internal node for slot `index` (`len()` is the
    /// overflow child).
    pub(crate) fn child(&self, index: usize) -> i64 {
        self.values[index]
    }

    pub(crate) fn decode(buf: &[u8], block: BlockNumber) -> Result<Self> {
        expect_magic_u32(buf, 0, NODE_MAGIC).map_err(parse(block, "tree node"))?;
        let count = usize::from(read_le_u16(buf, 4).map_err(parse(block, "key count"))?);
        let all_key_length = usize::from(read_le_u16(buf, 6).map_err(parse(block, "key length"))?);
        let left = read_le_i64(buf, 8).map_err(parse(block, "left link"))?;
        let right = read_le_i64(buf, 16).map_err(parse(block, "right link"))?;
        let overflow = read_le_i64(buf, 24).map_err(parse(block, "overflow link"))?;
        if overflow == FREE_LINK {
            return Err(bad(block, "free node reached from the tree"));
        }
        let keys_at = NODE_HEADER_SIZE + 2 * count;
        let values_at = align8(keys_at + all_key_length);
        if values_at + 8 * count > buf.len() {
            return Err(bad(
                block,
                format!("{count} keys of {all_key_length} bytes overrun the node"),
            ));
        }

        let mut keys = Vec::with_capacity(count);
        let mut values = Vec::with_capacity(count + 1);
        let mut start = 0_usize;
        for index in 0..count {
            let end = usize::from(
                read_le_u16(buf, NODE_HEADER_SIZE + 2 * index)
                    .map_err(parse(block, "key length table"))?,
            );
            if end <= start || end > all_key_length {
                return Err(bad(
                    block,
                    format!("key {index} ends at {end}, previous ended at {start}"),
                ));
            }
            keys.push(buf[keys_at + start..keys_at + end].to_vec());
            values.push(read_le_i64(buf, values_at + 8 * index).map_err(parse(block, "value"))?);
            start = end;
        }
        if start != all_key_length {
            return Err(bad(
                block,
                format!("key lengths sum to {start}, header says {all_key_length}"),
            ));
        }
        let leaf = overflow == NULL_LINK;
        if !leaf {
            values.push(overflow);
        }
        Ok(Self {
            left,
            right,
            leaf,
            keys,
            values,
        })
    }

    /// Encode into a fresh `node_size` buffer.
    pub(crate) fn encode(&self, node_size: usize) -> Result<Vec<u8>> {
        let expected_values = self.keys.len() + usize::from(!self.leaf);
        if self.values.len() != expected_values || !self.fits(node_size) {
            return Err(BfsError::Invariant(format!(
                "node with {} keys, {} values and {} bytes does not encode into {node_size}",
                self.keys.len(),
                self.values.len(),
                self.used_bytes()
            )));
        }
        let count = self.keys.len();
        let all_key_length = self.key_bytes();
        let (count_u16, length_u16) = match (u16::try_from(count), u16::try_from(all_key_length)) {
            (Ok(count), Ok(length)) => (count, length),
            _ => {
                return Err(BfsError::Invariant(format!(
                    "node key count {count} or length {all_key_length} exceeds u16"
                )));
            }
        };

        let mut buf = vec![0_u8; node_size];
        put_u32(&mut buf, 0, NODE_MAGIC);
        put_u16(&mut buf, 4, count_u16);
        put_u16(&mut buf, 6, length_u16);
        put_i64(&mut buf, 8, self.left);
        put_i64(&mut buf, 16, self.right);
        let overflow = if self.leaf {
            NULL_LINK
        } else {
            self.values[count]
        };
        put_i64(&mut buf, 24, overflow);

        let keys_at = NODE_HEADER_SIZE + 2 * count;
        let values_at = align8(keys_at + all_key_length);
        let mut end = 0_usize;
        for (index, key) in self.keys.iter().enumerate() {
            buf[keys_at + end..keys_at + end + key.len()].copy_from_slice(key);
            end += key.len();
            put_u16(
                &mut buf,
                NODE_HEADER_SIZE + 2 * index,
                u16::try_from(end).unwrap_or(length_u16),
            );
            put_i64(&mut buf, values_at + 8 * index, self.values[index]);
        }
        Ok(buf)
    }
}

/// Encode a node parked on the free list.
pub(crate) fn encode_free(node_size: usize, next: i64) -> Vec<u8> {
    let mut buf = vec![0_u8; node_size];
    put_u32(&mut buf, 0, NODE_MAGIC);
    put_i64(&mut buf, 8, NULL_LINK);
    put_i64(&mut buf, 16, next);
    put_i64(&mut buf, 24, FREE_LINK);
    buf
}

/// Next link of a free-list node.
pub(crate) fn decode_free(buf: &[u8], block: BlockNumber) -> Result<i64> {
    expect_magic_u32(buf, 0, NODE_MAGIC).map_err(parse(block, "free node"))?;
    let overflow = read_le_i64(buf, 24).map_err(parse(block, "free marker"))?;
    if overflow != FREE_LINK {
        return Err(bad(block, "free list reaches a node in use"));
    }
    read_le_i64(buf, 16).map_err(parse(block, "free list link"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(entries: &[(&[u8], i64)]) -> Node {
        Node {
            left: 7,
            right: NULL_LINK,
            leaf: true,
            keys: entries.iter().map(|(k, _)| k.to_vec()).collect(),
            values: entries.iter().map(|(_, v)| *v).collect(),
        }
    }

    #[test]
    fn leaf_layout_matches_the_documented_offsets() {
        let node = leaf(&[(b"ab", 5), (b"xyz", 1 << 40)]);
        let buf = node.encode(1024).unwrap();
        assert_eq!(&buf[0..4], &NODE_MAGIC.to_le_bytes());
        assert_eq!(u16::from_le_bytes([buf[4], buf[5]]), 2);
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 5);
        assert_eq!(i64::from_le_bytes(buf[24..32].try_into().unwrap()), NULL_LINK);
        // Cumulative end offsets, then the key bytes.
        assert_eq!(&buf[32..36], &[2, 0, 5, 0]);
        assert_eq!(&buf[36..41], b"abxyz");
        // 32 + 4 + 5 = 41, aligned to 48.
        assert_eq!(i64::from_le_bytes(buf[48..56].try_into().unwrap()), 5);
        assert_eq!(node.used_bytes(), 64);
        assert_eq!(Node::decode(&buf, BlockNumber(9)).unwrap(), node);
    }

    #[test]
    fn internal_node_keeps_overflow_child_last() {
        let node = Node {
            left: NULL_LINK,
            right: NULL_LINK,
            leaf: false,
            keys: vec![b"m".to_vec()],
            values: vec![10, 11],
        };
        let buf = node.encode(1024).unwrap();
        assert_eq!(i64::from_le_bytes(buf[24..32].try_into().unwrap()), 11);
        let back = Node::decode(&buf, BlockNumber(1)).unwrap();
        assert!(!back.leaf);
        assert_eq!(back.child(1), 11);
    }

    #[test]
    fn oversized_node_is_an_invariant_error() {
        let big = vec![b'k'; 200];
        let node = leaf(&[(&big, 1), (&big, 2), (&big, 3), (&big, 4), (&big, 5)]);
        assert!(!node.fits(1024));
        assert!(matches!(node.encode(1024), Err(BfsError::Invariant(_))));
    }

    #[test]
    fn damaged_key_table_is_bad_data() {
        let node = leaf(&[(b"a", 1), (b"b", 2)]);
        let mut buf = node.encode(1024).unwrap();
        // Second key ends before the first one.
        buf[34] = 0;
        assert!(Node::decode(&buf, BlockNumber(3)).unwrap_err().is_corruption());

        let mut buf = node.encode(1024).unwrap();
        buf[4] = 0xFF;
        buf[5] = 0xFF;
        assert!(Node::decode(&buf, BlockNumber(3)).unwrap_err().is_corruption());

        let mut buf = node.encode(1024).unwrap();
        buf[0] ^= 1;
        assert!(Node::decode(&buf, BlockNumber(3)).unwrap_err().is_corruption());
    }

    #[test]
    fn free_nodes_are_not_tree_nodes() {
        let buf = encode_free(1024, 42);
        assert_eq!(decode_free(&buf, BlockNumber(5)).unwrap(), 42);
        assert!(Node::decode(&buf, BlockNumber(5)).unwrap_err().is_corruption());
        let live = Node::empty_leaf().encode(1024).unwrap();
        assert!(decode_free(&live, BlockNumber(5)).is_err());
    }
}
