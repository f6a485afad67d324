//! Tree header block.
//!
//! ```text
//! 0  magic u32       4  node size u32    8  height u32     12 key type u32
//! 16 root link i64   24 free list i64    32 node count i64 40 flags u32
//! ```

use crate::key::KeyType;
use crate::node::{bad, parse, put_i64, put_u32};
use bfs_error::{BfsError, Result};
use bfs_types::{BlockNumber, expect_magic_u32, read_le_i64, read_le_u32};

pub(crate) const HEADER_MAGIC: u32 = 0x69F6_C2E8;
pub(crate) const FLAG_DUPLICATES: u32 = 1;
/// Deepest tree the header accepts.
pub(crate) const MAX_HEIGHT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TreeHeader {
    pub(crate) node_size: u32,
    /// Levels from the root to the leaves, 1 for a single leaf.
    pub(crate) height: u32,
    pub(crate) key_type: KeyType,
    pub(crate) root: i64,
    pub(crate) free_head: i64,
    /// Nodes owned by the tree, free list included.
    pub(crate) node_count: i64,
    pub(crate) flags: u32,
}

impl TreeHeader {
    pub(crate) fn allows_duplicates(&self) -> bool {
        self.flags & FLAG_DUPLICATES != 0
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; self.node_size as usize];
        put_u32(&mut buf, 0, HEADER_MAGIC);
        put_u32(&mut buf, 4, self.node_size);
        put_u32(&mut buf, 8, self.height);
        put_u32(&mut buf, 12, self.key_type.code());
        put_i64(&mut buf, 16, self.root);
        put_i64(&mut buf, 24, self.free_head);
        put_i64(&mut buf, 32, self.node_count);
        put_u32(&mut buf, 40, self.flags);
        buf
    }

    pub(crate) fn decode(buf: &[u8], block: BlockNumber) -> Result<Self> {
        expect_magic_u32(buf, 0, HEADER_MAGIC).map_err(parse(block, "tree header"))?;
        let node_size = read_le_u32(buf, 4).map_err(parse(block, "node size"))?;
        if node_size as usize != buf.len() {
            return Err(BfsError::Format(format!(
                "tree at block {} uses {node_size}-byte nodes on {}-byte blocks",
                block.0,
                buf.len()
            )));
        }
        let height = read_le_u32(buf, 8).map_err(parse(block, "height"))?;
        if !(1..=MAX_HEIGHT).contains(&height) {
            return Err(bad(block, format!("tree height {height} outside 1..={MAX_HEIGHT}")));
        }
        let code = read_le_u32(buf, 12).map_err(parse(block, "key type"))?;
        let key_type =
            KeyType::from_code(code).ok_or_else(|| bad(block, format!("unknown key type {code}")))?;
        let header = Self {
            node_size,
            height,
            key_type,
            root: read_le_i64(buf, 16).map_err(parse(block, "root link"))?,
            free_head: read_le_i64(buf, 24).map_err(parse(block, "free list"))?,
            node_count: read_le_i64(buf, 32).map_err(parse(block, "node count"))?,
            flags: read_le_u32(buf, 40).map_err(parse(block, "flags"))?,
        };
        if header.root < 0 || header.node_count < 1 {
            return Err(bad(
                block,
                format!(
                    "tree root {} with {} nodes",
                    header.root, header.node_count
                ),
            ));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_types::NULL_LINK;

    #[test]
    fn header_round_trip_and_checks() {
        let header = TreeHeader {
            node_size: 1024,
            height: 2,
            key_type: KeyType::Uint64,
            root: 77,
            free_head: NULL_LINK,
            node_count: 3,
            flags: FLAG_DUPLICATES,
        };
        let buf = header.encode();
        let back = TreeHeader::decode(&buf, BlockNumber(5)).unwrap();
        assert_eq!(back, header);
        assert!(back.allows_duplicates());

        let mut wrong = buf.clone();
        wrong[8] = 0;
        assert!(TreeHeader::decode(&wrong, BlockNumber(5)).unwrap_err().is_corruption());

        let mut wrong = buf.clone();
        wrong[12] = 99;
        assert!(TreeHeader::decode(&wrong, BlockNumber(5)).unwrap_err().is_corruption());

        let err = TreeHeader::decode(&buf[..512], BlockNumber(5)).unwrap_err();
        assert!(matches!(err, BfsError::Format(_)));
    }
}
