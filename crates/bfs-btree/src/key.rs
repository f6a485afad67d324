//! Key types and ordering.

use bfs_error::{BfsError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Longest key a node accepts.
pub const MAX_KEY_LENGTH: usize = 256;

/// How keys of a tree are interpreted and ordered. Stored in the tree
/// header as a `u32` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// Raw bytes, lexicographic.
    String,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float,
    Double,
    /// Bytes compared with ASCII case folded; keys differing only in case
    /// are the same key.
    CaseInsensitive,
}

impl KeyType {
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::String => 0,
            Self::Int32 => 1,
            Self::Uint32 => 2,
            Self::Int64 => 3,
            Self::Uint64 => 4,
            Self::Float => 5,
            Self::Double => 6,
            Self::CaseInsensitive => 7,
        }
    }

    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::String,
            1 => Self::Int32,
            2 => Self::Uint32,
            3 => Self::Int64,
            4 => Self::Uint64,
            5 => Self::Float,
            6 => Self::Double,
            7 => Self::CaseInsensitive,
            _ => return None,
        })
    }

    /// Exact key width for numeric types.
    #[must_use]
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Int32 | Self::Uint32 | Self::Float => Some(4),
            Self::Int64 | Self::Uint64 | Self::Double => Some(8),
            Self::String | Self::CaseInsensitive => None,
        }
    }

    /// Reject keys the tree cannot store.
    pub fn validate(self, key: &[u8]) -> Result<()> {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(BfsError::InvalidArgument(format!(
                "key length {} outside 1..={MAX_KEY_LENGTH}",
                key.len()
            )));
        }
        if let Some(width) = self.fixed_width() {
            if key.len() != width {
                return Err(BfsError::InvalidArgument(format!(
                    "{self:?} key must be {width} bytes, got {}",
                    key.len()
                )));
            }
        }
        Ok(())
    }

    /// Order two stored keys. Numeric keys are little-endian; a key of the
    /// wrong width (only possible on a damaged node) sorts bytewise.
    #[must_use]
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Self::String => a.cmp(b),
            Self::CaseInsensitive => a
                .iter()
                .map(u8::to_ascii_lowercase)
                .cmp(b.iter().map(u8::to_ascii_lowercase)),
            Self::Int32 => numeric(a, b, i32::from_le_bytes),
            Self::Uint32 => numeric(a, b, u32::from_le_bytes),
            Self::Int64 => numeric(a, b, i64::from_le_bytes),
            Self::Uint64 => numeric(a, b, u64::from_le_bytes),
            Self::Float => match (fixed::<4>(a), fixed::<4>(b)) {
                (Some(x), Some(y)) => f32::from_le_bytes(x).total_cmp(&f32::from_le_bytes(y)),
                _ => a.cmp(b),
            },
            Self::Double => match (fixed::<8>(a), fixed::<8>(b)) {
                (Some(x), Some(y)) => f64::from_le_bytes(x).total_cmp(&f64::from_le_bytes(y)),
                _ => a.cmp(b),
            },
        }
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
    bytes.try_into().ok()
}

fn numeric<const N: usize, T: Ord>(a: &[u8], b: &[u8], decode: fn([u8; N]) -> T) -> Ordering {
    match (fixed::<N>(a), fixed::<N>(b)) {
        (Some(x), Some(y)) => decode(x).cmp(&decode(y)),
        _ => a.cmp(b),
    }
}
