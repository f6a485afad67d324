#![forbid(unsafe_code)]
//! Error types for the BFS storage core.
//!
//! # Error Taxonomy
//!
//! The core uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `bfs-types` | Byte-level decode failures (short buffer, bad magic) |
//! | Runtime | `BfsError` | `bfs-error` (this crate) | Errors surfaced by cache, journal, allocator, and tree operations |
//!
//! `bfs-error` does not depend on `bfs-types`. Components that decode on-disk
//! structures convert a `ParseError` into [`BfsError::BadData`] themselves,
//! because only they know which block the bytes came from.
//!
//! ## Error classes
//!
//! | Class | Variants | Caller reaction |
//! |-------|----------|-----------------|
//! | Resource exhaustion | `NoSpace`, `TransactionTooLarge` | Recoverable: free space or split the work and retry |
//! | Structural corruption | `BadData` | Fatal to the operation; the volume is escalated to read-only |
//! | Invariant violation | `Invariant` | Debug builds panic first; release builds return the error and the transaction aborts |
//! | Volume state | `ReadOnly`, `Aborted` | Stop issuing writes; restart the transaction |
//! | Lookup | `NotFound`, `Exists` | Ordinary outcomes of index operations |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`BfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `BadData` | `EIO` |
//! | `Invariant` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `TransactionTooLarge` | `EFBIG` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `ReadOnly` | `EROFS` |
//! | `Aborted` | `ECANCELED` |

use thiserror::Error;

/// Unified error type for all storage-core operations.
#[derive(Debug, Error)]
pub enum BfsError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk structure failed validation (bad magic, out-of-range key
    /// count, inconsistent length table, checksum mismatch).
    ///
    /// `block` is the block the bytes were read from, for triage.
    #[error("bad data at block {block}: {detail}")]
    BadData { block: u64, detail: String },

    /// An internal invariant was broken by the caller or by a bug.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Device or volume format is not usable (wrong magic, bad geometry).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// A caller-supplied argument is outside the accepted range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No allocation group can satisfy the request.
    #[error("no space left on device")]
    NoSpace,

    /// A single transaction needs more log blocks than the log holds.
    #[error("transaction needs {needed} log blocks but the log holds {capacity}")]
    TransactionTooLarge { needed: u64, capacity: u64 },

    /// Key (or key/value pair) not present.
    #[error("entry not found")]
    NotFound,

    /// Key already present in a tree without duplicate support.
    #[error("entry exists")]
    Exists,

    /// Volume is mounted read-only or was escalated to read-only.
    #[error("read-only volume")]
    ReadOnly,

    /// The transaction was aborted (explicitly, or by a nested failure).
    #[error("transaction aborted")]
    Aborted,
}

impl BfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; adding a variant is a compile error until
    /// its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::BadData { .. } | Self::Invariant(_) => libc::EIO,
            Self::Format(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::TransactionTooLarge { .. } => libc::EFBIG,
            Self::NotFound => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::ReadOnly => libc::EROFS,
            Self::Aborted => libc::ECANCELED,
        }
    }

    /// True for corruption-class errors that must escalate the volume.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::BadData { .. })
    }

    /// True for exhaustion errors a caller may retry after freeing space.
    #[must_use]
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::NoSpace | Self::TransactionTooLarge { .. })
    }
}

/// Result alias using `BfsError`.
pub type Result<T> = std::result::Result<T, BfsError>;
