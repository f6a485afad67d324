#![forbid(unsafe_code)]
//! Public API of the BFS storage core.
//!
//! Re-exports the volume, journal, allocator and B+tree types from
//! `bfs-core` so that downstream code depends on a single crate.

pub use bfs_core::*;
