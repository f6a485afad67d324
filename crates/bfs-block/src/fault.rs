//! Fault injection for crash-consistency tests.
//!
//! [`FailingBlockDevice`] passes I/O through to an inner device until a
//! write budget is exhausted; from then on writes (and syncs) fail, which
//! models power loss at an exact point in the write stream.

use crate::{BlockBuf, BlockDevice};
use bfs_error::{BfsError, Result};
use bfs_types::BlockNumber;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug)]
pub struct FailingBlockDevice<D: BlockDevice> {
    inner: D,
    writes_left: AtomicU64,
    armed: AtomicBool,
    writes_seen: AtomicU64,
}

impl<D: BlockDevice> FailingBlockDevice<D> {
    /// Wrap `inner` with fault injection disarmed.
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            writes_left: AtomicU64::new(0),
            armed: AtomicBool::new(false),
            writes_seen: AtomicU64::new(0),
        }
    }

    /// Allow `writes` more block writes, then fail everything.
    pub fn fail_after(&self, writes: u64) {
        self.writes_left.store(writes, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn writes_seen(&self) -> u64 {
        self.writes_seen.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn injected() -> BfsError {
        BfsError::Io(std::io::Error::other("injected device failure"))
    }

    fn take_write(&self) -> Result<()> {
        if !self.armed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .map(|_| ())
            .map_err(|_| Self::injected())
    }
}

impl<D: BlockDevice> BlockDevice for FailingBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.inner.read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.take_write()?;
        self.writes_seen.fetch_add(1, Ordering::SeqCst);
        self.inner.write_block(block, data)
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        if self.armed.load(Ordering::SeqCst) && self.writes_left.load(Ordering::SeqCst) == 0 {
            return Err(Self::injected());
        }
        self.inner.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_block_device;

    #[test]
    fn writes_fail_once_budget_is_spent() {
        let dev = FailingBlockDevice::new(mem_block_device(1024, 4).unwrap());
        dev.fail_after(1);
        dev.write_block(BlockNumber(0), &[1; 1024]).expect("first write");
        assert!(dev.write_block(BlockNumber(1), &[2; 1024]).is_err());
        assert!(dev.sync().is_err());
        assert_eq!(dev.writes_seen(), 1);

        dev.disarm();
        dev.write_block(BlockNumber(1), &[2; 1024]).expect("disarmed");
        assert_eq!(dev.read_block(BlockNumber(0)).unwrap().as_slice(), &[1; 1024]);
    }
}
