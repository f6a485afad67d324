//! Mount-time log replay.

use crate::format::{self, LogLayout};
use bfs_block::BlockDevice;
use bfs_error::{BfsError, Result};
use bfs_types::{BlockNumber, LogSequence, VolumeGeometry};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    /// Complete log entries re-applied.
    pub entries: u64,
    /// Data blocks written to their final locations.
    pub blocks: u64,
    /// Log blocks reclaimed.
    pub log_blocks: u64,
}

fn bad(block: BlockNumber, detail: String) -> BfsError {
    BfsError::BadData {
        block: block.0,
        detail,
    }
}

/// Re-apply every entry between the log tail and head, sync, then mark the
/// log empty.
///
/// Every run array of an entry is verified (magic, checksum, sequence, data
/// checksum) before any block of that entry is written. An entry cut off by
/// the log head is never applied. Running replay
/// again on the result is a no-op, and running it on a copy of the same
/// unreplayed image produces the same bytes.
pub fn replay(
    device: &dyn BlockDevice,
    layout: &LogLayout,
    geometry: &VolumeGeometry,
) -> Result<ReplayReport> {
    let raw = device.read_block(layout.header_block)?;
    let mut header = format::decode_header(raw.as_slice(), layout.header_block)?;
    if header.log_size != layout.log_size {
        return Err(bad(
            layout.header_block,
            format!(
                "journal header log_size {} disagrees with log area of {} blocks",
                header.log_size, layout.log_size
            ),
        ));
    }
    let mut report = ReplayReport::default();
    if header.is_empty() {
        debug!(target: "bfs::journal", "journal_replay_clean");
        return Ok(report);
    }
    info!(
        target: "bfs::journal",
        log_start = header.log_start,
        log_end = header.log_end,
        "journal_replay_start"
    );

    let mut pos = header.log_start;
    let mut expected: Option<LogSequence> = None;
    // Blocks of the entry being verified, written once its last array checks out.
    let mut pending: Vec<(BlockNumber, Vec<u8>)> = Vec::new();
    let mut inside_entry = false;
    while pos < header.log_end {
        let array_block = layout.physical(pos);
        let array = format::decode_run_array(device.read_block(array_block)?.as_slice(), array_block)?;
        if let Some(seq) = expected {
            if array.sequence != seq {
                return Err(bad(
                    array_block,
                    format!("log sequence {} where {seq} was expected", array.sequence),
                ));
            }
        }
        pos += 1;
        let count = array.data_blocks();
        if pos + count > header.log_end {
            return Err(bad(
                array_block,
                format!("run array describes {count} blocks past the log head"),
            ));
        }

        let mut crc = 0_u32;
        for run in &array.runs {
            geometry
                .validate_run(run)
                .map_err(|err| bad(array_block, format!("logged run {run}: {err}")))?;
            let first = geometry.run_start(run);
            for offset in 0..u64::from(run.length) {
                let target = BlockNumber(first.0 + offset);
                if layout.contains(target) {
                    return Err(bad(
                        array_block,
                        format!("logged run {run} targets the log area"),
                    ));
                }
                let bytes = device.read_block(layout.physical(pos))?.into_inner();
                pos += 1;
                crc = crc32c::crc32c_append(crc, &bytes);
                pending.push((target, bytes));
            }
        }
        if crc != array.data_crc {
            return Err(bad(
                array_block,
                format!(
                    "logged data crc mismatch: stored={:#x} actual={crc:#x}",
                    array.data_crc
                ),
            ));
        }
        if array.last {
            for (target, bytes) in pending.drain(..) {
                device.write_block(target, &bytes)?;
                report.blocks += 1;
            }
            report.entries += 1;
            expected = Some(array.sequence.next());
            inside_entry = false;
        } else {
            expected = Some(array.sequence);
            inside_entry = true;
        }
    }
    if inside_entry {
        return Err(bad(
            layout.header_block,
            "log head falls inside an entry".to_owned(),
        ));
    }
    if let Some(next) = expected {
        if next != header.next_sequence {
            return Err(bad(
                layout.header_block,
                format!(
                    "last replayed entry precedes {next}, header expects {}",
                    header.next_sequence
                ),
            ));
        }
    }
    device.sync()?;

    report.log_blocks = header.used();
    header.log_start = header.log_end;
    let encoded = format::encode_header(&header, raw.as_slice().len());
    device.write_block(layout.header_block, &encoded)?;
    device.sync()?;
    info!(
        target: "bfs::journal",
        entries = report.entries,
        blocks = report.blocks,
        log_blocks = report.log_blocks,
        "journal_replay_done"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{LOG_HEADER, geometry, journal, layout};
    use crate::{JournalHeader, Transaction};
    use bfs_block::{ByteBlockDevice, MemByteDevice, mem_block_device};
    use std::sync::Arc;

    fn snapshot(device: &dyn BlockDevice) -> Vec<Vec<u8>> {
        (0..device.block_count())
            .map(|block| device.read_block(BlockNumber(block)).unwrap().into_inner())
            .collect()
    }

    fn restore(image: &[Vec<u8>]) -> ByteBlockDevice<MemByteDevice> {
        let device = mem_block_device(1024, image.len() as u64).unwrap();
        for (block, bytes) in image.iter().enumerate() {
            device.write_block(BlockNumber(block as u64), bytes).unwrap();
        }
        device
    }

    /// Commit a few entries, then "crash" by dropping the journal unflushed.
    fn crashed_image() -> Vec<Vec<u8>> {
        let (device, journal) = journal(64);
        for (block, byte) in [(100_u64, 0x58_u8), (101, 1), (100, 0x59)] {
            let txn = Transaction::start(&journal, false).unwrap();
            txn.get_writable(BlockNumber(block)).unwrap().fill(byte);
            txn.done().unwrap();
        }
        drop(journal);
        snapshot(device.as_ref())
    }

    #[test]
    fn replay_applies_committed_entries() {
        let image = crashed_image();
        assert_eq!(image[100][0], 0, "nothing flushed before the crash");
        let device = restore(&image);

        let report = replay(&device, &layout(64), &geometry()).unwrap();
        assert_eq!(report.entries, 3);
        assert_eq!(report.blocks, 3);
        assert_eq!(report.log_blocks, 6);
        assert_eq!(device.read_block(BlockNumber(100)).unwrap().as_slice()[0], 0x59);
        assert_eq!(device.read_block(BlockNumber(101)).unwrap().as_slice()[0], 1);

        let raw = device.read_block(LOG_HEADER).unwrap();
        let header = format::decode_header(raw.as_slice(), LOG_HEADER).unwrap();
        assert!(header.is_empty());
        assert_eq!(header.next_sequence, LogSequence(4));
    }

    #[test]
    fn replay_is_idempotent() {
        let image = crashed_image();
        let once = restore(&image);
        replay(&once, &layout(64), &geometry()).unwrap();
        let after_once = snapshot(&once);

        let report = replay(&once, &layout(64), &geometry()).unwrap();
        assert_eq!(report, ReplayReport::default());
        assert_eq!(snapshot(&once), after_once);

        // Interrupted after the data writes but before the header update:
        // replaying from the original header again converges.
        let twice = restore(&after_once);
        twice.write_block(LOG_HEADER, &image[LOG_HEADER.0 as usize]).unwrap();
        replay(&twice, &layout(64), &geometry()).unwrap();
        assert_eq!(snapshot(&twice), after_once);
    }

    #[test]
    fn clean_log_is_left_alone() {
        let (device, journal) = journal(16);
        drop(journal);
        let before = snapshot(device.as_ref());
        assert_eq!(
            replay(device.as_ref(), &layout(16), &geometry()).unwrap(),
            ReplayReport::default()
        );
        assert_eq!(snapshot(device.as_ref()), before);
    }

    #[test]
    fn damaged_log_data_is_corruption() {
        let mut image = crashed_image();
        // First data block of the first entry.
        image[LOG_HEADER.0 as usize + 2][10] ^= 0xFF;
        let device = restore(&image);
        let err = replay(&device, &layout(64), &geometry()).unwrap_err();
        assert!(err.is_corruption(), "{err}");
        assert_eq!(device.read_block(BlockNumber(100)).unwrap().as_slice()[0], 0);
    }

    /// One committed transaction over 130 scattered blocks, so its entry
    /// spans two run arrays, left unflushed.
    fn two_array_image() -> Vec<Vec<u8>> {
        let (device, journal) = journal(512);
        let txn = Transaction::start(&journal, false).unwrap();
        for i in 0..130_u64 {
            txn.get_writable(BlockNumber(100 + 2 * i)).unwrap().fill(0x58);
        }
        txn.done().unwrap();
        drop(journal);
        snapshot(device.as_ref())
    }

    fn assert_untouched(device: &dyn BlockDevice) {
        for i in 0..130_u64 {
            let block = BlockNumber(100 + 2 * i);
            assert_eq!(device.read_block(block).unwrap().as_slice()[0], 0, "{block} applied");
        }
    }

    #[test]
    fn damaged_later_array_leaves_whole_entry_unapplied() {
        let mut image = two_array_image();
        let per_array = format::max_runs(1024) as u64;
        let second_array = LOG_HEADER.0 + 2 + per_array;
        let array =
            format::decode_run_array(&image[second_array as usize], BlockNumber(second_array))
                .unwrap();
        assert!(array.last);
        assert_eq!(array.data_blocks(), 130 - per_array);
        image[second_array as usize + 1][10] ^= 0xFF;

        let device = restore(&image);
        let err = replay(&device, &layout(512), &geometry()).unwrap_err();
        assert!(err.is_corruption(), "{err}");
        assert_untouched(&device);
        let raw = device.read_block(LOG_HEADER).unwrap();
        assert!(!format::decode_header(raw.as_slice(), LOG_HEADER).unwrap().is_empty());
    }

    #[test]
    fn entry_cut_off_by_the_head_is_not_applied() {
        let image = two_array_image();
        let device = restore(&image);
        let mut header =
            format::decode_header(&image[LOG_HEADER.0 as usize], LOG_HEADER).unwrap();
        // Head just past the first array's data, before the last array.
        header.log_end = header.log_start + 1 + format::max_runs(1024) as u64;
        device
            .write_block(LOG_HEADER, &format::encode_header(&header, 1024))
            .unwrap();
        assert!(replay(&device, &layout(512), &geometry()).unwrap_err().is_corruption());
        assert_untouched(&device);
    }

    #[test]
    fn sequence_gap_is_corruption() {
        let image = crashed_image();
        let device = restore(&image);
        let raw = device.read_block(LOG_HEADER).unwrap();
        let mut header: JournalHeader = format::decode_header(raw.as_slice(), LOG_HEADER).unwrap();
        header.next_sequence = LogSequence(9);
        device
            .write_block(LOG_HEADER, &format::encode_header(&header, 1024))
            .unwrap();
        assert!(replay(&device, &layout(64), &geometry()).unwrap_err().is_corruption());
    }

    #[test]
    fn shared_device_handle_works() {
        let image = crashed_image();
        let device: Arc<dyn BlockDevice> = Arc::new(restore(&image));
        replay(device.as_ref(), &layout(64), &geometry()).unwrap();
        assert_eq!(device.read_block(BlockNumber(101)).unwrap().as_slice()[0], 1);
    }
}
