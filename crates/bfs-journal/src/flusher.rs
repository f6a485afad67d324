//! Background flusher: moves committed entries to their final locations.
//!
//! Wakes when a commit crosses the high-water mark or after
//! `flush_interval` of quiet. It shares only the log state with foreground
//! transactions and never takes the journal lock.

use crate::Shared;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

pub(crate) fn spawn(shared: Arc<Shared>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("bfs-journal-flush".to_owned())
        .spawn(move || run(&shared))
}

fn run(shared: &Shared) {
    debug!(target: "bfs::journal", "journal_flusher_started");
    loop {
        {
            let mut log = shared.log.lock();
            if !log.shutdown && !log.flush_requested {
                let _ = shared.wake.wait_for(&mut log, shared.config.flush_interval);
            }
            if log.shutdown {
                break;
            }
            let requested = std::mem::take(&mut log.flush_requested);
            if log.pending.is_empty() {
                continue;
            }
            trace!(
                target: "bfs::journal",
                requested,
                pending = log.pending.len(),
                "journal_flusher_wake"
            );
        }
        // After escalation the log stays as it is for replay.
        if !shared.cache.health().is_writable() {
            continue;
        }
        if let Err(err) = shared.flush() {
            error!(target: "bfs::journal", error = %err, "journal_background_flush_failed");
        }
    }
    debug!(target: "bfs::journal", "journal_flusher_stopped");
}
