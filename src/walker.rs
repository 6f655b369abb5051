//! Start-up walker: seed the message store's reference counts from every
//! durable queue's on-disk index.
//!
//! At broker boot, before any queue recovers, the message store needs to
//! know which message ids are still referenced and how many times. The
//! walker answers that by scanning every durable queue's journal and
//! segments concurrently and emitting one `(msg_id, 1)` per persistent,
//! un-acked publish, embedded or not.
//!
//! Shape: a bounded pool of worker threads drains a shared work channel
//! of queue directories; results funnel through a bounded MPSC gatherer
//! that the consumer drains one record at a time (backpressure is the
//! bound). The walker is finished when every worker has dropped its
//! sender and the gatherer is empty, which is exactly when `recv`
//! disconnects.

use crate::codec::MsgId;
use crate::error::IndexResult;
use crate::index::{queue_dir_name, scan_unacked, QUEUES_DIR};
use crate::storage::Directory;
use crate::terms::{RecoveryTerms, TermsList};
use crossbeam::channel::{bounded, unbounded, Receiver};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::warn;

/// Worker threads scanning queue directories concurrently.
const WALKER_POOL_SIZE: usize = 4;
/// Gatherer channel bound; `sync_in` blocks past this many pending records.
const GATHER_BOUND: usize = 128;

/// Iterator over `(msg_id, 1)` reference-count records gathered from all
/// durable queues. Returns `None` once every worker has finished and the
/// gatherer is drained.
pub struct StartupWalker {
    rx: Receiver<(MsgId, u64)>,
    workers: Vec<JoinHandle<()>>,
}

impl Iterator for StartupWalker {
    type Item = (MsgId, u64);

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for StartupWalker {
    fn drop(&mut self) {
        // Dropping the receiver unblocks any worker stuck on a full
        // gatherer; then the joins are quick.
        let workers = std::mem::take(&mut self.workers);
        drop(std::mem::replace(&mut self.rx, bounded(0).1));
        for w in workers {
            let _ = w.join();
        }
    }
}

/// Read back every durable queue's recovery terms (in the given order),
/// delete orphan queue directories, and start the concurrent scan.
///
/// Returns the terms in input order (`None` marks a non-clean shutdown
/// for that queue) alongside the walker the message store drains.
pub fn start(
    dir: Arc<dyn Directory>,
    durable_queue_names: &[String],
    terms_store: &dyn RecoveryTerms,
) -> IndexResult<(Vec<Option<TermsList>>, StartupWalker)> {
    let mut ordered_terms = Vec::with_capacity(durable_queue_names.len());
    let mut valid: HashSet<String> = HashSet::with_capacity(durable_queue_names.len());
    for name in durable_queue_names {
        let dir_name = queue_dir_name(name);
        ordered_terms.push(terms_store.read(&dir_name)?);
        valid.insert(dir_name);
    }

    // Anything under queues/ that no durable queue claims is garbage from
    // a deleted or transient queue. Dot-files (the terms store, format
    // markers) are not queue directories.
    for entry in dir.list_dir(QUEUES_DIR)? {
        if entry.starts_with('.') || valid.contains(&entry) {
            continue;
        }
        warn!(directory = %entry, "deleting orphan queue directory");
        dir.delete(&format!("{QUEUES_DIR}/{entry}"))?;
    }

    let (work_tx, work_rx) = unbounded::<String>();
    for dir_name in &valid {
        work_tx
            .send(format!("{QUEUES_DIR}/{dir_name}"))
            .expect("receiver alive");
    }
    drop(work_tx);

    let (gather_tx, gather_rx) = bounded::<(MsgId, u64)>(GATHER_BOUND);
    let pool = WALKER_POOL_SIZE.min(valid.len().max(1));
    let mut workers = Vec::with_capacity(pool);
    for _ in 0..pool {
        let work_rx = work_rx.clone();
        let gather_tx = gather_tx.clone();
        let dir = dir.clone();
        workers.push(std::thread::spawn(move || {
            while let Ok(queue_dir) = work_rx.recv() {
                let res = scan_unacked(&*dir, &queue_dir, |msg_id| {
                    // A send failure means the consumer went away; stop
                    // scanning, there is nobody left to seed.
                    gather_tx.send((msg_id, 1)).map_err(|_| {
                        crate::error::IndexError::InvalidState(
                            "walker consumer dropped".into(),
                        )
                    })
                });
                if let Err(e) = res {
                    warn!(queue_dir = %queue_dir, error = %e, "startup scan failed for queue");
                }
            }
        }));
    }
    drop(gather_tx);

    Ok((
        ordered_terms,
        StartupWalker {
            rx: gather_rx,
            workers,
        },
    ))
}
