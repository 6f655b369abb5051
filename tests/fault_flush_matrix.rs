//! Fault injection around the flush path: I/O errors must propagate
//! without corrupting state, and a retry after the fault clears must
//! leave the index indistinguishable from a fault-free run.

mod support;

use queue_index::index::{queue_dir, IndexConfig, MessageProps, QueueIndex, SyncCallback};
use queue_index::segment::load_segment;
use queue_index::storage::{Directory, FsDirectory};
use queue_index::MsgId;
use std::sync::Arc;
use support::FaultyDirectory;

fn noop() -> SyncCallback {
    Box::new(|_| {})
}

fn props(size: u32) -> MessageProps {
    MessageProps {
        expiry: 0,
        size,
        needs_confirming: false,
    }
}

fn mid(tag: u8) -> MsgId {
    [tag; 16]
}

#[test]
fn journal_append_failure_fails_the_publish() {
    let tmp = tempfile::tempdir().unwrap();
    let faulty = FaultyDirectory::new(FsDirectory::new(tmp.path()).unwrap());
    let cfg = faulty.cfg();
    let dir: Arc<dyn Directory> = Arc::new(faulty);

    let mut idx =
        QueueIndex::init(dir.clone(), "q", IndexConfig::default(), noop(), noop()).unwrap();
    cfg.lock().unwrap().fail_journal_append = true;
    assert!(idx
        .publish(mid(1), b"", 0, props(1), true, usize::MAX)
        .is_err());

    // Nothing was recorded; the failed publish is invisible.
    cfg.lock().unwrap().fail_journal_append = false;
    assert_eq!(idx.read(0, 10).unwrap(), Vec::new());

    // The same sequence id is still free to use after the failure.
    idx.publish(mid(1), b"", 0, props(1), true, usize::MAX).unwrap();
    assert_eq!(idx.read(0, 10).unwrap().len(), 1);
}

#[test]
fn segment_append_failure_keeps_overlay_for_retry() {
    let tmp = tempfile::tempdir().unwrap();
    let faulty = FaultyDirectory::new(FsDirectory::new(tmp.path()).unwrap());
    let cfg = faulty.cfg();
    let dir: Arc<dyn Directory> = Arc::new(faulty);

    let mut idx =
        QueueIndex::init(dir.clone(), "q", IndexConfig::default(), noop(), noop()).unwrap();
    idx.publish(mid(1), b"", 0, props(1), true, usize::MAX).unwrap();
    idx.publish(mid(2), b"", 1, props(1), true, usize::MAX).unwrap();

    cfg.lock().unwrap().fail_segment_append = true;
    assert!(idx.flush().is_err());

    // The journal was not truncated and the overlay not lost: a retry
    // flushes everything.
    cfg.lock().unwrap().fail_segment_append = false;
    idx.flush().unwrap();
    assert_eq!(idx.dirty_count(), 0);

    let qd = queue_dir("q");
    let (slots, unacked) = load_segment(&*dir, &qd, 0, false).unwrap();
    assert_eq!(unacked, 2);
    assert_eq!(slots.len(), 2);
    assert_eq!(idx.read(0, 10).unwrap().len(), 2);
}

#[test]
fn segment_delete_failure_surfaces_but_state_recovers() {
    let tmp = tempfile::tempdir().unwrap();
    let faulty = FaultyDirectory::new(FsDirectory::new(tmp.path()).unwrap());
    let cfg = faulty.cfg();
    let dir: Arc<dyn Directory> = Arc::new(faulty);

    let mut idx =
        QueueIndex::init(dir.clone(), "q", IndexConfig::default(), noop(), noop()).unwrap();
    idx.publish(mid(1), b"", 0, props(1), true, usize::MAX).unwrap();
    idx.flush().unwrap();
    idx.deliver(&[0]).unwrap();
    idx.ack(&[0]).unwrap();

    cfg.lock().unwrap().fail_segment_delete = true;
    assert!(idx.flush().is_err());
    assert!(cfg.lock().unwrap().segment_delete_calls >= 1);

    cfg.lock().unwrap().fail_segment_delete = false;
    idx.flush().unwrap();
    assert!(!dir.exists(&format!("{}/0.idx", queue_dir("q"))));
    assert_eq!(idx.read(0, 10).unwrap(), Vec::new());
}

#[test]
fn crash_after_failed_flush_recovers_everything() {
    let tmp = tempfile::tempdir().unwrap();
    let faulty = FaultyDirectory::new(FsDirectory::new(tmp.path()).unwrap());
    let cfg = faulty.cfg();
    let dir: Arc<dyn Directory> = Arc::new(faulty);

    {
        let mut idx =
            QueueIndex::init(dir.clone(), "q", IndexConfig::default(), noop(), noop()).unwrap();
        idx.publish(mid(1), b"", 0, props(5), true, usize::MAX).unwrap();
        idx.publish(mid(2), b"", 16384, props(5), true, usize::MAX).unwrap();
        idx.sync().unwrap();
        cfg.lock().unwrap().fail_segment_append = true;
        let _ = idx.flush();
        // Crash while the fault persists.
    }

    cfg.lock().unwrap().fail_segment_append = false;
    let mut contains = |_: &MsgId| true;
    let ((count, _), idx) = QueueIndex::recover(
        dir,
        "q",
        IndexConfig::default(),
        None,
        false,
        &mut contains,
        noop(),
        noop(),
    )
    .unwrap();
    assert_eq!(count, Some(2));
    assert_eq!(idx.read(0, 40000).unwrap().len(), 2);
}
