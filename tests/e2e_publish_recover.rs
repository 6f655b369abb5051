//! End-to-end: publish, terminate, recover from a clean shutdown.

use queue_index::index::{queue_dir, IndexConfig, MessageProps, QueueIndex, SyncCallback};
use queue_index::storage::{Directory, FsDirectory};
use queue_index::terms::{MemoryRecoveryTerms, RecoveryTerms};
use queue_index::{MsgId, SEGMENT_ENTRY_COUNT};
use std::sync::Arc;

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
fn publish_two_terminate_recover_clean() {
    let tmp = tempfile::tempdir().unwrap();
    let dir: Arc<dyn Directory> = Arc::new(FsDirectory::new(tmp.path()).unwrap());
    let terms_store = MemoryRecoveryTerms::new();

    let mut idx = QueueIndex::init(
        dir.clone(),
        "q",
        IndexConfig::default(),
        noop(),
        noop(),
    )
    .unwrap();
    idx.publish(mid(1), b"", 0, props(100), true, usize::MAX).unwrap();
    idx.publish(mid(2), b"", 1, props(200), true, usize::MAX).unwrap();
    let dir_name = idx.dir_name().to_string();
    idx.terminate(Vec::new(), &terms_store).unwrap();

    let terms = terms_store.read(&dir_name).unwrap();
    assert!(terms.is_some());
    let mut contains = |_: &MsgId| true;
    let ((count, bytes), idx) = QueueIndex::recover(
        dir,
        "q",
        IndexConfig::default(),
        terms,
        true,
        &mut contains,
        noop(),
        noop(),
    )
    .unwrap();
    assert_eq!((count, bytes), (None, None));

    let msgs = idx.read(0, 2).unwrap();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].msg_id, mid(1));
    assert_eq!(msgs[0].size, 100);
    assert!(!msgs[0].is_delivered);
    assert_eq!(msgs[1].msg_id, mid(2));
    assert_eq!(msgs[1].size, 200);
    assert!(!msgs[1].is_delivered);
}

#[test]
fn recover_preserves_read_and_bounds_across_terminate() {
    let tmp = tempfile::tempdir().unwrap();
    let dir: Arc<dyn Directory> = Arc::new(FsDirectory::new(tmp.path()).unwrap());
    let terms_store = MemoryRecoveryTerms::new();

    let mut idx = QueueIndex::init(
        dir.clone(),
        "q",
        IndexConfig::default(),
        noop(),
        noop(),
    )
    .unwrap();
    // Straddle a segment boundary and mix delivery states.
    idx.publish(mid(1), b"inline", 16383, props(10), true, usize::MAX)
        .unwrap();
    idx.publish(mid(2), b"", 16384, props(20), false, usize::MAX).unwrap();
    idx.deliver(&[16383]).unwrap();
    idx.flush().unwrap();
    idx.publish(mid(3), b"", 16385, props(30), true, usize::MAX).unwrap();

    let before_read = idx.read(0, 40000).unwrap();
    let before_bounds = idx.bounds();
    let dir_name = idx.dir_name().to_string();
    idx.terminate(Vec::new(), &terms_store).unwrap();

    let terms = terms_store.read(&dir_name).unwrap();
    let mut contains = |_: &MsgId| true;
    let (_, idx) = QueueIndex::recover(
        dir,
        "q",
        IndexConfig::default(),
        terms,
        true,
        &mut contains,
        noop(),
        noop(),
    )
    .unwrap();

    assert_eq!(idx.read(0, 40000).unwrap(), before_read);
    assert_eq!(idx.bounds(), before_bounds);
    assert_eq!(before_bounds, (0, 2 * SEGMENT_ENTRY_COUNT));
}

#[test]
fn erase_removes_queue_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let dir: Arc<dyn Directory> = Arc::new(FsDirectory::new(tmp.path()).unwrap());

    let mut idx = QueueIndex::init(
        dir.clone(),
        "q",
        IndexConfig::default(),
        noop(),
        noop(),
    )
    .unwrap();
    idx.publish(mid(1), b"", 0, props(1), true, usize::MAX).unwrap();
    idx.flush().unwrap();
    drop(idx);
    assert!(dir.exists(&queue_dir("q")));

    QueueIndex::erase(&*dir, "q").unwrap();
    assert!(!dir.exists(&queue_dir("q")));

    // Erasing a queue that never existed is a no-op.
    QueueIndex::erase(&*dir, "never").unwrap();
}

#[test]
fn delete_and_terminate_clears_terms_and_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let dir: Arc<dyn Directory> = Arc::new(FsDirectory::new(tmp.path()).unwrap());
    let terms_store = MemoryRecoveryTerms::new();

    let mut idx = QueueIndex::init(
        dir.clone(),
        "q",
        IndexConfig::default(),
        noop(),
        noop(),
    )
    .unwrap();
    idx.publish(mid(1), b"", 0, props(1), true, usize::MAX).unwrap();
    let dir_name = idx.dir_name().to_string();
    idx.delete_and_terminate(&terms_store).unwrap();

    assert!(!dir.exists(&queue_dir("q")));
    assert_eq!(terms_store.read(&dir_name).unwrap(), None);
}
