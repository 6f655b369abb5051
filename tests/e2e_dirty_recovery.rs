//! End-to-end: dirty recovery (crashes, torn flushes, lost messages).

use queue_index::index::{queue_dir, IndexConfig, MessageProps, QueueIndex, SyncCallback};
use queue_index::segment::load_segment;
use queue_index::storage::{Directory, FsDirectory};
use queue_index::terms::{MemoryRecoveryTerms, RecoveryTerms};
use queue_index::MsgId;
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

fn fs_dir(tmp: &tempfile::TempDir) -> Arc<dyn Directory> {
    Arc::new(FsDirectory::new(tmp.path()).unwrap())
}

fn recover_dirty(
    dir: &Arc<dyn Directory>,
    queue: &str,
    contains: &mut dyn FnMut(&MsgId) -> bool,
) -> ((Option<u64>, Option<u64>), QueueIndex) {
    QueueIndex::recover(
        dir.clone(),
        queue,
        IndexConfig::default(),
        None,
        false,
        contains,
        noop(),
        noop(),
    )
    .unwrap()
}

#[test]
fn crash_after_publish_recovers_one_unacked() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = fs_dir(&tmp);
    {
        let mut idx =
            QueueIndex::init(dir.clone(), "q", IndexConfig::default(), noop(), noop()).unwrap();
        idx.publish(mid(1), b"", 0, props(100), true, usize::MAX).unwrap();
        idx.sync().unwrap();
        // Crash: the index is dropped without terminate.
    }

    let mut contains = |_: &MsgId| true;
    let ((count, bytes), idx) = recover_dirty(&dir, "q", &mut contains);
    assert_eq!(count, Some(1));
    assert_eq!(bytes, Some(100));

    let msgs = idx.read(0, 10).unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].msg_id, mid(1));
    // Dirty recovery marks surviving messages delivered.
    assert!(msgs[0].is_delivered);
}

#[test]
fn message_store_losing_the_body_synthesizes_del_and_ack() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = fs_dir(&tmp);
    {
        let mut idx =
            QueueIndex::init(dir.clone(), "q", IndexConfig::default(), noop(), noop()).unwrap();
        idx.publish(mid(1), b"", 0, props(100), true, usize::MAX).unwrap();
        idx.sync().unwrap();
    }

    let mut contains = |_: &MsgId| false;
    let ((count, bytes), idx) = recover_dirty(&dir, "q", &mut contains);
    assert_eq!(count, Some(0));
    assert_eq!(bytes, Some(0));
    assert_eq!(idx.read(0, 10).unwrap(), Vec::new());
    assert_eq!(idx.segment_unacked(0), Some(0));

    // The synthesized ack survives the post-recovery flush: nothing on
    // disk claims the message anymore.
    let mut idx = idx;
    idx.flush().unwrap();
    assert!(!dir.exists(&format!("{}/0.idx", queue_dir("q"))));
}

#[test]
fn embedded_bodies_survive_regardless_of_the_message_store() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = fs_dir(&tmp);
    {
        let mut idx =
            QueueIndex::init(dir.clone(), "q", IndexConfig::default(), noop(), noop()).unwrap();
        idx.publish(mid(1), b"payload", 0, props(7), true, usize::MAX).unwrap();
        idx.sync().unwrap();
    }

    // The store knows nothing about embedded messages; they must survive.
    let mut contains = |_: &MsgId| false;
    let ((count, _), idx) = recover_dirty(&dir, "q", &mut contains);
    assert_eq!(count, Some(1));
    let msgs = idx.read(0, 10).unwrap();
    assert_eq!(msgs[0].body, b"payload");
}

#[test]
fn crash_between_segment_append_and_journal_truncation_deduplicates() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = fs_dir(&tmp);
    let qd = queue_dir("q");
    {
        let mut idx =
            QueueIndex::init(dir.clone(), "q", IndexConfig::default(), noop(), noop()).unwrap();
        idx.publish(mid(1), b"", 0, props(10), true, usize::MAX).unwrap();
        idx.deliver(&[0]).unwrap();
        idx.flush().unwrap();
        // Simulate the crash window: the journal is re-appended with the
        // very operations the flush just wrote to the segment, as if
        // truncation had not happened.
        idx.publish(mid(2), b"", 1, props(20), true, usize::MAX).unwrap();
        idx.sync().unwrap();
    }
    // Re-append a copy of the already-flushed publish + deliver in front
    // of the journal by rebuilding it. (Byte-level surgery: prepend the
    // flushed entries.)
    {
        use queue_index::codec::{encode_journal_entry, JournalEntry, PublishRecord};
        use std::io::Read;
        let mut journal = Vec::new();
        dir.open_file(&format!("{qd}/journal.jif"))
            .unwrap()
            .read_to_end(&mut journal)
            .unwrap();
        let mut rebuilt = Vec::new();
        encode_journal_entry(
            &JournalEntry::Publish(
                0,
                PublishRecord {
                    msg_id: mid(1),
                    expiry: 0,
                    size: 10,
                    body: Vec::new(),
                    is_persistent: true,
                },
            ),
            &mut rebuilt,
        );
        encode_journal_entry(&JournalEntry::Deliver(0), &mut rebuilt);
        rebuilt.extend_from_slice(&journal);
        dir.atomic_write(&format!("{qd}/journal.jif"), &rebuilt).unwrap();
    }

    let mut contains = |_: &MsgId| true;
    let ((count, bytes), idx) = recover_dirty(&dir, "q", &mut contains);
    // Exactly two live messages; the duplicated publish counts once.
    assert_eq!(count, Some(2));
    assert_eq!(bytes, Some(30));
    let msgs = idx.read(0, 10).unwrap();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].msg_id, mid(1));
    assert_eq!(msgs[1].msg_id, mid(2));
    assert_eq!(idx.segment_unacked(0), Some(2));
}

#[test]
fn mid_flush_crash_with_lost_body_acks_the_segment_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = fs_dir(&tmp);
    let qd = queue_dir("q");
    {
        let mut idx =
            QueueIndex::init(dir.clone(), "q", IndexConfig::default(), noop(), noop()).unwrap();
        idx.publish(mid(1), b"", 0, props(10), true, usize::MAX).unwrap();
        idx.flush().unwrap();
    }
    // Crash mid-flush: the segment holds the publish, and the journal
    // still holds it too (truncation never happened).
    {
        use queue_index::codec::{encode_journal_entry, JournalEntry, PublishRecord};
        let mut journal = Vec::new();
        encode_journal_entry(
            &JournalEntry::Publish(
                0,
                PublishRecord {
                    msg_id: mid(1),
                    expiry: 0,
                    size: 10,
                    body: Vec::new(),
                    is_persistent: true,
                },
            ),
            &mut journal,
        );
        dir.atomic_write(&format!("{qd}/journal.jif"), &journal).unwrap();
    }

    // The message store lost the body: recovery synthesizes deliver + ack
    // against the on-disk publish, and the next flush erases the file.
    let mut contains = |_: &MsgId| false;
    let ((count, _), mut idx) = recover_dirty(&dir, "q", &mut contains);
    assert_eq!(count, Some(0));
    assert_eq!(idx.read(0, 10).unwrap(), Vec::new());
    assert_eq!(idx.segment_unacked(0), Some(0));

    idx.flush().unwrap();
    assert!(!dir.exists(&format!("{qd}/0.idx")));
}

#[test]
fn terms_without_recovered_store_fall_back_to_dirty_path() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = fs_dir(&tmp);
    let terms_store = MemoryRecoveryTerms::new();
    let dir_name;
    {
        let mut idx =
            QueueIndex::init(dir.clone(), "q", IndexConfig::default(), noop(), noop()).unwrap();
        idx.publish(mid(1), b"", 0, props(10), true, usize::MAX).unwrap();
        idx.flush().unwrap();
        dir_name = idx.dir_name().to_string();
        idx.terminate(Vec::new(), &terms_store).unwrap();
    }

    // Clean terms exist, but the message store did not recover: the
    // contains predicate decides, and a clean shutdown means no delivery
    // synthesis for surviving messages.
    let terms = terms_store.read(&dir_name).unwrap();
    let mut contains = |_: &MsgId| true;
    let ((count, _), idx) = QueueIndex::recover(
        dir.clone(),
        "q",
        IndexConfig::default(),
        terms,
        false,
        &mut contains,
        noop(),
        noop(),
    )
    .unwrap();
    assert_eq!(count, Some(1));
    let msgs = idx.read(0, 10).unwrap();
    assert!(!msgs[0].is_delivered);

    // And with the message gone from the store, it is acked away.
    let terms = terms_store.read(&dir_name).unwrap();
    let mut contains = |_: &MsgId| false;
    let ((count, _), idx) = QueueIndex::recover(
        dir,
        "q",
        IndexConfig::default(),
        terms,
        false,
        &mut contains,
        noop(),
        noop(),
    )
    .unwrap();
    assert_eq!(count, Some(0));
    assert_eq!(idx.read(0, 10).unwrap(), Vec::new());
}

#[test]
fn partial_segment_tail_is_ignored_at_recovery() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = fs_dir(&tmp);
    let qd = queue_dir("q");
    {
        let mut idx =
            QueueIndex::init(dir.clone(), "q", IndexConfig::default(), noop(), noop()).unwrap();
        idx.publish(mid(1), b"", 0, props(10), true, usize::MAX).unwrap();
        idx.flush().unwrap();
    }
    // Dirty-shutdown tail padding on the segment file.
    {
        use std::io::Read;
        let mut bytes = Vec::new();
        dir.open_file(&format!("{qd}/0.idx"))
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        bytes.extend_from_slice(&[0u8; 48]);
        dir.atomic_write(&format!("{qd}/0.idx"), &bytes).unwrap();
    }

    let mut contains = |_: &MsgId| true;
    let ((count, _), idx) = recover_dirty(&dir, "q", &mut contains);
    assert_eq!(count, Some(1));
    assert_eq!(idx.read(0, 10).unwrap().len(), 1);

    let (slots, unacked) = load_segment(&*dir, &qd, 0, false).unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!(unacked, 1);
}
