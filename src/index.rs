//! The per-queue index state machine.
//!
//! One `QueueIndex` owns one queue directory and is driven single-threaded
//! by its queue: `publish` / `deliver` / `ack` append to the journal and
//! mirror into the per-segment overlay; once `dirty_count` crosses the
//! configured threshold the overlay is drained into segment files and the
//! journal is truncated. `sync` is the publisher-confirm barrier: after a
//! successful journal fsync the two on-sync callbacks receive the msg-ids
//! whose publishes are now durable.
//!
//! ## Recovery
//!
//! - **Clean** (recovery terms present *and* the message store recovered):
//!   the journal is empty; per-segment unacked counts are seeded from the
//!   terms written at `terminate`. Message counts are not reported:
//!   they would include transients nobody can verify.
//! - **Dirty**: the journal is replayed into the overlay, deduplicated
//!   against every segment file (a crash between segment append and
//!   journal truncation leaves both holding the same operations), unacked
//!   counts are recomputed, and the recovery policy walks every surviving
//!   publish: messages the store no longer has are synthetically
//!   delivered and acked; the rest are marked delivered unless the
//!   shutdown was clean.

use crate::codec::{
    encode_journal_entry, next_segment_boundary, rel_of, seg_of, seq_of, JournalEntry, MsgId,
    PublishRecord, SeqId, SEGMENT_ENTRY_COUNT,
};
use crate::error::{IndexError, IndexResult};
use crate::journal::{load_journal, overlay_add, JournalFile, OverlayAction};
use crate::merge::{journal_minus_segment, segment_plus_journal};
use crate::segment::{
    append_overlay, delete_segment_file, load_segment, parse_segment_name, SegmentStore,
};
use crate::storage::Directory;
use crate::terms::{read_segments_term, segments_term, RecoveryTerms, TermsList};
use md5::{Digest, Md5};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Fixed subdirectory of the broker data directory holding all queues.
pub const QUEUES_DIR: &str = "queues";

/// Configuration for a queue index.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Logical journal entries tolerated before an implicit flush.
    pub max_journal_entries: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            max_journal_entries: 4096,
        }
    }
}

impl IndexConfig {
    fn validate(&self) -> IndexResult<()> {
        if self.max_journal_entries == 0 {
            return Err(IndexError::InvalidConfig(
                "max_journal_entries must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Per-publish properties supplied by the queue.
#[derive(Debug, Clone, Default)]
pub struct MessageProps {
    /// Absolute expiry timestamp; `0` means no expiry.
    pub expiry: u64,
    /// Full message size in bytes.
    pub size: u32,
    /// Whether the publisher asked for a confirm once the publish is
    /// durable.
    pub needs_confirming: bool,
}

/// One message returned by [`QueueIndex::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMessage {
    /// Sequence id within the queue.
    pub seq_id: SeqId,
    /// Message id.
    pub msg_id: MsgId,
    /// Embedded body; empty when the body lives in the message store.
    pub body: Vec<u8>,
    /// Absolute expiry timestamp; `0` means no expiry.
    pub expiry: u64,
    /// Full message size in bytes.
    pub size: u32,
    /// Whether the message is persistent.
    pub is_persistent: bool,
    /// Whether a delivery has been recorded.
    pub is_delivered: bool,
}

/// Answer to [`QueueIndex::needs_sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeedsSync {
    /// Publisher confirms are waiting on an fsync.
    Confirms,
    /// The journal has unsynced appends but no confirms ride on them.
    Other,
    /// Nothing to sync.
    No,
}

/// Callback invoked with the msg-ids confirmed by a journal fsync.
pub type SyncCallback = Box<dyn FnMut(&HashSet<MsgId>) + Send>;

/// Predicate asking the message store whether it still holds a message.
pub type ContainsPredicate<'a> = &'a mut dyn FnMut(&MsgId) -> bool;

/// Counts and bytes surviving a recovery; `None` on the clean path, where
/// transient messages make the totals untrustworthy.
pub type RecoveredTotals = (Option<u64>, Option<u64>);

/// Lowercase base-36 rendering of the MD5 of the queue name: the queue's
/// directory basename under `queues/`.
pub fn queue_dir_name(queue_name: &str) -> String {
    const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let digest = Md5::digest(queue_name.as_bytes());
    let mut n = u128::from_be_bytes(digest.into());
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 is ascii")
}

/// Relative path of a queue's directory.
pub fn queue_dir(queue_name: &str) -> String {
    format!("{QUEUES_DIR}/{}", queue_dir_name(queue_name))
}

/// The per-queue persistent index.
pub struct QueueIndex {
    dir: Arc<dyn Directory>,
    dir_name: String,
    queue_dir: String,
    segments: SegmentStore,
    journal: JournalFile,
    dirty_count: usize,
    max_journal_entries: usize,
    on_sync: SyncCallback,
    on_sync_msg: SyncCallback,
    unconfirmed: HashSet<MsgId>,
    unconfirmed_msg: HashSet<MsgId>,
}

impl QueueIndex {
    /// Create a blank index for a queue that has never existed (or was
    /// erased). The directory is *not* created here; it appears when the
    /// journal is first appended to.
    pub fn init(
        dir: Arc<dyn Directory>,
        queue_name: &str,
        config: IndexConfig,
        on_sync: SyncCallback,
        on_sync_msg: SyncCallback,
    ) -> IndexResult<Self> {
        config.validate()?;
        let dir_name = queue_dir_name(queue_name);
        let queue_dir = format!("{QUEUES_DIR}/{dir_name}");
        if dir.exists(&queue_dir) {
            debug_assert!(false, "init on a queue with a stale directory: {queue_dir}");
            return Err(IndexError::InvalidState(format!(
                "stale queue directory exists: {queue_dir}"
            )));
        }
        let journal = JournalFile::new(dir.clone(), &queue_dir);
        Ok(QueueIndex {
            dir,
            dir_name,
            queue_dir,
            segments: SegmentStore::new(),
            journal,
            dirty_count: 0,
            max_journal_entries: config.max_journal_entries,
            on_sync,
            on_sync_msg,
            unconfirmed: HashSet::new(),
            unconfirmed_msg: HashSet::new(),
        })
    }

    /// Recover a queue's index from disk.
    ///
    /// `recovery_terms` is what the startup walker read back for this
    /// queue (`None` marks a non-clean shutdown). The clean path is taken
    /// only when terms exist *and* `msg_store_recovered` holds; a terms
    /// record without a recovered message store falls back to dirty
    /// recovery with `contains` doing the filtering.
    #[allow(clippy::too_many_arguments)]
    pub fn recover(
        dir: Arc<dyn Directory>,
        queue_name: &str,
        config: IndexConfig,
        recovery_terms: Option<TermsList>,
        msg_store_recovered: bool,
        contains: ContainsPredicate<'_>,
        on_sync: SyncCallback,
        on_sync_msg: SyncCallback,
    ) -> IndexResult<(RecoveredTotals, Self)> {
        config.validate()?;
        let dir_name = queue_dir_name(queue_name);
        let queue_dir = format!("{QUEUES_DIR}/{dir_name}");
        let journal = JournalFile::new(dir.clone(), &queue_dir);
        let mut state = QueueIndex {
            dir,
            dir_name,
            queue_dir,
            segments: SegmentStore::new(),
            journal,
            dirty_count: 0,
            max_journal_entries: config.max_journal_entries,
            on_sync,
            on_sync_msg,
            unconfirmed: HashSet::new(),
            unconfirmed_msg: HashSet::new(),
        };

        let clean = recovery_terms.is_some();
        if clean && msg_store_recovered {
            let terms = recovery_terms.expect("clean path requires terms");
            state.replay_journal()?;
            if let Some(counts) = read_segments_term(&terms) {
                for (seg, unacked) in counts {
                    state.segments.entry(seg).unacked = unacked;
                }
            }
            info!(queue_dir = %state.queue_dir, "recovered index from clean shutdown");
            return Ok(((None, None), state));
        }

        let (count, bytes) = state.recover_dirty(clean, contains)?;
        state.maybe_flush(None)?;
        info!(
            queue_dir = %state.queue_dir,
            unacked = count,
            bytes,
            "recovered index from dirty shutdown"
        );
        Ok(((Some(count), Some(bytes)), state))
    }

    fn replay_journal(&mut self) -> IndexResult<()> {
        let entries = load_journal(&*self.dir, &self.queue_dir)?;
        self.dirty_count = entries.len();
        for entry in entries {
            let seq = entry.seq_id();
            let action = match entry {
                JournalEntry::Publish(_, record) => OverlayAction::Publish(record),
                JournalEntry::Deliver(_) => OverlayAction::Deliver,
                JournalEntry::Ack(_) => OverlayAction::Ack,
            };
            let segment = self.segments.entry(seg_of(seq));
            overlay_add(&mut segment.overlay, rel_of(seq), action)?;
        }
        Ok(())
    }

    fn recover_dirty(
        &mut self,
        clean_shutdown: bool,
        contains: ContainsPredicate<'_>,
    ) -> IndexResult<(u64, u64)> {
        self.replay_journal()?;

        // Segments seen in the journal plus every .idx the directory holds.
        let mut segs: Vec<u64> = self.segments.nums();
        for name in self.dir.list_dir(&self.queue_dir)? {
            if let Some(seg) = parse_segment_name(&name) {
                if !segs.contains(&seg) {
                    segs.push(seg);
                }
            }
        }
        segs.sort_unstable();

        let mut total_count = 0u64;
        let mut total_bytes = 0u64;
        for seg in segs {
            let (file_slots, unacked_file) =
                load_segment(&*self.dir, &self.queue_dir, seg, true)?;
            let segment = self.segments.entry(seg);
            let dups = journal_minus_segment(&mut segment.overlay, &file_slots);
            self.dirty_count = self.dirty_count.saturating_sub(dups);

            let segment = self.segments.entry(seg);
            let (merged, delta) = segment_plus_journal(&file_slots, &segment.overlay);
            let mut unacked =
                u32::try_from(i64::from(unacked_file) + delta).map_err(|_| {
                    IndexError::InvalidState(format!(
                        "negative unacked count recovered for segment {seg}"
                    ))
                })?;

            for (rel, slot) in &merged {
                let Some(publish) = &slot.publish else {
                    continue;
                };
                if slot.acked {
                    continue;
                }
                // Embedded bodies are their own storage; the store is only
                // asked about messages it was supposed to hold.
                let contained = publish.is_embedded() || contains(&publish.msg_id);
                let segment = self.segments.entry(seg);
                if contained {
                    if !clean_shutdown && !slot.delivered {
                        overlay_add(&mut segment.overlay, *rel, OverlayAction::Deliver)?;
                        self.dirty_count += 1;
                    }
                    total_count += 1;
                    total_bytes += u64::from(publish.size);
                } else {
                    if !slot.delivered {
                        overlay_add(&mut segment.overlay, *rel, OverlayAction::Deliver)?;
                        self.dirty_count += 1;
                    }
                    overlay_add(&mut segment.overlay, *rel, OverlayAction::Ack)?;
                    self.dirty_count += 1;
                    unacked = unacked.checked_sub(1).ok_or_else(|| {
                        IndexError::InvalidState(format!(
                            "negative unacked count recovered for segment {seg}"
                        ))
                    })?;
                }
            }
            self.segments.entry(seg).unacked = unacked;
        }
        Ok((total_count, total_bytes))
    }

    /// Record a publish. The entry goes to the journal file first, then
    /// into the owning segment's overlay. Publishing the same sequence id
    /// twice is a caller bug.
    pub fn publish(
        &mut self,
        msg_id: MsgId,
        body: &[u8],
        seq_id: SeqId,
        props: MessageProps,
        is_persistent: bool,
        journal_size_hint: usize,
    ) -> IndexResult<()> {
        let record = PublishRecord {
            msg_id,
            expiry: props.expiry,
            size: props.size,
            body: body.to_vec(),
            is_persistent,
        };
        let mut buf = Vec::new();
        encode_journal_entry(&JournalEntry::Publish(seq_id, record.clone()), &mut buf);
        self.journal.append(&buf)?;

        let segment = self.segments.entry(seg_of(seq_id));
        overlay_add(&mut segment.overlay, rel_of(seq_id), OverlayAction::Publish(record))?;
        segment.unacked += 1;
        self.dirty_count += 1;

        if props.needs_confirming {
            if body.is_empty() {
                self.unconfirmed.insert(msg_id);
            } else {
                self.unconfirmed_msg.insert(msg_id);
            }
        }
        self.maybe_flush(Some(journal_size_hint))
    }

    /// Record deliveries for a batch of sequence ids.
    pub fn deliver(&mut self, seq_ids: &[SeqId]) -> IndexResult<()> {
        self.append_markers(seq_ids, false)
    }

    /// Record acknowledgements for a batch of sequence ids.
    pub fn ack(&mut self, seq_ids: &[SeqId]) -> IndexResult<()> {
        self.append_markers(seq_ids, true)
    }

    fn append_markers(&mut self, seq_ids: &[SeqId], is_ack: bool) -> IndexResult<()> {
        if seq_ids.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for &seq in seq_ids {
            let entry = if is_ack {
                JournalEntry::Ack(seq)
            } else {
                JournalEntry::Deliver(seq)
            };
            encode_journal_entry(&entry, &mut buf);
        }
        self.journal.append(&buf)?;

        for &seq in seq_ids {
            let segment = self.segments.entry(seg_of(seq));
            let action = if is_ack {
                OverlayAction::Ack
            } else {
                OverlayAction::Deliver
            };
            overlay_add(&mut segment.overlay, rel_of(seq), action)?;
            if is_ack {
                segment.unacked = segment.unacked.checked_sub(1).ok_or_else(|| {
                    IndexError::InvalidState(format!("ack of unpublished sequence id {seq}"))
                })?;
            }
        }
        self.dirty_count += seq_ids.len();
        self.maybe_flush(None)
    }

    /// Return the messages in the half-open range `[start, end)` whose
    /// merged state is published and not acked, in ascending sequence
    /// order.
    pub fn read(&self, start: SeqId, end: SeqId) -> IndexResult<Vec<ReadMessage>> {
        let mut out = Vec::new();
        if start >= end {
            return Ok(out);
        }
        let empty = std::collections::BTreeMap::new();
        for seg in seg_of(start)..=seg_of(end - 1) {
            let (file_slots, _) = load_segment(&*self.dir, &self.queue_dir, seg, false)?;
            let overlay = self
                .segments
                .get(seg)
                .map(|s| &s.overlay)
                .unwrap_or(&empty);
            let (merged, _) = segment_plus_journal(&file_slots, overlay);
            for (rel, slot) in &merged {
                let Some(publish) = &slot.publish else {
                    continue;
                };
                let seq = seq_of(seg, *rel);
                if seq < start || seq >= end {
                    continue;
                }
                out.push(ReadMessage {
                    seq_id: seq,
                    msg_id: publish.msg_id,
                    body: publish.body.clone(),
                    expiry: publish.expiry,
                    size: publish.size,
                    is_persistent: publish.is_persistent,
                    is_delivered: slot.delivered,
                });
            }
        }
        Ok(out)
    }

    /// First sequence id of the segment after the one covering `seq_id`.
    pub fn next_segment_boundary(seq_id: SeqId) -> SeqId {
        next_segment_boundary(seq_id)
    }

    /// `(low, next)` bounds: `low` is the first sequence id of the
    /// lowest-numbered segment ever seen (which need not hold a live
    /// publish), `next` the first id past the highest. `(0, 0)` when no
    /// segment has been touched.
    pub fn bounds(&self) -> (SeqId, SeqId) {
        match (self.segments.lowest(), self.segments.highest()) {
            (Some(lo), Some(hi)) => (lo * SEGMENT_ENTRY_COUNT, (hi + 1) * SEGMENT_ENTRY_COUNT),
            _ => (0, 0),
        }
    }

    /// Fsync the journal, then hand the confirmed msg-ids to the on-sync
    /// callbacks. No-op when the journal has never been opened.
    pub fn sync(&mut self) -> IndexResult<()> {
        if !self.journal.is_open() {
            return Ok(());
        }
        self.journal.sync()?;
        self.notify_sync();
        Ok(())
    }

    /// Whether a sync is worthwhile, and why.
    pub fn needs_sync(&self) -> NeedsSync {
        if !self.unconfirmed.is_empty() || !self.unconfirmed_msg.is_empty() {
            NeedsSync::Confirms
        } else if self.journal.appended_since_sync() {
            NeedsSync::Other
        } else {
            NeedsSync::No
        }
    }

    /// Drain the overlay into segment files and truncate the journal.
    /// No-op when nothing is dirty.
    pub fn flush(&mut self) -> IndexResult<()> {
        if self.dirty_count == 0 {
            return Ok(());
        }
        debug!(
            queue_dir = %self.queue_dir,
            dirty = self.dirty_count,
            "flushing journal into segments"
        );
        for seg in self.segments.nums() {
            let segment = self.segments.entry(seg);
            if segment.overlay.is_empty() {
                continue;
            }
            if segment.unacked == 0 {
                // Everything this segment ever held is acked: the overlay
                // is pure history and the file can go.
                segment.overlay.clear();
                delete_segment_file(&*self.dir, &self.queue_dir, seg)?;
            } else {
                append_overlay(&*self.dir, &self.queue_dir, segment)?;
            }
        }
        self.journal.truncate()?;
        self.dirty_count = 0;
        self.notify_sync();
        Ok(())
    }

    fn maybe_flush(&mut self, hint: Option<usize>) -> IndexResult<()> {
        let over_limit = self.dirty_count > self.max_journal_entries
            || hint.is_some_and(|h| self.dirty_count > h);
        if over_limit {
            self.flush()?;
        }
        Ok(())
    }

    fn notify_sync(&mut self) {
        if !self.unconfirmed.is_empty() {
            (self.on_sync)(&self.unconfirmed);
            self.unconfirmed.clear();
        }
        if !self.unconfirmed_msg.is_empty() {
            (self.on_sync_msg)(&self.unconfirmed_msg);
            self.unconfirmed_msg.clear();
        }
    }

    /// Close the journal and persist `[(segment, unacked)]` (plus the
    /// caller's extra terms, verbatim) so the next start can recover
    /// clean.
    pub fn terminate(
        mut self,
        extra_terms: TermsList,
        terms_store: &dyn RecoveryTerms,
    ) -> IndexResult<()> {
        self.journal.close();
        let counts: Vec<(u64, u32)> = self
            .segments
            .nums()
            .into_iter()
            .map(|seg| {
                let unacked = self.segments.get(seg).map(|s| s.unacked).unwrap_or(0);
                (seg, unacked)
            })
            .collect();
        let mut terms = vec![segments_term(&counts)?];
        terms.extend(extra_terms);
        terms_store.store(&self.dir_name, terms)
    }

    /// Terminate and remove every trace of the queue: its directory and
    /// its recovery terms.
    pub fn delete_and_terminate(mut self, terms_store: &dyn RecoveryTerms) -> IndexResult<()> {
        self.journal.close();
        if self.dir.exists(&self.queue_dir) {
            self.dir.delete(&self.queue_dir)?;
        }
        terms_store.clear(&self.dir_name)
    }

    /// Recursively delete a queue's directory, if it exists.
    pub fn erase(dir: &dyn Directory, queue_name: &str) -> IndexResult<()> {
        let queue_dir = queue_dir(queue_name);
        if dir.exists(&queue_dir) {
            dir.delete(&queue_dir)?;
        }
        Ok(())
    }

    /// The queue's directory basename (terms-store key).
    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }

    /// Logical journal entries pending flush.
    pub fn dirty_count(&self) -> usize {
        self.dirty_count
    }

    /// Unacked count of one segment, when it has been seen.
    pub fn segment_unacked(&self, seg: u64) -> Option<u32> {
        self.segments.get(seg).map(|s| s.unacked)
    }
}

/// Read-only scan of a queue directory for the startup walker: every
/// persistent publish whose merged state is unacked, embedded or not.
pub(crate) fn scan_unacked(
    dir: &dyn Directory,
    queue_dir: &str,
    mut emit: impl FnMut(MsgId) -> IndexResult<()>,
) -> IndexResult<()> {
    let mut overlays: std::collections::BTreeMap<
        u64,
        std::collections::BTreeMap<u16, crate::segment::Slot>,
    > = std::collections::BTreeMap::new();
    for entry in load_journal(dir, queue_dir)? {
        let seq = entry.seq_id();
        let action = match entry {
            JournalEntry::Publish(_, record) => OverlayAction::Publish(record),
            JournalEntry::Deliver(_) => OverlayAction::Deliver,
            JournalEntry::Ack(_) => OverlayAction::Ack,
        };
        overlay_add(overlays.entry(seg_of(seq)).or_default(), rel_of(seq), action)?;
    }

    let mut segs: Vec<u64> = overlays.keys().copied().collect();
    for name in dir.list_dir(queue_dir)? {
        if let Some(seg) = parse_segment_name(&name) {
            if !segs.contains(&seg) {
                segs.push(seg);
            }
        }
    }
    segs.sort_unstable();

    for seg in segs {
        let (file_slots, _) = load_segment(dir, queue_dir, seg, true)?;
        let mut overlay = overlays.remove(&seg).unwrap_or_default();
        journal_minus_segment(&mut overlay, &file_slots);
        let (merged, _) = segment_plus_journal(&file_slots, &overlay);
        for slot in merged.values() {
            let Some(publish) = &slot.publish else {
                continue;
            };
            if publish.is_persistent && !slot.acked {
                emit(publish.msg_id)?;
            }
        }
    }
    Ok(())
}
