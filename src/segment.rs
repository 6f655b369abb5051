//! Segment state, the in-memory segment store, and segment file I/O.
//!
//! A segment covers [`SEGMENT_ENTRY_COUNT`](crate::codec::SEGMENT_ENTRY_COUNT)
//! consecutive sequence ids and is backed by an append-only `<seg>.idx`
//! file. In memory a segment carries only its pending journal overlay and
//! its unacked count; file contents are re-read on demand.
//!
//! File discipline:
//! - `load` reads sequentially, accumulating publish records and
//!   deliver-or-ack markers (first marker = delivered, second = acked).
//! - `append_overlay` writes every occupied overlay slot in ascending rel
//!   order and clears the overlay.
//! - a segment file is deleted outright once its unacked count reaches
//!   zero at flush; fully-acked history leaves no on-disk trace.

use crate::codec::{
    decode_segment_entry, encode_segment_deliver_or_ack, encode_segment_publish, PublishRecord,
    SegmentEntry,
};
use crate::error::IndexResult;
use crate::storage::Directory;
use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use tracing::debug;

/// Segments kept in front of the tree for hot-path lookups.
const HOT_SEGMENTS: usize = 2;

/// The tri-state record for one sequence slot: publish, delivery,
/// acknowledgement. An absent slot is the empty state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Slot {
    /// The publish, when this view has seen one.
    pub publish: Option<PublishRecord>,
    /// Whether a delivery has been recorded.
    pub delivered: bool,
    /// Whether an acknowledgement has been recorded.
    pub acked: bool,
}

impl Slot {
    /// A slot holding just a publish.
    pub fn published(record: PublishRecord) -> Self {
        Slot {
            publish: Some(record),
            delivered: false,
            acked: false,
        }
    }
}

/// In-memory state for one segment.
#[derive(Debug)]
pub struct Segment {
    /// Segment number (`seq / SEGMENT_ENTRY_COUNT`).
    pub num: u64,
    /// Pending journal mutations for this segment, keyed by relative
    /// sequence. Drained into the segment file at flush.
    pub overlay: BTreeMap<u16, Slot>,
    /// Messages whose combined file + overlay state is published but not
    /// yet acked.
    pub unacked: u32,
}

impl Segment {
    /// Fresh segment state with an empty overlay.
    pub fn new(num: u64) -> Self {
        Segment {
            num,
            overlay: BTreeMap::new(),
            unacked: 0,
        }
    }
}

/// Relative path of a segment file inside `queue_dir`.
pub fn segment_path(queue_dir: &str, seg: u64) -> String {
    format!("{queue_dir}/{seg}.idx")
}

/// Parse a directory entry name as a segment file, returning its number.
pub fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_suffix(".idx")?.parse::<u64>().ok()
}

/// Load a segment file into a sparse slot map.
///
/// Returns the slots and the unacked count derived from the file alone.
/// With `keep_acked = false` (normal reads) the second deliver-or-ack
/// marker for a rel erases the slot; with `keep_acked = true` (recovery)
/// the acked slot is preserved so journal deduplication can see it.
///
/// A missing file loads as empty; a corrupt tail ends the file at the last
/// valid record.
pub fn load_segment(
    dir: &dyn Directory,
    queue_dir: &str,
    seg: u64,
    keep_acked: bool,
) -> IndexResult<(BTreeMap<u16, Slot>, u32)> {
    let path = segment_path(queue_dir, seg);
    let mut slots: BTreeMap<u16, Slot> = BTreeMap::new();
    if !dir.exists(&path) {
        return Ok((slots, 0));
    }
    let mut bytes = Vec::new();
    dir.open_file(&path)?.read_to_end(&mut bytes)?;

    let mut rest = &bytes[..];
    while let Some((entry, n)) = decode_segment_entry(rest) {
        rest = &rest[n..];
        match entry {
            SegmentEntry::Publish { rel, record } => {
                slots.insert(rel, Slot::published(record));
            }
            SegmentEntry::DeliverOrAck { rel } => {
                let slot = slots.entry(rel).or_default();
                if !slot.delivered {
                    slot.delivered = true;
                } else if keep_acked {
                    slot.acked = true;
                } else {
                    slots.remove(&rel);
                }
            }
        }
    }

    let unacked = slots
        .values()
        .filter(|s| s.publish.is_some() && !s.acked)
        .count() as u32;
    Ok((slots, unacked))
}

fn encode_overlay_slot(rel: u16, slot: &Slot, buf: &mut Vec<u8>) {
    match (&slot.publish, slot.delivered, slot.acked) {
        (Some(record), false, false) => encode_segment_publish(rel, record, buf),
        (Some(record), true, false) => {
            encode_segment_publish(rel, record, buf);
            encode_segment_deliver_or_ack(rel, buf);
        }
        // A publish that was delivered and acked without ever being
        // flushed need not touch the file at all.
        (Some(_), _, true) => {}
        (None, true, false) | (None, false, true) => encode_segment_deliver_or_ack(rel, buf),
        (None, true, true) => {
            // The only representation of "acked" the segment format has:
            // the marker written twice.
            encode_segment_deliver_or_ack(rel, buf);
            encode_segment_deliver_or_ack(rel, buf);
        }
        (None, false, false) => debug_assert!(false, "empty slot stored in overlay (rel={rel})"),
    }
}

/// Append every occupied overlay slot of `segment` to its file, in
/// ascending rel order, then clear the overlay.
pub fn append_overlay(
    dir: &dyn Directory,
    queue_dir: &str,
    segment: &mut Segment,
) -> IndexResult<()> {
    if segment.overlay.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::new();
    for (rel, slot) in &segment.overlay {
        encode_overlay_slot(*rel, slot, &mut buf);
    }
    if !buf.is_empty() {
        let path = segment_path(queue_dir, segment.num);
        let mut w = dir.append_file(&path)?;
        w.write_all(&buf)?;
        w.flush()?;
        debug!(
            segment = segment.num,
            bytes = buf.len(),
            "appended overlay to segment file"
        );
    }
    segment.overlay.clear();
    Ok(())
}

/// Delete a segment's file (fully-acked segment at flush).
pub fn delete_segment_file(dir: &dyn Directory, queue_dir: &str, seg: u64) -> IndexResult<()> {
    let path = segment_path(queue_dir, seg);
    if dir.exists(&path) {
        dir.delete(&path)?;
        debug!(segment = seg, "deleted fully-acked segment file");
    }
    Ok(())
}

/// The set of segments currently materialized in memory: a mapping from
/// segment number to state, fronted by a two-entry MRU so back-to-back
/// operations on the same one or two segments skip the tree.
#[derive(Debug, Default)]
pub struct SegmentStore {
    hot: VecDeque<Segment>,
    cold: BTreeMap<u64, Segment>,
}

impl SegmentStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no segment has ever been touched.
    pub fn is_empty(&self) -> bool {
        self.hot.is_empty() && self.cold.is_empty()
    }

    /// Borrow the segment's state, creating it empty on first access.
    /// The segment is promoted into the MRU.
    pub fn entry(&mut self, num: u64) -> &mut Segment {
        if let Some(pos) = self.hot.iter().position(|s| s.num == num) {
            let seg = self.hot.remove(pos).expect("position is in range");
            self.hot.push_front(seg);
        } else {
            let seg = self.cold.remove(&num).unwrap_or_else(|| Segment::new(num));
            self.hot.push_front(seg);
            if self.hot.len() > HOT_SEGMENTS {
                let evicted = self.hot.pop_back().expect("length checked");
                self.cold.insert(evicted.num, evicted);
            }
        }
        self.hot.front_mut().expect("segment just promoted")
    }

    /// Borrow the segment's state without creating or promoting it.
    pub fn get(&self, num: u64) -> Option<&Segment> {
        self.hot
            .iter()
            .find(|s| s.num == num)
            .or_else(|| self.cold.get(&num))
    }

    /// Segment numbers in ascending order.
    pub fn nums(&self) -> Vec<u64> {
        let mut out: Vec<u64> = self
            .hot
            .iter()
            .map(|s| s.num)
            .chain(self.cold.keys().copied())
            .collect();
        out.sort_unstable();
        out
    }

    /// Lowest segment number ever touched.
    pub fn lowest(&self) -> Option<u64> {
        self.nums().first().copied()
    }

    /// Highest segment number ever touched.
    pub fn highest(&self) -> Option<u64> {
        self.nums().last().copied()
    }

    /// Iterate all segment states (MRU entries first).
    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.hot.iter().chain(self.cold.values())
    }
}
