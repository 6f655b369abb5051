//! Merging a segment-file image with the in-memory journal overlay.
//!
//! Two pure functions over sparse slot maps:
//!
//! - [`segment_plus_journal`] produces the authoritative view of a
//!   segment: what the file says, corrected by what the journal has seen
//!   since the last flush. Used by reads and by dirty-recovery unacked
//!   recomputation.
//! - [`journal_minus_segment`] strips from a journal-replayed overlay
//!   everything the segment file already reflects. Used only at dirty
//!   recovery: a crash between segment append and journal truncation
//!   leaves the same operations in both places, and replaying them twice
//!   would double-count.
//!
//! Both treat pairings the lifecycle cannot produce (an ack without a
//! publish, a publish in two places at once) as caller bugs: debug builds
//! panic, release builds keep the segment's view.

use crate::segment::Slot;
use std::collections::BTreeMap;

/// Combine a segment image with its journal overlay.
///
/// Returns the merged view and the change to the segment's unacked count
/// relative to what the file alone says. Slots whose merged state is
/// acked disappear from the view.
pub fn segment_plus_journal(
    seg: &BTreeMap<u16, Slot>,
    overlay: &BTreeMap<u16, Slot>,
) -> (BTreeMap<u16, Slot>, i64) {
    let mut merged = seg.clone();
    let mut delta: i64 = 0;

    for (rel, o) in overlay {
        match seg.get(rel) {
            None => match &o.publish {
                Some(_) if !o.acked => {
                    merged.insert(*rel, o.clone());
                    delta += 1;
                }
                Some(_) => {
                    // Published, delivered and acked entirely inside the
                    // overlay: nothing to show, nothing unacked.
                }
                None => {
                    debug_assert!(
                        false,
                        "overlay delta at rel {rel} without a segment record"
                    );
                }
            },
            Some(s) => {
                debug_assert!(
                    o.publish.is_none(),
                    "duplicate publish at rel {rel} (segment and overlay)"
                );
                if o.publish.is_some() {
                    continue;
                }
                let delivered = s.delivered || o.delivered;
                let acked = s.acked || o.acked;
                if acked {
                    merged.remove(rel);
                    if s.publish.is_some() && !s.acked {
                        delta -= 1;
                    }
                } else {
                    let m = merged.get_mut(rel).expect("cloned from seg");
                    m.delivered = delivered;
                }
            }
        }
    }

    (merged, delta)
}

/// Remove from `overlay` every state the segment image already reflects,
/// shrinking partially-reflected slots to their unreflected delta.
///
/// `seg` must be loaded with `keep_acked = true` so that acked slots are
/// visible for comparison. Returns the number of overlay slots that were
/// removed or shrunk (journal entries that proved redundant).
pub fn journal_minus_segment(
    overlay: &mut BTreeMap<u16, Slot>,
    seg: &BTreeMap<u16, Slot>,
) -> usize {
    let mut duplicates = 0usize;
    let rels: Vec<u16> = overlay.keys().copied().collect();

    for rel in rels {
        let o = overlay.get(&rel).expect("key collected above");
        match seg.get(&rel) {
            None => {
                if o.publish.is_none() {
                    // The journal tail is stale: the message was flushed
                    // and its segment deleted before the crash. Nothing
                    // left to apply these markers to.
                    overlay.remove(&rel);
                }
            }
            Some(s) => {
                debug_assert!(
                    s.publish.is_some(),
                    "segment image has markers without a publish at rel {rel}"
                );
                if o.publish.is_some() {
                    debug_assert!(
                        s.delivered <= o.delivered && s.acked <= o.acked,
                        "segment ahead of a journal that still holds the publish at rel {rel}"
                    );
                }
                let delivered = o.delivered && !s.delivered;
                let acked = o.acked && !s.acked;
                if !delivered && !acked {
                    // Fully reflected (the publish included, when present).
                    overlay.remove(&rel);
                    if !s.acked {
                        duplicates += 1;
                    }
                } else if o.publish.is_some() || o.delivered != delivered || o.acked != acked {
                    // The publish (and any reflected marker) is on disk;
                    // keep only the unreflected remainder.
                    overlay.insert(
                        rel,
                        Slot {
                            publish: None,
                            delivered,
                            acked,
                        },
                    );
                    duplicates += 1;
                }
            }
        }
    }

    duplicates
}
