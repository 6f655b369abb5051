//! The append-only journal and its in-memory overlay transitions.
//!
//! Every public mutation first appends its encoded entry to
//! `journal.jif`, then mirrors it into the owning segment's overlay via
//! [`overlay_add`]. The journal is the only file the index ever fsyncs:
//! segments are rebuilt from it at flush, so one barrier covers every
//! segment.
//!
//! ## Overlay transition table
//!
//! | existing slot | action | new slot |
//! |---|---|---|
//! | empty | publish P | `(P, no_del, no_ack)` |
//! | empty | deliver | `(no_pub, del, no_ack)` |
//! | empty | ack | `(no_pub, no_del, ack)` |
//! | `(P, no_del, no_ack)` | deliver | `(P, del, no_ack)` |
//! | `(no_pub, del, no_ack)` | ack | `(no_pub, del, ack)` |
//! | `(P, del, no_ack)` | ack | *empty* |
//!
//! Any other pairing is a caller bug: panic in debug builds, rejected in
//! release. The last row is what keeps the overlay small: a message
//! published, delivered and acked between two flushes vanishes without
//! ever touching a segment file.

use crate::codec::{decode_journal_entry, JournalEntry, PublishRecord};
use crate::error::{IndexError, IndexResult};
use crate::segment::Slot;
use crate::storage::{self, Directory};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::warn;

/// Journal file name inside a queue directory.
pub const JOURNAL_FILE: &str = "journal.jif";

/// One logical action applied to an overlay slot.
#[derive(Debug, Clone)]
pub enum OverlayAction {
    /// Record a publish.
    Publish(PublishRecord),
    /// Record a delivery.
    Deliver,
    /// Record an acknowledgement.
    Ack,
}

/// Apply one action to the overlay slot at `rel`, enforcing the legal
/// transitions above.
pub fn overlay_add(
    overlay: &mut BTreeMap<u16, Slot>,
    rel: u16,
    action: OverlayAction,
) -> IndexResult<()> {
    let existing = overlay.get(&rel);
    let next = match (existing, &action) {
        (None, OverlayAction::Publish(record)) => Some(Slot::published(record.clone())),
        (None, OverlayAction::Deliver) => Some(Slot {
            publish: None,
            delivered: true,
            acked: false,
        }),
        (None, OverlayAction::Ack) => Some(Slot {
            publish: None,
            delivered: false,
            acked: true,
        }),
        (
            Some(Slot {
                publish: publish @ Some(_),
                delivered: false,
                acked: false,
            }),
            OverlayAction::Deliver,
        ) => Some(Slot {
            publish: publish.clone(),
            delivered: true,
            acked: false,
        }),
        (
            Some(Slot {
                publish: None,
                delivered: true,
                acked: false,
            }),
            OverlayAction::Ack,
        ) => Some(Slot {
            publish: None,
            delivered: true,
            acked: true,
        }),
        (
            Some(Slot {
                publish: Some(_),
                delivered: true,
                acked: false,
            }),
            OverlayAction::Ack,
        ) => None,
        (existing, action) => {
            debug_assert!(
                false,
                "illegal overlay transition at rel {rel}: {existing:?} + {action:?}"
            );
            return Err(IndexError::InvalidState(format!(
                "illegal overlay transition at rel {rel}"
            )));
        }
    };
    match next {
        Some(slot) => {
            overlay.insert(rel, slot);
        }
        None => {
            overlay.remove(&rel);
        }
    }
    Ok(())
}

/// Handle to a queue's `journal.jif`: lazy append handle plus the
/// appended-since-last-sync marker that drives `needs_sync`.
pub struct JournalFile {
    dir: Arc<dyn Directory>,
    path: String,
    w: Option<Box<dyn Write>>,
    appended_since_sync: bool,
}

impl JournalFile {
    /// Journal handle for the queue at `queue_dir`. Nothing is opened or
    /// created until the first append.
    pub fn new(dir: Arc<dyn Directory>, queue_dir: &str) -> Self {
        JournalFile {
            dir,
            path: format!("{queue_dir}/{JOURNAL_FILE}"),
            w: None,
            appended_since_sync: false,
        }
    }

    /// Whether an append handle is currently open.
    pub fn is_open(&self) -> bool {
        self.w.is_some()
    }

    /// Whether bytes were appended since the last sync barrier.
    pub fn appended_since_sync(&self) -> bool {
        self.appended_since_sync
    }

    /// Append pre-encoded journal bytes, opening the handle (and creating
    /// the queue directory) on first use.
    pub fn append(&mut self, encoded: &[u8]) -> IndexResult<()> {
        if encoded.is_empty() {
            return Ok(());
        }
        if self.w.is_none() {
            self.w = Some(self.dir.append_file(&self.path)?);
        }
        let w = self.w.as_mut().expect("handle just opened");
        w.write_all(encoded)?;
        self.appended_since_sync = true;
        Ok(())
    }

    /// Flush and fsync the journal. The barrier is backend-dependent: a
    /// real `sync_all` on filesystem directories, a flush elsewhere.
    pub fn sync(&mut self) -> IndexResult<()> {
        if let Some(w) = self.w.as_mut() {
            w.flush()?;
        }
        if self.dir.exists(&self.path) {
            storage::sync_file_if_possible(&*self.dir, &self.path)?;
        }
        self.appended_since_sync = false;
        Ok(())
    }

    /// Truncate the journal to zero bytes (after its entries have been
    /// drained into segment files).
    pub fn truncate(&mut self) -> IndexResult<()> {
        if let Some(w) = self.w.as_mut() {
            w.flush()?;
        }
        self.dir.truncate_file(&self.path)?;
        self.appended_since_sync = false;
        Ok(())
    }

    /// Drop the append handle (terminate).
    pub fn close(&mut self) {
        self.w = None;
        self.appended_since_sync = false;
    }
}

/// Read and decode a queue's journal file.
///
/// Returns all valid entries; a torn tail past the last valid record is
/// discarded (and logged), which is exactly what crash recovery wants.
pub fn load_journal(dir: &dyn Directory, queue_dir: &str) -> IndexResult<Vec<JournalEntry>> {
    let path = format!("{queue_dir}/{JOURNAL_FILE}");
    if !dir.exists(&path) {
        return Ok(Vec::new());
    }
    let mut bytes = Vec::new();
    dir.open_file(&path)?.read_to_end(&mut bytes)?;

    let mut entries = Vec::new();
    let mut rest = &bytes[..];
    while let Some((entry, n)) = decode_journal_entry(rest) {
        entries.push(entry);
        rest = &rest[n..];
    }
    if !rest.is_empty() && rest.iter().any(|&b| b != 0) {
        warn!(
            path = %path,
            discarded = rest.len(),
            "discarding unparseable journal tail"
        );
    }
    Ok(entries)
}
