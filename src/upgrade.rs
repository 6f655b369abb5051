//! Streaming upgraders between historical index file formats.
//!
//! Four upgraders, run in dependency order at the first boot after a
//! version change:
//!
//! | step | from → to | change |
//! |---|---|---|
//! | `add_queue_ttl` | v0 → v1 | publishes gain an 8-byte expiry (0 = none) |
//! | `avoid_zeroes` | v1 → v2 | journal kind prefixes re-assigned so only a publish may start with a zero byte; zero padding dropped |
//! | `store_msg_size` | v2 → v3 | publishes gain a 4-byte size |
//! | `store_msg` | v3 → v4 | publishes gain a 4-byte embedded-size (0 = body in the message store) |
//!
//! The historical journal kind assignment (v0/v1) was `00` ack, `01`
//! deliver, `10` publish-transient, `11` publish-persistent, which made
//! an ack of sequence id 0 an all-zero word and the zero-run terminator
//! ambiguous. `avoid_zeroes` swaps to the current assignment.
//!
//! Each upgrader is a pair of streaming byte rewriters (journal, segment).
//! A rewriter consumes one record and returns the rewritten bytes plus
//! the remaining input, or `None` when the tail is unparseable; the file
//! is truncated at that point, the same stance recovery takes. Rewritten
//! content goes to `<path>.upgrade` and is renamed over the original.
//!
//! A version marker (`queues/.index_format`, big-endian `u32`) records the
//! on-disk version so upgrades are idempotent. A missing marker over
//! existing queues means v0; a missing marker on a fresh directory means
//! current.

use crate::error::IndexResult;
use crate::index::QUEUES_DIR;
use crate::journal::JOURNAL_FILE;
use crate::segment::parse_segment_name;
use crate::storage::Directory;
use std::io::{Read, Write};
use tracing::info;

/// Current on-disk format version.
pub const INDEX_FORMAT_VERSION: u32 = 4;
/// Relative path of the version marker file.
pub const FORMAT_MARKER_PATH: &str = "queues/.index_format";

const MSG_ID_BYTES: usize = 16;

/// One streaming rewriter: `(output_chunk, remaining_input)`, or `None`
/// to truncate the file here.
pub type RewriteFn = for<'a> fn(&'a [u8]) -> Option<(Vec<u8>, &'a [u8])>;

/// A format upgrader: one rewriter per file kind.
pub struct Upgrader {
    /// Upgrade step name.
    pub name: &'static str,
    /// Rewriter for `journal.jif`.
    pub journal_fn: RewriteFn,
    /// Rewriter for `<seg>.idx` files.
    pub segment_fn: RewriteFn,
}

/// The upgrade chain, in dependency order. `UPGRADERS[v]` takes version
/// `v` to `v + 1`.
pub const UPGRADERS: [Upgrader; 4] = [
    Upgrader {
        name: "add_queue_ttl",
        journal_fn: journal_add_queue_ttl,
        segment_fn: segment_add_queue_ttl,
    },
    Upgrader {
        name: "avoid_zeroes",
        journal_fn: journal_avoid_zeroes,
        segment_fn: segment_passthrough,
    },
    Upgrader {
        name: "store_msg_size",
        journal_fn: journal_store_msg_size,
        segment_fn: segment_store_msg_size,
    },
    Upgrader {
        name: "store_msg",
        journal_fn: journal_store_msg,
        segment_fn: segment_store_msg,
    },
];

// Journal publish body length per version (after the 8-byte word).
const V0_PUB: usize = MSG_ID_BYTES;
const V1_PUB: usize = MSG_ID_BYTES + 8;
const V2_PUB: usize = V1_PUB;
const V3_PUB: usize = MSG_ID_BYTES + 8 + 4;

fn split_word(buf: &[u8]) -> Option<(u64, &[u8])> {
    if buf.len() < 8 {
        return None;
    }
    let word = u64::from_be_bytes(buf[..8].try_into().expect("slice len"));
    if word == 0 && buf.iter().all(|&b| b == 0) {
        // Trailing zeros: padding on old formats, terminator on new ones.
        return None;
    }
    Some((word, &buf[8..]))
}

fn copy_pub(word: u64, rest: &[u8], body_len: usize, pad: usize) -> Option<(Vec<u8>, &[u8])> {
    if rest.len() < body_len {
        return None;
    }
    let mut out = Vec::with_capacity(8 + body_len + pad);
    out.extend_from_slice(&word.to_be_bytes());
    out.extend_from_slice(&rest[..body_len]);
    out.extend_from_slice(&vec![0u8; pad]);
    Some((out, &rest[body_len..]))
}

fn journal_add_queue_ttl(buf: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    let (word, rest) = split_word(buf)?;
    match word >> 62 {
        // Historical kinds: 10/11 are publishes; insert a zero expiry.
        0b10 | 0b11 => copy_pub(word, rest, V0_PUB, 8),
        _ => Some((word.to_be_bytes().to_vec(), rest)),
    }
}

fn journal_avoid_zeroes(buf: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    let (word, rest) = split_word(buf)?;
    // 00 ack → 11, 01 deliver → 10, 10 pub-transient → 01,
    // 11 pub-persistent → 00: a bitwise complement of the kind.
    let new_word = (!word & (0b11 << 62)) | (word & !(0b11 << 62));
    match word >> 62 {
        0b10 | 0b11 => copy_pub(new_word, rest, V1_PUB, 0),
        _ => Some((new_word.to_be_bytes().to_vec(), rest)),
    }
}

fn journal_store_msg_size(buf: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    let (word, rest) = split_word(buf)?;
    match word >> 62 {
        // Current kinds from here on: 00/01 are publishes.
        0b00 | 0b01 => copy_pub(word, rest, V2_PUB, 4),
        _ => Some((word.to_be_bytes().to_vec(), rest)),
    }
}

fn journal_store_msg(buf: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    let (word, rest) = split_word(buf)?;
    match word >> 62 {
        0b00 | 0b01 => copy_pub(word, rest, V3_PUB, 4),
        _ => Some((word.to_be_bytes().to_vec(), rest)),
    }
}

fn split_segment_word(buf: &[u8]) -> Option<(u16, &[u8])> {
    if buf.len() < 2 {
        return None;
    }
    let word = u16::from_be_bytes(buf[..2].try_into().expect("slice len"));
    if word & 0xC000 == 0 {
        // `00` prefix: zero padding (or foreign bytes). Truncate.
        return None;
    }
    Some((word, &buf[2..]))
}

fn segment_rewrite(buf: &[u8], pub_body: usize, pad: usize) -> Option<(Vec<u8>, &[u8])> {
    let (word, rest) = split_segment_word(buf)?;
    if word & 0x8000 != 0 {
        if rest.len() < pub_body {
            return None;
        }
        let mut out = Vec::with_capacity(2 + pub_body + pad);
        out.extend_from_slice(&word.to_be_bytes());
        out.extend_from_slice(&rest[..pub_body]);
        out.extend_from_slice(&vec![0u8; pad]);
        Some((out, &rest[pub_body..]))
    } else {
        Some((word.to_be_bytes().to_vec(), rest))
    }
}

fn segment_add_queue_ttl(buf: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    segment_rewrite(buf, V0_PUB, 8)
}

fn segment_passthrough(buf: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    // Re-framing only: the walk itself drops the zero padding old files
    // carried, because split_segment_word stops at it.
    segment_rewrite(buf, V1_PUB, 0)
}

fn segment_store_msg_size(buf: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    segment_rewrite(buf, V2_PUB, 4)
}

fn segment_store_msg(buf: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    segment_rewrite(buf, V3_PUB, 4)
}

/// Run one rewriter over a whole file: stream records into
/// `<path>.upgrade`, then rename over the original. Zero-length and
/// missing files are skipped.
pub fn rewrite_file(dir: &dyn Directory, path: &str, f: RewriteFn) -> IndexResult<()> {
    if !dir.exists(path) {
        return Ok(());
    }
    let mut bytes = Vec::new();
    dir.open_file(path)?.read_to_end(&mut bytes)?;
    if bytes.is_empty() {
        return Ok(());
    }

    let mut out = Vec::with_capacity(bytes.len());
    let mut rest = &bytes[..];
    while let Some((chunk, rem)) = f(rest) {
        out.extend_from_slice(&chunk);
        rest = rem;
    }

    let upgrade_path = format!("{path}.upgrade");
    let mut w = dir.create_file(&upgrade_path)?;
    w.write_all(&out)?;
    w.flush()?;
    drop(w);
    dir.atomic_rename(&upgrade_path, path)?;
    Ok(())
}

/// On-disk format version currently recorded for the queues directory.
pub fn read_format_version(dir: &dyn Directory) -> IndexResult<u32> {
    if dir.exists(FORMAT_MARKER_PATH) {
        let mut bytes = Vec::new();
        dir.open_file(FORMAT_MARKER_PATH)?.read_to_end(&mut bytes)?;
        if bytes.len() == 4 {
            return Ok(u32::from_be_bytes(bytes[..4].try_into().expect("len checked")));
        }
        // Unreadable marker: treat as the pre-marker era. Markers are
        // written atomically, so this only happens to hand-edited files.
        return Ok(0);
    }
    let has_queues = dir
        .list_dir(QUEUES_DIR)?
        .iter()
        .any(|n| !n.starts_with('.'));
    Ok(if has_queues { 0 } else { INDEX_FORMAT_VERSION })
}

fn write_format_version(dir: &dyn Directory, version: u32) -> IndexResult<()> {
    dir.atomic_write(FORMAT_MARKER_PATH, &version.to_be_bytes())
}

/// Upgrade every queue directory from the recorded version to the current
/// one, then stamp the marker. Runs before the startup walker.
///
/// The marker is written even when nothing needed upgrading: a fresh
/// directory must not read as v0 once queues exist in it.
pub fn upgrade_queues(dir: &dyn Directory) -> IndexResult<()> {
    let from = read_format_version(dir)?;
    if from < INDEX_FORMAT_VERSION {
        let queue_dirs: Vec<String> = dir
            .list_dir(QUEUES_DIR)?
            .into_iter()
            .filter(|n| !n.starts_with('.'))
            .collect();

        for upgrader in &UPGRADERS[from as usize..] {
            for queue in &queue_dirs {
                let queue_dir = format!("{QUEUES_DIR}/{queue}");
                rewrite_file(
                    dir,
                    &format!("{queue_dir}/{JOURNAL_FILE}"),
                    upgrader.journal_fn,
                )?;
                for name in dir.list_dir(&queue_dir)? {
                    if parse_segment_name(&name).is_some() {
                        rewrite_file(dir, &format!("{queue_dir}/{name}"), upgrader.segment_fn)?;
                    }
                }
            }
            info!(step = upgrader.name, queues = queue_dirs.len(), "applied index format upgrade");
        }
    }
    write_format_version(dir, INDEX_FORMAT_VERSION)
}
