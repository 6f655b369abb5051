//! On-disk record layouts for the journal and segment files.
//!
//! Two file formats share a bit-level encoding; all integers are big-endian
//! and every record is byte-aligned on its total length.
//!
//! ## Public invariants (must not change without a format bump)
//!
//! - **Journal entry**: an 8-byte word whose top 2 bits select the kind
//!   (`00` publish-persistent, `01` publish-transient, `10` deliver,
//!   `11` ack) and whose low 62 bits are the sequence id. Publishes are
//!   followed by `[msg_id:16][expiry:u64][size:u32][embedded_size:u32]`
//!   and `embedded_size` bytes of body.
//! - **Segment entry**: a 2-byte word. Top bit `1`: publish,
//!   `[1|is_persistent|rel:14]`, followed by the same 32-byte publish body
//!   and embedded bytes. Top bits `01`: deliver-or-ack, `[01|rel:14]`.
//!   A slot is acked iff *two* deliver-or-ack words exist for its rel.
//! - **Journal termination**: at a record boundary, a run of
//!   `2 + PUB_RECORD_BODY_BYTES` zero bytes (or all-zero bytes to EOF)
//!   ends the file. An all-zero journal head therefore reads as an empty
//!   journal, not as a publish of sequence id 0.
//! - **Segment termination**: a publish word whose 32-byte fixed body is
//!   all zero is dirty-shutdown tail padding; parsing stops there. A word
//!   with top bits `00` also stops parsing.
//!
//! Decoders never fail: anything unparseable ends the file at the last
//! valid record boundary, which is exactly the crash-recovery posture the
//! journal needs (partial tail appends are discarded, the prefix is kept).

use byteorder::{BigEndian, WriteBytesExt};

/// Number of consecutive sequence ids covered by one segment file.
pub const SEGMENT_ENTRY_COUNT: u64 = 16384;

/// Bytes in a message id.
pub const MSG_ID_BYTES: usize = 16;

/// Fixed publish body: msg-id + expiry + size + embedded-size.
pub const PUB_RECORD_BODY_BYTES: usize = MSG_ID_BYTES + 8 + 4 + 4;

/// Zero-run length that terminates journal reading.
pub const JOURNAL_ZERO_RUN_BYTES: usize = 2 + PUB_RECORD_BODY_BYTES;

/// Largest encodable sequence id (62 bits).
pub const SEQ_ID_MAX: u64 = (1 << 62) - 1;

/// Hard cap on embedded bodies, to avoid unbounded allocations when a
/// corrupt size field is read back.
pub const MAX_EMBEDDED_BODY_BYTES: u32 = 16 * 1024 * 1024; // 16 MiB

const SEQ_MASK: u64 = SEQ_ID_MAX;
const KIND_PUB_PERSISTENT: u64 = 0b00;
const KIND_PUB_TRANSIENT: u64 = 0b01;
const KIND_DELIVER: u64 = 0b10;
const KIND_ACK: u64 = 0b11;

/// Sequence id assigned by the owning queue. 62-bit, monotonic but sparse.
pub type SeqId = u64;

/// Message identifier (opaque 16 bytes).
pub type MsgId = [u8; MSG_ID_BYTES];

/// Segment number covering `seq`.
#[inline]
pub fn seg_of(seq: SeqId) -> u64 {
    seq / SEGMENT_ENTRY_COUNT
}

/// Relative sequence of `seq` within its segment (14 bits).
#[inline]
pub fn rel_of(seq: SeqId) -> u16 {
    (seq % SEGMENT_ENTRY_COUNT) as u16
}

/// Reassemble a sequence id from segment number and relative sequence.
#[inline]
pub fn seq_of(seg: u64, rel: u16) -> SeqId {
    seg * SEGMENT_ENTRY_COUNT + u64::from(rel)
}

/// First sequence id of the segment after the one covering `seq`.
#[inline]
pub fn next_segment_boundary(seq: SeqId) -> SeqId {
    (seg_of(seq) + 1) * SEGMENT_ENTRY_COUNT
}

/// A publish as recorded on disk and mirrored in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    /// Opaque message id.
    pub msg_id: MsgId,
    /// Absolute expiry timestamp; `0` means no expiry.
    pub expiry: u64,
    /// Full message size in bytes (including a body held by the message
    /// store when not embedded).
    pub size: u32,
    /// Message body embedded in the index; empty means the body lives in
    /// the external message store.
    pub body: Vec<u8>,
    /// Whether the message must survive a broker restart.
    pub is_persistent: bool,
}

impl PublishRecord {
    /// Whether the body is embedded in the index rather than the message
    /// store.
    pub fn is_embedded(&self) -> bool {
        !self.body.is_empty()
    }
}

/// One logical journal mutation, carrying a full sequence id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    /// A message was published at the given sequence id.
    Publish(SeqId, PublishRecord),
    /// The message at the given sequence id was handed to a consumer.
    Deliver(SeqId),
    /// The consumer acknowledged the message at the given sequence id.
    Ack(SeqId),
}

impl JournalEntry {
    /// The sequence id this entry refers to.
    pub fn seq_id(&self) -> SeqId {
        match self {
            JournalEntry::Publish(seq, _) | JournalEntry::Deliver(seq) | JournalEntry::Ack(seq) => {
                *seq
            }
        }
    }
}

/// One record parsed from a segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentEntry {
    /// A publish keyed by relative sequence.
    Publish {
        /// Relative sequence within the segment.
        rel: u16,
        /// The publish payload.
        record: PublishRecord,
    },
    /// A deliver-or-ack marker; meaning depends on how many have been seen
    /// for the same rel.
    DeliverOrAck {
        /// Relative sequence within the segment.
        rel: u16,
    },
}

fn write_pub_body(record: &PublishRecord, out: &mut Vec<u8>) {
    out.extend_from_slice(&record.msg_id);
    out.write_u64::<BigEndian>(record.expiry).expect("vec write");
    out.write_u32::<BigEndian>(record.size).expect("vec write");
    out.write_u32::<BigEndian>(record.body.len() as u32)
        .expect("vec write");
    out.extend_from_slice(&record.body);
}

/// Append the encoding of one journal entry to `out`.
///
/// Debug builds assert the sequence id fits in 62 bits (the queue never
/// assigns larger ones); release builds mask.
pub fn encode_journal_entry(entry: &JournalEntry, out: &mut Vec<u8>) {
    let seq = entry.seq_id();
    debug_assert!(seq <= SEQ_ID_MAX, "sequence id overflows 62 bits: {seq}");
    let kind = match entry {
        JournalEntry::Publish(_, r) if r.is_persistent => KIND_PUB_PERSISTENT,
        JournalEntry::Publish(..) => KIND_PUB_TRANSIENT,
        JournalEntry::Deliver(_) => KIND_DELIVER,
        JournalEntry::Ack(_) => KIND_ACK,
    };
    out.write_u64::<BigEndian>((kind << 62) | (seq & SEQ_MASK))
        .expect("vec write");
    if let JournalEntry::Publish(_, record) = entry {
        write_pub_body(record, out);
    }
}

/// Append the segment encoding of a publish to `out`.
pub fn encode_segment_publish(rel: u16, record: &PublishRecord, out: &mut Vec<u8>) {
    debug_assert!(rel < SEGMENT_ENTRY_COUNT as u16);
    let word: u16 = 0x8000 | (u16::from(record.is_persistent) << 14) | (rel & 0x3FFF);
    out.write_u16::<BigEndian>(word).expect("vec write");
    write_pub_body(record, out);
}

/// Append the segment encoding of one deliver-or-ack marker to `out`.
pub fn encode_segment_deliver_or_ack(rel: u16, out: &mut Vec<u8>) {
    debug_assert!(rel < SEGMENT_ENTRY_COUNT as u16);
    let word: u16 = 0x4000 | (rel & 0x3FFF);
    out.write_u16::<BigEndian>(word).expect("vec write");
}

fn read_pub_body(buf: &[u8]) -> Option<(MsgId, u64, u32, Vec<u8>, usize)> {
    if buf.len() < PUB_RECORD_BODY_BYTES {
        return None;
    }
    let mut msg_id = [0u8; MSG_ID_BYTES];
    msg_id.copy_from_slice(&buf[..MSG_ID_BYTES]);
    let expiry = u64::from_be_bytes(buf[16..24].try_into().expect("slice len"));
    let size = u32::from_be_bytes(buf[24..28].try_into().expect("slice len"));
    let embedded = u32::from_be_bytes(buf[28..32].try_into().expect("slice len"));
    if embedded > MAX_EMBEDDED_BODY_BYTES {
        return None;
    }
    let embedded = embedded as usize;
    if buf.len() < PUB_RECORD_BODY_BYTES + embedded {
        return None;
    }
    let body = buf[PUB_RECORD_BODY_BYTES..PUB_RECORD_BODY_BYTES + embedded].to_vec();
    Some((msg_id, expiry, size, body, PUB_RECORD_BODY_BYTES + embedded))
}

/// Decode the next journal entry from `buf`.
///
/// Returns the entry and the number of bytes consumed, or `None` when
/// reading must stop: clean EOF, the zero-run terminator, a torn tail, or
/// a record whose framing is inconsistent. Everything decoded before a
/// `None` is valid.
pub fn decode_journal_entry(buf: &[u8]) -> Option<(JournalEntry, usize)> {
    if buf.len() < 8 {
        return None;
    }
    let word = u64::from_be_bytes(buf[..8].try_into().expect("slice len"));
    if word == 0 {
        // Candidate terminator. Only a publish may begin with a zero byte,
        // and a real publish of seq 0 carries a non-zero body within the
        // next PUB_RECORD_BODY_BYTES; an all-zero window is tail padding.
        let window = buf.len().min(JOURNAL_ZERO_RUN_BYTES);
        if buf[..window].iter().all(|&b| b == 0) {
            return None;
        }
    }
    let kind = word >> 62;
    let seq = word & SEQ_MASK;
    match kind {
        KIND_DELIVER => Some((JournalEntry::Deliver(seq), 8)),
        KIND_ACK => Some((JournalEntry::Ack(seq), 8)),
        _ => {
            let (msg_id, expiry, size, body, body_len) = read_pub_body(&buf[8..])?;
            let record = PublishRecord {
                msg_id,
                expiry,
                size,
                body,
                is_persistent: kind == KIND_PUB_PERSISTENT,
            };
            Some((JournalEntry::Publish(seq, record), 8 + body_len))
        }
    }
}

/// Decode the next segment entry from `buf`.
///
/// Same stopping discipline as [`decode_journal_entry`]: `None` ends the
/// file at the previous record boundary. A publish whose fixed body is all
/// zero is dirty-shutdown tail padding.
pub fn decode_segment_entry(buf: &[u8]) -> Option<(SegmentEntry, usize)> {
    if buf.len() < 2 {
        return None;
    }
    let word = u16::from_be_bytes(buf[..2].try_into().expect("slice len"));
    if word & 0x8000 != 0 {
        let rel = word & 0x3FFF;
        let fixed = buf.get(2..2 + PUB_RECORD_BODY_BYTES)?;
        if fixed.iter().all(|&b| b == 0) {
            return None;
        }
        let (msg_id, expiry, size, body, body_len) = read_pub_body(&buf[2..])?;
        let record = PublishRecord {
            msg_id,
            expiry,
            size,
            body,
            is_persistent: word & 0x4000 != 0,
        };
        Some((SegmentEntry::Publish { rel, record }, 2 + body_len))
    } else if word & 0x4000 != 0 {
        Some((SegmentEntry::DeliverOrAck { rel: word & 0x3FFF }, 2))
    } else {
        // `00` prefix: zero padding or foreign bytes.
        None
    }
}
