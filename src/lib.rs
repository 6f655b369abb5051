//! `queue-index`: the per-queue persistent index of a durable message
//! broker.
//!
//! Scope:
//! - storage abstraction (`storage`)
//! - on-disk record layouts (`codec`)
//! - append-only journal + overlay transitions (`journal`)
//! - segment state, store, and file I/O (`segment`)
//! - segment ⊕ journal merge logic (`merge`)
//! - the queue-index state machine (`index`)
//! - recovery-terms store (`terms`)
//! - start-up walker (`walker`)
//! - historical format upgraders (`upgrade`)
//!
//! Non-goal: deciding *when* to publish/deliver/ack (the queue's job) or
//! storing message bodies too large to embed (the message store's job).
//!
//! ## Contract (what you can rely on)
//!
//! - **Ordering**: for one sequence id, publish precedes deliver precedes
//!   ack in every observable order: journal bytes, overlay transitions,
//!   post-flush segment contents. Nothing is promised across queues.
//! - **Crash consistency**: any truncation of the journal tail recovers
//!   to the last state whose operations were appended before the cut;
//!   partial appends are discarded by the zero-run rule, never
//!   misparsed.
//! - **Confirm barrier**: the msg-ids handed to the on-sync callbacks
//!   have had their publishes fsync'd (subject to the storage backend
//!   actually providing barriers; see `storage`).
//! - **No acked residue**: a segment whose every publish is acked is
//!   deleted at flush; fully-acked history leaves no on-disk trace.
//!
//! A queue's index is single-threaded on behalf of its owning queue; only
//! the start-up walker and the upgraders touch *different* queue
//! directories concurrently.

pub mod codec;
pub mod error;
pub mod index;
pub mod journal;
pub mod merge;
pub mod segment;
pub mod storage;
pub mod terms;
pub mod upgrade;
pub mod walker;

pub use codec::{next_segment_boundary, MsgId, SeqId, SEGMENT_ENTRY_COUNT};
pub use error::{IndexError, IndexResult};
pub use index::{IndexConfig, MessageProps, NeedsSync, QueueIndex, ReadMessage};
pub use storage::{Directory, FsDirectory, MemoryDirectory};
