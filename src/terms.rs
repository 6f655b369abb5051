//! The recovery-terms store: a small per-queue key-value record written at
//! clean shutdown to speed the next start.
//!
//! The store is process-wide, keyed by per-queue directory basename. The
//! index owns one key, `"segments"`, holding `[(segment, unacked)]`; any
//! extra keys a caller hands to `terminate` ride along verbatim.
//!
//! ## File format
//!
//! One file, `queues/.recovery_terms`, written atomically:
//!
//! - **Header**: `[magic "QTRM"][version:u32][payload_len:u64][crc32:u32]`
//!   (little-endian integers).
//! - **Payload**: postcard-encoded `BTreeMap<String, Vec<(String, Vec<u8>)>>`
//!   (deterministic ordering for reproducible bytes).
//! - **Checksum**: `crc32fast` over the payload bytes.
//!
//! An unreadable or corrupt terms file degrades every queue to the dirty
//! recovery path instead of failing the boot; the terms are an
//! optimization, not a source of truth.

use crate::error::{IndexError, IndexResult};
use crate::storage::Directory;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Magic bytes for the recovery-terms file.
pub const TERMS_MAGIC: [u8; 4] = *b"QTRM";
/// Current terms file format version.
pub const TERMS_VERSION: u32 = 1;
/// Relative path of the terms file.
pub const TERMS_PATH: &str = "queues/.recovery_terms";
/// The key under which the index persists its per-segment unacked counts.
pub const SEGMENTS_KEY: &str = "segments";

/// Safety cap on the terms payload, to avoid absurd allocations from a
/// corrupt header.
const MAX_TERMS_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Opaque per-queue key-value terms.
pub type TermsList = Vec<(String, Vec<u8>)>;

/// Encode the index-owned `"segments"` term.
pub fn segments_term(counts: &[(u64, u32)]) -> IndexResult<(String, Vec<u8>)> {
    let bytes =
        postcard::to_allocvec(counts).map_err(|e| IndexError::Encode(e.to_string()))?;
    Ok((SEGMENTS_KEY.to_string(), bytes))
}

/// Decode the `"segments"` term out of a terms list, if present and
/// readable.
pub fn read_segments_term(terms: &TermsList) -> Option<Vec<(u64, u32)>> {
    let (_, bytes) = terms.iter().find(|(k, _)| k == SEGMENTS_KEY)?;
    postcard::from_bytes(bytes).ok()
}

/// Interface the index and the start-up walker use against the terms
/// store. Process-wide; implementations provide their own synchronization.
pub trait RecoveryTerms: Send + Sync {
    /// Read the terms for a queue directory, if a clean shutdown left any.
    fn read(&self, dir_name: &str) -> IndexResult<Option<TermsList>>;
    /// Store (replace) the terms for a queue directory.
    fn store(&self, dir_name: &str, terms: TermsList) -> IndexResult<()>;
    /// Remove the terms for a queue directory.
    fn clear(&self, dir_name: &str) -> IndexResult<()>;
}

/// File-backed terms store. Every mutation rewrites the file atomically;
/// reads come from memory.
pub struct FileRecoveryTerms {
    dir: Arc<dyn Directory>,
    table: Mutex<BTreeMap<String, TermsList>>,
}

impl FileRecoveryTerms {
    /// Open the store, loading any terms a previous shutdown persisted.
    pub fn start(dir: Arc<dyn Directory>) -> IndexResult<Self> {
        let table = match Self::load(&*dir) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "recovery terms unreadable; all queues will recover dirty");
                BTreeMap::new()
            }
        };
        Ok(FileRecoveryTerms {
            dir,
            table: Mutex::new(table),
        })
    }

    /// Close the store. Mutations are persisted as they happen, so this
    /// only drops the in-memory table.
    pub fn stop(self) {}

    fn load(dir: &dyn Directory) -> IndexResult<BTreeMap<String, TermsList>> {
        if !dir.exists(TERMS_PATH) {
            return Ok(BTreeMap::new());
        }
        let mut f = dir.open_file(TERMS_PATH)?;
        let mut magic = [0u8; 4];
        f.read_exact(&mut magic)?;
        if magic != TERMS_MAGIC {
            return Err(IndexError::Format("invalid recovery-terms magic".into()));
        }
        let version = f.read_u32::<LittleEndian>()?;
        if version != TERMS_VERSION {
            return Err(IndexError::Format(format!(
                "recovery-terms version mismatch (got {version}, expected {TERMS_VERSION})"
            )));
        }
        let payload_len = f.read_u64::<LittleEndian>()?;
        let expected_crc = f.read_u32::<LittleEndian>()?;
        let payload_len = usize::try_from(payload_len)
            .map_err(|_| IndexError::Format("recovery-terms payload length overflow".into()))?;
        if payload_len > MAX_TERMS_PAYLOAD_BYTES {
            return Err(IndexError::Format(format!(
                "recovery-terms payload too large: {payload_len} bytes"
            )));
        }
        let mut payload = vec![0u8; payload_len];
        f.read_exact(&mut payload)?;
        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            return Err(IndexError::Format(format!(
                "recovery-terms crc mismatch (expected {expected_crc:#010x}, got {actual_crc:#010x})"
            )));
        }
        postcard::from_bytes(&payload).map_err(|e| IndexError::Decode(e.to_string()))
    }

    fn persist(&self, table: &BTreeMap<String, TermsList>) -> IndexResult<()> {
        let payload =
            postcard::to_allocvec(table).map_err(|e| IndexError::Encode(e.to_string()))?;
        let mut out = Vec::with_capacity(4 + 4 + 8 + 4 + payload.len());
        out.extend_from_slice(&TERMS_MAGIC);
        out.write_u32::<LittleEndian>(TERMS_VERSION)
            .expect("vec write");
        out.write_u64::<LittleEndian>(payload.len() as u64)
            .expect("vec write");
        out.write_u32::<LittleEndian>(crc32fast::hash(&payload))
            .expect("vec write");
        out.extend_from_slice(&payload);
        self.dir.atomic_write(TERMS_PATH, &out)
    }

    fn lock_err() -> IndexError {
        IndexError::LockFailed {
            resource: "recovery terms".to_string(),
            reason: "lock poisoned".to_string(),
        }
    }
}

impl RecoveryTerms for FileRecoveryTerms {
    fn read(&self, dir_name: &str) -> IndexResult<Option<TermsList>> {
        let table = self.table.lock().map_err(|_| Self::lock_err())?;
        Ok(table.get(dir_name).cloned())
    }

    fn store(&self, dir_name: &str, terms: TermsList) -> IndexResult<()> {
        let mut table = self.table.lock().map_err(|_| Self::lock_err())?;
        table.insert(dir_name.to_string(), terms);
        self.persist(&table)
    }

    fn clear(&self, dir_name: &str) -> IndexResult<()> {
        let mut table = self.table.lock().map_err(|_| Self::lock_err())?;
        if table.remove(dir_name).is_some() {
            self.persist(&table)?;
        }
        Ok(())
    }
}

/// In-memory terms store for tests.
#[derive(Default)]
pub struct MemoryRecoveryTerms {
    table: Mutex<HashMap<String, TermsList>>,
}

impl MemoryRecoveryTerms {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecoveryTerms for MemoryRecoveryTerms {
    fn read(&self, dir_name: &str) -> IndexResult<Option<TermsList>> {
        Ok(self
            .table
            .lock()
            .map_err(|_| FileRecoveryTerms::lock_err())?
            .get(dir_name)
            .cloned())
    }

    fn store(&self, dir_name: &str, terms: TermsList) -> IndexResult<()> {
        self.table
            .lock()
            .map_err(|_| FileRecoveryTerms::lock_err())?
            .insert(dir_name.to_string(), terms);
        Ok(())
    }

    fn clear(&self, dir_name: &str) -> IndexResult<()> {
        self.table
            .lock()
            .map_err(|_| FileRecoveryTerms::lock_err())?
            .remove(dir_name);
        Ok(())
    }
}
