//! Fuzz the segment loader end to end: arbitrary file bytes must parse
//! to a consistent slot map in both keep-acked modes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use queue_index::segment::load_segment;
use queue_index::storage::{Directory, MemoryDirectory};

fuzz_target!(|data: &[u8]| {
    let dir = MemoryDirectory::new();
    dir.atomic_write("q/0.idx", data).unwrap();

    let (normal, unacked) = load_segment(&dir, "q", 0, false).unwrap();
    let (kept, unacked_kept) = load_segment(&dir, "q", 0, true).unwrap();

    // keep_acked only ever preserves *more* slots, and the unacked count
    // is mode-independent.
    assert_eq!(unacked, unacked_kept);
    for (rel, slot) in &normal {
        assert!(kept.contains_key(rel), "slot {rel} lost in keep-acked mode");
        assert!(!slot.acked);
    }
    assert!(normal.len() <= kept.len());
});
