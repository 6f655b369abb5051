//! Fuzz the upgrade chain: arbitrary v0 bytes must rewrite without
//! panicking, and the rewritten journal must decode cleanly with the
//! current codec.

#![no_main]

use libfuzzer_sys::fuzz_target;
use queue_index::codec::decode_journal_entry;
use queue_index::storage::{Directory, MemoryDirectory};
use queue_index::upgrade::{rewrite_file, UPGRADERS};

fuzz_target!(|data: &[u8]| {
    let dir = MemoryDirectory::new();
    dir.atomic_write("q/journal.jif", data).unwrap();

    for u in &UPGRADERS {
        rewrite_file(&dir, "q/journal.jif", u.journal_fn).unwrap();
    }

    let mut bytes = Vec::new();
    use std::io::Read;
    dir.open_file("q/journal.jif")
        .unwrap()
        .read_to_end(&mut bytes)
        .unwrap();
    let mut rest = &bytes[..];
    while let Some((_, n)) = decode_journal_entry(rest) {
        rest = &rest[n..];
    }
});
