//! Fuzz the journal record decoder: arbitrary bytes must never panic,
//! never allocate absurdly, and always terminate.

#![no_main]

use libfuzzer_sys::fuzz_target;
use queue_index::codec::decode_journal_entry;

fuzz_target!(|data: &[u8]| {
    let mut rest = data;
    let mut decoded = 0usize;
    while let Some((entry, n)) = decode_journal_entry(rest) {
        assert!(n > 0 && n <= rest.len());
        // Re-encoding a decoded entry must reproduce the consumed bytes.
        let mut buf = Vec::new();
        queue_index::codec::encode_journal_entry(&entry, &mut buf);
        assert_eq!(&rest[..n], &buf[..]);
        rest = &rest[n..];
        decoded += 1;
        if decoded > data.len() {
            panic!("decoder failed to make progress");
        }
    }
});
