//! Fuzz target for batch merging.
//!
//! Merged output never repeats a line and is newline-terminated when
//! it is not empty.

#![no_main]

use batch_replicator::batch::merge_batches;
use libfuzzer_sys::fuzz_target;
use std::collections::HashSet;

fuzz_target!(|files: Vec<Vec<u8>>| {
    let merged = merge_batches(&files);
    if merged.is_empty() {
        return;
    }
    assert_eq!(merged.last(), Some(&b'\n'));

    let mut seen = HashSet::new();
    for line in merged[..merged.len() - 1].split(|b| *b == b'\n') {
        assert!(seen.insert(line), "duplicate line in merged output");
    }
});
