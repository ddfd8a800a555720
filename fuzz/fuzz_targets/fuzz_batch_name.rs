//! Fuzz target for batch filename parsing.
//!
//! Parsing must never panic, and a parsed origin must be a non-empty
//! slice of the name without separators.

#![no_main]

use batch_replicator::batch::{batch_type, origin_node, BATCH_SUFFIX};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|name: &str| {
    if let Some(origin) = origin_node(name) {
        assert!(!origin.is_empty());
        assert!(!origin.contains('_'));
        assert!(name.contains(origin));
        assert!(name.ends_with(BATCH_SUFFIX));
    }

    if batch_type(name).is_some() {
        assert!(name.ends_with(BATCH_SUFFIX));
    }
});
