//! Fuzz target for command template substitution.
//!
//! Quoted values must never leave a single quote unbalanced, otherwise a
//! value could escape into the command line.

#![no_main]

use batch_replicator::exec::{shell_quote, substitute};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (template, value) = data;

    let quoted = shell_quote(value);
    if quoted != value {
        assert!(quoted.starts_with('\''));
        assert!(quoted.ends_with('\''));
        // Every embedded quote is closed, escaped and reopened.
        assert_eq!(
            quoted.matches('\'').count(),
            2 + 3 * value.matches('\'').count()
        );
    }

    let _ = substitute(template, &[("%b", value), ("%s", value), ("%d", value)]);
});
