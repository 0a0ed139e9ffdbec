#![no_main]

use libfuzzer_sys::fuzz_target;
use wharf_core::strategy::parse_strategy;

fuzz_target!(|data: &str| {
    // Parsing must never panic on arbitrary input, and a successful parse
    // must always round-trip through display_name without panicking.
    if let Ok(strategy) = parse_strategy(data) {
        let _ = strategy.display_name();
        assert!(!strategy.batches.is_empty());
    }
});
