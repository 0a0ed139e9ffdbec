#![no_main]

use libfuzzer_sys::fuzz_target;
use wharf_duration::parse_duration;

fuzz_target!(|data: &str| {
    // humantime-style parsing must never panic, and a round trip through
    // milliseconds must reproduce the same Duration parse_duration would
    // give directly on the millisecond string.
    if let Ok(duration) = parse_duration(data) {
        let ms = duration.as_millis();
        let reparsed = parse_duration(&format!("{ms}ms")).expect("ms suffix always parses");
        assert_eq!(reparsed.as_millis(), ms);
    }
});
