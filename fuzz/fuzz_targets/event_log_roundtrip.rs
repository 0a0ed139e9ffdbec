#![no_main]

use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;
use wharf_events::EventLog;

fuzz_target!(|data: &str| {
    // Arbitrary text written as an events.jsonl must either be rejected or
    // parse into events whose line count never exceeds the non-blank lines
    // in the input.
    let Ok(td) = tempdir() else { return };
    let path = td.path().join("events.jsonl");
    if std::fs::write(&path, data).is_err() {
        return;
    }

    let non_blank_lines = data.lines().filter(|l| !l.trim().is_empty()).count();

    if let Ok(log) = EventLog::read_from_file(&path) {
        assert!(log.len() <= non_blank_lines);
    }
});
