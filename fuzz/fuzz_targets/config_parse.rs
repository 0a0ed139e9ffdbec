#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;
use wharf_core::config::{CliOverrides, WharfConfig};

fuzz_target!(|data: &str| {
    // Arbitrary text is rarely valid `.wharf.toml`; loading it must return
    // an error rather than panic, for any input including malformed TOML,
    // wrong-typed fields, or a well-formed-but-invalid balancer section.
    let Ok(td) = tempdir() else { return };
    let path = td.path().join(".wharf.toml");
    if fs::write(&path, data).is_err() {
        return;
    }
    let _ = WharfConfig::load_from_file(&path, &CliOverrides::default());
});
