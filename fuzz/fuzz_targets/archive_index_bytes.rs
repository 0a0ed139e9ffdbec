#![no_main]

use libfuzzer_sys::fuzz_target;
use wharf_core::archive::index_archive_bytes;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes are rarely a valid ZIP; the indexer must reject them
    // with an error rather than panic, and a successful index must never
    // contain a directory entry (trailing slash).
    if let Ok(index) = index_archive_bytes(data) {
        for path in index.paths() {
            assert!(!path.ends_with('/'));
        }
    }
});
