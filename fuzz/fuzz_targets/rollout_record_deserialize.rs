#![no_main]

use libfuzzer_sys::fuzz_target;
use wharf_types::RolloutRecord;

fuzz_target!(|data: &str| {
    // Arbitrary JSON text must never panic the deserializer, and a record
    // that round-trips must reproduce the same rollout id and host states.
    let Ok(record) = serde_json::from_str::<RolloutRecord>(data) else {
        return;
    };
    let reencoded = serde_json::to_string(&record).expect("a parsed record always reserializes");
    let reparsed: RolloutRecord =
        serde_json::from_str(&reencoded).expect("reserialized record always reparses");
    assert_eq!(reparsed.rollout_id, record.rollout_id);
    assert_eq!(reparsed.host_states.len(), record.host_states.len());
});
