//! Fuzz test for the record merge engine
//!
//! Interprets two JSON objects as field maps of the same record and checks
//! the merge laws:
//! - Merging twice reports nothing the second time
//! - Every changed field carries the incoming value
//! - Fields only the existing record has survive
//!
//! Run with: cargo +nightly fuzz run merge_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use strata_core::{CacheKey, Record, Value};

fn record_from(json: &serde_json::Value) -> Option<Record> {
    let object = json.as_object()?;
    let mut record = Record::new(CacheKey::new("Fuzz:1"));
    for (name, value) in object {
        record.insert(name.clone(), Value::from_json(value));
    }
    Some(record)
}

fuzz_target!(|data: &[u8]| {
    let Ok(serde_json::Value::Array(items)) = serde_json::from_slice::<serde_json::Value>(data)
    else {
        return;
    };
    let [existing, incoming] = items.as_slice() else {
        return;
    };
    let (Some(existing), Some(incoming)) = (record_from(existing), record_from(incoming)) else {
        return;
    };

    let (merged, changed) = existing.merge_with(&incoming);
    for path in &changed {
        assert_eq!(merged.field(&path.field), incoming.field(&path.field));
    }
    for (name, value) in existing.fields() {
        if !incoming.has_field(name) {
            assert_eq!(merged.field(name), Some(value));
        }
    }

    let (_, again) = merged.merge_with(&incoming);
    assert!(again.is_empty(), "Second merge should change nothing");
});
