//! Fuzz test for the response normalizer
//!
//! Feeds arbitrary JSON documents through a fixed selection set to find:
//! - Panics on unexpected value shapes
//! - Dangling references inside a single batch
//!
//! Run with: cargo +nightly fuzz run normalize_fuzz -- -max_total_time=60

#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use strata_core::{CacheKey, CompiledField, IdFieldKeyResolver, Variables};
use strata_normalizer::Normalizer;

fn selection() -> Vec<CompiledField> {
    let node = vec![
        CompiledField::new("id"),
        CompiledField::new("name"),
        CompiledField::new("children")
            .with_selections(vec![CompiledField::new("id"), CompiledField::new("name")]),
    ];
    vec![
        CompiledField::new("node").with_selections(node.clone()),
        CompiledField::new("nodes").with_selections(node),
        CompiledField::new("count"),
    ]
}

fuzz_target!(|data: &[u8]| {
    let Ok(json) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    for normalizer in [
        Normalizer::default(),
        Normalizer::new(Arc::new(IdFieldKeyResolver::default())),
    ] {
        match normalizer.normalize(&CacheKey::root(), &json, &selection(), &Variables::new()) {
            Ok(batch) => {
                // The root record is always present
                assert!(batch.root_record().is_some(), "Batch should contain its root");

                // Every reference points at a record of the same batch
                for record in batch.records() {
                    for key in record.referenced_keys() {
                        assert!(batch.get(&key).is_some(), "Dangling reference to {}", key);
                    }
                }
            }
            Err(_) => {
                // Only non-object roots are rejected with this selection
                assert!(!json.is_object(), "Object roots should normalize");
            }
        }
    }
});
