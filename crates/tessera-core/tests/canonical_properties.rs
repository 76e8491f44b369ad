//! Canonical JSON property tests
//!
//! The canonical form is an interop contract: hashes and signatures are
//! computed over it on every homeserver. These properties pin down the
//! two load-bearing guarantees: serialization is a fixpoint (re-parsing
//! and re-serializing changes nothing), and key order never leaks from
//! the input.

use proptest::prelude::*;
use serde_json::{json, Value};
use tessera_core::canonical::{to_canonical_string, MAX_CANONICAL_INT};

/// Strategy for JSON values restricted to the canonical-legal subset.
fn arbitrary_canonical_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-MAX_CANONICAL_INT..=MAX_CANONICAL_INT).prop_map(|i| json!(i)),
        "[a-zA-Z0-9 _\\-\"\\\\]{0,12}".prop_map(Value::String),
    ];

    leaf.prop_recursive(3, 24, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

proptest! {
    #[test]
    fn canonical_is_a_fixpoint(value in arbitrary_canonical_value()) {
        let once = to_canonical_string(&value).unwrap();
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        let twice = to_canonical_string(&reparsed).unwrap();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn object_keys_emitted_sorted(value in arbitrary_canonical_value()) {
        let canonical = to_canonical_string(&value).unwrap();
        let reparsed: Value = serde_json::from_str(&canonical).unwrap();
        check_sorted(&reparsed);

        fn check_sorted(value: &Value) {
            match value {
                Value::Object(map) => {
                    let keys: Vec<&String> = map.keys().collect();
                    let mut sorted = keys.clone();
                    sorted.sort();
                    assert_eq!(keys, sorted);
                    map.values().for_each(check_sorted);
                }
                Value::Array(items) => items.iter().for_each(check_sorted),
                _ => {}
            }
        }
    }

    #[test]
    fn floats_never_serialize(float in any::<f64>().prop_filter("finite non-integer", |f| f.is_finite() && f.fract() != 0.0)) {
        let value = json!({ "n": float });
        prop_assert!(to_canonical_string(&value).is_err());
    }
}
