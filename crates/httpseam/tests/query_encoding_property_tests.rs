//! Property-based tests for URL parameter encoding

use httpseam::request::query_string;
use proptest::prelude::*;
use serde_json::{Map, Value};

/// Property: every pair decodes to the original key and value, and pairs come
/// out in key order.
#[test]
fn prop_query_pairs_decode_in_key_order() {
    proptest!(|(entries in prop::collection::btree_map("[a-z]{1,8}", any::<String>(), 0..12))| {
        let parameters: Map<String, Value> = entries
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();

        let query = query_string(&parameters);
        let pairs: Vec<(String, String)> = if query.is_empty() {
            Vec::new()
        } else {
            query
                .split('&')
                .map(|pair| {
                    let (key, value) = pair.split_once('=').expect("key=value");
                    (
                        urlencoding::decode(key).unwrap().into_owned(),
                        urlencoding::decode(value).unwrap().into_owned(),
                    )
                })
                .collect()
        };

        let expected: Vec<(String, String)> = entries.into_iter().collect();
        prop_assert_eq!(pairs, expected);
    });
}

/// Property: encoded components never contain raw delimiters.
#[test]
fn prop_query_components_are_escaped() {
    proptest!(|(key in "[a-z]{1,6}", value in any::<String>())| {
        let mut parameters = Map::new();
        parameters.insert(key, Value::String(value));

        let query = query_string(&parameters);
        prop_assert_eq!(query.matches('=').count(), 1);
        prop_assert!(!query.contains('&'));
        prop_assert!(!query.contains(' '));
        prop_assert!(!query.contains('#'));
    });
}
