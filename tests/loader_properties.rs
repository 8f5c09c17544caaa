mod common;

use common::{harness, FakeBackend};
use erp_gateway::CircuitBreakerConfig;
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

// Keys drawn from a small alphabet so repeats are common; "x*" ids never exist
fn keys_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(
        prop_oneof![
            (0u8..12).prop_map(|n| format!("p{n}")),
            (0u8..3).prop_map(|n| format!("x{n}")),
        ],
        1..40,
    )
}

fn products() -> Vec<serde_json::Value> {
    (0..12)
        .map(|n| json!({"id": format!("p{n}"), "sku": n}))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn each_distinct_key_is_fetched_once_and_order_is_kept(keys in keys_strategy()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let inventory = Arc::new(FakeBackend::new().entities("GetProductsByIds", products()));
            let h = harness(
                vec![("inventory", inventory.clone())],
                CircuitBreakerConfig::default(),
            );
            let loaders = h.runtime.request_loaders();

            let results = loaders.products().load_many(keys.clone()).await;
            prop_assert_eq!(results.len(), keys.len());

            for (key, result) in keys.iter().zip(&results) {
                match result {
                    Some(product) => prop_assert_eq!(product["id"].as_str(), Some(key.as_str())),
                    None => prop_assert!(key.starts_with('x')),
                }
            }

            let calls = inventory.calls_to("GetProductsByIds");
            prop_assert_eq!(calls.len(), 1);
            let distinct: BTreeSet<&String> = keys.iter().collect();
            let sent: Vec<&String> = calls[0].iter().collect();
            prop_assert_eq!(sent, distinct.into_iter().collect::<Vec<_>>());

            // a second pass in the same request is answered from the memo
            let again = loaders.products().load_many(keys.clone()).await;
            prop_assert_eq!(again, results);
            prop_assert_eq!(inventory.calls_to("GetProductsByIds").len(), 1);
            Ok(())
        })?;
    }
}
