//! Property tests for the stock ledger: stock never goes negative and the
//! stored quantity always equals the replay of its transactions.

mod common;

use common::{TestApp, CLERK};
use proptest::prelude::*;
use supplyroom_api::{
    entities::TransactionType,
    errors::ServiceError,
    services::ledger::{self, StockMovement},
};

fn delta_strategy() -> impl Strategy<Value = i32> {
    (-30i32..30).prop_filter("non-zero delta", |d| *d != 0)
}

fn movement(supply_id: i32, delta: i32) -> StockMovement {
    StockMovement {
        supply_id,
        delta,
        transaction_type: if delta < 0 {
            TransactionType::Out
        } else {
            TransactionType::In
        },
        reason: "property test".to_string(),
        reference: None,
        performed_by: CLERK,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn stock_never_negative_and_replay_matches(
        opening in 0i32..50,
        deltas in prop::collection::vec(delta_strategy(), 1..20),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let app = TestApp::new().await;
            let supply = app.consumable("Batteries", opening, 0).await;
            let mut expected = opening;

            for delta in deltas {
                let result = ledger::apply_delta(app.db(), movement(supply.id, delta)).await;
                if expected + delta < 0 {
                    assert!(matches!(result, Err(ServiceError::InsufficientStock(_))));
                } else {
                    let entry = result.expect("movement within stock");
                    assert_eq!(entry.previous_quantity, expected);
                    assert_eq!(entry.new_quantity, expected + delta);
                    expected += delta;
                }
                assert_eq!(app.stock(supply.id).await, expected);
            }

            let audit = app.services().ledger.verify(supply.id).await.expect("audit");
            assert!(audit.consistent);
            assert_eq!(audit.replayed, i64::from(expected));
        });
    }
}
