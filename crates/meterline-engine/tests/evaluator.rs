//! Quantity evaluation through the public seam

use meterline_common::MeteringError;
use meterline_engine::{ExpressionEvaluator, QuantityEvaluator};
use rust_decimal_macros::dec;
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn props(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

#[test]
fn test_product_of_properties() {
    let evaluator = ExpressionEvaluator::new();
    let quantity = evaluator
        .evaluate_quantity(
            "token*duration*pixel",
            &props(json!({"token": 10, "duration": 3, "pixel": 100})),
        )
        .unwrap();
    assert_eq!(quantity, dec!(3000));
}

#[test]
fn test_missing_property_defaults_to_zero() {
    let evaluator = ExpressionEvaluator::new();
    let quantity = evaluator
        .evaluate_quantity("a+b", &props(json!({"a": 10})))
        .unwrap();
    assert_eq!(quantity, dec!(10));
}

#[test]
fn test_empty_and_truncated_formulas_fail() {
    let evaluator = ExpressionEvaluator::new();
    let properties = props(json!({"a": 1, "b": 2}));
    for formula in ["", "   ", "a+b+"] {
        let err = evaluator.evaluate_quantity(formula, &properties).unwrap_err();
        assert!(err.is_validation(), "{:?} for {:?}", err, formula);
        assert!(matches!(err, MeteringError::Expression(_)));
    }
}

#[test]
fn test_compiled_programs_are_shared() {
    let evaluator = ExpressionEvaluator::new();
    let properties = props(json!({"gb": 1.5, "hours": 2}));
    for _ in 0..3 {
        assert_eq!(
            evaluator.evaluate_quantity("gb * hours", &properties).unwrap(),
            dec!(3)
        );
    }
    assert_eq!(evaluator.cached_programs(), 1);
}

#[tokio::test]
async fn test_concurrent_evaluation() {
    let evaluator: Arc<dyn QuantityEvaluator> = Arc::new(ExpressionEvaluator::new());
    let handles: Vec<_> = (0..8i64)
        .map(|i| {
            let evaluator = evaluator.clone();
            tokio::spawn(async move {
                evaluator
                    .evaluate_quantity("n * 2", &props(json!({ "n": i })))
                    .unwrap()
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), rust_decimal::Decimal::from(i as i64 * 2));
    }
}
