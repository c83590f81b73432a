//! Formula evaluation
//!
//! Billable quantities are computed from event properties with CEL formulas
//! compiled by `cel-interpreter`. [`ExpressionEvaluator`] caches compiled
//! programs and sits behind the [`QuantityEvaluator`] seam.

pub mod evaluator;

pub use evaluator::{
    is_reserved, number_to_decimal, ExpressionEvaluator, Program, QuantityEvaluator,
    MAX_NESTING, RESERVED_WORDS,
};
