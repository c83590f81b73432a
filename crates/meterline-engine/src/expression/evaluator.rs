//! Compiled formulas and quantity evaluation
//!
//! A formula is compiled once with `cel-interpreter`, its free identifiers
//! collected, and the result cached by exact text. Evaluation binds each
//! identifier from the event properties, defaulting absent ones to integer zero.

use cel_interpreter::{Context, Program as CelProgram, Value};
use dashmap::DashMap;
use meterline_common::{ExpressionError, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Number, Value as JsonValue};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Words that can never name an event property
pub const RESERVED_WORDS: &[&str] = &[
    "as", "break", "const", "continue", "else", "false", "for", "function", "if", "import", "in",
    "let", "loop", "package", "namespace", "null", "return", "true", "var", "void", "while",
    "__result__",
];

/// Deepest bracket nesting accepted in a formula
pub const MAX_NESTING: usize = 64;

pub fn is_reserved(word: &str) -> bool {
    RESERVED_WORDS.contains(&word)
}

/// Turns a formula and an event's properties into a billable quantity
pub trait QuantityEvaluator: Send + Sync {
    fn evaluate_quantity(
        &self,
        formula: &str,
        properties: &Map<String, JsonValue>,
    ) -> Result<Decimal>;
}

/// Compiled formula with its free identifiers
pub struct Program {
    source: String,
    program: CelProgram,
    identifiers: BTreeSet<String>,
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("source", &self.source)
            .field("identifiers", &self.identifiers)
            .finish()
    }
}

impl Program {
    /// Parse and check a formula
    pub fn compile(formula: &str) -> std::result::Result<Self, ExpressionError> {
        if formula.trim().is_empty() {
            return Err(ExpressionError::Empty);
        }
        check_nesting(formula)?;

        let program = CelProgram::compile(formula)
            .map_err(|e| ExpressionError::Parse(e.to_string()))?;
        let identifiers: BTreeSet<String> = program
            .references()
            .variables()
            .into_iter()
            .filter(|name| !is_reserved(name))
            .map(str::to_string)
            .collect();
        if identifiers.is_empty() {
            return Err(ExpressionError::NoIdentifiers);
        }

        Ok(Self {
            source: formula.to_string(),
            program,
            identifiers,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn identifiers(&self) -> &BTreeSet<String> {
        &self.identifiers
    }

    /// Evaluate against a property bag
    pub fn evaluate(
        &self,
        properties: &Map<String, JsonValue>,
    ) -> std::result::Result<Decimal, ExpressionError> {
        let mut context = Context::default();
        for name in &self.identifiers {
            bind(&mut context, name, properties.get(name))?;
        }
        let value = self
            .program
            .execute(&context)
            .map_err(|e| ExpressionError::Evaluation(e.to_string()))?;
        value_to_decimal(&value)
    }
}

/// Bind one identifier. Integers bind as signed so that literals mix freely
fn bind(
    context: &mut Context<'_>,
    name: &str,
    value: Option<&JsonValue>,
) -> std::result::Result<(), ExpressionError> {
    let bound = match value {
        None => context.add_variable(name, 0i64),
        Some(JsonValue::Number(n)) => match n.as_i64() {
            Some(i) => context.add_variable(name, i),
            None => match n.as_u64() {
                Some(u) => context.add_variable(name, u),
                None => context.add_variable(name, n.as_f64().unwrap_or(f64::NAN)),
            },
        },
        Some(other) => context.add_variable(name, other),
    };
    bound.map_err(|e| ExpressionError::Evaluation(format!("cannot bind {}: {}", name, e)))
}

/// Reject formulas nested deeper than [`MAX_NESTING`] before they reach the parser
fn check_nesting(formula: &str) -> std::result::Result<(), ExpressionError> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in formula.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' | '[' | '{' => {
                depth += 1;
                if depth > MAX_NESTING {
                    return Err(ExpressionError::Parse(format!(
                        "nesting deeper than {} levels",
                        MAX_NESTING
                    )));
                }
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

fn value_to_decimal(value: &Value) -> std::result::Result<Decimal, ExpressionError> {
    match value {
        Value::Int(i) => Ok(Decimal::from(*i)),
        Value::UInt(u) => Ok(Decimal::from(*u)),
        Value::Float(f) => float_to_decimal(*f),
        Value::Bool(_) => Err(ExpressionError::NonNumeric("bool".into())),
        Value::String(_) => Err(ExpressionError::NonNumeric("string".into())),
        Value::Null => Err(ExpressionError::NonNumeric("null".into())),
        Value::List(_) => Err(ExpressionError::NonNumeric("list".into())),
        Value::Map(_) => Err(ExpressionError::NonNumeric("map".into())),
        _ => Err(ExpressionError::NonNumeric("value".into())),
    }
}

fn float_to_decimal(f: f64) -> std::result::Result<Decimal, ExpressionError> {
    if !f.is_finite() {
        return Err(ExpressionError::Evaluation(format!(
            "result {} is not a finite number",
            f
        )));
    }
    Decimal::from_f64(f).ok_or_else(|| {
        ExpressionError::Evaluation(format!("result {} is out of decimal range", f))
    })
}

/// JSON number as a decimal
pub fn number_to_decimal(n: &Number) -> std::result::Result<Decimal, ExpressionError> {
    if let Some(i) = n.as_i64() {
        return Ok(Decimal::from(i));
    }
    if let Some(u) = n.as_u64() {
        return Ok(Decimal::from(u));
    }
    float_to_decimal(n.as_f64().unwrap_or(f64::NAN))
}

/// Evaluator with a process-wide cache of compiled formulas
#[derive(Debug, Default)]
pub struct ExpressionEvaluator {
    programs: DashMap<String, Arc<Program>>,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `formula`, reusing a cached program when one exists.
    /// Concurrent first compiles of the same text may both run; either result is kept.
    pub fn program(&self, formula: &str) -> Result<Arc<Program>> {
        if let Some(program) = self.programs.get(formula) {
            return Ok(Arc::clone(program.value()));
        }
        let program = Arc::new(Program::compile(formula)?);
        debug!(
            formula = %formula,
            identifiers = program.identifiers.len(),
            "Compiled formula"
        );
        self.programs
            .insert(formula.to_string(), Arc::clone(&program));
        Ok(program)
    }

    /// Number of cached programs
    pub fn cached_programs(&self) -> usize {
        self.programs.len()
    }
}

impl QuantityEvaluator for ExpressionEvaluator {
    #[instrument(skip(self, properties), level = "trace")]
    fn evaluate_quantity(
        &self,
        formula: &str,
        properties: &Map<String, JsonValue>,
    ) -> Result<Decimal> {
        let program = self.program(formula)?;
        Ok(program.evaluate(properties)?)
    }
}
