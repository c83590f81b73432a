//! Named query fragments with their own positional arguments
//!
//! Each fragment owns its SQL text and the arguments for the `?` placeholders
//! in that text. [`QueryFragment::bind`] writes the placeholder and records the
//! argument in one step, so text and arguments cannot drift apart.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;

/// Positional query argument
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Str(String),
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl SqlArg {
    /// Argument as text, for assertions and logging
    pub fn as_text(&self) -> String {
        match self {
            SqlArg::Str(s) => s.clone(),
            SqlArg::Int(i) => i.to_string(),
            SqlArg::UInt(u) => u.to_string(),
            SqlArg::Float(f) => f.to_string(),
        }
    }
}

impl From<&str> for SqlArg {
    fn from(s: &str) -> Self {
        SqlArg::Str(s.to_string())
    }
}

impl From<String> for SqlArg {
    fn from(s: String) -> Self {
        SqlArg::Str(s)
    }
}

impl From<&String> for SqlArg {
    fn from(s: &String) -> Self {
        SqlArg::Str(s.clone())
    }
}

impl From<i64> for SqlArg {
    fn from(i: i64) -> Self {
        SqlArg::Int(i)
    }
}

impl From<u64> for SqlArg {
    fn from(u: u64) -> Self {
        SqlArg::UInt(u)
    }
}

impl From<u32> for SqlArg {
    fn from(u: u32) -> Self {
        SqlArg::UInt(u as u64)
    }
}

impl From<f64> for SqlArg {
    fn from(f: f64) -> Self {
        SqlArg::Float(f)
    }
}

/// Millisecond-precision UTC text accepted by `toDateTime64(?, 3, 'UTC')`
pub fn timestamp_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replacen('T', " ", 1)
        .trim_end_matches('Z')
        .to_string()
}

/// One named piece of a query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFragment {
    pub name: String,
    pub sql: String,
    pub args: Vec<SqlArg>,
}

impl QueryFragment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: String::new(),
            args: Vec::new(),
        }
    }

    /// Append trusted SQL text (never caller data)
    pub fn sql(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    /// Append a `?` placeholder bound to `arg`
    pub fn bind(&mut self, arg: impl Into<SqlArg>) -> &mut Self {
        self.sql.push('?');
        self.args.push(arg.into());
        self
    }

    /// Append `?, ?, ...` bound to every item
    pub fn bind_list<I, A>(&mut self, items: I) -> &mut Self
    where
        I: IntoIterator<Item = A>,
        A: Into<SqlArg>,
    {
        for (i, item) in items.into_iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.bind(item);
        }
        self
    }

    /// Append a bound DateTime64(3) literal
    pub fn bind_timestamp(&mut self, ts: DateTime<Utc>) -> &mut Self {
        self.sql.push_str("toDateTime64(");
        self.bind(timestamp_text(ts));
        self.sql.push_str(", 3, 'UTC')");
        self
    }

    /// Append `column = ?` for one value or `column IN (?, ...)` for several
    pub fn bind_in(&mut self, column_sql: &str, values: &[String]) -> &mut Self {
        self.sql.push_str(column_sql);
        if values.len() == 1 {
            self.sql.push_str(" = ");
            self.bind(&values[0]);
        } else {
            self.sql.push_str(" IN (");
            self.bind_list(values);
            self.sql.push(')');
        }
        self
    }

    /// Append another fragment's text and arguments
    pub fn extend(&mut self, other: &QueryFragment) -> &mut Self {
        self.sql.push_str(&other.sql);
        self.args.extend(other.args.iter().cloned());
        self
    }

    pub fn placeholder_count(&self) -> usize {
        self.sql.matches('?').count()
    }
}

/// Final query text with its order-matched arguments
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub args: Vec<SqlArg>,
}

impl BuiltQuery {
    pub fn placeholder_count(&self) -> usize {
        self.sql.matches('?').count()
    }
}

impl From<QueryFragment> for BuiltQuery {
    fn from(fragment: QueryFragment) -> Self {
        Self {
            sql: fragment.sql,
            args: fragment.args,
        }
    }
}

/// Property value as a string, empty when absent or not a string
pub fn string_property_sql(q: &mut QueryFragment, property: &str) {
    q.sql("JSONExtractString(properties, ").bind(property).sql(")");
}

/// Property value as Float64; throws on missing or non-numeric values
pub fn numeric_property_sql(q: &mut QueryFragment, property: &str) {
    q.sql("toFloat64(trim(BOTH '\"' FROM JSONExtractRaw(properties, ")
        .bind(property)
        .sql(")))");
}

/// Raw JSON text of a property, empty when absent
pub fn raw_property_sql(q: &mut QueryFragment, property: &str) {
    q.sql("JSONExtractRaw(properties, ").bind(property).sql(")");
}

/// ` AND JSONExtractString(properties, ?) IN (...)` for every filter, in key order
pub fn property_filters_sql(q: &mut QueryFragment, filters: &BTreeMap<String, Vec<String>>) {
    for (property, values) in filters {
        q.sql(" AND ");
        property_condition_sql(q, property, values);
    }
}

/// `JSONExtractString(properties, ?) = ?` or `... IN (?, ...)`
pub fn property_condition_sql(q: &mut QueryFragment, property: &str, values: &[String]) {
    string_property_sql(q, property);
    q.bind_in("", values);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bind_keeps_text_and_args_aligned() {
        let mut q = QueryFragment::new("base");
        q.sql("SELECT 1 WHERE a = ").bind("x").sql(" AND b IN (").bind_list([1i64, 2, 3]).sql(")");
        assert_eq!(q.sql, "SELECT 1 WHERE a = ? AND b IN (?, ?, ?)");
        assert_eq!(q.args.len(), q.placeholder_count());
        assert_eq!(q.args[0], SqlArg::Str("x".into()));
    }

    #[test]
    fn test_single_and_multi_value_conditions() {
        let mut single = QueryFragment::default();
        property_condition_sql(&mut single, "model", &["gpt-4".to_string()]);
        assert_eq!(single.sql, "JSONExtractString(properties, ?) = ?");

        let mut multi = QueryFragment::default();
        property_condition_sql(&mut multi, "region", &["us".to_string(), "eu".to_string()]);
        assert_eq!(multi.sql, "JSONExtractString(properties, ?) IN (?, ?)");
        assert_eq!(
            multi.args,
            vec![
                SqlArg::Str("region".into()),
                SqlArg::Str("us".into()),
                SqlArg::Str("eu".into())
            ]
        );
    }

    #[test]
    fn test_timestamp_text() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(timestamp_text(ts), "2024-03-01 12:30:05.000");

        let mut q = QueryFragment::default();
        q.bind_timestamp(ts);
        assert_eq!(q.sql, "toDateTime64(?, 3, 'UTC')");
    }

    #[test]
    fn test_extend_concatenates_in_order() {
        let mut a = QueryFragment::new("a");
        a.sql("x = ").bind(1i64);
        let mut b = QueryFragment::new("b");
        b.sql(" AND y = ").bind(2i64);
        a.extend(&b);
        assert_eq!(a.sql, "x = ? AND y = ?");
        assert_eq!(a.args, vec![SqlArg::Int(1), SqlArg::Int(2)]);
    }
}
