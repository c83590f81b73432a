//! Filter-group usage query
//!
//! Assembles one query as an ordered chain of CTEs:
//!
//! ```text
//! base_events -> filter_matches -> matched_events -> best_matches -> final
//! ```
//!
//! `base_events` collapses duplicate rows and applies the tenant, window,
//! customer and property filters. The matching stages tag every event with a
//! tuple per filter group and keep the best match by
//! `(condition_count, group_id)`. The final stage aggregates per group.

use super::fragment::{
    numeric_property_sql, property_condition_sql, property_filters_sql, raw_property_sql,
    BuiltQuery, QueryFragment,
};
use super::PROCESSED_EVENTS_TABLE;
use meterline_common::{
    validate_filters, AggregationType, FilterGroup, MeteringError, RequestContext, Result,
    UsageParams,
};
use std::collections::BTreeMap;

/// Builder for the grouped best-match usage query
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    base: Option<QueryFragment>,
    base_filters: BTreeMap<String, Vec<String>>,
    groups: Vec<FilterGroup>,
    aggregation: Option<(AggregationType, Option<String>)>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope to the request tenant and the params' window, event name,
    /// customers and property filters; collapse duplicates to the latest version.
    pub fn with_base_filters(mut self, ctx: &RequestContext, params: &UsageParams) -> Self {
        let mut q = QueryFragment::new("base_events");
        q.sql("SELECT id, timestamp, properties FROM (SELECT id, timestamp, properties, sign FROM ")
            .sql(PROCESSED_EVENTS_TABLE)
            .sql(" WHERE tenant_id = ")
            .bind(&ctx.tenant_id)
            .sql(" AND environment_id = ")
            .bind(&ctx.environment_id)
            .sql(" AND event_name = ")
            .bind(&params.event_name)
            .sql(" AND timestamp >= ")
            .bind_timestamp(params.start_time)
            .sql(" AND timestamp < ")
            .bind_timestamp(params.end_time);
        if let Some(external_customer_id) = &params.external_customer_id {
            q.sql(" AND external_customer_id = ").bind(external_customer_id);
        }
        if let Some(customer_id) = &params.customer_id {
            q.sql(" AND customer_id = ").bind(customer_id);
        }
        q.sql(" ORDER BY tenant_id, environment_id, timestamp, id, version DESC")
            .sql(" LIMIT 1 BY tenant_id, environment_id, timestamp, id)")
            .sql(" WHERE sign = 1");
        property_filters_sql(&mut q, &params.filters);

        self.base = Some(q);
        self.base_filters = params.filters.clone();
        self
    }

    /// Resolve every event to its best matching group. Without groups every
    /// event lands in one bucket with an empty id.
    pub fn with_filter_groups(mut self, groups: &[FilterGroup]) -> Self {
        self.groups = groups.to_vec();
        self
    }

    /// Terminal aggregate per group
    pub fn with_aggregation(
        mut self,
        aggregation_type: AggregationType,
        property: Option<&str>,
    ) -> Self {
        self.aggregation = Some((aggregation_type, property.map(str::to_string)));
        self
    }

    /// Ordered fragments; CTEs first, the final select last.
    /// Filters with a blank property or no values are rejected here.
    pub fn fragments(&self) -> Result<Vec<QueryFragment>> {
        validate_filters(&self.base_filters)?;
        for group in &self.groups {
            group.validate()?;
        }
        let base = self.base.clone().ok_or_else(|| {
            MeteringError::Validation("base filters are required to build a usage query".into())
        })?;
        let (aggregation_type, property) = self.aggregation.as_ref().ok_or_else(|| {
            MeteringError::Validation("aggregation is required to build a usage query".into())
        })?;

        let mut fragments = vec![base];
        if self.groups.is_empty() {
            let mut best = QueryFragment::new("best_matches");
            best.sql("SELECT id, timestamp, properties, '' AS best_match_group FROM base_events");
            fragments.push(best);
        } else {
            fragments.push(self.filter_matches());
            fragments.push(matched_events());
            fragments.push(best_matches());
        }
        fragments.push(final_select(*aggregation_type, property.as_deref())?);
        Ok(fragments)
    }

    /// Query text and its positional arguments, in fragment order
    pub fn build(&self) -> Result<BuiltQuery> {
        let fragments = self.fragments()?;
        let (ctes, last) = fragments.split_at(fragments.len() - 1);

        let mut out = QueryFragment::new("query");
        for (i, cte) in ctes.iter().enumerate() {
            out.sql(if i == 0 { "WITH " } else { ",\n" })
                .sql(&cte.name)
                .sql(" AS (\n    ")
                .extend(cte)
                .sql("\n)");
        }
        out.sql("\n").extend(&last[0]);
        Ok(out.into())
    }

    fn filter_matches(&self) -> QueryFragment {
        let mut q = QueryFragment::new("filter_matches");
        q.sql("SELECT id, timestamp, properties, [");
        for (i, group) in self.groups.iter().enumerate() {
            if i > 0 {
                q.sql(", ");
            }
            q.sql("tuple(")
                .bind(&group.id)
                .sql(", toUInt32(")
                .bind(group.condition_count() as u64)
                .sql("), toUInt8(");
            if group.filters.is_empty() {
                q.sql("1");
            } else {
                for (j, (property, values)) in group.filters.iter().enumerate() {
                    if j > 0 {
                        q.sql(" AND ");
                    }
                    property_condition_sql(&mut q, property, values);
                }
            }
            q.sql("))");
        }
        q.sql("] AS group_matches FROM base_events");
        q
    }
}

fn matched_events() -> QueryFragment {
    let mut q = QueryFragment::new("matched_events");
    q.sql(
        "SELECT id, timestamp, properties, group_match.1 AS group_id, \
         group_match.2 AS condition_count \
         FROM filter_matches ARRAY JOIN group_matches AS group_match \
         WHERE group_match.3 = 1",
    );
    q
}

fn best_matches() -> QueryFragment {
    let mut q = QueryFragment::new("best_matches");
    q.sql(
        "SELECT id, timestamp, properties, \
         argMax(group_id, (condition_count, group_id)) AS best_match_group \
         FROM matched_events GROUP BY id, timestamp, properties",
    );
    q
}

fn final_select(aggregation_type: AggregationType, property: Option<&str>) -> Result<QueryFragment> {
    let mut q = QueryFragment::new("final");
    q.sql("SELECT best_match_group AS filter_group_id, ");
    aggregate_sql(&mut q, aggregation_type, property)?;
    q.sql(" AS value FROM best_matches GROUP BY best_match_group ORDER BY best_match_group");
    Ok(q)
}

/// Aggregate over `properties`, always as Float64
fn aggregate_sql(
    q: &mut QueryFragment,
    aggregation_type: AggregationType,
    property: Option<&str>,
) -> Result<()> {
    let required_property = || {
        property.filter(|p| !p.is_empty()).ok_or_else(|| {
            MeteringError::Validation(format!(
                "property is required for {} aggregation",
                aggregation_type
            ))
        })
    };
    match aggregation_type {
        AggregationType::Count => {
            q.sql("toFloat64(count())");
        }
        AggregationType::Sum => {
            q.sql("sum(");
            numeric_property_sql(q, required_property()?);
            q.sql(")");
        }
        AggregationType::Avg => {
            q.sql("avg(");
            numeric_property_sql(q, required_property()?);
            q.sql(")");
        }
        AggregationType::CountUnique => {
            q.sql("toFloat64(count(DISTINCT ");
            raw_property_sql(q, required_property()?);
            q.sql("))");
        }
        AggregationType::Latest => {
            q.sql("argMax(");
            numeric_property_sql(q, required_property()?);
            q.sql(", timestamp)");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::fragment::SqlArg;
    use chrono::{TimeZone, Utc};

    const INJECTION: &str = "'; DROP TABLE events; --";

    fn ctx() -> RequestContext {
        RequestContext::new("tenant_1", "env_1")
    }

    fn params() -> UsageParams {
        UsageParams::new(
            "image_generated",
            AggregationType::Count,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_build_requires_base_and_aggregation() {
        assert!(QueryBuilder::new()
            .with_aggregation(AggregationType::Count, None)
            .build()
            .is_err());
        assert!(QueryBuilder::new()
            .with_base_filters(&ctx(), &params())
            .build()
            .is_err());
    }

    #[test]
    fn test_fragment_order() {
        let builder = QueryBuilder::new()
            .with_base_filters(&ctx(), &params())
            .with_filter_groups(&[FilterGroup::new("g1", 1).with_filter("size", ["512"])])
            .with_aggregation(AggregationType::Count, None);
        let names: Vec<String> = builder
            .fragments()
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(
            names,
            vec!["base_events", "filter_matches", "matched_events", "best_matches", "final"]
        );

        let query = builder.build().unwrap();
        assert!(query.sql.starts_with("WITH base_events AS ("));
        assert!(query.sql.contains("argMax(group_id, (condition_count, group_id))"));
        assert!(!query.sql.contains("priority"));
        assert!(query.sql.contains("LIMIT 1 BY tenant_id, environment_id, timestamp, id"));
        assert!(query.sql.ends_with("ORDER BY best_match_group"));
        assert_eq!(query.args.len(), query.placeholder_count());
    }

    #[test]
    fn test_arguments_follow_fragment_order() {
        let query = QueryBuilder::new()
            .with_base_filters(&ctx(), &params().with_external_customer("cust_9"))
            .with_filter_groups(&[FilterGroup::new("g1", 3).with_filter("size", ["512"])])
            .with_aggregation(AggregationType::Sum, Some("tokens"))
            .build()
            .unwrap();
        let args: Vec<String> = query.args.iter().map(SqlArg::as_text).collect();
        assert_eq!(
            args,
            vec![
                "tenant_1",
                "env_1",
                "image_generated",
                "2024-01-01 00:00:00.000",
                "2024-02-01 00:00:00.000",
                "cust_9",
                "g1",
                "1",
                "size",
                "512",
                "tokens",
            ]
        );
    }

    #[test]
    fn test_empty_filters_only_scope_conditions() {
        let query = QueryBuilder::new()
            .with_base_filters(&ctx(), &params())
            .with_aggregation(AggregationType::Count, None)
            .build()
            .unwrap();
        assert!(!query.sql.contains("JSONExtract"));
        assert!(query.sql.contains("'' AS best_match_group"));
        assert_eq!(query.args.len(), 5);
    }

    #[test]
    fn test_universal_group_matches_unconditionally() {
        let query = QueryBuilder::new()
            .with_base_filters(&ctx(), &params())
            .with_filter_groups(&[FilterGroup::new("default", 0)])
            .with_aggregation(AggregationType::Count, None)
            .build()
            .unwrap();
        assert!(query.sql.contains("toUInt8(1)"));
    }

    #[test]
    fn test_values_never_inlined() {
        let long_value = "x".repeat(10_000);
        let query = QueryBuilder::new()
            .with_base_filters(
                &ctx(),
                &params()
                    .with_external_customer(INJECTION)
                    .with_filter(INJECTION, [INJECTION, long_value.as_str()]),
            )
            .with_filter_groups(&[
                FilterGroup::new(INJECTION, 1).with_filter(INJECTION, [INJECTION]),
            ])
            .with_aggregation(AggregationType::CountUnique, Some(INJECTION))
            .build()
            .unwrap();

        assert!(!query.sql.contains(INJECTION));
        assert!(!query.sql.contains("DROP TABLE"));
        assert!(!query.sql.contains(&long_value));
        assert!(query.args.iter().any(|a| a.as_text() == INJECTION));
        assert_eq!(query.args.len(), query.placeholder_count());
    }

    #[test]
    fn test_empty_value_lists_are_rejected() {
        let empty: [&str; 0] = [];
        let in_group = QueryBuilder::new()
            .with_base_filters(&ctx(), &params())
            .with_filter_groups(&[FilterGroup::new("g1", 1).with_filter("size", empty)])
            .with_aggregation(AggregationType::Count, None)
            .build();
        assert!(matches!(in_group, Err(MeteringError::Validation(_))));

        let in_base = QueryBuilder::new()
            .with_base_filters(&ctx(), &params().with_filter("model", empty))
            .with_aggregation(AggregationType::Count, None)
            .build();
        assert!(matches!(in_base, Err(MeteringError::Validation(_))));
    }

    #[test]
    fn test_property_required_for_sum() {
        let result = QueryBuilder::new()
            .with_base_filters(&ctx(), &params())
            .with_aggregation(AggregationType::Sum, None)
            .build();
        assert!(matches!(result, Err(MeteringError::Validation(_))));
    }
}
