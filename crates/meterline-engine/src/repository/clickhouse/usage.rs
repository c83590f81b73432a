//! Usage reads on ClickHouse

use super::rows::{from_seconds, CountRow, FloatRow, GroupValueRow, WindowCountRow, WindowFloatRow};
use super::ClickHouseStore;
use crate::query::{aggregator_for, BuiltQuery, QueryBuilder};
use crate::repository::{decimal_from_f64, UsageRepository};
use async_trait::async_trait;
use meterline_common::{
    AggregationResult, FilterGroupUsage, RequestContext, Result, UsageParams, UsageWindow,
    UsageWithFiltersParams,
};
use rust_decimal::Decimal;
use tracing::{debug, instrument};

impl ClickHouseStore {
    /// Whole-window aggregate, decoded by the aggregate's result type
    async fn scalar_usage(&self, ctx: &RequestContext, query: &BuiltQuery, integer: bool) -> Result<Decimal> {
        let hint = "Failed to query usage";
        if integer {
            let row = ctx
                .run("get_usage", self.fetch_first::<CountRow>(query, hint))
                .await?;
            Ok(row.map(|r| Decimal::from(r.value)).unwrap_or(Decimal::ZERO))
        } else {
            let row = ctx
                .run("get_usage", self.fetch_first::<FloatRow>(query, hint))
                .await?;
            row.map(|r| decimal_from_f64(r.value))
                .unwrap_or(Ok(Decimal::ZERO))
        }
    }

    async fn windowed_usage(&self, ctx: &RequestContext, query: &BuiltQuery, integer: bool) -> Result<Vec<UsageWindow>> {
        let hint = "Failed to query windowed usage";
        if integer {
            let rows = ctx
                .run("get_usage", self.fetch_rows::<WindowCountRow>(query, hint))
                .await?;
            rows.into_iter()
                .map(|r| {
                    Ok(UsageWindow {
                        window_start: from_seconds(r.window_start)?,
                        value: Decimal::from(r.value),
                    })
                })
                .collect()
        } else {
            let rows = ctx
                .run("get_usage", self.fetch_rows::<WindowFloatRow>(query, hint))
                .await?;
            rows.into_iter()
                .map(|r| {
                    Ok(UsageWindow {
                        window_start: from_seconds(r.window_start)?,
                        value: decimal_from_f64(r.value)?,
                    })
                })
                .collect()
        }
    }
}

#[async_trait]
impl UsageRepository for ClickHouseStore {
    #[instrument(skip(self, ctx, params), fields(event_name = %params.event_name, aggregation = %params.aggregation_type))]
    async fn get_usage(&self, ctx: &RequestContext, params: &UsageParams) -> Result<AggregationResult> {
        ctx.validate()?;
        let ctx = self.bounded(ctx);
        let aggregator = aggregator_for(params.aggregation_type);
        let integer = params.aggregation_type.is_integer_result();

        let total_params = UsageParams {
            window_size: None,
            ..params.clone()
        };
        let value = self
            .scalar_usage(&ctx, &aggregator.build_query(&ctx, &total_params)?, integer)
            .await?;

        let results = match params.window_size {
            Some(_) => {
                self.windowed_usage(&ctx, &aggregator.build_query(&ctx, params)?, integer)
                    .await?
            }
            None => Vec::new(),
        };
        debug!(value = %value, windows = results.len(), "Usage aggregated");

        Ok(AggregationResult {
            value,
            results,
            event_name: params.event_name.clone(),
            aggregation_type: params.aggregation_type,
        })
    }

    #[instrument(skip(self, ctx, params), fields(event_name = %params.usage.event_name, groups = params.filter_groups.len()))]
    async fn get_usage_with_filters(
        &self,
        ctx: &RequestContext,
        params: &UsageWithFiltersParams,
    ) -> Result<Vec<FilterGroupUsage>> {
        ctx.validate()?;
        params.validate()?;
        let ctx = self.bounded(ctx);
        let query = QueryBuilder::new()
            .with_base_filters(&ctx, &params.usage)
            .with_filter_groups(&params.filter_groups)
            .with_aggregation(params.usage.aggregation_type, params.usage.property_name.as_deref())
            .build()?;

        let rows = ctx
            .run(
                "get_usage_with_filters",
                self.fetch_rows::<GroupValueRow>(&query, "Failed to query usage by filter group"),
            )
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(FilterGroupUsage {
                    filter_group_id: r.filter_group_id,
                    value: decimal_from_f64(r.value)?,
                })
            })
            .collect()
    }
}
