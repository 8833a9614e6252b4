//! Per-service time series for the trend plots.

use crate::analytics::TraceAnalytics;
use crate::dsl::Dsl;
use crate::error::{Result, ServicemapError};
use crate::gateway::{Bucket, SearchResponse};
use crate::mode::AnalyticsMode;
use crate::query::service_trends_query;
use chrono::{TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

const PLOT_DATE_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

/// x = bucket start (epoch ms), y = value, labels = interval text per point.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrendSeries {
    pub x: Vec<i64>,
    pub y: Vec<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceTrend {
    pub latency_trend: TrendSeries,
    pub throughput: TrendSeries,
    pub error_rate: TrendSeries,
}

pub type ServiceTrends = BTreeMap<String, ServiceTrend>;

/// Parse a fixed interval such as `30s`, `5m` or `1d` into milliseconds.
pub fn parse_fixed_interval(interval: &str) -> Result<i64> {
    let split = interval
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ServicemapError::InvalidInput(format!("Interval has no unit: {}", interval)))?;
    let (amount, unit) = interval.split_at(split);
    let amount: i64 = amount
        .parse()
        .map_err(|_| ServicemapError::InvalidInput(format!("Invalid interval: {}", interval)))?;
    let unit_ms = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => {
            return Err(ServicemapError::InvalidInput(format!(
                "Unsupported interval unit: {}",
                interval
            )))
        }
    };
    match amount.checked_mul(unit_ms) {
        Some(0) => Err(ServicemapError::InvalidInput(format!(
            "Interval must be positive: {}",
            interval
        ))),
        Some(ms) => Ok(ms),
        None => Err(ServicemapError::InvalidInput(format!("Interval too large: {}", interval))),
    }
}

fn format_ms(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format(PLOT_DATE_FORMAT).to_string())
        .unwrap_or_default()
}

fn trend_from_bucket(service: &Bucket, interval_ms: i64) -> ServiceTrend {
    let mut trend = ServiceTrend::default();
    for time_bucket in service.sub_buckets("time_buckets") {
        let Some(start) = time_bucket.key_i64() else {
            continue;
        };
        let end = start.checked_add(interval_ms).map(format_ms).unwrap_or_default();
        let label = format!("{} - {}", format_ms(start), end);

        trend.latency_trend.x.push(start);
        trend
            .latency_trend
            .y
            .push(time_bucket.value("average_latency").unwrap_or(0.0));

        trend.throughput.x.push(start);
        trend
            .throughput
            .y
            .push(time_bucket.value("trace_count").unwrap_or(0.0));
        trend.throughput.labels.push(label.clone());

        trend.error_rate.x.push(start);
        trend
            .error_rate
            .y
            .push(time_bucket.value("error_rate").unwrap_or(0.0));
        trend.error_rate.labels.push(label);
    }
    trend
}

/// Shape a trends response into per-service series.
pub fn parse_service_trends(response: &SearchResponse, interval_ms: i64) -> Result<ServiceTrends> {
    let services = response
        .buckets("service_trends")
        .ok_or_else(|| ServicemapError::Parse("trends response has no service_trends aggregation".into()))?;
    Ok(services
        .iter()
        .map(|service| (service.key_str(), trend_from_bucket(service, interval_ms)))
        .collect())
}

/// Latency, throughput and error-rate series per service. Failures are
/// reported as "Failed to retrieve service trends" and yield no series.
pub async fn service_trends(
    ctx: &TraceAnalytics,
    dsl: &Dsl,
    mode: AnalyticsMode,
    fixed_interval: &str,
    data_source_id: Option<&str>,
) -> ServiceTrends {
    let result: Result<ServiceTrends> = async {
        let interval_ms = parse_fixed_interval(fixed_interval)?;
        let request = service_trends_query(mode, dsl, fixed_interval, &ctx.limits);
        let response = ctx.gateway.search(&request, mode, data_source_id).await?;
        parse_service_trends(&response, interval_ms)
    }
    .await;

    result.unwrap_or_else(|e| {
        log::error!("Error in service_trends: {}", e);
        ctx.notifier.notify_error("Failed to retrieve service trends", &e);
        ServiceTrends::new()
    })
}
