//! Search gateway: executes aggregation queries against the search backend.

pub mod http;

pub use http::HttpSearchGateway;

use crate::error::Result;
use crate::mode::AnalyticsMode;
use crate::query::SearchRequest;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// Executes one structured query and returns the parsed aggregations.
#[async_trait]
pub trait SearchGateway: Send + Sync {
    async fn search(
        &self,
        request: &SearchRequest,
        mode: AnalyticsMode,
        data_source_id: Option<&str>,
    ) -> Result<SearchResponse>;
}

/// Search response; only aggregations are read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub aggregations: HashMap<String, Aggregation>,
}

impl SearchResponse {
    /// Buckets of a top-level aggregation, `None` when it is missing.
    pub fn buckets(&self, name: &str) -> Option<&[Bucket]> {
        self.aggregations.get(name).map(|agg| agg.buckets.as_slice())
    }
}

/// A bucket or metric aggregation result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Aggregation {
    #[serde(default)]
    pub buckets: Vec<Bucket>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub doc_count: Option<u64>,
}

/// Sub-aggregation slot of a bucket; anything that is not an object
/// (e.g. `key_as_string`) is kept raw.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BucketField {
    Aggregation(Aggregation),
    Other(Value),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bucket {
    pub key: Value,
    #[serde(default)]
    pub doc_count: u64,
    #[serde(flatten)]
    pub fields: HashMap<String, BucketField>,
}

impl Bucket {
    /// Key rendered as a string (terms keys are strings, histogram keys numbers).
    pub fn key_str(&self) -> String {
        match &self.key {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn key_i64(&self) -> Option<i64> {
        self.key.as_i64().or_else(|| self.key.as_f64().map(|f| f as i64))
    }

    pub fn sub(&self, name: &str) -> Option<&Aggregation> {
        match self.fields.get(name) {
            Some(BucketField::Aggregation(agg)) => Some(agg),
            _ => None,
        }
    }

    /// Nested buckets of a sub-aggregation; empty when it is absent.
    pub fn sub_buckets(&self, name: &str) -> &[Bucket] {
        self.sub(name).map(|agg| agg.buckets.as_slice()).unwrap_or(&[])
    }

    /// `<name>.value` of a metric sub-aggregation.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.sub(name).and_then(|agg| agg.value)
    }
}
