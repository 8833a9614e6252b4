//! Service dependency graph: nodes discovered from the service map, edges
//! correlated through `resource:domain` composite keys, optional metrics.

mod builder;

pub use builder::{build_service_map, GraphSetter};

use crate::error::{Result, ServicemapError};
use crate::gateway::{Bucket, SearchResponse};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One service observed in trace data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceNode {
    pub service_name: String,
    /// Rendering key, `1..=N` in discovery order within one build
    pub id: u32,
    pub target_resources: Vec<String>,
    /// Services this node calls, in discovery order
    pub target_services: Vec<String>,
    /// Services calling this node, in discovery order
    pub dest_services: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput_per_minute: Option<f64>,
}

impl ServiceNode {
    fn new(service_name: String, id: u32, target_resources: Vec<String>) -> Self {
        Self {
            service_name,
            id,
            target_resources,
            target_services: Vec::new(),
            dest_services: Vec::new(),
            latency: None,
            error_rate: None,
            throughput: None,
            throughput_per_minute: None,
        }
    }
}

/// Service name → node. Built fresh per request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceGraph {
    nodes: BTreeMap<String, ServiceNode>,
}

/// Per-service metric values as read from a metrics bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceMetrics {
    pub latency: Option<f64>,
    pub error_rate: Option<f64>,
    pub doc_count: u64,
}

impl ServiceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create nodes from node-discovery buckets, ids assigned in bucket order.
    ///
    /// A repeated bucket key keeps its first node.
    pub fn from_node_buckets(buckets: &[Bucket]) -> Self {
        let mut graph = Self::new();
        let mut next_id: u32 = 1;
        for bucket in buckets {
            let name = bucket.key_str();
            if graph.nodes.contains_key(&name) {
                continue;
            }
            let mut resources: Vec<String> = Vec::new();
            for resource in bucket.sub_buckets("target_resource") {
                let key = resource.key_str();
                if !resources.contains(&key) {
                    resources.push(key);
                }
            }
            graph
                .nodes
                .insert(name.clone(), ServiceNode::new(name, next_id, resources));
            next_id = next_id.saturating_add(1);
        }
        graph
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, service_name: &str) -> Option<&ServiceNode> {
        self.nodes.get(service_name)
    }

    pub fn contains(&self, service_name: &str) -> bool {
        self.nodes.contains_key(service_name)
    }

    /// Nodes ordered by id (discovery order).
    pub fn nodes(&self) -> Vec<&ServiceNode> {
        let mut nodes: Vec<&ServiceNode> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// Service names in discovery order.
    pub fn service_names(&self) -> Vec<String> {
        self.nodes().into_iter().map(|n| n.service_name.clone()).collect()
    }

    /// Record that `caller` calls `callee`. Either end missing from the
    /// graph makes this a no-op; repeated links are ignored.
    pub fn link(&mut self, caller: &str, callee: &str) -> bool {
        if !self.nodes.contains_key(caller) || !self.nodes.contains_key(callee) {
            log::debug!("Dropping edge {} -> {}: unknown service", caller, callee);
            return false;
        }
        if let Some(node) = self.nodes.get_mut(caller) {
            if !node.target_services.iter().any(|s| s == callee) {
                node.target_services.push(callee.to_string());
            }
        }
        if let Some(node) = self.nodes.get_mut(callee) {
            if !node.dest_services.iter().any(|s| s == caller) {
                node.dest_services.push(caller.to_string());
            }
        }
        true
    }

    /// Resolve inbound edge buckets against the outbound lookup.
    ///
    /// Returns the number of composite keys that matched.
    pub fn resolve_edges(
        &mut self,
        inbound: &SearchResponse,
        outbound_lookup: &HashMap<String, String>,
    ) -> Result<usize> {
        let mut matched = 0;
        for service in edge_buckets(inbound)? {
            let callee = service.key_str();
            for (key, _) in composite_keys(service) {
                if let Some(caller) = outbound_lookup.get(&key) {
                    if self.link(caller, &callee) {
                        matched += 1;
                    }
                }
            }
        }
        Ok(matched)
    }

    /// Set metrics on a node; unknown services are ignored.
    pub fn apply_metrics(
        &mut self,
        service_name: &str,
        metrics: ServiceMetrics,
        minutes_in_range: Option<f64>,
    ) -> bool {
        let Some(node) = self.nodes.get_mut(service_name) else {
            log::debug!("Metrics for unknown service {}", service_name);
            return false;
        };
        node.latency = metrics.latency;
        node.error_rate = Some(
            metrics
                .error_rate
                .map(|rate| round_half_up(rate, 2))
                .filter(|rate| rate.is_finite())
                .unwrap_or(0.0),
        );
        node.throughput = Some(metrics.doc_count);
        if let Some(minutes) = minutes_in_range.filter(|m| *m > 0.0) {
            node.throughput_per_minute = Some(round_half_up(metrics.doc_count as f64 / minutes, 2));
        }
        true
    }
}

fn edge_buckets(response: &SearchResponse) -> Result<&[Bucket]> {
    response
        .buckets("service_name")
        .ok_or_else(|| ServicemapError::Parse("edge response has no service_name aggregation".into()))
}

/// `resource:domain` keys under one service bucket, with the service name.
fn composite_keys(service: &Bucket) -> Vec<(String, String)> {
    let owner = service.key_str();
    let mut keys = Vec::new();
    for resource in service.sub_buckets("resource") {
        for domain in resource.sub_buckets("domain") {
            keys.push((
                format!("{}:{}", resource.key_str(), domain.key_str()),
                owner.clone(),
            ));
        }
    }
    keys
}

/// Composite key → owning service, from an outbound edge response.
pub fn outbound_lookup(outbound: &SearchResponse) -> Result<HashMap<String, String>> {
    let mut lookup = HashMap::new();
    for service in edge_buckets(outbound)? {
        lookup.extend(composite_keys(service));
    }
    Ok(lookup)
}

/// Round to `places` decimals, halves toward positive infinity.
///
/// Shifts through the decimal exponent so values such as `1.005` round the
/// way they read.
pub fn round_half_up(value: f64, places: i32) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let shifted: f64 = format!("{}e{}", value, places).parse().unwrap_or(value * 10f64.powi(places));
    let rounded = (shifted + 0.5).floor();
    format!("{}e{}", rounded, -places)
        .parse()
        .unwrap_or(rounded / 10f64.powi(places))
}
