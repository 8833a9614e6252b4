//! Last-request-wins rebuilds of the service map.
//!
//! Rebuilds are grouped by a scope key (a client session, or the mode and
//! data source). Each rebuild takes the next generation of its scope and its
//! graph becomes the scope's latest only if no newer rebuild of the same
//! scope started in the meantime. Scopes never supersede each other.

use crate::analytics::TraceAnalytics;
use crate::dsl::Dsl;
use crate::graph::{build_service_map, ServiceGraph};
use crate::mode::AnalyticsMode;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Slot {
    generation: u64,
    latest: Option<Arc<ServiceGraph>>,
}

/// Owns the most recently published graph per scope.
#[derive(Clone, Default)]
pub struct MapRefresher {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

/// Handle for one in-flight rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    scope: String,
    generation: u64,
}

impl Ticket {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Outcome of a rebuild. Both variants carry the graph the rebuild produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Refresh {
    Published(Arc<ServiceGraph>),
    /// A newer rebuild of the same scope started before this one finished
    Superseded(Arc<ServiceGraph>),
}

impl Refresh {
    pub fn graph(&self) -> &Arc<ServiceGraph> {
        match self {
            Refresh::Published(graph) | Refresh::Superseded(graph) => graph,
        }
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, Refresh::Superseded(_))
    }
}

/// Scope key for a request: the session when the caller names one,
/// otherwise the mode and data source.
pub fn scope_key(session: Option<&str>, mode: AnalyticsMode, data_source_id: Option<&str>) -> String {
    match session.filter(|s| !s.is_empty()) {
        Some(session) => format!("session:{}", session),
        None => format!("{}|{}", mode, data_source_id.unwrap_or("")),
    }
}

impl MapRefresher {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start a rebuild in `scope`.
    pub fn begin(&self, scope: &str) -> Ticket {
        let mut slots = self.slots();
        let slot = slots.entry(scope.to_string()).or_default();
        slot.generation += 1;
        Ticket {
            scope: scope.to_string(),
            generation: slot.generation,
        }
    }

    pub fn is_current(&self, ticket: &Ticket) -> bool {
        self.slots()
            .get(&ticket.scope)
            .is_some_and(|slot| slot.generation == ticket.generation)
    }

    /// Publish `graph` as the scope's latest if `ticket` is still the newest.
    pub fn publish(&self, ticket: &Ticket, graph: ServiceGraph) -> Refresh {
        let graph = Arc::new(graph);
        let mut slots = self.slots();
        match slots.get_mut(&ticket.scope) {
            Some(slot) if slot.generation == ticket.generation => {
                slot.latest = Some(Arc::clone(&graph));
                Refresh::Published(graph)
            }
            _ => {
                log::debug!(
                    "Not publishing service map for {}: generation {} superseded",
                    ticket.scope,
                    ticket.generation
                );
                Refresh::Superseded(graph)
            }
        }
    }

    pub fn latest(&self, scope: &str) -> Option<Arc<ServiceGraph>> {
        self.slots().get(scope).and_then(|slot| slot.latest.clone())
    }

    /// Rebuild the graph and publish it unless superseded.
    pub async fn refresh(
        &self,
        scope: &str,
        ctx: &TraceAnalytics,
        dsl: &Dsl,
        mode: AnalyticsMode,
        data_source_id: Option<&str>,
        include_metrics: bool,
    ) -> Refresh {
        let ticket = self.begin(scope);
        let graph = build_service_map(ctx, dsl, mode, data_source_id, include_metrics, None).await;
        self.publish(&ticket, graph)
    }
}
