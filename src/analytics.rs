use crate::gateway::SearchGateway;
use crate::notify::{LogNotifier, Notifier};
use crate::query::QueryLimits;
use std::sync::Arc;

/// Handles every trace-analytics operation needs, passed explicitly.
#[derive(Clone)]
pub struct TraceAnalytics {
    pub gateway: Arc<dyn SearchGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub limits: QueryLimits,
}

impl TraceAnalytics {
    pub fn new(gateway: Arc<dyn SearchGateway>) -> Self {
        Self {
            gateway,
            notifier: Arc::new(LogNotifier),
            limits: QueryLimits::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_limits(mut self, limits: QueryLimits) -> Self {
        self.limits = limits;
        self
    }
}
