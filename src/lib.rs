pub mod analytics;
pub mod chat;
pub mod config;
pub mod dsl;
pub mod error;
pub mod gateway;
pub mod graph;
pub mod mode;
pub mod notify;
pub mod query;
pub mod refresh;
pub mod server;
pub mod services;

pub use analytics::TraceAnalytics;
pub use config::Config;
pub use dsl::Dsl;
pub use error::{Result, ServicemapError};
pub use graph::{build_service_map, ServiceGraph, ServiceNode};
pub use mode::AnalyticsMode;
