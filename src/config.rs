use crate::mode::AnalyticsMode;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub servicemap: ServicemapConfig,
    pub search: SearchConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub http_server: HttpServerConfig,
}

/// General settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServicemapConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Mode used when a request does not name one
    #[serde(default)]
    pub default_mode: AnalyticsMode,
}

impl Default for ServicemapConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            default_mode: AnalyticsMode::default(),
        }
    }
}

/// Search backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// Base URL of the default cluster, e.g. `http://localhost:9200`
    pub endpoint: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Environment variable holding the basic-auth user name (optional)
    #[serde(default)]
    pub username_env: Option<String>,
    /// Environment variable holding the basic-auth password (optional)
    #[serde(default)]
    pub password_env: Option<String>,
    /// Additional clusters addressed by data-source id
    #[serde(default)]
    pub data_sources: HashMap<String, String>,
    #[serde(default = "default_custom_span_indices")]
    pub custom_span_indices: String,
    #[serde(default = "default_custom_service_map_indices")]
    pub custom_service_map_indices: String,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
    #[serde(default = "default_max_edges")]
    pub max_edges: usize,
}

/// Chat proxy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_upstream_url")]
    pub upstream_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            upstream_url: default_chat_upstream_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_custom_span_indices() -> String {
    "otel-v1-apm-span-*".to_string()
}

fn default_custom_service_map_indices() -> String {
    "otel-v1-apm-service-map*".to_string()
}

fn default_max_nodes() -> usize {
    500
}

fn default_max_edges() -> usize {
    1000
}

fn default_chat_upstream_url() -> String {
    "http://localhost:5000/search".to_string()
}

fn default_http_host() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_allowed_origins() -> Vec<String> {
    vec![]
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in SERVICEMAP_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let config_path = std::env::var("SERVICEMAP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        Self::from_toml(&config_str)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(config_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(config_str).context("Failed to parse config.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        url::Url::parse(&self.search.endpoint)
            .with_context(|| format!("search.endpoint is not a valid URL: {}", self.search.endpoint))?;

        for (id, endpoint) in &self.search.data_sources {
            url::Url::parse(endpoint).with_context(|| {
                format!("search.data_sources.{} is not a valid URL: {}", id, endpoint)
            })?;
        }

        url::Url::parse(&self.chat.upstream_url).with_context(|| {
            format!("chat.upstream_url is not a valid URL: {}", self.chat.upstream_url)
        })?;

        // Credentials are read lazily, but a named variable must exist
        for env_name in [&self.search.username_env, &self.search.password_env]
            .into_iter()
            .flatten()
        {
            std::env::var(env_name).with_context(|| {
                format!(
                    "Environment variable {} not set. Set it in your .env file or as an environment variable.",
                    env_name
                )
            })?;
        }

        if self.search.timeout_secs == 0 {
            anyhow::bail!("search.timeout_secs must be greater than 0");
        }

        if self.chat.timeout_secs == 0 {
            anyhow::bail!("chat.timeout_secs must be greater than 0");
        }

        if self.search.max_nodes == 0 || self.search.max_edges == 0 {
            anyhow::bail!("search.max_nodes and search.max_edges must be greater than 0");
        }

        if self.http_server.port == 0 {
            anyhow::bail!("http_server.port cannot be 0");
        }

        Ok(())
    }
}
