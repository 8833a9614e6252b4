use crate::config::SearchConfig;
use crate::error::{Result, ServicemapError};
use crate::gateway::{SearchGateway, SearchResponse};
use crate::mode::AnalyticsMode;
use crate::query::SearchRequest;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Search gateway over the OpenSearch `_search` REST endpoint
///
/// Each data-source id maps to its own cluster endpoint; requests without
/// one go to the default endpoint.
pub struct HttpSearchGateway {
    client: Client,
    config: SearchConfig,
    credentials: Option<(String, String)>,
}

impl HttpSearchGateway {
    /// Create a new gateway from search configuration
    ///
    /// Basic-auth credentials are read from the environment variables named
    /// in the configuration, when both are set.
    pub fn new(config: SearchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServicemapError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let credentials = match (&config.username_env, &config.password_env) {
            (Some(user_env), Some(pass_env)) => {
                let user = std::env::var(user_env).map_err(|_| {
                    ServicemapError::Config(format!("Environment variable {} not set", user_env))
                })?;
                let pass = std::env::var(pass_env).map_err(|_| {
                    ServicemapError::Config(format!("Environment variable {} not set", pass_env))
                })?;
                Some((user, pass))
            }
            _ => None,
        };

        Ok(Self {
            client,
            config,
            credentials,
        })
    }

    /// Resolve the `_search` URL for an index pattern and data source
    fn search_url(&self, index: &str, data_source_id: Option<&str>) -> Result<url::Url> {
        let base = match data_source_id.filter(|id| !id.is_empty()) {
            Some(id) => self.config.data_sources.get(id).ok_or_else(|| {
                ServicemapError::Gateway(format!("Unknown data source: {}", id))
            })?,
            None => &self.config.endpoint,
        };

        let mut url = url::Url::parse(base)
            .map_err(|e| ServicemapError::Config(format!("Invalid endpoint {}: {}", base, e)))?;
        url.path_segments_mut()
            .map_err(|_| ServicemapError::Config(format!("Endpoint cannot be a base: {}", base)))?
            .pop_if_empty()
            .push(index)
            .push("_search");
        Ok(url)
    }
}

#[async_trait]
impl SearchGateway for HttpSearchGateway {
    async fn search(
        &self,
        request: &SearchRequest,
        mode: AnalyticsMode,
        data_source_id: Option<&str>,
    ) -> Result<SearchResponse> {
        let index = mode.index_pattern(request.target, &self.config);
        let url = self.search_url(&index, data_source_id)?;
        let start = std::time::Instant::now();

        let mut builder = self
            .client
            .post(url.clone())
            .header("Content-Type", "application/json")
            .json(&request.body);
        if let Some((user, pass)) = &self.credentials {
            builder = builder.basic_auth(user, Some(pass));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ServicemapError::Gateway(format!("Network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(ServicemapError::Gateway(format!(
                "Search backend error {}: {}",
                status, body
            )));
        }

        let result: SearchResponse = response
            .json()
            .await
            .map_err(|e| ServicemapError::Parse(format!("Failed to parse search response: {}", e)))?;

        log::debug!("Search on {} ({}) took {:?}", index, mode, start.elapsed());
        Ok(result)
    }
}
