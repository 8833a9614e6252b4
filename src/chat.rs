//! Log-analysis chat proxy: forwards a question about a log row to an
//! external assistant and relays its answer.

use crate::config::ChatConfig;
use crate::error::{Result, ServicemapError};
use chrono::{SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Request body contract accepted by the chat route.
pub const CHAT_CONTRACT_VERSION: u32 = 2;

/// Chat request (contract v2): the selected log row and the user's question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatMessageRequest {
    #[serde(default)]
    pub log: String,
    pub query: String,
}

impl ChatMessageRequest {
    /// Parse a request body, rejecting other contract shapes.
    pub fn from_body(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| {
            ServicemapError::InvalidInput(format!(
                "Expected chat contract v{} body {{\"log\": string, \"query\": string}}: {}",
                CHAT_CONTRACT_VERSION, e
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageResponse {
    pub response: String,
    pub timestamp: String,
}

#[derive(Serialize)]
struct UpstreamRequest<'a> {
    query: &'a str,
    log: &'a str,
}

/// Pick the reply text out of an upstream payload.
///
/// Order: `response.response`, then `result`, then the whole payload.
pub fn extract_reply(data: &Value) -> String {
    let candidates = [data.pointer("/response/response"), data.get("result")];
    for candidate in candidates.into_iter().flatten() {
        match candidate {
            Value::String(s) if !s.is_empty() => return s.clone(),
            Value::Null | Value::Bool(false) | Value::String(_) => {}
            other => return other.to_string(),
        }
    }
    data.to_string()
}

/// HTTP client for the chat upstream
pub struct ChatClient {
    client: Client,
    upstream_url: String,
}

impl ChatClient {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServicemapError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            upstream_url: config.upstream_url.clone(),
        })
    }

    /// Forward one message
    ///
    /// Upstream non-success statuses are returned as [`ServicemapError::Chat`]
    /// with that status; network and parse failures use 500.
    pub async fn send(&self, request: &ChatMessageRequest) -> Result<ChatMessageResponse> {
        let response = self
            .client
            .post(&self.upstream_url)
            .header("Content-Type", "application/json")
            .json(&UpstreamRequest {
                query: &request.query,
                log: &request.log,
            })
            .send()
            .await
            .map_err(|e| ServicemapError::Chat {
                status: 500,
                message: format!("Network error: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServicemapError::Chat {
                status: status.as_u16(),
                message: format!("External API responded with status: {}", status.as_u16()),
            });
        }

        let data: Value = response.json().await.map_err(|e| ServicemapError::Chat {
            status: 500,
            message: format!("Failed to parse upstream response: {}", e),
        })?;

        Ok(ChatMessageResponse {
            response: extract_reply(&data),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }
}
