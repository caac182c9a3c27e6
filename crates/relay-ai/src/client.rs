use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument, warn};

use relay_core::event::Recommendation;

use crate::models::{self, UpstreamRequest};
use crate::{AiError, RecommendClient};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the recommendation upstream. The overall request deadline
/// is enforced by the orchestrator; this client only bounds connection setup.
pub struct HttpRecommendClient {
    client: Client,
    url: String,
}

impl HttpRecommendClient {
    pub fn new(base_url: &str, endpoint: &str) -> Result<Self, AiError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AiError::Network(e.to_string()))?;
        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), endpoint),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RecommendClient for HttpRecommendClient {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, request), fields(patient_id = %request.patient_id, session_id = %request.session_id))]
    async fn recommend(&self, request: &UpstreamRequest) -> Result<Vec<Recommendation>, AiError> {
        let resp = self
            .client
            .post(&self.url)
            .header("accept", "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| AiError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "upstream returned error status");
            return Err(AiError::Http {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let body = resp
            .text()
            .await
            .map_err(|e| AiError::Network(e.to_string()))?;

        // Some deployments answer with a plain JSON envelope instead of an
        // event stream, typically on validation failure or degraded mode.
        let recommendations = if content_type.contains("application/json")
            && !content_type.contains("text/event-stream")
        {
            let json: serde_json::Value = serde_json::from_str(&body)
                .map_err(|e| AiError::InvalidResponse(e.to_string()))?;
            if let Some(code) = json.get("code").and_then(serde_json::Value::as_i64) {
                if code != 0 {
                    let message = json
                        .get("message")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("upstream rejected request");
                    return Err(AiError::InvalidResponse(message.to_string()));
                }
            }
            models::extract_recommendations(&json)
        } else {
            models::parse_event_stream(&body)
        };

        debug!(count = recommendations.len(), "upstream call complete");
        Ok(recommendations)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_base_and_endpoint() {
        let client = HttpRecommendClient::new("http://ai.example:9000/", "/v1/recommend").unwrap();
        assert_eq!(client.url(), "http://ai.example:9000/v1/recommend");
    }

    #[test]
    fn retryable_classification() {
        assert!(AiError::Network("reset".into()).is_retryable());
        assert!(AiError::Http { status: 503, body: String::new() }.is_retryable());
        assert!(AiError::Http { status: 429, body: String::new() }.is_retryable());
        assert!(!AiError::Http { status: 400, body: String::new() }.is_retryable());
        assert!(!AiError::InvalidResponse("bad shape".into()).is_retryable());
    }

    #[test]
    fn truncate_caps_long_bodies() {
        let long = "x".repeat(600);
        assert_eq!(truncate(&long, 500).len(), 500);
        assert_eq!(truncate("short", 500), "short");
    }
}
