use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use relay_core::event::Recommendation;

use crate::models::UpstreamRequest;
use crate::{AiError, RecommendClient};

/// Pre-programmed responses for deterministic testing without a live upstream.
pub enum MockResponse {
    /// Return these recommendations.
    Ok(Vec<Recommendation>),
    /// Fail the call.
    Error(AiError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// Convenience: a single-item successful response.
    pub fn one(name: &str, reason: &str) -> Self {
        Self::Ok(vec![Recommendation {
            check_item_name: name.to_string(),
            reason: reason.to_string(),
            cautions: String::new(),
        }])
    }

    /// Convenience: wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock client that returns pre-programmed responses in sequence.
pub struct MockRecommendClient {
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
}

impl MockRecommendClient {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RecommendClient for MockRecommendClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn recommend(&self, _request: &UpstreamRequest) -> Result<Vec<Recommendation>, AiError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        let Some(response) = self.responses.get(idx) else {
            return Err(AiError::InvalidResponse(format!(
                "no mock response configured for call {idx}"
            )));
        };

        let mut current = response;
        loop {
            match current {
                MockResponse::Ok(recs) => return Ok(recs.clone()),
                MockResponse::Error(e) => return Err(e.clone()),
                MockResponse::Delay(duration, inner) => {
                    tokio::time::sleep(*duration).await;
                    current = inner;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> UpstreamRequest {
        UpstreamRequest {
            session_id: "ADM42".into(),
            patient_id: "P001".into(),
            doctor_id: "D1001".into(),
            department: "CARD".into(),
            source: "lip".into(),
            patient_sex: "F".into(),
            patient_age: "54".into(),
            abstract_history: String::new(),
            clinic_info: String::new(),
            recommend_count: 3,
            diagnose_name: String::new(),
        }
    }

    #[tokio::test]
    async fn sequential_responses() {
        let mock = MockRecommendClient::new(vec![
            MockResponse::one("Chest CT", "first"),
            MockResponse::one("ECG", "second"),
        ]);

        let first = mock.recommend(&request()).await.unwrap();
        assert_eq!(first[0].check_item_name, "Chest CT");
        assert_eq!(mock.call_count(), 1);

        let second = mock.recommend(&request()).await.unwrap();
        assert_eq!(second[0].check_item_name, "ECG");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_responses_error() {
        let mock = MockRecommendClient::new(vec![MockResponse::one("only", "one")]);
        let _ = mock.recommend(&request()).await;
        assert!(mock.recommend(&request()).await.is_err());
    }

    #[tokio::test]
    async fn error_response() {
        let mock = MockRecommendClient::new(vec![MockResponse::Error(AiError::Http {
            status: 503,
            body: "unavailable".into(),
        })]);
        match mock.recommend(&request()).await {
            Err(AiError::Http { status: 503, .. }) => {}
            other => panic!("expected HTTP 503, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_response_waits() {
        let mock = MockRecommendClient::new(vec![MockResponse::delayed(
            Duration::from_secs(5),
            MockResponse::one("Chest CT", "after delay"),
        )]);

        let req = request();
        let call = mock.recommend(&req);
        let result = tokio::time::timeout(Duration::from_secs(10), call).await;
        let recs = result.unwrap().unwrap();
        assert_eq!(recs[0].check_item_name, "Chest CT");
    }
}
