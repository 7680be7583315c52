//! HTTP client for the external webhook.
//!
//! Posts `{"to","content"}` to the configured URL under the outbound
//! guard: the call first waits for a rate-limiter token (bounded by the
//! request timeout), then runs inside the webhook circuit breaker.
//! Responses are parsed leniently; a 2xx body that is not the expected
//! JSON still counts as success, just without a webhook-assigned id.

use std::{sync::Arc, time::Duration};

use courier_core::{
    error::{CourierError, Result},
    guard::{CircuitBreaker, RateLimiter},
    ports::{PortFuture, WebhookClient, WebhookResponse},
};

/// Reqwest-based implementation of [`WebhookClient`].
pub struct HttpWebhookClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
}

impl HttpWebhookClient {
    /// Creates a client for the given webhook URL.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::Configuration` when the underlying HTTP
    /// client cannot be built.
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                CourierError::configuration(format!("failed to build webhook client: {e}"))
            })?;

        Ok(Self { client, url: url.into(), timeout, limiter, breaker })
    }

    async fn dispatch(&self, content: &str, to: &str) -> Result<WebhookResponse> {
        // The limiter wait is bounded by the same deadline as the request
        // itself, so a saturated bucket surfaces as a retryable error
        // instead of an unbounded stall.
        tokio::time::timeout(self.timeout, self.limiter.acquire())
            .await
            .map_err(|_| CourierError::rate_limited("timed out waiting for a send slot"))?;

        self.breaker.call(self.post(content, to)).await
    }

    async fn post(&self, content: &str, to: &str) -> Result<WebhookResponse> {
        let body = serde_json::json!({ "to": to, "content": content });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CourierError::timeout(self.timeout.as_secs())
                } else if e.is_connect() {
                    CourierError::network(format!("connection failed: {e}"))
                } else {
                    CourierError::network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() >= 400 {
            tracing::warn!(status = status.as_u16(), url = %self.url, "webhook rejected message");
            return Err(CourierError::webhook_status(status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CourierError::network(format!("failed to read response body: {e}")))?;

        Ok(serde_json::from_slice(&bytes).unwrap_or_default())
    }
}

impl WebhookClient for HttpWebhookClient {
    fn send(&self, content: &str, to: &str) -> PortFuture<'_, WebhookResponse> {
        let content = content.to_string();
        let to = to.to_string();
        Box::pin(async move { self.dispatch(&content, &to).await })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use courier_core::guard::CircuitConfig;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn guarded_client(url: String) -> HttpWebhookClient {
        HttpWebhookClient::new(
            url,
            Duration::from_secs(5),
            Arc::new(RateLimiter::new(50.0, 100)),
            Arc::new(CircuitBreaker::new("webhook-client", CircuitConfig::default())),
        )
        .expect("client builds")
    }

    #[tokio::test]
    async fn successful_send_returns_webhook_id() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/webhook"))
            .and(matchers::body_json(serde_json::json!({
                "to": "+90111111111",
                "content": "hi"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": "ok",
                "messageId": "WH1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = guarded_client(format!("{}/webhook", server.uri()));
        let response = client.send("hi", "+90111111111").await.unwrap();

        assert_eq!(response.message, "ok");
        assert_eq!(response.message_id.as_deref(), Some("WH1"));
    }

    #[tokio::test]
    async fn unparseable_success_body_yields_empty_response() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("accepted, thanks"))
            .mount(&server)
            .await;

        let client = guarded_client(format!("{}/webhook", server.uri()));
        let response = client.send("hi", "+90111111111").await.unwrap();

        assert_eq!(response.message_id, None);
    }

    #[tokio::test]
    async fn server_error_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = guarded_client(format!("{}/webhook", server.uri()));
        let error = client.send("hi", "+90111111111").await.unwrap_err();

        assert!(matches!(error, CourierError::WebhookStatus { status: 500 }));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn client_error_also_counts_as_webhook_failure() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = guarded_client(format!("{}/webhook", server.uri()));
        let error = client.send("hi", "+90111111111").await.unwrap_err();

        assert!(matches!(error, CourierError::WebhookStatus { status: 404 }));
    }

    #[tokio::test]
    async fn breaker_short_circuits_after_repeated_failures() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = guarded_client(format!("{}/webhook", server.uri()));

        // Six attempts against a continuously failing webhook; the breaker
        // trips once the window has three observations at full failure.
        for _ in 0..6 {
            let _ = client.send("hi", "+90111111111").await;
        }

        let start = Instant::now();
        let error = client.send("hi", "+90111111111").await.unwrap_err();

        assert!(matches!(error, CourierError::CircuitOpen { .. }));
        assert!(start.elapsed() < Duration::from_millis(5));

        // The webhook itself only ever saw the pre-trip calls.
        let hits = server.received_requests().await.unwrap().len();
        assert_eq!(hits, 3);
    }

    #[tokio::test]
    async fn connection_failure_maps_to_network_error() {
        // Nothing listens on this port.
        let client = guarded_client("http://127.0.0.1:9/webhook".to_string());
        let error = client.send("hi", "+90111111111").await.unwrap_err();

        assert!(matches!(error, CourierError::Network { .. }));
        assert!(error.is_retryable());
    }
}
