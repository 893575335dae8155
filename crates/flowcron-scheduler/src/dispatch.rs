//! Notification dispatch — HTTP webhook delivery.

use async_trait::async_trait;

use flowcron_core::config::NotifyConfig;
use flowcron_core::error::{FlowError, Result};
use flowcron_core::traits::{NotificationEvent, NotificationSink};

/// Generic HTTP webhook — POST with JSON body.
pub struct WebhookSink {
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: &str, headers: Vec<(String, String)>) -> Self {
        Self {
            url: url.to_string(),
            headers,
            client: reqwest::Client::new(),
        }
    }

    /// Sink for `[notify] webhook_url`, if one is configured.
    pub fn from_config(config: &NotifyConfig) -> Option<Self> {
        (!config.webhook_url.is_empty())
            .then(|| Self::new(&config.webhook_url, config.headers.clone()))
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, event: &NotificationEvent) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "schedule_id": event.schedule_id,
                "workflow_id": event.workflow_id,
                "log_id": event.log_id,
                "status": event.status,
                "message": event.message,
                "timestamp": event.timestamp.to_rfc3339(),
            }))
            .timeout(std::time::Duration::from_secs(10));

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| FlowError::Http(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Webhook notification sent to {}: {}", self.url, event.schedule_id);
            Ok(())
        } else {
            Err(FlowError::Http(format!("Webhook error {}", resp.status())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_posts_event_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-token", "abc"))
            .and(body_partial_json(serde_json::json!({"schedule_id": "s1", "status": "timeout"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookSink::new(&format!("{}/hook", server.uri()), vec![("x-token".into(), "abc".into())]);
        let event = NotificationEvent::new("s1", "wf", "log-1", "timeout", "Timed out after 5s");
        sink.notify(&event).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_success_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink = WebhookSink::new(&server.uri(), vec![]);
        let event = NotificationEvent::new("s1", "wf", "log-1", "failed", "boom");
        assert!(matches!(sink.notify(&event).await, Err(FlowError::Http(_))));
    }

    #[test]
    fn test_from_config_requires_url() {
        assert!(WebhookSink::from_config(&NotifyConfig::default()).is_none());
        let config = NotifyConfig { webhook_url: "http://localhost/x".into(), ..Default::default() };
        assert!(WebhookSink::from_config(&config).is_some());
    }
}
