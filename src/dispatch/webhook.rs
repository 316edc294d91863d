use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::{DispatchError, NotificationDispatcher, NotificationPayload, TemplateKind};

#[derive(Serialize)]
struct WebhookBody<'a> {
    recipient: &'a str,
    template: TemplateKind,
    payload: &'a NotificationPayload,
}

/// POSTs each notification as JSON to a rendering/delivery service.
///
/// Any non-2xx response is a rejection; the service decides presentation
/// from `template`.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
}

impl WebhookDispatcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookDispatcher {
    async fn send(
        &self,
        recipient: &str,
        template: TemplateKind,
        payload: &NotificationPayload,
    ) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookBody {
                recipient,
                template,
                payload,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout {
                        recipient: recipient.to_string(),
                    }
                } else {
                    DispatchError::Transport(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Rejected {
                recipient: recipient.to_string(),
                reason: format!("HTTP {status}: {}", body.trim()),
            });
        }

        tracing::debug!(recipient, template = template.as_str(), "webhook delivered");
        Ok(())
    }
}
