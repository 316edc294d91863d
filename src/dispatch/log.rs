use async_trait::async_trait;

use super::{DispatchError, NotificationDispatcher, NotificationPayload, TemplateKind};

/// Writes each notification as a tracing event. Used when no delivery
/// channel is configured.
#[derive(Debug, Clone, Default)]
pub struct TracingDispatcher;

#[async_trait]
impl NotificationDispatcher for TracingDispatcher {
    async fn send(
        &self,
        recipient: &str,
        template: TemplateKind,
        payload: &NotificationPayload,
    ) -> Result<(), DispatchError> {
        let body = serde_json::to_string(payload).unwrap_or_else(|e| format!("<{e}>"));
        tracing::info!(
            recipient,
            template = template.as_str(),
            payload = %body,
            "notification"
        );
        Ok(())
    }
}
