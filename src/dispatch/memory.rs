use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{DispatchError, NotificationDispatcher, NotificationPayload, TemplateKind};

/// A notification captured by [`MemoryDispatcher`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub recipient: String,
    pub template: TemplateKind,
    pub payload: NotificationPayload,
}

/// Keeps delivered notifications in memory. Recipients registered with
/// [`MemoryDispatcher::fail_for`] are rejected instead.
#[derive(Debug, Clone, Default)]
pub struct MemoryDispatcher {
    sent: Arc<Mutex<Vec<SentNotification>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl MemoryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, recipient: impl Into<String>) {
        self.failing
            .lock()
            .expect("dispatcher lock poisoned")
            .insert(recipient.into());
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().expect("dispatcher lock poisoned").clone()
    }

    pub fn sent_to(&self, recipient: &str) -> Vec<SentNotification> {
        self.sent()
            .into_iter()
            .filter(|n| n.recipient == recipient)
            .collect()
    }
}

#[async_trait]
impl NotificationDispatcher for MemoryDispatcher {
    async fn send(
        &self,
        recipient: &str,
        template: TemplateKind,
        payload: &NotificationPayload,
    ) -> Result<(), DispatchError> {
        if self
            .failing
            .lock()
            .expect("dispatcher lock poisoned")
            .contains(recipient)
        {
            return Err(DispatchError::Rejected {
                recipient: recipient.to_string(),
                reason: "recipient marked as failing".to_string(),
            });
        }

        self.sent
            .lock()
            .expect("dispatcher lock poisoned")
            .push(SentNotification {
                recipient: recipient.to_string(),
                template,
                payload: payload.clone(),
            });
        Ok(())
    }
}
