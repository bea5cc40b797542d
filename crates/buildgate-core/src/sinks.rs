use crate::error::CoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Audit record handed to the audit sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub user_id: Option<String>,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub previous_data: Option<Value>,
    pub new_data: Option<Value>,
    pub metadata: Option<Value>,
}

impl AuditRecord {
    pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            user_id: None,
            action: action.into(),
            resource: resource.into(),
            resource_id: None,
            previous_data: None,
            new_data: None,
            metadata: None,
        }
    }

    pub fn by(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn on(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_change(mut self, previous: Option<Value>, new: Option<Value>) -> Self {
        self.previous_data = previous;
        self.new_data = new;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), CoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), CoreError>;
}

/// Best-effort audit front-end. Sink failures are logged and never reach the caller.
#[derive(Clone)]
pub struct AuditTrail {
    sink: Arc<dyn AuditSink>,
}

impl AuditTrail {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub async fn emit(&self, record: AuditRecord) {
        let action = record.action.clone();
        let resource_id = record.resource_id.clone().unwrap_or_default();
        if let Err(err) = self.sink.record(record).await {
            warn!(
                action = %action,
                resource_id = %resource_id,
                error = %err,
                "audit sink failed; continuing"
            );
        }
    }
}

/// Best-effort notification front-end.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub async fn send(
        &self,
        user_id: &str,
        kind: &str,
        title: impl Into<String>,
        message: impl Into<String>,
    ) {
        let notification = Notification {
            user_id: user_id.to_string(),
            kind: kind.to_string(),
            title: title.into(),
            message: message.into(),
        };
        if let Err(err) = self.sink.notify(notification).await {
            warn!(user_id = %user_id, kind = %kind, error = %err, "notification failed; continuing");
        }
    }
}

/// Writes audit records to the tracing log.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), CoreError> {
        info!(
            target: "buildgate::audit",
            action = %record.action,
            resource = %record.resource,
            resource_id = record.resource_id.as_deref().unwrap_or("-"),
            user_id = record.user_id.as_deref().unwrap_or("-"),
            "audit"
        );
        Ok(())
    }
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default, Clone)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, notification: Notification) -> Result<(), CoreError> {
        info!(
            target: "buildgate::notify",
            user_id = %notification.user_id,
            kind = %notification.kind,
            title = %notification.title,
            "notification"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn record(&self, _record: AuditRecord) -> Result<(), CoreError> {
            Err(CoreError::Storage("audit store offline".to_string()))
        }
    }

    #[async_trait]
    impl NotificationSink for BrokenSink {
        async fn notify(&self, _notification: Notification) -> Result<(), CoreError> {
            Err(CoreError::collaborator("mailer", "smtp refused"))
        }
    }

    #[tokio::test]
    async fn failing_sinks_are_swallowed() {
        let trail = AuditTrail::new(Arc::new(BrokenSink));
        trail
            .emit(AuditRecord::new("ESCROW_RELEASE_REQUESTED", "escrow_transaction").on("t1"))
            .await;

        let notifier = Notifier::new(Arc::new(BrokenSink));
        notifier.send("u1", "ESCROW", "title", "message").await;
    }

    #[test]
    fn audit_record_builder_sets_optional_fields() {
        let record = AuditRecord::new("APPROVE", "escrow_transaction")
            .by("u1")
            .on("t1")
            .with_metadata(serde_json::json!({"amount_cents": 100}));
        assert_eq!(record.user_id.as_deref(), Some("u1"));
        assert_eq!(record.resource_id.as_deref(), Some("t1"));
        assert!(record.previous_data.is_none());
    }
}
