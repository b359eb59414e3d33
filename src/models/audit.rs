use chrono::{DateTime, Utc};
use serde::Serialize;

/// Admin action recorded by the audit sink.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub actor_id: String,
    /// Dotted action name, e.g. `deletion_request.create`.
    pub action: String,
    /// Identifier of the object the action applied to.
    pub target: String,
    pub fields: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        actor_id: &str,
        action: &str,
        target: impl Into<String>,
        fields: serde_json::Value,
    ) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            action: action.to_string(),
            target: target.into(),
            fields,
            occurred_at: Utc::now(),
        }
    }
}
