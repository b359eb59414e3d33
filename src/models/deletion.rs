use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of protected resource a deletion request targets.
#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum ResourceKind {
    Environment,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Environment => "environment",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource targeted for deletion, together with the project that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub id: String,
    pub project_id: String,
}

impl Resource {
    pub fn environment(project_id: impl Into<String>, environment_id: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Environment,
            id: environment_id.into(),
            project_id: project_id.into(),
        }
    }

    /// The caller scope that owns this resource.
    pub fn scope(&self) -> Scope {
        Scope {
            project_id: self.project_id.clone(),
            environment_id: self.id.clone(),
        }
    }
}

/// The project/environment an authenticated caller is acting within.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub project_id: String,
    pub environment_id: String,
}

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum DeletionState {
    Pending,
    Approved,
    Executed,
    Expired,
    Rejected,
}

impl DeletionState {
    /// Terminal states are reached once and never left.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeletionState::Executed | DeletionState::Expired | DeletionState::Rejected
        )
    }

    /// Legal forward transitions of the request state machine.
    pub fn can_transition_to(&self, next: DeletionState) -> bool {
        matches!(
            (self, next),
            (DeletionState::Pending, DeletionState::Approved)
                | (DeletionState::Pending, DeletionState::Expired)
                | (DeletionState::Pending, DeletionState::Rejected)
                | (DeletionState::Approved, DeletionState::Executed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionState::Pending => "pending",
            DeletionState::Approved => "approved",
            DeletionState::Executed => "executed",
            DeletionState::Expired => "expired",
            DeletionState::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for DeletionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeletionRequest {
    pub id: Uuid,
    pub project_id: String,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
    pub backoff_interval_secs: i64,
    pub state: DeletionState,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Set while one caller holds the right to run the destructive action.
    pub executing_since: Option<DateTime<Utc>>,
}

impl DeletionRequest {
    pub fn backoff_interval(&self) -> Duration {
        Duration::seconds(self.backoff_interval_secs)
    }

    /// Earliest instant at which a still-pending request may be expired.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + self.backoff_interval()
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.state == DeletionState::Pending && now >= self.expires_at()
    }

    /// Whether a caller may start the destructive action at `now`: the
    /// request is approved and nobody holds a lease younger than `lease`.
    pub fn can_claim_execution(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.state == DeletionState::Approved
            && self.executing_since.map_or(true, |since| since + lease <= now)
    }

    pub fn in_scope(&self, scope: &Scope) -> bool {
        self.project_id == scope.project_id && self.resource_id == scope.environment_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeletionConfirmation {
    pub id: Uuid,
    pub deletion_request_id: Uuid,
    pub approver_id: String,
    /// SHA-256 hex digest of the code delivered to the approver.
    #[serde(skip_serializing)]
    pub visible_code: String,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl DeletionConfirmation {
    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }
}

/// Row values for a request about to be inserted.
#[derive(Debug, Clone)]
pub struct NewDeletionRequest {
    pub id: Uuid,
    pub resource: Resource,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
    pub backoff_interval_secs: i64,
}

/// Row values for a confirmation about to be inserted.
#[derive(Debug, Clone)]
pub struct NewDeletionConfirmation {
    pub id: Uuid,
    pub approver_id: String,
    pub code_digest: String,
}
