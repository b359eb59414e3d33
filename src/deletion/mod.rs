//! Deletion-request workflow.
//!
//! The coordinator owns the state machine; everything it talks to outside the
//! store is one of the collaborator traits below.

pub mod code;
pub mod coordinator;
pub mod gate;
pub mod report;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::audit::AuditEvent;
use crate::models::deletion::{DeletionRequest, Resource};
use code::ConfirmationCode;

pub use coordinator::{ApprovalCoordinator, ApprovalResult, ApprovalStatus, CoordinatorSettings};
pub use gate::ResourceGate;
pub use report::{CreateReport, DeletionReport};

/// Answers whether a resource still holds recorded data.
#[async_trait]
pub trait ResourceInspector: Send + Sync {
    async fn has_dependents(&self, resource: &Resource) -> anyhow::Result<bool>;
}

/// Performs the irreversible deletion. Must be safe to call repeatedly with
/// the same resource.
#[async_trait]
pub trait ResourceEraser: Send + Sync {
    async fn erase(&self, resource: &Resource) -> anyhow::Result<()>;

    /// Erase only if the resource still holds no dependent data, checked in
    /// the same unit of work as the delete. Returns false, having deleted
    /// nothing, when data is present.
    async fn erase_if_empty(&self, resource: &Resource) -> anyhow::Result<bool>;
}

/// Delivers a confirmation code to an approver. Best-effort.
#[async_trait]
pub trait ApproverNotifier: Send + Sync {
    async fn notify(
        &self,
        approver_id: &str,
        request: &DeletionRequest,
        code: &ConfirmationCode,
    ) -> anyhow::Result<()>;
}

/// Lists the users allowed to approve deletion of a resource.
#[async_trait]
pub trait ApproverDirectory: Send + Sync {
    async fn approvers_for(&self, resource: &Resource) -> anyhow::Result<Vec<String>>;
}

/// Fire-and-forget admin audit trail.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Audit sink that only emits a tracing event. Used by CLI commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            actor_id = %event.actor_id,
            action = %event.action,
            target = %event.target,
            fields = %event.fields,
            "admin action"
        );
    }
}
