use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::deletion::{
    DeletionConfirmation, DeletionRequest, DeletionState, Resource, ResourceKind,
};

/// Status summary of a deletion request as seen by clients.
#[derive(Debug, Clone, Serialize)]
pub struct DeletionReport {
    /// `None` when the resource was deleted without a request.
    pub id: Option<Uuid>,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub state: DeletionState,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub confirmed: usize,
    pub total: usize,
    pub pending_approvers: Vec<String>,
}

/// Result of a create call: the report plus who was sent a code.
#[derive(Debug, Clone, Serialize)]
pub struct CreateReport {
    #[serde(flatten)]
    pub report: DeletionReport,
    /// True when the resource was empty and deleted on the spot.
    pub deleted_immediately: bool,
    pub notified_approvers: Vec<String>,
    /// Approvers whose notification failed; their codes were still issued.
    pub undelivered_approvers: Vec<String>,
}

pub fn build(request: &DeletionRequest, confirmations: &[DeletionConfirmation]) -> DeletionReport {
    let confirmed = confirmations.iter().filter(|c| c.is_confirmed()).count();
    let mut pending_approvers: Vec<String> = confirmations
        .iter()
        .filter(|c| !c.is_confirmed())
        .map(|c| c.approver_id.clone())
        .collect();
    pending_approvers.sort();

    DeletionReport {
        id: Some(request.id),
        resource_kind: request.resource_kind,
        resource_id: request.resource_id.clone(),
        state: request.state,
        created_at: Some(request.created_at),
        expires_at: Some(request.expires_at()),
        confirmed,
        total: confirmations.len(),
        pending_approvers,
    }
}

/// Report for a resource deleted without going through approval.
pub fn immediate(resource: &Resource) -> DeletionReport {
    DeletionReport {
        id: None,
        resource_kind: resource.kind,
        resource_id: resource.id.clone(),
        state: DeletionState::Executed,
        created_at: None,
        expires_at: None,
        confirmed: 0,
        total: 0,
        pending_approvers: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DeletionRequest {
        DeletionRequest {
            id: Uuid::new_v4(),
            project_id: "p1".into(),
            resource_kind: ResourceKind::Environment,
            resource_id: "env-42".into(),
            requested_by: "admin".into(),
            created_at: Utc::now(),
            backoff_interval_secs: 86_400,
            state: DeletionState::Pending,
            resolved_at: None,
            executing_since: None,
        }
    }

    fn confirmation(req: &DeletionRequest, approver: &str, confirmed: bool) -> DeletionConfirmation {
        DeletionConfirmation {
            id: Uuid::new_v4(),
            deletion_request_id: req.id,
            approver_id: approver.into(),
            visible_code: "digest".into(),
            confirmed_at: confirmed.then(Utc::now),
        }
    }

    #[test]
    fn test_counts_and_pending_approvers() {
        let req = request();
        let rows = vec![
            confirmation(&req, "u2", false),
            confirmation(&req, "u1", true),
            confirmation(&req, "u3", false),
        ];
        let report = build(&req, &rows);
        assert_eq!(report.confirmed, 1);
        assert_eq!(report.total, 3);
        assert_eq!(report.pending_approvers, vec!["u2", "u3"]);
        assert_eq!(report.expires_at, Some(req.created_at + chrono::Duration::days(1)));
    }

    #[test]
    fn test_immediate_report_has_no_id() {
        let report = immediate(&Resource::environment("p1", "env-empty"));
        assert!(report.id.is_none());
        assert_eq!(report.state, DeletionState::Executed);
        assert_eq!(report.total, 0);
    }

    #[test]
    fn test_create_report_flattens() {
        let req = request();
        let create = CreateReport {
            report: build(&req, &[confirmation(&req, "u1", false)]),
            deleted_immediately: false,
            notified_approvers: vec!["u1".into()],
            undelivered_approvers: vec![],
        };
        let json = serde_json::to_value(&create).unwrap();
        assert_eq!(json["state"], "pending");
        assert_eq!(json["total"], 1);
        assert_eq!(json["notified_approvers"][0], "u1");
        assert!(json.get("visible_code").is_none());
    }
}
