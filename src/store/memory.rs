//! In-process `DeletionStore`.
//!
//! One mutex guards the whole state, which gives every operation the same
//! all-or-nothing, serialized behaviour the Postgres store gets from row
//! locks. Used by tests and local demos.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ConfirmOutcome, DeletionStore, RejectOutcome};
use crate::deletion::code;
use crate::errors::{AppError, AppResult};
use crate::models::deletion::{
    DeletionConfirmation, DeletionRequest, DeletionState, NewDeletionConfirmation,
    NewDeletionRequest, ResourceKind, Scope,
};

#[derive(Default)]
struct State {
    requests: HashMap<Uuid, DeletionRequest>,
    confirmations: HashMap<Uuid, Vec<DeletionConfirmation>>,
}

impl State {
    fn active_for(&self, kind: ResourceKind, resource_id: &str) -> Option<&DeletionRequest> {
        self.requests.values().find(|r| {
            r.resource_kind == kind && r.resource_id == resource_id && !r.state.is_terminal()
        })
    }

    /// Locate the request and the index of the confirmation matching the code.
    fn locate(&self, id: Uuid, scope: &Scope, code_digest: &str) -> Option<usize> {
        let request = self.requests.get(&id)?;
        if !request.in_scope(scope) {
            return None;
        }
        let rows = self.confirmations.get(&id)?;
        let matched = code::find_match(rows, code_digest)?;
        rows.iter().position(|c| c.id == matched.id)
    }

    fn transition(&mut self, id: Uuid, to: DeletionState, now: DateTime<Utc>) -> bool {
        match self.requests.get_mut(&id) {
            Some(r) if r.state.can_transition_to(to) => {
                r.state = to;
                if to.is_terminal() {
                    r.resolved_at = Some(now);
                }
                true
            }
            _ => false,
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeletionStore for MemoryStore {
    async fn insert_request(
        &self,
        request: &NewDeletionRequest,
        confirmations: &[NewDeletionConfirmation],
    ) -> AppResult<(DeletionRequest, Vec<DeletionConfirmation>)> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.active_for(request.resource.kind, &request.resource.id) {
            return Err(AppError::Conflict(format!(
                "deletion request {} is already outstanding for {} {}",
                existing.id, request.resource.kind, request.resource.id
            )));
        }

        let row = DeletionRequest {
            id: request.id,
            project_id: request.resource.project_id.clone(),
            resource_kind: request.resource.kind,
            resource_id: request.resource.id.clone(),
            requested_by: request.requested_by.clone(),
            created_at: request.created_at,
            backoff_interval_secs: request.backoff_interval_secs,
            state: DeletionState::Pending,
            resolved_at: None,
            executing_since: None,
        };
        let rows: Vec<DeletionConfirmation> = confirmations
            .iter()
            .map(|c| DeletionConfirmation {
                id: c.id,
                deletion_request_id: request.id,
                approver_id: c.approver_id.clone(),
                visible_code: c.code_digest.clone(),
                confirmed_at: None,
            })
            .collect();

        state.requests.insert(row.id, row.clone());
        state.confirmations.insert(row.id, rows.clone());
        Ok((row, rows))
    }

    async fn find_active(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> AppResult<Option<DeletionRequest>> {
        let state = self.state.lock().await;
        Ok(state.active_for(kind, resource_id).cloned())
    }

    async fn load(
        &self,
        id: Uuid,
    ) -> AppResult<Option<(DeletionRequest, Vec<DeletionConfirmation>)>> {
        let state = self.state.lock().await;
        Ok(state.requests.get(&id).map(|r| {
            let rows = state.confirmations.get(&id).cloned().unwrap_or_default();
            (r.clone(), rows)
        }))
    }

    async fn confirm(
        &self,
        id: Uuid,
        scope: &Scope,
        code_digest: &str,
        now: DateTime<Utc>,
    ) -> AppResult<ConfirmOutcome> {
        let mut state = self.state.lock().await;
        let Some(idx) = state.locate(id, scope, code_digest) else {
            return Ok(ConfirmOutcome::NoMatch);
        };
        let request = state.requests[&id].clone();

        if state.confirmations[&id][idx].is_confirmed() {
            return Ok(ConfirmOutcome::AlreadyConfirmed(request));
        }
        if request.state != DeletionState::Pending {
            return Ok(ConfirmOutcome::Closed {
                request,
                lapsed: false,
            });
        }
        if request.is_stale(now) {
            state.transition(id, DeletionState::Expired, now);
            return Ok(ConfirmOutcome::Closed {
                request: state.requests[&id].clone(),
                lapsed: true,
            });
        }

        let rows = state
            .confirmations
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("confirmations vanished for {}", id))?;
        rows[idx].confirmed_at = Some(now);
        let approver_id = rows[idx].approver_id.clone();
        let quorum_reached = rows.iter().all(|c| c.is_confirmed())
            && state.transition(id, DeletionState::Approved, now);

        Ok(ConfirmOutcome::Recorded {
            request: state.requests[&id].clone(),
            approver_id,
            quorum_reached,
        })
    }

    async fn reject(
        &self,
        id: Uuid,
        scope: &Scope,
        code_digest: &str,
        now: DateTime<Utc>,
    ) -> AppResult<RejectOutcome> {
        let mut state = self.state.lock().await;
        let Some(idx) = state.locate(id, scope, code_digest) else {
            return Ok(RejectOutcome::NoMatch);
        };
        let request = state.requests[&id].clone();

        match request.state {
            DeletionState::Rejected => return Ok(RejectOutcome::AlreadyRejected(request)),
            DeletionState::Pending if request.is_stale(now) => {
                state.transition(id, DeletionState::Expired, now);
                return Ok(RejectOutcome::Closed {
                    request: state.requests[&id].clone(),
                    lapsed: true,
                });
            }
            DeletionState::Pending => {}
            _ => {
                return Ok(RejectOutcome::Closed {
                    request,
                    lapsed: false,
                })
            }
        }

        let approver_id = state.confirmations[&id][idx].approver_id.clone();
        state.transition(id, DeletionState::Rejected, now);
        Ok(RejectOutcome::Rejected {
            request: state.requests[&id].clone(),
            approver_id,
        })
    }

    async fn claim_execution(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> AppResult<Option<DeletionRequest>> {
        let mut state = self.state.lock().await;
        match state.requests.get_mut(&id) {
            Some(r) if r.can_claim_execution(now, lease) => {
                r.executing_since = Some(now);
                Ok(Some(r.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release_execution(&self, id: Uuid) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if let Some(r) = state.requests.get_mut(&id) {
            r.executing_since = None;
        }
        Ok(())
    }

    async fn mark_executed(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state.transition(id, DeletionState::Executed, now))
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> AppResult<Vec<DeletionRequest>> {
        let mut state = self.state.lock().await;
        let stale: Vec<Uuid> = state
            .requests
            .values()
            .filter(|r| r.is_stale(now))
            .map(|r| r.id)
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            if state.transition(id, DeletionState::Expired, now) {
                expired.push(state.requests[&id].clone());
            }
        }
        Ok(expired)
    }

    async fn list_approved(&self) -> AppResult<Vec<DeletionRequest>> {
        let state = self.state.lock().await;
        let mut approved: Vec<DeletionRequest> = state
            .requests
            .values()
            .filter(|r| r.state == DeletionState::Approved)
            .cloned()
            .collect();
        approved.sort_by_key(|r| r.created_at);
        Ok(approved)
    }

    async fn purge_resolved(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut state = self.state.lock().await;
        let doomed: Vec<Uuid> = state
            .requests
            .values()
            .filter(|r| r.state.is_terminal() && r.resolved_at.is_some_and(|t| t < cutoff))
            .map(|r| r.id)
            .collect();
        for id in &doomed {
            state.requests.remove(id);
            state.confirmations.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deletion::code::ConfirmationCode;
    use crate::models::deletion::Resource;

    fn new_request(resource: &Resource, now: DateTime<Utc>) -> NewDeletionRequest {
        NewDeletionRequest {
            id: Uuid::new_v4(),
            resource: resource.clone(),
            requested_by: "admin".into(),
            created_at: now,
            backoff_interval_secs: 3600,
        }
    }

    fn new_confirmation(approver: &str, code: &ConfirmationCode) -> NewDeletionConfirmation {
        NewDeletionConfirmation {
            id: Uuid::new_v4(),
            approver_id: approver.into(),
            code_digest: code.digest(),
        }
    }

    #[tokio::test]
    async fn test_second_active_request_conflicts() {
        let store = MemoryStore::new();
        let env = Resource::environment("p1", "env-1");
        let now = Utc::now();
        let code = ConfirmationCode::generate();

        store
            .insert_request(&new_request(&env, now), &[new_confirmation("u1", &code)])
            .await
            .unwrap();
        let err = store
            .insert_request(&new_request(&env, now), &[new_confirmation("u1", &code)])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_confirm_is_compare_and_set() {
        let store = MemoryStore::new();
        let env = Resource::environment("p1", "env-1");
        let now = Utc::now();
        let a = ConfirmationCode::generate();
        let b = ConfirmationCode::generate();
        let (req, _) = store
            .insert_request(
                &new_request(&env, now),
                &[new_confirmation("u1", &a), new_confirmation("u2", &b)],
            )
            .await
            .unwrap();

        let first = store.confirm(req.id, &env.scope(), &a.digest(), now).await.unwrap();
        assert!(matches!(
            first,
            ConfirmOutcome::Recorded { quorum_reached: false, .. }
        ));
        let again = store
            .confirm(req.id, &env.scope(), &a.digest(), now + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(matches!(again, ConfirmOutcome::AlreadyConfirmed(_)));

        let (_, rows) = store.load(req.id).await.unwrap().unwrap();
        let u1 = rows.iter().find(|c| c.approver_id == "u1").unwrap();
        assert_eq!(u1.confirmed_at, Some(now));
    }

    #[tokio::test]
    async fn test_foreign_scope_does_not_match() {
        let store = MemoryStore::new();
        let env = Resource::environment("p1", "env-1");
        let now = Utc::now();
        let a = ConfirmationCode::generate();
        let (req, _) = store
            .insert_request(&new_request(&env, now), &[new_confirmation("u1", &a)])
            .await
            .unwrap();

        let other = Resource::environment("p2", "env-1").scope();
        let outcome = store.confirm(req.id, &other, &a.digest(), now).await.unwrap();
        assert!(matches!(outcome, ConfirmOutcome::NoMatch));
    }

    #[tokio::test]
    async fn test_execution_lease_is_exclusive() {
        let store = MemoryStore::new();
        let env = Resource::environment("p1", "env-1");
        let now = Utc::now();
        let a = ConfirmationCode::generate();
        let (req, _) = store
            .insert_request(&new_request(&env, now), &[new_confirmation("u1", &a)])
            .await
            .unwrap();
        let lease = Duration::minutes(10);

        // Not approved yet.
        assert!(store.claim_execution(req.id, now, lease).await.unwrap().is_none());

        store.confirm(req.id, &env.scope(), &a.digest(), now).await.unwrap();
        assert!(store.claim_execution(req.id, now, lease).await.unwrap().is_some());
        assert!(store
            .claim_execution(req.id, now + Duration::minutes(1), lease)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .claim_execution(req.id, now + Duration::minutes(11), lease)
            .await
            .unwrap()
            .is_some());

        store.release_execution(req.id).await.unwrap();
        assert!(store
            .claim_execution(req.id, now + Duration::minutes(12), lease)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_purge_only_removes_old_terminal_requests() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let code = ConfirmationCode::generate();
        let old = Resource::environment("p1", "env-old");
        let other = Resource::environment("p1", "env-other");
        store
            .insert_request(&new_request(&old, now), &[new_confirmation("u1", &code)])
            .await
            .unwrap();
        store
            .insert_request(&new_request(&other, now), &[new_confirmation("u1", &code)])
            .await
            .unwrap();

        let expired = store.expire_stale(now + chrono::Duration::hours(2)).await.unwrap();
        assert_eq!(expired.len(), 2);

        let removed = store.purge_resolved(now + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 0);
        let removed = store.purge_resolved(now + chrono::Duration::hours(3)).await.unwrap();
        assert_eq!(removed, 2);
    }
}
