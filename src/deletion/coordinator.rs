//! Approval coordinator: the deletion-request state machine.
//!
//! ```text
//! pending ──all codes confirmed──▶ approved ──erase ok──▶ executed
//!    │ └──────backoff elapsed────▶ expired
//!    └────────approver veto──────▶ rejected
//! ```
//!
//! Correctness rests on the store: each transition is a single atomic store
//! call. Before the destructive action runs, the caller takes an execution
//! lease on the `approved` request, so concurrent callers never erase in
//! parallel. A failed attempt releases the lease; a crashed holder's lease
//! lapses after `execution_lease`. `approved -> executed` is a
//! compare-and-set, so only one caller records the terminal transition.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::code::ConfirmationCode;
use super::gate::ResourceGate;
use super::report::{self, CreateReport, DeletionReport};
use super::{ApproverNotifier, AuditSink, Clock, ResourceEraser, ResourceInspector, SystemClock};
use crate::config::Config;
use crate::errors::{AppError, AppResult};
use crate::middleware::metrics::DeletionMetrics;
use crate::models::audit::AuditEvent;
use crate::models::deletion::{
    DeletionRequest, DeletionState, NewDeletionConfirmation, NewDeletionRequest, Resource, Scope,
};
use crate::store::{ConfirmOutcome, DeletionStore, RejectOutcome};

/// Actor id used for transitions made by background sweeps.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub store_timeout: Duration,
    pub max_backoff: Duration,
    pub erase_attempts: u32,
    /// Base delay between erase attempts, multiplied by the attempt number.
    pub erase_retry_delay: Duration,
    /// Bound on one erase attempt.
    pub erase_timeout: Duration,
    /// Age after which another caller may take over a held execution lease.
    pub execution_lease: Duration,
    /// Bound on delivering one approver's code.
    pub notify_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            max_backoff: Duration::from_secs(30 * 24 * 3600),
            erase_attempts: 3,
            erase_retry_delay: Duration::from_millis(500),
            erase_timeout: Duration::from_secs(60),
            execution_lease: Duration::from_secs(15 * 60),
            notify_timeout: Duration::from_secs(15),
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            store_timeout: cfg.store_timeout(),
            max_backoff: Duration::from_secs(cfg.max_backoff_secs),
            erase_attempts: cfg.erase_attempts,
            erase_timeout: cfg.erase_timeout(),
            execution_lease: Duration::from_secs(cfg.execution_lease_secs),
            notify_timeout: Duration::from_millis(cfg.notify_timeout_ms),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// This call recorded the confirmation.
    Accepted,
    /// The code had already been confirmed; nothing changed.
    AlreadyConfirmed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalResult {
    pub status: ApprovalStatus,
    pub report: DeletionReport,
}

pub struct ApprovalCoordinator {
    store: Arc<dyn DeletionStore>,
    gate: ResourceGate,
    eraser: Arc<dyn ResourceEraser>,
    notifier: Arc<dyn ApproverNotifier>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    metrics: Arc<DeletionMetrics>,
    settings: CoordinatorSettings,
}

impl ApprovalCoordinator {
    pub fn new(
        store: Arc<dyn DeletionStore>,
        inspector: Arc<dyn ResourceInspector>,
        eraser: Arc<dyn ResourceEraser>,
        notifier: Arc<dyn ApproverNotifier>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<DeletionMetrics>,
    ) -> Self {
        Self {
            store,
            gate: ResourceGate::new(inspector),
            eraser,
            notifier,
            audit,
            clock: Arc::new(SystemClock),
            metrics,
            settings: CoordinatorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: CoordinatorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &DeletionMetrics {
        &self.metrics
    }

    /// Bound a store call by the configured timeout. Dropping a Postgres
    /// future mid-transaction rolls the transaction back.
    async fn timed<T, F>(&self, op: &'static str, fut: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.settings.store_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(AppError::Transient(format!(
                "store operation '{}' timed out after {:?}",
                op, self.settings.store_timeout
            ))),
        };
        self.metrics.store_latency(op, started.elapsed());
        result
    }

    fn validate_approvers(approvers: Vec<String>) -> AppResult<Vec<String>> {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(approvers.len());
        for raw in approvers {
            let id = raw.trim();
            if id.is_empty() {
                return Err(AppError::InvalidArgument("approver id must not be blank".into()));
            }
            if seen.insert(id.to_string()) {
                unique.push(id.to_string());
            }
        }
        if unique.is_empty() {
            return Err(AppError::InvalidArgument(
                "a deletion request needs at least one approver".into(),
            ));
        }
        Ok(unique)
    }

    fn validate_backoff(&self, backoff: Duration) -> AppResult<i64> {
        if backoff.as_secs() == 0 {
            return Err(AppError::InvalidArgument(
                "backoff interval must be at least one second".into(),
            ));
        }
        if backoff > self.settings.max_backoff {
            return Err(AppError::InvalidArgument(format!(
                "backoff interval {}s exceeds the maximum of {}s",
                backoff.as_secs(),
                self.settings.max_backoff.as_secs()
            )));
        }
        i64::try_from(backoff.as_secs())
            .map_err(|_| AppError::InvalidArgument("backoff interval out of range".into()))
    }

    // -- Create --

    pub async fn create_deletion_request(
        &self,
        actor_id: &str,
        resource: &Resource,
        approvers: Vec<String>,
        backoff: Duration,
    ) -> AppResult<CreateReport> {
        let approvers = Self::validate_approvers(approvers)?;
        let backoff_secs = self.validate_backoff(backoff)?;

        if let Some(existing) = self
            .timed("find_active", self.store.find_active(resource.kind, &resource.id))
            .await?
        {
            self.metrics.request("conflict");
            return Err(AppError::Conflict(format!(
                "deletion request {} is already {} for {} {}",
                existing.id, existing.state, resource.kind, resource.id
            )));
        }

        if self.erase_if_empty(resource).await? {
            self.metrics.request("deleted_immediately");
            self.audit.record(AuditEvent::new(
                actor_id,
                "environment.delete",
                resource.id.clone(),
                json!({ "project_id": resource.project_id, "immediate": true }),
            ));
            tracing::info!(
                resource_kind = %resource.kind,
                resource_id = %resource.id,
                "resource was empty, deleted without approval"
            );
            return Ok(CreateReport {
                report: report::immediate(resource),
                deleted_immediately: true,
                notified_approvers: Vec::new(),
                undelivered_approvers: Vec::new(),
            });
        }

        let new_request = NewDeletionRequest {
            id: Uuid::new_v4(),
            resource: resource.clone(),
            requested_by: actor_id.to_string(),
            created_at: self.clock.now(),
            backoff_interval_secs: backoff_secs,
        };
        let issued: Vec<(String, ConfirmationCode)> = approvers
            .into_iter()
            .map(|a| (a, ConfirmationCode::generate()))
            .collect();
        let confirmations: Vec<NewDeletionConfirmation> = issued
            .iter()
            .map(|(approver_id, code)| NewDeletionConfirmation {
                id: Uuid::new_v4(),
                approver_id: approver_id.clone(),
                code_digest: code.digest(),
            })
            .collect();

        let (request, rows) = match self
            .timed(
                "insert_request",
                self.store.insert_request(&new_request, &confirmations),
            )
            .await
        {
            Ok(created) => created,
            Err(e) => {
                if matches!(e, AppError::Conflict(_)) {
                    self.metrics.request("conflict");
                }
                return Err(e);
            }
        };

        tracing::info!(
            request_id = %request.id,
            resource_kind = %request.resource_kind,
            resource_id = %request.resource_id,
            approvers = rows.len(),
            backoff_secs,
            "deletion request created"
        );

        let created = &request;
        let notify_timeout = self.settings.notify_timeout;
        let deliveries = join_all(issued.iter().map(|(approver_id, code)| async move {
            let delivered = tokio::time::timeout(
                notify_timeout,
                self.notifier.notify(approver_id, created, code),
            )
            .await
            .unwrap_or_else(|_| {
                Err(anyhow::anyhow!("delivery timed out after {:?}", notify_timeout))
            });
            (approver_id.clone(), delivered)
        }))
        .await;

        let mut notified_approvers = Vec::new();
        let mut undelivered_approvers = Vec::new();
        for (approver_id, delivered) in deliveries {
            match delivered {
                Ok(()) => notified_approvers.push(approver_id),
                Err(e) => {
                    tracing::warn!(
                        request_id = %request.id,
                        approver_id = %approver_id,
                        error = %e,
                        "failed to notify approver"
                    );
                    undelivered_approvers.push(approver_id);
                }
            }
        }

        self.metrics.request("created");
        self.metrics.transition(DeletionState::Pending);
        self.audit.record(AuditEvent::new(
            actor_id,
            "deletion_request.create",
            request.id.to_string(),
            json!({
                "resource_kind": request.resource_kind,
                "resource_id": request.resource_id,
                "approvers": rows.iter().map(|c| c.approver_id.as_str()).collect::<Vec<_>>(),
                "backoff_interval_secs": backoff_secs,
            }),
        ));

        Ok(CreateReport {
            report: report::build(&request, &rows),
            deleted_immediately: false,
            notified_approvers,
            undelivered_approvers,
        })
    }

    // -- Read --

    pub async fn get_deletion_request(&self, scope: &Scope, id: Uuid) -> AppResult<DeletionReport> {
        match self.timed("load", self.store.load(id)).await? {
            Some((request, rows)) if request.in_scope(scope) => Ok(report::build(&request, &rows)),
            _ => Err(AppError::NotFound(format!("deletion request {}", id))),
        }
    }

    // -- Approve / reject --

    pub async fn approve_deletion_confirmation(
        &self,
        actor_id: &str,
        scope: &Scope,
        id: Uuid,
        raw_code: &str,
    ) -> AppResult<ApprovalResult> {
        let Some(code) = ConfirmationCode::parse(raw_code) else {
            self.metrics.confirmation("no_match");
            return Err(AppError::NotFound("no matching deletion confirmation".into()));
        };
        let now = self.clock.now();

        let outcome = self
            .timed("confirm", self.store.confirm(id, scope, &code.digest(), now))
            .await?;

        let status = match outcome {
            ConfirmOutcome::NoMatch => {
                self.metrics.confirmation("no_match");
                return Err(AppError::NotFound("no matching deletion confirmation".into()));
            }
            ConfirmOutcome::Closed { request, lapsed } => {
                self.metrics.confirmation("closed");
                if lapsed {
                    self.record_expired(std::slice::from_ref(&request));
                }
                return Err(AppError::Conflict(format!(
                    "deletion request {} is {} and no longer accepts approvals",
                    request.id, request.state
                )));
            }
            ConfirmOutcome::AlreadyConfirmed(request) => {
                self.metrics.confirmation("already_confirmed");
                if request.state == DeletionState::Approved {
                    // Finish a stranded execution unless another caller holds the lease.
                    self.complete(actor_id, &request).await?;
                }
                ApprovalStatus::AlreadyConfirmed
            }
            ConfirmOutcome::Recorded {
                request,
                approver_id,
                quorum_reached,
            } => {
                self.metrics.confirmation("accepted");
                tracing::info!(
                    request_id = %request.id,
                    approver_id = %approver_id,
                    quorum_reached,
                    "deletion confirmation recorded"
                );
                self.audit.record(AuditEvent::new(
                    actor_id,
                    "deletion_request.approve",
                    request.id.to_string(),
                    json!({ "approver_id": approver_id, "quorum_reached": quorum_reached }),
                ));
                if quorum_reached {
                    self.metrics.transition(DeletionState::Approved);
                    self.complete(actor_id, &request).await?;
                }
                ApprovalStatus::Accepted
            }
        };

        let report = self.get_deletion_request(scope, id).await?;
        Ok(ApprovalResult { status, report })
    }

    /// An approver vetoes the request with their own code.
    pub async fn reject_deletion_confirmation(
        &self,
        actor_id: &str,
        scope: &Scope,
        id: Uuid,
        raw_code: &str,
    ) -> AppResult<DeletionReport> {
        let Some(code) = ConfirmationCode::parse(raw_code) else {
            return Err(AppError::NotFound("no matching deletion confirmation".into()));
        };
        let now = self.clock.now();

        match self
            .timed("reject", self.store.reject(id, scope, &code.digest(), now))
            .await?
        {
            RejectOutcome::NoMatch => {
                return Err(AppError::NotFound("no matching deletion confirmation".into()))
            }
            RejectOutcome::Closed { request, lapsed } => {
                if lapsed {
                    self.record_expired(std::slice::from_ref(&request));
                }
                return Err(AppError::Conflict(format!(
                    "deletion request {} is {} and can no longer be rejected",
                    request.id, request.state
                )));
            }
            RejectOutcome::AlreadyRejected(_) => {}
            RejectOutcome::Rejected {
                request,
                approver_id,
            } => {
                self.metrics.transition(DeletionState::Rejected);
                tracing::info!(
                    request_id = %request.id,
                    approver_id = %approver_id,
                    "deletion request rejected"
                );
                self.audit.record(AuditEvent::new(
                    actor_id,
                    "deletion_request.reject",
                    request.id.to_string(),
                    json!({ "approver_id": approver_id }),
                ));
            }
        }

        self.get_deletion_request(scope, id).await
    }

    // -- Delete --

    /// Delete an environment directly. Allowed when it holds no data, or when
    /// its deletion request has been approved.
    pub async fn delete_environment(
        &self,
        actor_id: &str,
        resource: &Resource,
    ) -> AppResult<DeletionReport> {
        let active = self
            .timed("find_active", self.store.find_active(resource.kind, &resource.id))
            .await?;

        match active {
            Some(request) if request.state == DeletionState::Approved => {
                if request.project_id != resource.project_id {
                    return Err(AppError::NotFound(format!("{} {}", resource.kind, resource.id)));
                }
                self.complete(actor_id, &request).await?;
                self.get_deletion_request(&resource.scope(), request.id).await
            }
            Some(request) => Err(AppError::Conflict(format!(
                "deletion request {} is still {}",
                request.id, request.state
            ))),
            None => {
                if !self.erase_if_empty(resource).await? {
                    return Err(AppError::Conflict(format!(
                        "{} {} holds recorded data; an approved deletion request is required",
                        resource.kind, resource.id
                    )));
                }
                self.audit.record(AuditEvent::new(
                    actor_id,
                    "environment.delete",
                    resource.id.clone(),
                    json!({ "project_id": resource.project_id, "immediate": true }),
                ));
                Ok(report::immediate(resource))
            }
        }
    }

    // -- Execution --

    /// Erase a resource that the gate reports empty. The eraser re-checks
    /// emptiness in the same unit of work as the delete; false means data
    /// arrived in between, or was there all along, and nothing was deleted.
    async fn erase_if_empty(&self, resource: &Resource) -> AppResult<bool> {
        if !self
            .timed("has_dependents", self.gate.can_delete_immediately(resource))
            .await?
        {
            return Ok(false);
        }
        let erased = self
            .erase_with_retry(resource, || self.eraser.erase_if_empty(resource))
            .await?;
        if !erased {
            tracing::info!(
                resource_kind = %resource.kind,
                resource_id = %resource.id,
                "data recorded after the emptiness check, approval required"
            );
        }
        Ok(erased)
    }

    /// Run one destructive operation with bounded attempts. Exhausted
    /// attempts are `Fatal`, or `Transient` when the last one timed out.
    async fn erase_with_retry<T, F, Fut>(
        &self,
        resource: &Resource,
        mut attempt_once: F,
    ) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let attempts = self.settings.erase_attempts.max(1);
        let limit = self.settings.erase_timeout;
        let mut last_error = None;
        let mut timed_out = false;

        for attempt in 1..=attempts {
            let outcome = match tokio::time::timeout(limit, attempt_once()).await {
                Ok(outcome) => {
                    timed_out = false;
                    outcome
                }
                Err(_) => {
                    timed_out = true;
                    Err(anyhow::anyhow!("timed out after {:?}", limit))
                }
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(
                        resource_kind = %resource.kind,
                        resource_id = %resource.id,
                        attempt,
                        error = %e,
                        "destructive action failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.erase_retry_delay * attempt).await;
                    }
                }
            }
        }

        self.metrics.erase_failure(resource.kind.as_str());
        let message = format!(
            "deleting {} {} failed after {} attempts: {}",
            resource.kind,
            resource.id,
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        );
        if timed_out {
            Err(AppError::Transient(message))
        } else {
            Err(AppError::Fatal(message))
        }
    }

    /// Run the destructive action for an approved request, then move it to
    /// `executed`. Returns true if this call made the transition, false if
    /// another caller holds the execution lease or already finished. On
    /// failure the lease is released and the request stays `approved` for a
    /// later caller or the completion sweep.
    async fn complete(&self, actor_id: &str, request: &DeletionRequest) -> AppResult<bool> {
        let lease = chrono::Duration::from_std(self.settings.execution_lease).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("execution lease out of range: {}", e))
        })?;
        let Some(claimed) = self
            .timed(
                "claim_execution",
                self.store.claim_execution(request.id, self.clock.now(), lease),
            )
            .await?
        else {
            tracing::debug!(
                request_id = %request.id,
                "execution lease held elsewhere or request no longer approved"
            );
            return Ok(false);
        };

        let resource = Resource {
            kind: claimed.resource_kind,
            id: claimed.resource_id.clone(),
            project_id: claimed.project_id.clone(),
        };
        if let Err(e) = self
            .erase_with_retry(&resource, || self.eraser.erase(&resource))
            .await
        {
            if let Err(release_err) = self
                .timed("release_execution", self.store.release_execution(claimed.id))
                .await
            {
                tracing::warn!(
                    request_id = %claimed.id,
                    error = %release_err,
                    "could not release execution lease; it lapses on its own"
                );
            }
            return Err(e);
        }

        let moved = self
            .timed(
                "mark_executed",
                self.store.mark_executed(claimed.id, self.clock.now()),
            )
            .await?;
        if moved {
            self.metrics.transition(DeletionState::Executed);
            tracing::info!(
                request_id = %claimed.id,
                resource_id = %claimed.resource_id,
                "deletion request executed"
            );
            self.audit.record(AuditEvent::new(
                actor_id,
                "deletion_request.execute",
                claimed.id.to_string(),
                json!({ "resource_kind": claimed.resource_kind, "resource_id": claimed.resource_id }),
            ));
        }
        Ok(moved)
    }

    // -- Maintenance --

    fn record_expired(&self, expired: &[DeletionRequest]) {
        if expired.is_empty() {
            return;
        }
        self.metrics.transitions(DeletionState::Expired, expired.len());
        for request in expired {
            tracing::info!(
                request_id = %request.id,
                resource_id = %request.resource_id,
                "deletion request expired"
            );
            self.audit.record(AuditEvent::new(
                SYSTEM_ACTOR,
                "deletion_request.expire",
                request.id.to_string(),
                json!({ "resource_kind": request.resource_kind, "resource_id": request.resource_id }),
            ));
        }
    }

    /// Expire every pending request whose backoff interval has elapsed.
    pub async fn expire_stale_requests(&self) -> AppResult<Vec<DeletionRequest>> {
        let now = self.clock.now();
        let expired = self
            .timed("expire_stale", self.store.expire_stale(now))
            .await?;
        self.record_expired(&expired);
        Ok(expired)
    }

    /// Retry the destructive action for requests stranded in `approved`.
    /// Returns how many were moved to `executed`.
    pub async fn complete_approved_requests(&self) -> AppResult<usize> {
        let approved = self.timed("list_approved", self.store.list_approved()).await?;
        let mut completed = 0;
        for request in &approved {
            match self.complete(SYSTEM_ACTOR, request).await {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    tracing::error!(
                        request_id = %request.id,
                        error = %e,
                        "approved deletion still failing"
                    );
                }
            }
        }
        Ok(completed)
    }

    /// Remove terminal requests resolved longer than `retention` ago.
    pub async fn purge_resolved_requests(&self, retention: chrono::Duration) -> AppResult<u64> {
        let cutoff = self.clock.now() - retention;
        let removed = self
            .timed("purge_resolved", self.store.purge_resolved(cutoff))
            .await?;
        if removed > 0 {
            tracing::info!(rows = removed, "purged resolved deletion requests");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_approvers_dedupes_and_trims() {
        let out = ApprovalCoordinator::validate_approvers(vec![
            "u1".into(),
            " u2 ".into(),
            "u1".into(),
        ])
        .unwrap();
        assert_eq!(out, vec!["u1", "u2"]);
    }

    #[test]
    fn test_validate_approvers_rejects_empty_and_blank() {
        assert!(matches!(
            ApprovalCoordinator::validate_approvers(vec![]),
            Err(AppError::InvalidArgument(_))
        ));
        assert!(matches!(
            ApprovalCoordinator::validate_approvers(vec!["u1".into(), "  ".into()]),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_settings_from_config() {
        let cfg = Config::default_for_test();
        let settings = CoordinatorSettings::from_config(&cfg);
        assert_eq!(settings.erase_attempts, 2);
        assert_eq!(settings.store_timeout, Duration::from_millis(2_000));
        assert_eq!(settings.max_backoff, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(settings.erase_timeout, Duration::from_secs(10));
        assert_eq!(settings.execution_lease, Duration::from_secs(300));
        assert_eq!(settings.notify_timeout, Duration::from_secs(1));
    }
}
