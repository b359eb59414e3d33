pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::errors::AppResult;
use crate::models::deletion::{
    DeletionConfirmation, DeletionRequest, NewDeletionConfirmation, NewDeletionRequest,
    ResourceKind, Scope,
};

/// Result of submitting a code for approval.
#[derive(Debug, Clone)]
pub enum ConfirmOutcome {
    /// Unknown request, foreign scope, or no confirmation with that code.
    NoMatch,
    /// The code was confirmed earlier; nothing was written.
    AlreadyConfirmed(DeletionRequest),
    /// `confirmed_at` was set by this call.
    Recorded {
        request: DeletionRequest,
        approver_id: String,
        /// This call moved the request from `pending` to `approved`.
        quorum_reached: bool,
    },
    /// The code is valid but the request no longer accepts approvals.
    /// `lapsed` is set when this call expired it.
    Closed { request: DeletionRequest, lapsed: bool },
}

/// Result of an approver vetoing a request.
#[derive(Debug, Clone)]
pub enum RejectOutcome {
    NoMatch,
    Rejected {
        request: DeletionRequest,
        approver_id: String,
    },
    AlreadyRejected(DeletionRequest),
    Closed { request: DeletionRequest, lapsed: bool },
}

/// Durable storage for deletion requests and their confirmations.
///
/// Every method is one atomic unit. Implementations must serialize
/// `confirm`, `reject`, `claim_execution`, `mark_executed` and `expire_stale`
/// per request so that exactly one caller observes each state transition.
#[async_trait]
pub trait DeletionStore: Send + Sync {
    /// Insert a `pending` request with its confirmations. Fails with
    /// `Conflict` when the resource already has a non-terminal request.
    async fn insert_request(
        &self,
        request: &NewDeletionRequest,
        confirmations: &[NewDeletionConfirmation],
    ) -> AppResult<(DeletionRequest, Vec<DeletionConfirmation>)>;

    /// The `pending` or `approved` request for a resource, if any.
    async fn find_active(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> AppResult<Option<DeletionRequest>>;

    async fn load(
        &self,
        id: Uuid,
    ) -> AppResult<Option<(DeletionRequest, Vec<DeletionConfirmation>)>>;

    /// Match `code_digest` against the request's confirmations, set
    /// `confirmed_at` if still null and re-evaluate quorum.
    async fn confirm(
        &self,
        id: Uuid,
        scope: &Scope,
        code_digest: &str,
        now: DateTime<Utc>,
    ) -> AppResult<ConfirmOutcome>;

    async fn reject(
        &self,
        id: Uuid,
        scope: &Scope,
        code_digest: &str,
        now: DateTime<Utc>,
    ) -> AppResult<RejectOutcome>;

    /// Take the execution lease on an `approved` request. Returns the request
    /// when this caller now holds the lease, or `None` if the request is not
    /// `approved` or another caller took the lease less than `lease` ago.
    async fn claim_execution(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> AppResult<Option<DeletionRequest>>;

    /// Drop the execution lease after a failed attempt so the next caller
    /// can retry without waiting for it to go stale.
    async fn release_execution(&self, id: Uuid) -> AppResult<()>;

    /// `approved -> executed`. Returns false if the request was not `approved`.
    async fn mark_executed(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<bool>;

    /// Expire every `pending` request whose backoff has elapsed at `now`.
    async fn expire_stale(&self, now: DateTime<Utc>) -> AppResult<Vec<DeletionRequest>>;

    async fn list_approved(&self) -> AppResult<Vec<DeletionRequest>>;

    /// Delete terminal requests resolved before `cutoff`. Returns rows removed.
    async fn purge_resolved(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;
}
