use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{ConfirmOutcome, DeletionStore, RejectOutcome};
use crate::deletion::code;
use crate::deletion::{ApproverDirectory, ResourceEraser, ResourceInspector};
use crate::errors::{AppError, AppResult};
use crate::models::deletion::{
    DeletionConfirmation, DeletionRequest, DeletionState, NewDeletionConfirmation,
    NewDeletionRequest, Resource, ResourceKind, Scope,
};

const REQUEST_COLUMNS: &str = "id, project_id, resource_kind, resource_id, requested_by, \
     created_at, backoff_interval_secs, state, resolved_at, executing_since";

const CONFIRMATION_COLUMNS: &str =
    "id, deletion_request_id, approver_id, visible_code, confirmed_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    /// Applied as `lock_timeout` / `statement_timeout` inside every
    /// workflow transaction.
    op_timeout: Duration,
    /// The same bound for the environment delete, which touches far more rows.
    erase_timeout: Duration,
}

impl PgStore {
    pub async fn connect(database_url: &str, op_timeout: Duration) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(op_timeout)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool, op_timeout))
    }

    pub fn from_pool(pool: PgPool, op_timeout: Duration) -> Self {
        Self {
            pool,
            op_timeout,
            erase_timeout: op_timeout,
        }
    }

    pub fn with_erase_timeout(mut self, erase_timeout: Duration) -> Self {
        self.erase_timeout = erase_timeout;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Begin a transaction whose lock waits and statements are bounded.
    async fn begin_bounded(&self) -> AppResult<Transaction<'static, Postgres>> {
        self.begin_with_limit(self.op_timeout).await
    }

    async fn begin_with_limit(&self, limit: Duration) -> AppResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        let limit = format!("{}ms", limit.as_millis());
        sqlx::query(
            "SELECT set_config('lock_timeout', $1, true), set_config('statement_timeout', $1, true)",
        )
        .bind(&limit)
        .execute(&mut *tx)
        .await?;
        Ok(tx)
    }

    /// Lock the request row for the rest of the transaction.
    async fn lock_request(
        tx: &mut Transaction<'static, Postgres>,
        id: Uuid,
    ) -> AppResult<Option<DeletionRequest>> {
        let row = sqlx::query_as::<_, DeletionRequest>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM deletion_request WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row)
    }

    async fn confirmations_of(
        tx: &mut Transaction<'static, Postgres>,
        id: Uuid,
    ) -> AppResult<Vec<DeletionConfirmation>> {
        let rows = sqlx::query_as::<_, DeletionConfirmation>(&format!(
            "SELECT {CONFIRMATION_COLUMNS} FROM deletion_confirmation
             WHERE deletion_request_id = $1 ORDER BY approver_id"
        ))
        .bind(id)
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows)
    }

    async fn set_state(
        tx: &mut Transaction<'static, Postgres>,
        id: Uuid,
        from: DeletionState,
        to: DeletionState,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let resolved_at = to.is_terminal().then_some(now);
        let result = sqlx::query(
            "UPDATE deletion_request SET state = $1, resolved_at = COALESCE($2, resolved_at)
             WHERE id = $3 AND state = $4",
        )
        .bind(to)
        .bind(resolved_at)
        .bind(id)
        .bind(from)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Locks the request, checks scope and finds the confirmation for the code.
    async fn locate(
        tx: &mut Transaction<'static, Postgres>,
        id: Uuid,
        scope: &Scope,
        code_digest: &str,
    ) -> AppResult<Option<(DeletionRequest, DeletionConfirmation)>> {
        let Some(request) = Self::lock_request(tx, id).await? else {
            return Ok(None);
        };
        if !request.in_scope(scope) {
            return Ok(None);
        }
        let rows = Self::confirmations_of(tx, id).await?;
        Ok(code::find_match(&rows, code_digest)
            .cloned()
            .map(|c| (request, c)))
    }
}

#[async_trait]
impl DeletionStore for PgStore {
    async fn insert_request(
        &self,
        request: &NewDeletionRequest,
        confirmations: &[NewDeletionConfirmation],
    ) -> AppResult<(DeletionRequest, Vec<DeletionConfirmation>)> {
        let mut tx = self.begin_bounded().await?;

        let inserted = sqlx::query_as::<_, DeletionRequest>(&format!(
            r#"INSERT INTO deletion_request
                   (id, project_id, resource_kind, resource_id, requested_by, created_at, backoff_interval_secs, state)
               VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
               RETURNING {REQUEST_COLUMNS}"#
        ))
        .bind(request.id)
        .bind(&request.resource.project_id)
        .bind(request.resource.kind)
        .bind(&request.resource.id)
        .bind(&request.requested_by)
        .bind(request.created_at)
        .bind(request.backoff_interval_secs)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match AppError::from(e) {
            AppError::Conflict(_) => AppError::Conflict(format!(
                "a deletion request is already outstanding for {} {}",
                request.resource.kind, request.resource.id
            )),
            other => other,
        })?;

        let mut rows = Vec::with_capacity(confirmations.len());
        for c in confirmations {
            let row = sqlx::query_as::<_, DeletionConfirmation>(&format!(
                r#"INSERT INTO deletion_confirmation (id, deletion_request_id, approver_id, visible_code)
                   VALUES ($1, $2, $3, $4)
                   RETURNING {CONFIRMATION_COLUMNS}"#
            ))
            .bind(c.id)
            .bind(inserted.id)
            .bind(&c.approver_id)
            .bind(&c.code_digest)
            .fetch_one(&mut *tx)
            .await?;
            rows.push(row);
        }

        tx.commit().await?;
        Ok((inserted, rows))
    }

    async fn find_active(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> AppResult<Option<DeletionRequest>> {
        let row = sqlx::query_as::<_, DeletionRequest>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM deletion_request
             WHERE resource_kind = $1 AND resource_id = $2 AND state IN ('pending', 'approved')"
        ))
        .bind(kind)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn load(
        &self,
        id: Uuid,
    ) -> AppResult<Option<(DeletionRequest, Vec<DeletionConfirmation>)>> {
        let Some(request) = sqlx::query_as::<_, DeletionRequest>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM deletion_request WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let rows = sqlx::query_as::<_, DeletionConfirmation>(&format!(
            "SELECT {CONFIRMATION_COLUMNS} FROM deletion_confirmation
             WHERE deletion_request_id = $1 ORDER BY approver_id"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some((request, rows)))
    }

    async fn confirm(
        &self,
        id: Uuid,
        scope: &Scope,
        code_digest: &str,
        now: DateTime<Utc>,
    ) -> AppResult<ConfirmOutcome> {
        let mut tx = self.begin_bounded().await?;

        let Some((mut request, matched)) = Self::locate(&mut tx, id, scope, code_digest).await?
        else {
            return Ok(ConfirmOutcome::NoMatch);
        };

        if matched.is_confirmed() {
            return Ok(ConfirmOutcome::AlreadyConfirmed(request));
        }
        if request.state != DeletionState::Pending {
            return Ok(ConfirmOutcome::Closed {
                request,
                lapsed: false,
            });
        }
        if request.is_stale(now) {
            Self::set_state(&mut tx, id, DeletionState::Pending, DeletionState::Expired, now)
                .await?;
            tx.commit().await?;
            request.state = DeletionState::Expired;
            request.resolved_at = Some(now);
            return Ok(ConfirmOutcome::Closed {
                request,
                lapsed: true,
            });
        }

        let written = sqlx::query(
            "UPDATE deletion_confirmation SET confirmed_at = $1
             WHERE id = $2 AND confirmed_at IS NULL",
        )
        .bind(now)
        .bind(matched.id)
        .execute(&mut *tx)
        .await?;
        if written.rows_affected() == 0 {
            return Ok(ConfirmOutcome::AlreadyConfirmed(request));
        }

        let outstanding: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deletion_confirmation
             WHERE deletion_request_id = $1 AND confirmed_at IS NULL",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        let quorum_reached = outstanding == 0
            && Self::set_state(&mut tx, id, DeletionState::Pending, DeletionState::Approved, now)
                .await?;
        tx.commit().await?;

        if quorum_reached {
            request.state = DeletionState::Approved;
        }
        Ok(ConfirmOutcome::Recorded {
            request,
            approver_id: matched.approver_id,
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
        let mut tx = self.begin_bounded().await?;

        let Some((mut request, matched)) = Self::locate(&mut tx, id, scope, code_digest).await?
        else {
            return Ok(RejectOutcome::NoMatch);
        };

        match request.state {
            DeletionState::Rejected => return Ok(RejectOutcome::AlreadyRejected(request)),
            DeletionState::Pending => {}
            _ => {
                return Ok(RejectOutcome::Closed {
                    request,
                    lapsed: false,
                })
            }
        }

        let (to, lapsed) = if request.is_stale(now) {
            (DeletionState::Expired, true)
        } else {
            (DeletionState::Rejected, false)
        };
        Self::set_state(&mut tx, id, DeletionState::Pending, to, now).await?;
        tx.commit().await?;
        request.state = to;
        request.resolved_at = Some(now);

        if lapsed {
            Ok(RejectOutcome::Closed { request, lapsed })
        } else {
            Ok(RejectOutcome::Rejected {
                request,
                approver_id: matched.approver_id,
            })
        }
    }

    async fn claim_execution(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> AppResult<Option<DeletionRequest>> {
        let mut tx = self.begin_bounded().await?;
        let claimed = sqlx::query_as::<_, DeletionRequest>(&format!(
            r#"UPDATE deletion_request
               SET executing_since = $2
               WHERE id = $1
                 AND state = 'approved'
                 AND (executing_since IS NULL OR executing_since <= $3)
               RETURNING {REQUEST_COLUMNS}"#
        ))
        .bind(id)
        .bind(now)
        .bind(now - lease)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(claimed)
    }

    async fn release_execution(&self, id: Uuid) -> AppResult<()> {
        let mut tx = self.begin_bounded().await?;
        sqlx::query(
            "UPDATE deletion_request SET executing_since = NULL
             WHERE id = $1 AND state = 'approved'",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_executed(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        let mut tx = self.begin_bounded().await?;
        let moved =
            Self::set_state(&mut tx, id, DeletionState::Approved, DeletionState::Executed, now)
                .await?;
        tx.commit().await?;
        Ok(moved)
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> AppResult<Vec<DeletionRequest>> {
        let mut tx = self.begin_bounded().await?;
        // Rows locked by an in-flight approval are waited on, then re-checked.
        let rows = sqlx::query_as::<_, DeletionRequest>(&format!(
            r#"UPDATE deletion_request
               SET state = 'expired', resolved_at = $1
               WHERE state = 'pending'
                 AND created_at + make_interval(secs => backoff_interval_secs::double precision) <= $1
               RETURNING {REQUEST_COLUMNS}"#
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rows)
    }

    async fn list_approved(&self) -> AppResult<Vec<DeletionRequest>> {
        let rows = sqlx::query_as::<_, DeletionRequest>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM deletion_request
             WHERE state = 'approved' ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn purge_resolved(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut tx = self.begin_bounded().await?;
        let result = sqlx::query(
            "DELETE FROM deletion_request
             WHERE state IN ('executed', 'expired', 'rejected') AND resolved_at < $1",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

// -- Environment collaborators --

#[async_trait]
impl ResourceInspector for PgStore {
    async fn has_dependents(&self, resource: &Resource) -> anyhow::Result<bool> {
        match resource.kind {
            ResourceKind::Environment => {
                let exists = sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM action WHERE project_id = $1 AND environment_id = $2)",
                )
                .bind(&resource.project_id)
                .bind(&resource.id)
                .fetch_one(&self.pool)
                .await?;
                Ok(exists)
            }
        }
    }
}

impl PgStore {
    /// Delete an environment's dependents and the environment row inside
    /// `tx`. Returns (dependent rows removed, environment rows removed).
    async fn delete_environment_rows(
        tx: &mut Transaction<'static, Postgres>,
        resource: &Resource,
    ) -> AppResult<(u64, u64)> {
        let mut removed = 0u64;
        for stmt in [
            "DELETE FROM action WHERE environment_id = $1",
            "DELETE FROM token WHERE environment_id = $1",
            "DELETE FROM environmentuser WHERE environment_id = $1",
        ] {
            removed += sqlx::query(stmt)
                .bind(&resource.id)
                .execute(&mut **tx)
                .await?
                .rows_affected();
        }
        let env = sqlx::query("DELETE FROM environment WHERE id = $1 AND project_id = $2")
            .bind(&resource.id)
            .bind(&resource.project_id)
            .execute(&mut **tx)
            .await?;
        Ok((removed, env.rows_affected()))
    }

    fn log_erased(resource: &Resource, dependents: u64, environments: u64) {
        if environments == 0 {
            tracing::warn!(
                environment_id = %resource.id,
                "environment already deleted, nothing to erase"
            );
        } else {
            tracing::info!(
                environment_id = %resource.id,
                project_id = %resource.project_id,
                dependents_removed = dependents,
                "environment erased"
            );
        }
    }
}

#[async_trait]
impl ResourceEraser for PgStore {
    /// Deletes the environment and everything recorded under it. Re-running
    /// against an already deleted environment deletes nothing and succeeds.
    async fn erase(&self, resource: &Resource) -> anyhow::Result<()> {
        match resource.kind {
            ResourceKind::Environment => {
                let mut tx = self.begin_with_limit(self.erase_timeout).await?;
                let (dependents, environments) =
                    Self::delete_environment_rows(&mut tx, resource).await?;
                tx.commit().await?;
                Self::log_erased(resource, dependents, environments);
                Ok(())
            }
        }
    }

    /// Locks the environment row before checking for events. Inserts into
    /// `action` take a key-share lock on it through the foreign key, so an
    /// event cannot land between the check and the delete.
    async fn erase_if_empty(&self, resource: &Resource) -> anyhow::Result<bool> {
        match resource.kind {
            ResourceKind::Environment => {
                let mut tx = self.begin_with_limit(self.erase_timeout).await?;
                sqlx::query("SELECT id FROM environment WHERE id = $1 AND project_id = $2 FOR UPDATE")
                    .bind(&resource.id)
                    .bind(&resource.project_id)
                    .fetch_optional(&mut *tx)
                    .await?;
                let has_events = sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM action WHERE project_id = $1 AND environment_id = $2)",
                )
                .bind(&resource.project_id)
                .bind(&resource.id)
                .fetch_one(&mut *tx)
                .await?;
                if has_events {
                    tx.rollback().await?;
                    return Ok(false);
                }
                let (dependents, environments) =
                    Self::delete_environment_rows(&mut tx, resource).await?;
                tx.commit().await?;
                Self::log_erased(resource, dependents, environments);
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl ApproverDirectory for PgStore {
    async fn approvers_for(&self, resource: &Resource) -> anyhow::Result<Vec<String>> {
        match resource.kind {
            ResourceKind::Environment => {
                let ids = sqlx::query_scalar::<_, String>(
                    "SELECT user_id FROM environmentuser WHERE environment_id = $1 ORDER BY user_id",
                )
                .bind(&resource.id)
                .fetch_all(&self.pool)
                .await?;
                Ok(ids)
            }
        }
    }
}
