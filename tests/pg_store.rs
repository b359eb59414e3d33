//! Postgres store integration tests.
//!
//! Each test gets a fresh database with `migrations/` applied. Requires
//! `DATABASE_URL` to point at a server the test user may create databases on:
//! `cargo test --test pg_store`.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use deletion_gate::deletion::code::ConfirmationCode;
use deletion_gate::deletion::ResourceEraser;
use deletion_gate::errors::AppError;
use deletion_gate::models::deletion::{
    DeletionState, NewDeletionConfirmation, NewDeletionRequest, Resource, ResourceKind,
};
use deletion_gate::store::postgres::PgStore;
use deletion_gate::store::{ConfirmOutcome, DeletionStore};

fn store(pool: PgPool) -> PgStore {
    PgStore::from_pool(pool, Duration::from_secs(5))
}

fn new_request(resource: &Resource, backoff_secs: i64) -> NewDeletionRequest {
    NewDeletionRequest {
        id: Uuid::new_v4(),
        resource: resource.clone(),
        requested_by: "admin".into(),
        created_at: Utc::now(),
        backoff_interval_secs: backoff_secs,
    }
}

fn confirmation(approver: &str, code: &ConfirmationCode) -> NewDeletionConfirmation {
    NewDeletionConfirmation {
        id: Uuid::new_v4(),
        approver_id: approver.into(),
        code_digest: code.digest(),
    }
}

async fn seed_environment(pool: &PgPool, project_id: &str, environment_id: &str) {
    sqlx::query("INSERT INTO project (id, name) VALUES ($1, $1) ON CONFLICT DO NOTHING")
        .bind(project_id)
        .execute(pool)
        .await
        .expect("Failed to insert project");
    sqlx::query("INSERT INTO environment (id, project_id, name) VALUES ($1, $2, $1)")
        .bind(environment_id)
        .bind(project_id)
        .execute(pool)
        .await
        .expect("Failed to insert environment");
}

async fn record_event(pool: &PgPool, project_id: &str, environment_id: &str) {
    sqlx::query("INSERT INTO action (id, project_id, environment_id) VALUES ($1, $2, $3)")
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(environment_id)
        .execute(pool)
        .await
        .expect("Failed to insert action");
}

// ========================================================================
// Requests
// ========================================================================

#[sqlx::test(migrations = "./migrations")]
async fn test_second_active_request_hits_unique_index(pool: PgPool) {
    let store = store(pool);
    let env = Resource::environment("p1", "env-1");
    let code = ConfirmationCode::generate();

    let (first, _) = store
        .insert_request(&new_request(&env, 3600), &[confirmation("u1", &code)])
        .await
        .expect("Failed to insert request");

    let err = store
        .insert_request(&new_request(&env, 3600), &[confirmation("u1", &code)])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)), "got {err:?}");

    // A terminal request frees the resource.
    let expired = store
        .expire_stale(first.created_at + ChronoDuration::hours(1))
        .await
        .expect("Query failed");
    assert_eq!(expired.len(), 1);
    store
        .insert_request(&new_request(&env, 3600), &[confirmation("u1", &code)])
        .await
        .expect("Resource should be free after expiry");
}

#[sqlx::test(migrations = "./migrations")]
async fn test_find_active_and_load(pool: PgPool) {
    let store = store(pool);
    let env = Resource::environment("p1", "env-1");
    let code = ConfirmationCode::generate();
    let (req, rows) = store
        .insert_request(
            &new_request(&env, 3600),
            &[confirmation("u2", &code), confirmation("u1", &code)],
        )
        .await
        .expect("Failed to insert request");
    assert_eq!(rows.len(), 2);
    assert_eq!(req.state, DeletionState::Pending);
    assert_eq!(req.executing_since, None);

    let active = store
        .find_active(ResourceKind::Environment, "env-1")
        .await
        .expect("Query failed")
        .expect("Request not found");
    assert_eq!(active.id, req.id);

    let (_, loaded) = store.load(req.id).await.expect("Query failed").expect("Request not found");
    let approvers: Vec<_> = loaded.iter().map(|c| c.approver_id.as_str()).collect();
    assert_eq!(approvers, vec!["u1", "u2"]);
    assert!(loaded.iter().all(|c| c.visible_code == code.digest()));
}

// ========================================================================
// Confirmations
// ========================================================================

#[sqlx::test(migrations = "./migrations")]
async fn test_confirm_sets_confirmed_at_once(pool: PgPool) {
    let store = store(pool);
    let env = Resource::environment("p1", "env-1");
    let a = ConfirmationCode::generate();
    let b = ConfirmationCode::generate();
    let (req, _) = store
        .insert_request(
            &new_request(&env, 3600),
            &[confirmation("u1", &a), confirmation("u2", &b)],
        )
        .await
        .expect("Failed to insert request");

    let first_at = Utc::now();
    let first = store
        .confirm(req.id, &env.scope(), &a.digest(), first_at)
        .await
        .expect("Query failed");
    assert!(matches!(
        first,
        ConfirmOutcome::Recorded { quorum_reached: false, .. }
    ));

    let again = store
        .confirm(req.id, &env.scope(), &a.digest(), first_at + ChronoDuration::minutes(5))
        .await
        .expect("Query failed");
    assert!(matches!(again, ConfirmOutcome::AlreadyConfirmed(_)));

    let (_, rows) = store.load(req.id).await.expect("Query failed").expect("Request not found");
    let u1 = rows.iter().find(|c| c.approver_id == "u1").expect("u1 row missing");
    let stored = u1.confirmed_at.expect("u1 should be confirmed");
    assert!((stored - first_at).num_milliseconds().abs() < 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_wrong_code_or_scope_does_not_match(pool: PgPool) {
    let store = store(pool);
    let env = Resource::environment("p1", "env-1");
    let a = ConfirmationCode::generate();
    let (req, _) = store
        .insert_request(&new_request(&env, 3600), &[confirmation("u1", &a)])
        .await
        .expect("Failed to insert request");

    let other = ConfirmationCode::generate();
    let outcome = store
        .confirm(req.id, &env.scope(), &other.digest(), Utc::now())
        .await
        .expect("Query failed");
    assert!(matches!(outcome, ConfirmOutcome::NoMatch));

    let foreign = Resource::environment("p2", "env-1").scope();
    let outcome = store
        .confirm(req.id, &foreign, &a.digest(), Utc::now())
        .await
        .expect("Query failed");
    assert!(matches!(outcome, ConfirmOutcome::NoMatch));
}

/// Both approvers confirm at once on separate connections: the row lock
/// serializes the quorum check, so exactly one call sees it reached.
#[sqlx::test(migrations = "./migrations")]
async fn test_concurrent_confirms_reach_quorum_once(pool: PgPool) {
    let store = store(pool);
    let env = Resource::environment("p1", "env-1");
    let a = ConfirmationCode::generate();
    let b = ConfirmationCode::generate();
    let (req, _) = store
        .insert_request(
            &new_request(&env, 3600),
            &[confirmation("u1", &a), confirmation("u2", &b)],
        )
        .await
        .expect("Failed to insert request");
    let scope = env.scope();
    let now = Utc::now();

    let s1 = store.clone();
    let s2 = store.clone();
    let (da, db) = (a.digest(), b.digest());
    let scope1 = scope.clone();
    let scope2 = scope.clone();
    let first = tokio::spawn(async move { s1.confirm(req.id, &scope1, &da, now).await });
    let second = tokio::spawn(async move { s2.confirm(req.id, &scope2, &db, now).await });
    let outcomes = [
        first.await.expect("task panicked").expect("Query failed"),
        second.await.expect("task panicked").expect("Query failed"),
    ];

    let reached = outcomes
        .iter()
        .filter(|o| matches!(o, ConfirmOutcome::Recorded { quorum_reached: true, .. }))
        .count();
    assert_eq!(reached, 1);

    let (loaded, _) = store.load(req.id).await.expect("Query failed").expect("Request not found");
    assert_eq!(loaded.state, DeletionState::Approved);
}

/// The same code submitted twice at once: one write, one no-op.
#[sqlx::test(migrations = "./migrations")]
async fn test_concurrent_same_code_writes_once(pool: PgPool) {
    let store = store(pool);
    let env = Resource::environment("p1", "env-1");
    let a = ConfirmationCode::generate();
    let b = ConfirmationCode::generate();
    let (req, _) = store
        .insert_request(
            &new_request(&env, 3600),
            &[confirmation("u1", &a), confirmation("u2", &b)],
        )
        .await
        .expect("Failed to insert request");
    let scope = env.scope();
    let now = Utc::now();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let s = store.clone();
            let scope = scope.clone();
            let digest = a.digest();
            tokio::spawn(async move { s.confirm(req.id, &scope, &digest, now).await })
        })
        .collect();
    let mut recorded = 0;
    let mut already = 0;
    for handle in handles {
        match handle.await.expect("task panicked").expect("Query failed") {
            ConfirmOutcome::Recorded { .. } => recorded += 1,
            ConfirmOutcome::AlreadyConfirmed(_) => already += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!((recorded, already), (1, 1));
}

#[sqlx::test(migrations = "./migrations")]
async fn test_late_confirm_expires_request(pool: PgPool) {
    let store = store(pool);
    let env = Resource::environment("p1", "env-1");
    let a = ConfirmationCode::generate();
    let (req, _) = store
        .insert_request(&new_request(&env, 3600), &[confirmation("u1", &a)])
        .await
        .expect("Failed to insert request");

    let outcome = store
        .confirm(req.id, &env.scope(), &a.digest(), req.created_at + ChronoDuration::hours(2))
        .await
        .expect("Query failed");
    assert!(matches!(outcome, ConfirmOutcome::Closed { lapsed: true, .. }));

    let (loaded, _) = store.load(req.id).await.expect("Query failed").expect("Request not found");
    assert_eq!(loaded.state, DeletionState::Expired);
    assert!(loaded.resolved_at.is_some());
}

// ========================================================================
// Expiry, execution and purge
// ========================================================================

#[sqlx::test(migrations = "./migrations")]
async fn test_expire_stale_respects_backoff_interval(pool: PgPool) {
    let store = store(pool);
    let env = Resource::environment("p1", "env-1");
    let code = ConfirmationCode::generate();
    let (req, _) = store
        .insert_request(&new_request(&env, 3600), &[confirmation("u1", &code)])
        .await
        .expect("Failed to insert request");

    let early = store
        .expire_stale(req.created_at + ChronoDuration::minutes(59))
        .await
        .expect("Query failed");
    assert!(early.is_empty());

    let due = store
        .expire_stale(req.created_at + ChronoDuration::hours(1))
        .await
        .expect("Query failed");
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, req.id);
    assert_eq!(due[0].state, DeletionState::Expired);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_execution_lease_and_mark_executed(pool: PgPool) {
    let store = store(pool);
    let env = Resource::environment("p1", "env-1");
    let a = ConfirmationCode::generate();
    let (req, _) = store
        .insert_request(&new_request(&env, 3600), &[confirmation("u1", &a)])
        .await
        .expect("Failed to insert request");
    let now = Utc::now();
    let lease = ChronoDuration::minutes(15);

    assert!(store.claim_execution(req.id, now, lease).await.expect("Query failed").is_none());
    store
        .confirm(req.id, &env.scope(), &a.digest(), now)
        .await
        .expect("Query failed");

    let claimed = store
        .claim_execution(req.id, now, lease)
        .await
        .expect("Query failed")
        .expect("Lease should be free");
    assert!(claimed.executing_since.is_some());
    assert!(store
        .claim_execution(req.id, now + ChronoDuration::minutes(1), lease)
        .await
        .expect("Query failed")
        .is_none());

    store.release_execution(req.id).await.expect("Query failed");
    assert!(store
        .claim_execution(req.id, now + ChronoDuration::minutes(2), lease)
        .await
        .expect("Query failed")
        .is_some());

    assert!(store.mark_executed(req.id, now).await.expect("Query failed"));
    assert!(!store.mark_executed(req.id, now).await.expect("Query failed"));
    assert!(store
        .claim_execution(req.id, now + ChronoDuration::hours(1), lease)
        .await
        .expect("Query failed")
        .is_none());
}

#[sqlx::test(migrations = "./migrations")]
async fn test_purge_cascades_to_confirmations(pool: PgPool) {
    let store = store(pool.clone());
    let env = Resource::environment("p1", "env-1");
    let code = ConfirmationCode::generate();
    let (req, _) = store
        .insert_request(
            &new_request(&env, 3600),
            &[confirmation("u1", &code), confirmation("u2", &code)],
        )
        .await
        .expect("Failed to insert request");
    let resolved_at = req.created_at + ChronoDuration::hours(1);
    store.expire_stale(resolved_at).await.expect("Query failed");

    let kept = store
        .purge_resolved(resolved_at - ChronoDuration::seconds(1))
        .await
        .expect("Query failed");
    assert_eq!(kept, 0);

    let removed = store
        .purge_resolved(resolved_at + ChronoDuration::seconds(1))
        .await
        .expect("Query failed");
    assert_eq!(removed, 1);

    let orphans: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM deletion_confirmation WHERE deletion_request_id = $1",
    )
    .bind(req.id)
    .fetch_one(&pool)
    .await
    .expect("Query failed");
    assert_eq!(orphans, 0);
}

// ========================================================================
// Environment collaborators
// ========================================================================

#[sqlx::test(migrations = "./migrations")]
async fn test_erase_if_empty_refuses_environment_with_events(pool: PgPool) {
    let store = store(pool.clone());
    seed_environment(&pool, "p1", "env-busy").await;
    seed_environment(&pool, "p1", "env-idle").await;
    record_event(&pool, "p1", "env-busy").await;

    let busy = Resource::environment("p1", "env-busy");
    assert!(!store.erase_if_empty(&busy).await.expect("Erase failed"));
    let still_there: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM environment WHERE id = 'env-busy')")
            .fetch_one(&pool)
            .await
            .expect("Query failed");
    assert!(still_there);

    let idle = Resource::environment("p1", "env-idle");
    assert!(store.erase_if_empty(&idle).await.expect("Erase failed"));
    let gone: bool =
        sqlx::query_scalar("SELECT NOT EXISTS(SELECT 1 FROM environment WHERE id = 'env-idle')")
            .fetch_one(&pool)
            .await
            .expect("Query failed");
    assert!(gone);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_erase_removes_dependents_and_is_idempotent(pool: PgPool) {
    let store = store(pool.clone());
    seed_environment(&pool, "p1", "env-1").await;
    record_event(&pool, "p1", "env-1").await;
    record_event(&pool, "p1", "env-1").await;

    let env = Resource::environment("p1", "env-1");
    store.erase(&env).await.expect("Erase failed");
    store.erase(&env).await.expect("Second erase should be a no-op");

    let events: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM action WHERE environment_id = 'env-1'")
            .fetch_one(&pool)
            .await
            .expect("Query failed");
    assert_eq!(events, 0);
}
