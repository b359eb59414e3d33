use sqlx::PgPool;

use crate::deletion::AuditSink;
use crate::models::audit::AuditEvent;

/// Audit sink backed by `admin_audit_log`. Each event is written from its own
/// Tokio task so the request path never waits on the insert.
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl AuditSink for PgAuditSink {
    fn record(&self, event: AuditEvent) {
        log_async(self.pool.clone(), event);
    }
}

pub fn log_async(pool: PgPool, event: AuditEvent) {
    tokio::spawn(async move {
        if let Err(e) = insert_audit_event(&pool, &event).await {
            tracing::error!(
                action = %event.action,
                target = %event.target,
                "failed to write audit log: {}",
                e
            );
        } else {
            tracing::debug!(action = %event.action, target = %event.target, "audit log recorded");
        }
    });
}

async fn insert_audit_event(pool: &PgPool, event: &AuditEvent) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO admin_audit_log (id, occurred_at, actor_id, action, target, fields)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(uuid::Uuid::new_v4())
    .bind(event.occurred_at)
    .bind(&event.actor_id)
    .bind(&event.action)
    .bind(&event.target)
    .bind(&event.fields)
    .execute(pool)
    .await?;

    Ok(())
}
