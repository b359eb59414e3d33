use std::sync::Arc;

use crate::errors::{AppError, AppResult};
use crate::models::deletion::Resource;

use super::ResourceInspector;

/// Decides whether a resource may be deleted without the approval workflow.
///
/// Only a resource with no dependent data at all bypasses approval; a single
/// recorded row is enough to require confirmation.
#[derive(Clone)]
pub struct ResourceGate {
    inspector: Arc<dyn ResourceInspector>,
}

impl ResourceGate {
    pub fn new(inspector: Arc<dyn ResourceInspector>) -> Self {
        Self { inspector }
    }

    pub async fn can_delete_immediately(&self, resource: &Resource) -> AppResult<bool> {
        let has_dependents = self
            .inspector
            .has_dependents(resource)
            .await
            .map_err(|e| {
                AppError::Internal(e.context(format!(
                    "dependents check failed for {} {}",
                    resource.kind, resource.id
                )))
            })?;
        tracing::debug!(
            resource_kind = %resource.kind,
            resource_id = %resource.id,
            has_dependents,
            "resource gate evaluated"
        );
        Ok(!has_dependents)
    }
}
