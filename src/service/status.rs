use crate::db::DesiredStateSource;
use crate::error::ProvisionerError;
use crate::types::{DatabaseStatus, RequestKey, StatusPatch};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// The status already matched; nothing was written.
    Unchanged,
    Patched,
    /// The request disappeared before the patch landed.
    Gone,
}

/// Reflects convergence back onto a request's observed state.
#[derive(Clone)]
pub struct StatusUpdater {
    source: Arc<dyn DesiredStateSource>,
}

impl StatusUpdater {
    pub fn new(source: Arc<dyn DesiredStateSource>) -> Self {
        Self { source }
    }

    /// Set `provisioned = true`. Never writes `false`.
    pub async fn mark_provisioned(
        &self,
        key: &RequestKey,
        current: &DatabaseStatus,
    ) -> Result<StatusUpdate, ProvisionerError> {
        let patch = StatusPatch::provisioned();
        if patch.is_satisfied_by(current) {
            return Ok(StatusUpdate::Unchanged);
        }
        if self.source.patch_status(key, &patch).await? {
            debug!(request = %key, "marked provisioned");
            Ok(StatusUpdate::Patched)
        } else {
            Ok(StatusUpdate::Gone)
        }
    }
}
