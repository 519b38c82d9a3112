use crate::error::ProvisionerError;
use crate::types::{CredentialRecord, DatabaseRequest, RequestKey, SecretKey, StatusPatch};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Where desired state comes from and observed status goes back to.
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    async fn get(&self, key: &RequestKey) -> Result<Option<DatabaseRequest>, ProvisionerError>;

    async fn list_keys(&self) -> Result<Vec<RequestKey>, ProvisionerError>;

    /// Change notifications for desired state (not for status patches).
    fn watch(&self) -> broadcast::Receiver<RequestKey>;

    /// Merge-patch the status. Returns `false` when the request no longer exists.
    async fn patch_status(
        &self,
        key: &RequestKey,
        patch: &StatusPatch,
    ) -> Result<bool, ProvisionerError>;
}

/// Key-value store for credential records.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &SecretKey) -> Result<Option<CredentialRecord>, ProvisionerError>;

    /// Fails with [`ProvisionerError::AlreadyExists`] if the key is taken.
    async fn create(&self, record: &CredentialRecord) -> Result<(), ProvisionerError>;

    /// Replace the record, but only if it still matches `previous` (generation
    /// and rotation marker as read earlier). Fails with
    /// [`ProvisionerError::Conflict`] when it changed or disappeared meanwhile.
    async fn update(
        &self,
        record: &CredentialRecord,
        previous: &CredentialRecord,
    ) -> Result<(), ProvisionerError>;
}
