use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::info;

use crate::db::DesiredStateSource;
use crate::identity;
use crate::middleware::auth::RequireKeyAuth;
use crate::types::{DatabaseRequest, DatabaseSpec, RequestKey};
use crate::{ProvisionerError, router::ProvisionerState};

/// PUT /v1/namespaces/{namespace}/databases/{name} -> create or replace desired state.
pub async fn apply_database(
    _auth: RequireKeyAuth,
    State(state): State<ProvisionerState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(spec): Json<DatabaseSpec>,
) -> Result<Json<DatabaseRequest>, ProvisionerError> {
    let key = RequestKey::new(namespace, name);
    identity::validate(&key)?;
    let request = state.store.apply_request(&key, &spec).await?;
    info!(request = %key, extensions = ?spec.extensions, "request applied");
    Ok(Json(request))
}

/// GET /v1/namespaces/{namespace}/databases/{name} -> desired state and status.
pub async fn get_database(
    _auth: RequireKeyAuth,
    State(state): State<ProvisionerState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<DatabaseRequest>, ProvisionerError> {
    let key = RequestKey::new(namespace, name);
    DesiredStateSource::get(&state.store, &key)
        .await?
        .map(Json)
        .ok_or_else(|| ProvisionerError::NotFound(format!("request {key}")))
}

/// DELETE /v1/namespaces/{namespace}/databases/{name}.
///
/// The credential record goes with the request. Role and database stay on the server.
pub async fn delete_database(
    _auth: RequireKeyAuth,
    State(state): State<ProvisionerState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<StatusCode, ProvisionerError> {
    let key = RequestKey::new(namespace, name);
    if !state.store.delete_request(&key).await? {
        return Err(ProvisionerError::NotFound(format!("request {key}")));
    }
    info!(request = %key, "request deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/namespaces/{namespace}/databases/{name}/rotate -> issue a new password.
pub async fn rotate_credentials(
    _auth: RequireKeyAuth,
    State(state): State<ProvisionerState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<StatusCode, ProvisionerError> {
    let key = RequestKey::new(namespace, name);
    let names = identity::derive(&key)?;
    state.store.request_rotation(&names.secret_key).await?;
    info!(request = %key, "credential rotation requested");
    Ok(StatusCode::ACCEPTED)
}
