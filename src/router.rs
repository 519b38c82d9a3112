use axum::{
    Router,
    routing::{post, put},
};
use std::sync::Arc;

use crate::db::ObjectStore;
use crate::handlers::databases::{
    apply_database, delete_database, get_database, rotate_credentials,
};

#[derive(Clone)]
pub struct ProvisionerState {
    pub store: ObjectStore,
    pub api_key: Arc<str>,
}

impl ProvisionerState {
    pub fn new(store: ObjectStore, api_key: impl Into<Arc<str>>) -> Self {
        Self {
            store,
            api_key: api_key.into(),
        }
    }
}

pub fn provisioner_router(state: ProvisionerState) -> Router {
    Router::new()
        .route(
            "/v1/namespaces/{namespace}/databases/{name}",
            put(apply_database)
                .get(get_database)
                .delete(delete_database),
        )
        .route(
            "/v1/namespaces/{namespace}/databases/{name}/rotate",
            post(rotate_credentials),
        )
        .with_state(state)
}
