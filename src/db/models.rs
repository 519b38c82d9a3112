use crate::error::ProvisionerError;
use crate::types::{
    CredentialRecord, DatabaseRequest, DatabaseSpec, DatabaseStatus, RequestKey, SecretKey,
};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct DbRequest {
    pub namespace: String,
    pub name: String,
    pub engine: String,
    pub extensions: String,
    pub provisioned: Option<bool>,
}

impl TryFrom<DbRequest> for DatabaseRequest {
    type Error = ProvisionerError;

    fn try_from(row: DbRequest) -> Result<Self, Self::Error> {
        let engine = row
            .engine
            .parse()
            .map_err(|e: String| sqlx::Error::Decode(e.into()))?;
        let extensions: Vec<String> = serde_json::from_str(&row.extensions)?;
        Ok(DatabaseRequest {
            key: RequestKey::new(row.namespace, row.name),
            spec: DatabaseSpec { engine, extensions },
            status: DatabaseStatus {
                provisioned: row.provisioned,
            },
        })
    }
}

#[derive(Clone, FromRow)]
pub struct DbCredentialRecord {
    pub namespace: String,
    pub name: String,
    pub owner_namespace: String,
    pub owner_name: String,
    pub host: String,
    pub port: i64,
    pub database: String,
    pub username: String,
    pub password: String,
    pub generation: i64,
    pub rotated_at: DateTime<Utc>,
    pub rotate_requested: bool,
}

impl TryFrom<DbCredentialRecord> for CredentialRecord {
    type Error = ProvisionerError;

    fn try_from(row: DbCredentialRecord) -> Result<Self, Self::Error> {
        let port = u16::try_from(row.port).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(CredentialRecord {
            key: SecretKey {
                namespace: row.namespace,
                name: row.name,
            },
            owner: RequestKey::new(row.owner_namespace, row.owner_name),
            host: row.host,
            port,
            database: row.database,
            username: row.username,
            password: row.password,
            generation: row.generation,
            rotated_at: row.rotated_at,
            rotate_requested: row.rotate_requested,
        })
    }
}
