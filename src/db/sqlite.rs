use crate::db::models::{DbCredentialRecord, DbRequest};
use crate::db::schema::SQLITE_INIT;
use crate::db::traits::{CredentialStore, DesiredStateSource};
use crate::error::ProvisionerError;
use crate::types::{
    CredentialRecord, DatabaseRequest, DatabaseSpec, RequestKey, SecretKey, StatusPatch,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::debug;

pub type SqlitePool = Pool<Sqlite>;

const WATCH_CAPACITY: usize = 1024;

const SELECT_REQUEST: &str = r#"SELECT namespace, name, engine, extensions, provisioned
    FROM database_requests WHERE namespace = ? AND name = ?"#;

const SELECT_CREDENTIAL: &str = r#"SELECT namespace, name, owner_namespace, owner_name,
    host, port, database, username, password, generation, rotated_at, rotate_requested
    FROM credential_records WHERE namespace = ? AND name = ?"#;

/// SQLite-backed object store holding requests and their credential records.
#[derive(Clone)]
pub struct ObjectStore {
    pool: SqlitePool,
    changes: broadcast::Sender<RequestKey>,
}

impl ObjectStore {
    pub fn new(pool: SqlitePool) -> Self {
        let (changes, _) = broadcast::channel(WATCH_CAPACITY);
        Self { pool, changes }
    }

    /// Open (creating if missing) the database at `url` and initialize the schema.
    pub async fn open(url: &str) -> Result<Self, ProvisionerError> {
        let connect_opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(connect_opts).await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Initialize the schema by executing the bundled DDL.
    pub async fn init_schema(&self) -> Result<(), ProvisionerError> {
        for stmt in SQLITE_INIT.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            sqlx::query(s).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Create or replace the desired state of a request. Status is left untouched.
    pub async fn apply_request(
        &self,
        key: &RequestKey,
        spec: &DatabaseSpec,
    ) -> Result<DatabaseRequest, ProvisionerError> {
        let extensions = serde_json::to_string(&spec.extensions)?;
        sqlx::query(
            r#"
            INSERT INTO database_requests (namespace, name, engine, extensions, provisioned)
            VALUES (?, ?, ?, ?, NULL)
            ON CONFLICT(namespace, name) DO UPDATE SET
                engine = excluded.engine,
                extensions = excluded.extensions
            "#,
        )
        .bind(&key.namespace)
        .bind(&key.name)
        .bind(spec.engine.as_str())
        .bind(extensions)
        .execute(&self.pool)
        .await?;

        let request = DesiredStateSource::get(self, key)
            .await?
            .ok_or_else(|| ProvisionerError::NotFound(format!("request {key}")))?;
        self.notify(key);
        Ok(request)
    }

    /// Delete a request; its credential record follows through the cascade.
    pub async fn delete_request(&self, key: &RequestKey) -> Result<bool, ProvisionerError> {
        let res = sqlx::query("DELETE FROM database_requests WHERE namespace = ? AND name = ?")
            .bind(&key.namespace)
            .bind(&key.name)
            .execute(&self.pool)
            .await?;
        let deleted = res.rows_affected() > 0;
        if deleted {
            self.notify(key);
        }
        Ok(deleted)
    }

    /// Mark a credential record so the next reconcile issues a new password.
    pub async fn request_rotation(&self, key: &SecretKey) -> Result<(), ProvisionerError> {
        let owner: Option<(String, String)> = sqlx::query_as(
            r#"UPDATE credential_records SET rotate_requested = 1
               WHERE namespace = ? AND name = ?
               RETURNING owner_namespace, owner_name"#,
        )
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await?;

        let (namespace, name) =
            owner.ok_or_else(|| ProvisionerError::NotFound(format!("credential record {key}")))?;
        self.notify(&RequestKey::new(namespace, name));
        Ok(())
    }

    fn notify(&self, key: &RequestKey) {
        // no subscribers is fine
        let _ = self.changes.send(key.clone());
    }
}

#[async_trait]
impl DesiredStateSource for ObjectStore {
    async fn get(&self, key: &RequestKey) -> Result<Option<DatabaseRequest>, ProvisionerError> {
        let row: Option<DbRequest> = sqlx::query_as(SELECT_REQUEST)
            .bind(&key.namespace)
            .bind(&key.name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(DatabaseRequest::try_from).transpose()
    }

    async fn list_keys(&self) -> Result<Vec<RequestKey>, ProvisionerError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT namespace, name FROM database_requests ORDER BY namespace, name")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(namespace, name)| RequestKey::new(namespace, name))
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<RequestKey> {
        self.changes.subscribe()
    }

    async fn patch_status(
        &self,
        key: &RequestKey,
        patch: &StatusPatch,
    ) -> Result<bool, ProvisionerError> {
        let res = sqlx::query(
            r#"UPDATE database_requests SET provisioned = COALESCE(?, provisioned)
               WHERE namespace = ? AND name = ?"#,
        )
        .bind(patch.provisioned)
        .bind(&key.namespace)
        .bind(&key.name)
        .execute(&self.pool)
        .await?;
        debug!(request = %key, ?patch, "status patched");
        Ok(res.rows_affected() > 0)
    }
}

#[async_trait]
impl CredentialStore for ObjectStore {
    async fn get(&self, key: &SecretKey) -> Result<Option<CredentialRecord>, ProvisionerError> {
        let row: Option<DbCredentialRecord> = sqlx::query_as(SELECT_CREDENTIAL)
            .bind(&key.namespace)
            .bind(&key.name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CredentialRecord::try_from).transpose()
    }

    async fn create(&self, record: &CredentialRecord) -> Result<(), ProvisionerError> {
        let res = sqlx::query(
            r#"
            INSERT INTO credential_records (
                namespace, name, owner_namespace, owner_name, host, port,
                database, username, password, generation, rotated_at, rotate_requested
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(namespace, name) DO NOTHING
            "#,
        )
        .bind(&record.key.namespace)
        .bind(&record.key.name)
        .bind(&record.owner.namespace)
        .bind(&record.owner.name)
        .bind(&record.host)
        .bind(i64::from(record.port))
        .bind(&record.database)
        .bind(&record.username)
        .bind(&record.password)
        .bind(record.generation)
        .bind(record.rotated_at)
        .bind(record.rotate_requested)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(ProvisionerError::AlreadyExists(format!(
                "credential record {}",
                record.key
            )));
        }
        Ok(())
    }

    async fn update(
        &self,
        record: &CredentialRecord,
        previous: &CredentialRecord,
    ) -> Result<(), ProvisionerError> {
        let res = sqlx::query(
            r#"UPDATE credential_records SET
                owner_namespace = ?,
                owner_name = ?,
                host = ?,
                port = ?,
                database = ?,
                username = ?,
                password = ?,
                generation = ?,
                rotated_at = ?,
                rotate_requested = ?
              WHERE namespace = ? AND name = ?
                AND generation = ? AND rotate_requested = ?"#,
        )
        .bind(&record.owner.namespace)
        .bind(&record.owner.name)
        .bind(&record.host)
        .bind(i64::from(record.port))
        .bind(&record.database)
        .bind(&record.username)
        .bind(&record.password)
        .bind(record.generation)
        .bind(record.rotated_at)
        .bind(record.rotate_requested)
        .bind(&record.key.namespace)
        .bind(&record.key.name)
        .bind(previous.generation)
        .bind(previous.rotate_requested)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(ProvisionerError::Conflict(format!(
                "credential record {} changed since it was read",
                record.key
            )));
        }
        Ok(())
    }
}
