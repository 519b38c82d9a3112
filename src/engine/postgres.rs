use crate::config::PostgresConfig;
use crate::engine::sql::{
    self, PROBE_DATABASE_OWNER, PROBE_EXTENSIONS, PROBE_ROLE, RENDER_SET_PASSWORD,
    SUPPRESS_STATEMENT_LOG,
};
use crate::engine::{AdminEngine, AdminSession};
use crate::error::{IsRetryable, ProvisionerError};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions};
use sqlx::{Connection, Postgres};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// PostgreSQL admin interface backed by a connection pool.
#[derive(Clone)]
pub struct PgAdmin {
    pool: PgPool,
    options: PgConnectOptions,
}

impl PgAdmin {
    /// Build the pool and verify connectivity, retrying transient failures.
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self, ProvisionerError> {
        let options = connect_options(cfg);
        info!(
            host = %cfg.host,
            port = cfg.port,
            database = %cfg.database,
            user = %cfg.user,
            pool_size = cfg.pool_size,
            "Creating PostgreSQL admin pool"
        );

        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_max_times(5)
            .with_jitter();

        let pool = (|| async {
            let pool = PgPoolOptions::new()
                .max_connections(cfg.pool_size.max(1))
                .acquire_timeout(Duration::from_millis(cfg.acquire_timeout_ms))
                .connect_with(options.clone())
                .await?;
            Ok::<_, ProvisionerError>(pool)
        })
        .retry(retry_policy)
        .when(|e: &ProvisionerError| e.is_retryable())
        .notify(|err, dur: Duration| {
            warn!("PostgreSQL connect retrying after error {}, sleeping {:?}", err, dur);
        })
        .await?;

        debug!("PostgreSQL admin pool created");
        Ok(Self::new(pool, options))
    }

    pub fn new(pool: PgPool, options: PgConnectOptions) -> Self {
        Self { pool, options }
    }
}

fn connect_options(cfg: &PostgresConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&cfg.host)
        .port(cfg.port)
        .database(&cfg.database)
        .username(&cfg.user)
        .password(&cfg.password)
        .application_name("pg-provisioner")
}

#[async_trait]
impl AdminEngine for PgAdmin {
    async fn session(&self) -> Result<Box<dyn AdminSession>, ProvisionerError> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgAdminSession {
            conn,
            options: self.options.clone(),
        }))
    }
}

/// Holds one pooled connection; released back to the pool on drop.
pub struct PgAdminSession {
    conn: PoolConnection<Postgres>,
    options: PgConnectOptions,
}

impl PgAdminSession {
    /// Short-lived admin connection to another database on the same server.
    async fn connect_to(&self, database: &str) -> Result<PgConnection, ProvisionerError> {
        let conn = PgConnection::connect_with(&self.options.clone().database(database)).await?;
        Ok(conn)
    }

    async fn exec(&mut self, statement: &str) -> Result<(), ProvisionerError> {
        sqlx::query(statement).execute(&mut *self.conn).await?;
        Ok(())
    }
}

async fn close_quietly(conn: PgConnection, database: &str) {
    if let Err(e) = conn.close().await {
        debug!(database, "closing per-database admin connection failed: {}", e);
    }
}

/// Decode problems mean the catalog answered with something we did not expect.
fn probe_error(e: sqlx::Error) -> ProvisionerError {
    match e {
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => ProvisionerError::ProbeAmbiguous(e.to_string()),
        other => ProvisionerError::DatabaseError(other),
    }
}

#[async_trait]
impl AdminSession for PgAdminSession {
    async fn role_exists(&mut self, role: &str) -> Result<bool, ProvisionerError> {
        let rows: Vec<String> = sqlx::query_scalar(PROBE_ROLE)
            .bind(role)
            .fetch_all(&mut *self.conn)
            .await
            .map_err(probe_error)?;
        match rows.as_slice() {
            [] => Ok(false),
            [found] if found == role => Ok(true),
            other => Err(ProvisionerError::ProbeAmbiguous(format!(
                "role probe for `{role}` returned {other:?}"
            ))),
        }
    }

    async fn database_owner(&mut self, database: &str) -> Result<Option<String>, ProvisionerError> {
        let mut rows: Vec<String> = sqlx::query_scalar(PROBE_DATABASE_OWNER)
            .bind(database)
            .fetch_all(&mut *self.conn)
            .await
            .map_err(probe_error)?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            n => Err(ProvisionerError::ProbeAmbiguous(format!(
                "database probe for `{database}` returned {n} rows"
            ))),
        }
    }

    async fn installed_extensions(
        &mut self,
        database: &str,
    ) -> Result<BTreeSet<String>, ProvisionerError> {
        let mut conn = self.connect_to(database).await?;
        let result: Result<Vec<String>, sqlx::Error> = sqlx::query_scalar(PROBE_EXTENSIONS)
            .fetch_all(&mut conn)
            .await;
        close_quietly(conn, database).await;
        Ok(result.map_err(probe_error)?.into_iter().collect())
    }

    async fn create_role(&mut self, role: &str) -> Result<(), ProvisionerError> {
        self.exec(&sql::create_role(role)).await
    }

    async fn set_role_password(
        &mut self,
        role: &str,
        password: &str,
    ) -> Result<(), ProvisionerError> {
        let mut tx = self.conn.begin().await?;
        sqlx::query(SUPPRESS_STATEMENT_LOG)
            .execute(&mut *tx)
            .await?;
        let statement: String = sqlx::query_scalar(RENDER_SET_PASSWORD)
            .bind(role)
            .bind(password)
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query(&statement).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_database(
        &mut self,
        database: &str,
        owner: &str,
    ) -> Result<(), ProvisionerError> {
        self.exec(&sql::create_database(database, owner)).await
    }

    async fn alter_database_owner(
        &mut self,
        database: &str,
        owner: &str,
    ) -> Result<(), ProvisionerError> {
        self.exec(&sql::alter_database_owner(database, owner)).await
    }

    async fn create_extensions(
        &mut self,
        database: &str,
        extensions: &[String],
    ) -> Result<(), ProvisionerError> {
        if extensions.is_empty() {
            return Ok(());
        }
        let mut conn = self.connect_to(database).await?;
        let mut result = Ok(());
        for extension in extensions {
            let statement = sql::create_extension(extension);
            if let Err(e) = sqlx::query(&statement).execute(&mut conn).await {
                result = Err(e.into());
                break;
            }
        }
        close_quietly(conn, database).await;
        result
    }
}
