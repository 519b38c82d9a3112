//! Administrative access to the relational engine that hosts roles and databases.

pub mod postgres;
pub mod sql;

use crate::error::ProvisionerError;
use async_trait::async_trait;
use std::collections::BTreeSet;

pub use postgres::PgAdmin;

/// Source of administrative sessions, authenticated with operator credentials.
#[async_trait]
pub trait AdminEngine: Send + Sync {
    /// Acquire one connection for the duration of a reconcile attempt.
    /// Dropping the session gives the connection back.
    async fn session(&self) -> Result<Box<dyn AdminSession>, ProvisionerError>;
}

/// Probes and DDL over a single acquired connection.
#[async_trait]
pub trait AdminSession: Send {
    async fn role_exists(&mut self, role: &str) -> Result<bool, ProvisionerError>;

    /// Owner role of `database`, or `None` if it does not exist.
    async fn database_owner(&mut self, database: &str) -> Result<Option<String>, ProvisionerError>;

    async fn installed_extensions(
        &mut self,
        database: &str,
    ) -> Result<BTreeSet<String>, ProvisionerError>;

    async fn create_role(&mut self, role: &str) -> Result<(), ProvisionerError>;

    async fn set_role_password(&mut self, role: &str, password: &str)
    -> Result<(), ProvisionerError>;

    async fn create_database(&mut self, database: &str, owner: &str)
    -> Result<(), ProvisionerError>;

    async fn alter_database_owner(
        &mut self,
        database: &str,
        owner: &str,
    ) -> Result<(), ProvisionerError>;

    async fn create_extensions(
        &mut self,
        database: &str,
        extensions: &[String],
    ) -> Result<(), ProvisionerError>;
}
