//! Level-triggered convergence of role, database and credential record for one request.
//!
//! Every attempt starts from fresh probes, so an attempt interrupted at any
//! point is finished by the next one without replaying completed steps.
//! Idempotence comes from probing before each creation, never from
//! `IF NOT EXISTS` DDL.

use crate::config::Config;
use crate::db::{CredentialStore, DesiredStateSource};
use crate::engine::AdminEngine;
use crate::error::{IsRetryable, ProvisionerError};
use crate::identity;
use crate::service::planner::{self, ActionPlan, CredentialWrite, Observed};
use crate::service::secret;
use crate::service::status::{StatusUpdate, StatusUpdater};
use crate::types::{ConnectionParams, RequestKey};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use tracing::{debug, info, instrument, warn};

/// Steps of an attempt, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    LoadRequest,
    DeriveNames,
    ProbeCredential,
    Acquire,
    ProbeRole,
    ProbeDatabase,
    ProbeExtensions,
    CreateRole,
    SetPassword,
    CreateDatabase,
    ReassignOwner,
    CreateExtensions,
    WriteCredential,
    PatchStatus,
    /// The attempt as a whole, when it ended without reporting a step.
    Attempt,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::LoadRequest => "load request",
            Step::DeriveNames => "derive names",
            Step::ProbeCredential => "probe credential record",
            Step::Acquire => "acquire admin connection",
            Step::ProbeRole => "probe role",
            Step::ProbeDatabase => "probe database",
            Step::ProbeExtensions => "probe extensions",
            Step::CreateRole => "create role",
            Step::SetPassword => "set role password",
            Step::CreateDatabase => "create database",
            Step::ReassignOwner => "reassign database owner",
            Step::CreateExtensions => "create extensions",
            Step::WriteCredential => "write credential record",
            Step::PatchStatus => "patch status",
            Step::Attempt => "reconcile attempt",
        }
    }

    fn is_probe(&self) -> bool {
        matches!(
            self,
            Step::ProbeCredential | Step::ProbeRole | Step::ProbeDatabase | Step::ProbeExtensions
        )
    }

    fn is_ddl(&self) -> bool {
        matches!(
            self,
            Step::CreateRole
                | Step::SetPassword
                | Step::CreateDatabase
                | Step::ReassignOwner
                | Step::CreateExtensions
        )
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phases of one attempt: `Start → Probing → Planning → Applying → Committed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Probing,
    Planning,
    Applying,
    Committed,
    Failed,
}

/// Failure classes a dispatcher uses to decide what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request identity can never produce valid names.
    InvalidRequest,
    TransientIo,
    ProbeAmbiguous,
    DdlFailure,
    /// Engine side succeeded, the credential store write did not.
    SecretWriteFailure,
}

impl ErrorKind {
    /// Whether the identity should be queued again with backoff.
    pub fn requeue(&self) -> bool {
        !matches!(self, ErrorKind::InvalidRequest)
    }
}

#[derive(Debug, ThisError)]
#[error("reconcile failed at {step}: {source}")]
pub struct ReconcileError {
    pub step: Step,
    #[source]
    pub source: ProvisionerError,
}

impl ReconcileError {
    pub fn new(step: Step, source: ProvisionerError) -> Self {
        Self { step, source }
    }

    pub fn kind(&self) -> ErrorKind {
        if matches!(self.source, ProvisionerError::InvalidIdentity(_)) {
            return ErrorKind::InvalidRequest;
        }
        if self.step == Step::WriteCredential {
            return ErrorKind::SecretWriteFailure;
        }
        if self.source.is_retryable() {
            return ErrorKind::TransientIo;
        }
        if matches!(self.source, ProvisionerError::ProbeAmbiguous(_)) || self.step.is_probe() {
            return ErrorKind::ProbeAmbiguous;
        }
        if self.step.is_ddl() {
            return ErrorKind::DdlFailure;
        }
        ErrorKind::TransientIo
    }
}

impl IsRetryable for ReconcileError {
    fn is_retryable(&self) -> bool {
        self.kind().requeue()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub plan: ActionPlan,
    pub status_patched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The request does not exist (anymore). Nothing to do.
    NotFound,
    Converged(Report),
}

/// Static inputs of the reconciler that do not come from the request.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Host and port advertised in credential records.
    pub host: String,
    pub port: u16,
    pub call_timeout: Duration,
    pub password_length: usize,
}

impl ReconcileSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            host: cfg.postgres.public_host().to_string(),
            port: cfg.postgres.public_port(),
            call_timeout: cfg.reconciler.call_timeout(),
            password_length: cfg.reconciler.password_length,
        }
    }
}

/// Converges the state of one request per call. Assumes at most one call
/// per identity is in flight; see the dispatcher for that guarantee.
#[derive(Clone)]
pub struct Reconciler {
    source: Arc<dyn DesiredStateSource>,
    credentials: Arc<dyn CredentialStore>,
    engine: Arc<dyn AdminEngine>,
    status: StatusUpdater,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn DesiredStateSource>,
        credentials: Arc<dyn CredentialStore>,
        engine: Arc<dyn AdminEngine>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            status: StatusUpdater::new(source.clone()),
            source,
            credentials,
            engine,
            settings,
        }
    }

    #[instrument(name = "reconcile", skip(self, key), fields(namespace = %key.namespace, name = %key.name))]
    pub async fn reconcile(&self, key: &RequestKey) -> Result<Outcome, ReconcileError> {
        debug!(phase = ?Phase::Start);
        let result = self.attempt(key).await;
        match &result {
            Ok(Outcome::NotFound) => {
                info!("request not found; nothing to reconcile");
            }
            Ok(Outcome::Converged(report)) => {
                debug!(phase = ?Phase::Committed, plan = ?report.plan);
            }
            Err(e) => {
                warn!(
                    phase = ?Phase::Failed,
                    step = %e.step,
                    kind = ?e.kind(),
                    error = %e.source,
                    "reconcile attempt failed"
                );
            }
        }
        result
    }

    async fn attempt(&self, key: &RequestKey) -> Result<Outcome, ReconcileError> {
        let Some(desired) = self.bounded(Step::LoadRequest, self.source.get(key)).await? else {
            return Ok(Outcome::NotFound);
        };
        let names = identity::derive(key).map_err(|e| ReconcileError::new(Step::DeriveNames, e))?;
        let params = ConnectionParams {
            host: self.settings.host.clone(),
            port: self.settings.port,
            database: names.database_name.clone(),
            username: names.role_name.clone(),
        };

        debug!(phase = ?Phase::Probing, role = %names.role_name);
        let credential = self
            .bounded(Step::ProbeCredential, self.credentials.get(&names.secret_key))
            .await?;
        let mut session = self.bounded(Step::Acquire, self.engine.session()).await?;
        let role_exists = self
            .bounded(Step::ProbeRole, session.role_exists(&names.role_name))
            .await?;
        let database_owner = self
            .bounded(
                Step::ProbeDatabase,
                session.database_owner(&names.database_name),
            )
            .await?;
        let installed_extensions = if database_owner.is_some() && !desired.spec.extensions.is_empty()
        {
            self.bounded(
                Step::ProbeExtensions,
                session.installed_extensions(&names.database_name),
            )
            .await?
        } else {
            BTreeSet::new()
        };
        let observed = Observed {
            credential,
            role_exists,
            database_owner,
            installed_extensions,
        };

        debug!(phase = ?Phase::Planning);
        let plan = planner::plan(&desired, &names, &observed, &params);
        if plan.is_noop() {
            debug!("already converged");
            return Ok(Outcome::Converged(Report {
                plan,
                status_patched: false,
            }));
        }

        debug!(phase = ?Phase::Applying, plan = ?plan);
        let record = secret::materialize(
            &names.secret_key,
            key,
            &params,
            observed.credential.as_ref(),
            plan.reset_password,
            self.settings.password_length,
        );

        let role = names.role_name.as_str();
        let database = names.database_name.as_str();
        if plan.create_role {
            self.bounded(Step::CreateRole, session.create_role(role))
                .await?;
            info!(role, "role created");
        }
        if plan.reset_password {
            self.bounded(
                Step::SetPassword,
                session.set_role_password(role, &record.password),
            )
            .await?;
            info!(role, generation = record.generation, "role password set");
        }
        if plan.create_database {
            self.bounded(Step::CreateDatabase, session.create_database(database, role))
                .await?;
            info!(database, owner = role, "database created");
        } else if plan.reassign_owner {
            self.bounded(
                Step::ReassignOwner,
                session.alter_database_owner(database, role),
            )
            .await?;
            info!(database, owner = role, "database owner reassigned");
        }
        if !plan.extensions.is_empty() {
            self.bounded(
                Step::CreateExtensions,
                session.create_extensions(database, &plan.extensions),
            )
            .await?;
            info!(database, extensions = ?plan.extensions, "extensions created");
        }
        // engine work is done; give the connection back before touching the store
        drop(session);

        match (plan.credential, observed.credential.as_ref()) {
            (CredentialWrite::None, _) => {}
            (CredentialWrite::Update, Some(previous)) => {
                self.bounded(
                    Step::WriteCredential,
                    self.credentials.update(&record, previous),
                )
                .await?;
                info!(secret = %record.key, "credential record updated");
            }
            (CredentialWrite::Create, _) | (CredentialWrite::Update, None) => {
                self.bounded(Step::WriteCredential, self.credentials.create(&record))
                    .await?;
                info!(secret = %record.key, "credential record created");
            }
        }

        let mut status_patched = false;
        if plan.mark_provisioned {
            match self
                .bounded(
                    Step::PatchStatus,
                    self.status.mark_provisioned(key, &desired.status),
                )
                .await?
            {
                StatusUpdate::Patched => status_patched = true,
                StatusUpdate::Unchanged => {}
                StatusUpdate::Gone => return Ok(Outcome::NotFound),
            }
        }

        Ok(Outcome::Converged(Report {
            plan,
            status_patched,
        }))
    }

    /// Run one collaborator call under the configured timeout.
    async fn bounded<T, F>(&self, step: Step, fut: F) -> Result<T, ReconcileError>
    where
        F: Future<Output = Result<T, ProvisionerError>>,
    {
        let after = self.settings.call_timeout;
        match tokio::time::timeout(after, fut).await {
            Ok(res) => res.map_err(|source| ReconcileError::new(step, source)),
            Err(_) => Err(ReconcileError::new(
                step,
                ProvisionerError::Timeout {
                    op: step.as_str(),
                    after,
                },
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(step: Step, source: ProvisionerError) -> ReconcileError {
        ReconcileError::new(step, source)
    }

    #[test]
    fn classification_follows_step_and_cause() {
        let timeout = || ProvisionerError::Timeout {
            op: "x",
            after: Duration::from_secs(1),
        };
        assert_eq!(err(Step::ProbeRole, timeout()).kind(), ErrorKind::TransientIo);
        assert_eq!(
            err(Step::LoadRequest, ProvisionerError::DatabaseError(sqlx::Error::PoolTimedOut))
                .kind(),
            ErrorKind::TransientIo
        );
        assert_eq!(
            err(Step::ProbeDatabase, ProvisionerError::ProbeAmbiguous("2 rows".into())).kind(),
            ErrorKind::ProbeAmbiguous
        );
        assert_eq!(
            err(Step::CreateDatabase, ProvisionerError::DatabaseError(sqlx::Error::RowNotFound))
                .kind(),
            ErrorKind::DdlFailure
        );
        assert_eq!(
            err(Step::WriteCredential, timeout()).kind(),
            ErrorKind::SecretWriteFailure
        );
        assert_eq!(
            err(Step::DeriveNames, ProvisionerError::InvalidIdentity("x".into())).kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            err(Step::Attempt, ProvisionerError::TaskFailed("panicked".into())).kind(),
            ErrorKind::TransientIo
        );
    }

    #[test]
    fn only_invalid_requests_are_not_requeued() {
        assert!(!ErrorKind::InvalidRequest.requeue());
        for kind in [
            ErrorKind::TransientIo,
            ErrorKind::ProbeAmbiguous,
            ErrorKind::DdlFailure,
            ErrorKind::SecretWriteFailure,
        ] {
            assert!(kind.requeue());
        }
    }
}
