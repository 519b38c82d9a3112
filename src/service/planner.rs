//! Desired snapshot + probed actual state -> action plan. No I/O.

use crate::identity::DerivedNames;
use crate::types::{ConnectionParams, CredentialRecord, DatabaseRequest};
use serde::Serialize;
use std::collections::BTreeSet;

/// What the probes saw, across both backing systems.
#[derive(Debug, Clone, Default)]
pub struct Observed {
    pub credential: Option<CredentialRecord>,
    pub role_exists: bool,
    /// Owner of the database, `None` when the database does not exist.
    pub database_owner: Option<String>,
    pub installed_extensions: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum CredentialWrite {
    #[default]
    None,
    Create,
    Update,
}

/// Actions for one attempt, applied in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActionPlan {
    pub create_role: bool,
    pub reset_password: bool,
    pub create_database: bool,
    pub reassign_owner: bool,
    pub extensions: Vec<String>,
    pub credential: CredentialWrite,
    pub mark_provisioned: bool,
}

impl ActionPlan {
    pub fn issues_ddl(&self) -> bool {
        self.create_role
            || self.reset_password
            || self.create_database
            || self.reassign_owner
            || !self.extensions.is_empty()
    }

    pub fn is_noop(&self) -> bool {
        !self.issues_ddl() && self.credential == CredentialWrite::None && !self.mark_provisioned
    }
}

pub fn plan(
    desired: &DatabaseRequest,
    names: &DerivedNames,
    observed: &Observed,
    params: &ConnectionParams,
) -> ActionPlan {
    let create_role = !observed.role_exists;
    let reset_password = create_role
        || observed
            .credential
            .as_ref()
            .is_none_or(|record| record.rotate_requested);

    let create_database = observed.database_owner.is_none();
    let reassign_owner = observed
        .database_owner
        .as_ref()
        .is_some_and(|owner| *owner != names.role_name);

    let mut seen = BTreeSet::new();
    let extensions = desired
        .spec
        .extensions
        .iter()
        .filter(|ext| !observed.installed_extensions.contains(*ext))
        .filter(|ext| seen.insert(ext.as_str()))
        .cloned()
        .collect();

    let credential = match &observed.credential {
        None => CredentialWrite::Create,
        Some(record) if reset_password || record.connection_params() != *params => {
            CredentialWrite::Update
        }
        Some(_) => CredentialWrite::None,
    };

    ActionPlan {
        create_role,
        reset_password,
        create_database,
        reassign_owner,
        extensions,
        credential,
        mark_provisioned: desired.status.provisioned != Some(true),
    }
}
