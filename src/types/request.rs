use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a request: the (namespace, name) pair it was submitted under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub namespace: String,
    pub name: String,
}

impl RequestKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Engine flavour requested. Only PostgreSQL is supported today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineType {
    #[default]
    Postgres,
}

impl EngineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineType::Postgres => "Postgres",
        }
    }
}

impl FromStr for EngineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Postgres" => Ok(EngineType::Postgres),
            other => Err(format!("unsupported database type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSpec {
    #[serde(rename = "type", default)]
    pub engine: EngineType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
}

/// Observed state. `provisioned` is tri-state: unknown until the first successful reconcile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStatus {
    pub provisioned: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseRequest {
    #[serde(flatten)]
    pub key: RequestKey,
    pub spec: DatabaseSpec,
    #[serde(default)]
    pub status: DatabaseStatus,
}

/// Merge-patch of [`DatabaseStatus`]: `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusPatch {
    pub provisioned: Option<bool>,
}

impl StatusPatch {
    pub fn provisioned() -> Self {
        Self {
            provisioned: Some(true),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.provisioned.is_none()
    }

    /// True when applying the patch would not change `status`.
    pub fn is_satisfied_by(&self, status: &DatabaseStatus) -> bool {
        self.provisioned.is_none_or(|p| status.provisioned == Some(p))
    }
}
