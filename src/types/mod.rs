pub mod credential;
pub mod request;

pub use credential::{ConnectionParams, CredentialRecord, SecretKey};
pub use request::{DatabaseRequest, DatabaseSpec, DatabaseStatus, EngineType, RequestKey, StatusPatch};
