//! Object store: desired/observed state of requests plus credential records.
//!
//! Layout:
//! - `traits.rs`: the collaborator interfaces the reconciler depends on
//! - `models.rs`: Rust structs mirroring DB rows and conversions
//! - `schema.rs`: SQL DDL for initializing the database (SQLite)
//! - `sqlite.rs`: the SQLite implementation of both interfaces

pub mod models;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use schema::SQLITE_INIT;
pub use sqlite::{ObjectStore, SqlitePool};
pub use traits::{CredentialStore, DesiredStateSource};
