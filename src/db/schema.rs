//! SQL DDL for initializing the object store.

/// SQLite schema with:
/// - `database_requests` keyed by (namespace, name); `provisioned` NULL/0/1
/// - `credential_records` keyed by (namespace, name), owned by a request
///   through a cascading foreign key so deleting a request deletes its record
pub const SQLITE_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS database_requests (
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    engine TEXT NOT NULL,
    extensions TEXT NOT NULL, -- JSON array, serialized as text
    provisioned INTEGER NULL,
    PRIMARY KEY (namespace, name)
);

CREATE TABLE IF NOT EXISTS credential_records (
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    owner_namespace TEXT NOT NULL,
    owner_name TEXT NOT NULL,
    host TEXT NOT NULL,
    port INTEGER NOT NULL,
    database TEXT NOT NULL,
    username TEXT NOT NULL,
    password TEXT NOT NULL,
    generation INTEGER NOT NULL DEFAULT 0,
    rotated_at TEXT NOT NULL, -- RFC3339
    rotate_requested INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (namespace, name),
    FOREIGN KEY (owner_namespace, owner_name)
        REFERENCES database_requests (namespace, name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_credential_records_owner
    ON credential_records (owner_namespace, owner_name);
"#;
