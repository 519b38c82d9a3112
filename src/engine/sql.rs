//! The fixed set of administrative statement shapes.
//!
//! Identifiers go through [`quote_ident`]; literal values are never spliced
//! into SQL text on this side and are always bound as parameters.

/// Quote an identifier the way PostgreSQL's `quote_ident` does, unconditionally.
pub fn quote_ident(ident: &str) -> String {
    let mut quoted = String::with_capacity(ident.len() + 2);
    quoted.push('"');
    for c in ident.chars() {
        if c == '"' {
            quoted.push('"');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

pub const PROBE_ROLE: &str = "SELECT rolname FROM pg_catalog.pg_roles WHERE rolname = $1";

pub const PROBE_DATABASE_OWNER: &str = "SELECT pg_catalog.pg_get_userbyid(datdba) AS owner \
     FROM pg_catalog.pg_database WHERE datname = $1";

pub const PROBE_EXTENSIONS: &str = "SELECT extname FROM pg_catalog.pg_extension";

/// Rendered server-side so the password is only ever a bound parameter.
/// `$1` is the role, `$2` the password; the result is the statement to run.
///
/// The rendered statement carries the password as a literal. Run it in the
/// same transaction as [`SUPPRESS_STATEMENT_LOG`] so it stays out of the
/// server log.
pub const RENDER_SET_PASSWORD: &str = "SELECT pg_catalog.format('ALTER ROLE %I WITH LOGIN PASSWORD %L', $1::text, $2::text)";

/// Turns statement logging off until the enclosing transaction ends.
/// Needs superuser, which the operator login has.
pub const SUPPRESS_STATEMENT_LOG: &str = "SET LOCAL log_statement = 'none'";

pub fn create_role(role: &str) -> String {
    format!("CREATE ROLE {} WITH LOGIN", quote_ident(role))
}

pub fn create_database(database: &str, owner: &str) -> String {
    format!(
        "CREATE DATABASE {} OWNER {}",
        quote_ident(database),
        quote_ident(owner)
    )
}

pub fn alter_database_owner(database: &str, owner: &str) -> String {
    format!(
        "ALTER DATABASE {} OWNER TO {}",
        quote_ident(database),
        quote_ident(owner)
    )
}

pub fn create_extension(extension: &str) -> String {
    format!("CREATE EXTENSION {}", quote_ident(extension))
}
