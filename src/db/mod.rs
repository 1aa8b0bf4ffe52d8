pub mod postgres;

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;

/// Catalog state of a named database. The server catalog is the only
/// source of truth; state is re-queried on every operation, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseState {
    Absent,
    Regular,
    Template,
}

/// One row of the server's database catalog.
#[derive(Debug, Clone)]
pub struct DatabaseInfo {
    pub name: String,
    pub owner: String,
    pub is_template: bool,
    pub allows_connections: bool,
    /// None when the connected role may not read the size.
    pub size_bytes: Option<i64>,
    pub comment: Option<String>,
}

/// A schema-qualified table, enumerated fresh on each pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// A foreign session connected to some database on the server.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub pid: i32,
    pub user: Option<String>,
    pub application: Option<String>,
    pub client_addr: Option<String>,
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pid {} ({} from {})",
            self.pid,
            self.user.as_deref().unwrap_or("unknown"),
            self.client_addr.as_deref().unwrap_or("local")
        )
    }
}

/// Server-level catalog operations issued over the maintenance connection.
///
/// Every method is one discrete server call; the lifecycle engine sequences
/// them and owns the preflight and partial-failure semantics. Implemented
/// for PostgreSQL in [`postgres`] and by in-memory fakes in tests.
#[async_trait]
pub trait CatalogOps: Send + Sync {
    async fn database_state(&self, name: &str) -> Result<DatabaseState>;

    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>>;

    /// Whether the connected role may create databases.
    async fn has_create_privilege(&self) -> Result<bool>;

    /// Foreign sessions connected to `database`, excluding our own.
    async fn active_sessions(&self, database: &str) -> Result<Vec<SessionInfo>>;

    /// Requests termination of one session by server process id. `false`
    /// means the session was already gone.
    async fn terminate_session(&self, pid: i32) -> Result<bool>;

    /// Clones `template` into a new database `name`, optionally flagging
    /// the clone as a template in the same server call.
    async fn create_database_from(
        &self,
        name: &str,
        template: &str,
        as_template: bool,
    ) -> Result<()>;

    async fn set_template_flag(&self, name: &str, value: bool) -> Result<()>;

    async fn drop_database(&self, name: &str) -> Result<()>;

    async fn set_comment(&self, name: &str, comment: &str) -> Result<()>;

    /// Opens a connection into `database` for table-level work.
    async fn open_schema(&self, database: &str) -> Result<Box<dyn SchemaOps>>;
}

/// Table-level operations inside one database.
#[async_trait]
pub trait SchemaOps: Send + Sync {
    /// All user tables outside the system schemas.
    async fn list_tables(&self) -> Result<Vec<TableRef>>;

    /// Empties one table, cascading into referencing tables.
    async fn truncate_cascade(&self, table: &TableRef) -> Result<()>;
}
