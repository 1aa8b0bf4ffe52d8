//! PostgreSQL implementation of the catalog and schema traits.
//!
//! Database names cannot be bound as statement parameters in DDL, so the
//! statements that create, drop or comment on databases are assembled with
//! identifier quoting instead. Names coming from the CLI are validated
//! before they reach this module; quoting here is the second net.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::debug;

use super::{CatalogOps, DatabaseInfo, DatabaseState, SchemaOps, SessionInfo, TableRef};
use crate::config::ConnectionProfile;
use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Catalog operations over a pool on the maintenance database.
pub struct PgCatalog {
    profile: ConnectionProfile,
    pool: PgPool,
}

impl PgCatalog {
    pub async fn connect(profile: &ConnectionProfile) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect(&profile.url())
            .await
            .map_err(|e| {
                map_pg_error(
                    e,
                    &format!(
                        "connecting to '{}' on {}:{}",
                        profile.maintenance_db, profile.host, profile.port
                    ),
                )
            })?;
        Ok(PgCatalog {
            profile: profile.clone(),
            pool,
        })
    }
}

#[async_trait]
impl CatalogOps for PgCatalog {
    async fn database_state(&self, name: &str) -> Result<DatabaseState> {
        let row = sqlx::query("SELECT datistemplate FROM pg_database WHERE datname = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(DatabaseState::Absent),
            Some(row) => {
                let is_template: bool = row.try_get("datistemplate")?;
                Ok(if is_template {
                    DatabaseState::Template
                } else {
                    DatabaseState::Regular
                })
            }
        }
    }

    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>> {
        let rows = sqlx::query(
            "SELECT d.datname AS name,
                    pg_get_userbyid(d.datdba) AS owner,
                    d.datistemplate AS is_template,
                    d.datallowconn AS allows_connections,
                    CASE WHEN has_database_privilege(d.datname, 'CONNECT')
                         THEN pg_database_size(d.datname) END AS size_bytes,
                    shobj_description(d.oid, 'pg_database') AS comment
             FROM pg_database d
             ORDER BY d.datname",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut databases = Vec::with_capacity(rows.len());
        for row in rows {
            databases.push(DatabaseInfo {
                name: row.try_get("name")?,
                owner: row.try_get("owner")?,
                is_template: row.try_get("is_template")?,
                allows_connections: row.try_get("allows_connections")?,
                size_bytes: row.try_get("size_bytes")?,
                comment: row.try_get("comment")?,
            });
        }
        Ok(databases)
    }

    async fn has_create_privilege(&self) -> Result<bool> {
        let row = sqlx::query(
            "SELECT usesuper OR usecreatedb AS can_create
             FROM pg_user WHERE usename = current_user",
        )
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(row.try_get("can_create")?),
            None => Ok(false),
        }
    }

    async fn active_sessions(&self, database: &str) -> Result<Vec<SessionInfo>> {
        let rows = sqlx::query(
            "SELECT pid, usename, application_name, client_addr::text AS client_addr
             FROM pg_stat_activity
             WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(database)
        .fetch_all(&self.pool)
        .await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            sessions.push(SessionInfo {
                pid: row.try_get("pid")?,
                user: row.try_get("usename")?,
                application: row.try_get("application_name")?,
                client_addr: row.try_get("client_addr")?,
            });
        }
        Ok(sessions)
    }

    async fn terminate_session(&self, pid: i32) -> Result<bool> {
        debug!("terminating session {}", pid);
        let row = sqlx::query("SELECT pg_terminate_backend($1) AS ok")
            .bind(pid)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("ok")?)
    }

    async fn create_database_from(
        &self,
        name: &str,
        template: &str,
        as_template: bool,
    ) -> Result<()> {
        debug!(
            "creating database '{}' from '{}' (template flag: {})",
            name, template, as_template
        );
        let statement = format!(
            "CREATE DATABASE {} WITH TEMPLATE {} IS_TEMPLATE = {}",
            quote_ident(name),
            quote_ident(template),
            as_template
        );
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(|e| map_pg_error(e, &format!("creating database '{}'", name)))?;
        Ok(())
    }

    async fn set_template_flag(&self, name: &str, value: bool) -> Result<()> {
        debug!("setting template flag on '{}' to {}", name, value);
        let result = sqlx::query("UPDATE pg_database SET datistemplate = $1 WHERE datname = $2")
            .bind(value)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| map_pg_error(e, &format!("updating template flag on '{}'", name)))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("database '{}' does not exist", name)));
        }
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        debug!("dropping database '{}'", name);
        let statement = format!("DROP DATABASE {}", quote_ident(name));
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(|e| map_pg_error(e, &format!("dropping database '{}'", name)))?;
        Ok(())
    }

    async fn set_comment(&self, name: &str, comment: &str) -> Result<()> {
        let statement = if comment.is_empty() {
            format!("COMMENT ON DATABASE {} IS NULL", quote_ident(name))
        } else {
            format!(
                "COMMENT ON DATABASE {} IS {}",
                quote_ident(name),
                quote_literal(comment)
            )
        };
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(|e| map_pg_error(e, &format!("commenting on database '{}'", name)))?;
        Ok(())
    }

    async fn open_schema(&self, database: &str) -> Result<Box<dyn SchemaOps>> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect(&self.profile.url_for(database))
            .await
            .map_err(|e| map_pg_error(e, &format!("connecting to database '{}'", database)))?;
        Ok(Box::new(PgSchema { pool }))
    }
}

/// Table operations over a single connection into one database.
pub struct PgSchema {
    pool: PgPool,
}

#[async_trait]
impl SchemaOps for PgSchema {
    async fn list_tables(&self) -> Result<Vec<TableRef>> {
        let rows = sqlx::query(
            "SELECT schemaname, tablename FROM pg_tables
             WHERE schemaname NOT IN ('pg_catalog', 'information_schema')
               AND schemaname NOT LIKE 'pg_toast%'
             ORDER BY schemaname, tablename",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            tables.push(TableRef {
                schema: row.try_get("schemaname")?,
                name: row.try_get("tablename")?,
            });
        }
        Ok(tables)
    }

    async fn truncate_cascade(&self, table: &TableRef) -> Result<()> {
        debug!("truncating {}", table);
        let statement = format!(
            "TRUNCATE TABLE {}.{} CASCADE",
            quote_ident(&table.schema),
            quote_ident(&table.name)
        );
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(|e| map_pg_error(e, &format!("truncating {}", table)))?;
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Maps server error codes onto the operation taxonomy; anything without
/// a recognized code passes through as a plain driver error.
fn map_pg_error(err: sqlx::Error, what: &str) -> Error {
    let code = err
        .as_database_error()
        .and_then(|e| e.code())
        .map(|c| c.to_string());
    match code.as_deref() {
        // insufficient_privilege, invalid_authorization_specification,
        // invalid_password
        Some("42501") | Some("28000") | Some("28P01") => {
            Error::PermissionDenied(format!("{}: {}", what, err))
        }
        // duplicate_database
        Some("42P04") => Error::Conflict(format!("{}: {}", what, err)),
        // invalid_catalog_name
        Some("3D000") => Error::NotFound(format!("{}: {}", what, err)),
        // object_in_use
        Some("55006") => Error::Busy(format!("{}: {}", what, err)),
        _ => Error::Database(err),
    }
}
