use std::fmt;

use tracing::{info, warn};

use crate::common::CancelToken;
use crate::db::{SchemaOps, TableRef};
use crate::error::{Error, Result};

/// Per-table outcome of one truncation pass. Already-emptied tables stay
/// empty when later tables fail; nothing is rolled back.
#[derive(Debug, Default)]
pub struct TruncationReport {
    pub succeeded: Vec<TableRef>,
    pub failed: Vec<(TableRef, String)>,
}

impl TruncationReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_full_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Converts a report with failures into the typed partial-failure
    /// error, after the caller has rendered the itemized report.
    pub fn into_result(self, operation: &str) -> Result<TruncationReport> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(Error::PartialFailure {
                operation: operation.to_string(),
                failed: self.failed.len(),
                total: self.total(),
            })
        }
    }
}

impl fmt::Display for TruncationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "emptied {} of {} tables",
            self.succeeded.len(),
            self.total()
        )?;
        for (table, error) in &self.failed {
            write!(f, "\n  {}: {}", table, error)?;
        }
        Ok(())
    }
}

/// Empties every user table in the connected database.
///
/// Tables are enumerated fresh, then truncated one at a time with CASCADE
/// so foreign keys never force an ordering. A failure on one table is
/// recorded and the pass continues; only losing the connection outright
/// aborts the batch. The cancellation token is checked between tables,
/// never mid-statement.
pub async fn truncate_all(
    schema: &dyn SchemaOps,
    cancel: &CancelToken,
) -> Result<TruncationReport> {
    let tables = schema.list_tables().await?;
    info!("truncating {} tables", tables.len());

    let mut report = TruncationReport::default();
    for table in tables {
        cancel.check()?;
        match schema.truncate_cascade(&table).await {
            Ok(()) => report.succeeded.push(table),
            Err(e) if connection_lost(&e) => return Err(e),
            Err(e) => {
                warn!("failed to truncate {}: {}", table, e);
                report.failed.push((table, e.to_string()));
            }
        }
    }
    Ok(report)
}

fn connection_lost(err: &Error) -> bool {
    match err {
        Error::Database(e) => matches!(
            e,
            sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
        ),
        _ => false,
    }
}
