//! Vector conversion into the shared GeoPackage container.
//!
//! Conversion is delegated to an external `ogr2ogr` binary; the exporter
//! treats it as opaque and never inspects geometry itself.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::datasource::Datasource;
use crate::error::{Error, Result};

/// Everything the converter needs to materialize one layer.
#[derive(Debug, Clone)]
pub struct ConversionSource {
    pub host: String,
    pub port: String,
    pub dbname: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub schema: String,
    pub table: String,
    pub geometry_column: Option<String>,
    pub where_clause: Option<String>,
}

impl ConversionSource {
    /// Builds a source from a stored layer connection string. Host and
    /// port fall back to the driver defaults; a missing database name or
    /// table reference makes the layer unconvertible.
    pub fn from_datasource(ds: &Datasource) -> Result<Self> {
        let (schema, table) = ds
            .schema_and_table()
            .ok_or_else(|| Error::Datasource("layer has no table reference".to_string()))?;
        let dbname = ds
            .dbname()
            .ok_or_else(|| Error::Datasource("layer names no database".to_string()))?
            .to_string();
        Ok(ConversionSource {
            host: ds.host().unwrap_or("localhost").to_string(),
            port: ds.port().unwrap_or("5432").to_string(),
            dbname,
            user: ds.user().map(str::to_string),
            password: ds.password().map(str::to_string),
            schema,
            table,
            geometry_column: ds.geometry_column().map(str::to_string),
            where_clause: ds.subset_clause().map(str::to_string),
        })
    }
}

/// Materializes one database layer into a container file under the given
/// layer name, returning a feature count when the backend reports one.
#[async_trait]
pub trait VectorConverter: Send + Sync {
    async fn convert(
        &self,
        source: &ConversionSource,
        container: &Path,
        layer_name: &str,
    ) -> Result<Option<u64>>;
}

/// Converter backed by the `ogr2ogr` command line tool.
pub struct Ogr2ogrConverter {
    binary: PathBuf,
}

impl Ogr2ogrConverter {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Ogr2ogrConverter {
            binary: binary.into(),
        }
    }

    fn build_args(
        &self,
        source: &ConversionSource,
        container: &Path,
        layer_name: &str,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec!["-f".to_string(), "GPKG".to_string()];
        // The first layer creates the container, later layers extend it.
        if container.exists() {
            args.push("-update".to_string());
        }
        args.push("-nln".to_string());
        args.push(layer_name.to_string());
        if let Some(clause) = &source.where_clause {
            args.push("-where".to_string());
            args.push(clause.clone());
        }
        args.push(container.display().to_string());
        args.push(pg_dataset(source));
        args.push(source_layer(source));
        args
    }
}

impl Default for Ogr2ogrConverter {
    fn default() -> Self {
        Ogr2ogrConverter::new("ogr2ogr")
    }
}

#[async_trait]
impl VectorConverter for Ogr2ogrConverter {
    async fn convert(
        &self,
        source: &ConversionSource,
        container: &Path,
        layer_name: &str,
    ) -> Result<Option<u64>> {
        let args = self.build_args(source, container, layer_name);
        let shown: Vec<String> = args.iter().map(|a| redact(a)).collect();
        debug!("running {} {}", self.binary.display(), shown.join(" "));

        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::ExternalTool {
                tool: "ogr2ogr".to_string(),
                message: format!("could not run '{}': {}", self.binary.display(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ExternalTool {
                tool: "ogr2ogr".to_string(),
                message: stderr.trim().to_string(),
            });
        }
        Ok(None)
    }
}

fn pg_dataset(source: &ConversionSource) -> String {
    let mut parts = vec![
        format!("host={}", source.host),
        format!("port={}", source.port),
        format!("dbname={}", source.dbname),
    ];
    if let Some(user) = &source.user {
        parts.push(format!("user={}", user));
    }
    if let Some(password) = &source.password {
        parts.push(format!("password={}", password));
    }
    format!("PG:{}", parts.join(" "))
}

/// Layer argument understood by the PG driver; the parenthesized column
/// picks one geometry column of tables that carry several.
fn source_layer(source: &ConversionSource) -> String {
    match &source.geometry_column {
        Some(geom) => format!("{}.{}({})", source.schema, source.table, geom),
        None => format!("{}.{}", source.schema, source.table),
    }
}

/// Keeps passwords out of log output.
fn redact(arg: &str) -> String {
    match arg.find("password=") {
        Some(at) => {
            let end = arg[at..]
                .find(' ')
                .map(|off| at + off)
                .unwrap_or(arg.len());
            format!("{}password=***{}", &arg[..at], &arg[end..])
        }
        None => arg.to_string(),
    }
}
