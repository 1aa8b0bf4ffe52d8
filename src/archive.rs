use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use indexmap::IndexMap;
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use crate::common::{self, sanitize_layer_name, CancelToken};
use crate::convert::{ConversionSource, VectorConverter};
use crate::datasource::Datasource;
use crate::error::{Error, Result};
use crate::project::{LayerEdit, ProjectDocument};

/// Settings for one export run.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// File name of the shared GeoPackage inside the destination.
    pub container_name: String,
    /// Credentials used when a layer's connection string carries none.
    pub fallback_user: Option<String>,
    pub fallback_password: Option<String>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            container_name: "data.gpkg".to_string(),
            fallback_user: None,
            fallback_password: None,
        }
    }
}

/// One layer materialized into the container.
#[derive(Debug, Clone)]
pub struct ConvertedLayer {
    pub layer: String,
    pub target: String,
    pub features: Option<u64>,
}

/// Everything one export run did, for the report file and the caller.
#[derive(Debug)]
pub struct ExportReport {
    pub project: PathBuf,
    pub destination: PathBuf,
    pub files_copied: usize,
    pub container: String,
    pub converted: Vec<ConvertedLayer>,
    /// Layer display name and the conversion error.
    pub failed: Vec<(String, String)>,
    /// Layer display name and why conversion was not attempted.
    pub skipped: Vec<(String, String)>,
    /// Layers that keep their original connection string minus credentials.
    pub credentials_stripped: usize,
    pub warnings: Vec<String>,
    pub portable_document: PathBuf,
}

impl ExportReport {
    pub fn database_layers(&self) -> usize {
        self.converted.len() + self.failed.len() + self.skipped.len()
    }

    pub fn is_full_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// Converts a report with failed or skipped layers into the typed
    /// partial-failure error, after the caller has rendered the report.
    pub fn into_result(self) -> Result<ExportReport> {
        let missed = self.failed.len() + self.skipped.len();
        if missed == 0 {
            Ok(self)
        } else {
            Err(Error::PartialFailure {
                operation: "archive export".to_string(),
                failed: missed,
                total: self.database_layers(),
            })
        }
    }
}

/// Builds a self-contained copy of a project: the full source tree, one
/// GeoPackage holding every database-backed layer, and a rewritten
/// document that opens without a live database connection.
pub struct ArchiveExporter<'a> {
    converter: &'a dyn VectorConverter,
    options: ArchiveOptions,
    cancel: CancelToken,
}

impl<'a> ArchiveExporter<'a> {
    pub fn new(
        converter: &'a dyn VectorConverter,
        options: ArchiveOptions,
        cancel: CancelToken,
    ) -> Self {
        Self {
            converter,
            options,
            cancel,
        }
    }

    /// Exports the project at `project_path` into `dest_root`.
    ///
    /// The destination is created when missing and must lie outside the
    /// project directory. Existing files in the destination are
    /// overwritten by the copy step. Per-layer conversion failures are
    /// recorded and the remaining layers still convert; the report file
    /// is written in every non-aborted outcome.
    pub async fn export(&self, project_path: &Path, dest_root: &Path) -> Result<ExportReport> {
        let document = ProjectDocument::read(project_path)?;

        let source_root = match project_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let source_canon = source_root.canonicalize()?;
        // Checked before anything is created so a refused export leaves
        // no stray directory inside the project tree.
        if resolve_prospective(dest_root)?.starts_with(&source_canon) {
            return Err(Error::InvalidName(format!(
                "destination '{}' lies inside the project directory",
                dest_root.display()
            )));
        }
        std::fs::create_dir_all(dest_root)?;

        info!(
            "exporting '{}' to '{}'",
            project_path.display(),
            dest_root.display()
        );
        let files_copied = common::copy_dir_recursive(&source_canon, dest_root, &self.cancel)?;
        info!("copied {} project files", files_copied);

        let manifest = allocate_names(&document);
        let container_path = dest_root.join(&self.options.container_name);
        // A container left over from an earlier run would be appended
        // to instead of replaced.
        if container_path.exists() {
            std::fs::remove_file(&container_path)?;
        }

        let mut edits: HashMap<String, LayerEdit> = HashMap::new();
        let mut converted = Vec::new();
        let mut failed = Vec::new();
        let mut skipped = Vec::new();

        for layer in document.layers().iter().filter(|l| l.is_database_backed()) {
            self.cancel.check()?;
            let target = match manifest.get(&layer.id) {
                Some(t) => t.clone(),
                None => continue,
            };

            let parsed = Datasource::parse(&layer.datasource)
                .and_then(|ds| ConversionSource::from_datasource(&ds));
            let mut source = match parsed {
                Ok(s) => s,
                Err(e) => {
                    warn!("skipping layer '{}': {}", layer.name, e);
                    skipped.push((layer.name.clone(), e.to_string()));
                    continue;
                }
            };
            if source.user.is_none() {
                source.user = self.options.fallback_user.clone();
            }
            if source.password.is_none() {
                source.password = self.options.fallback_password.clone();
            }

            info!("converting layer '{}' as '{}'", layer.name, target);
            match self
                .converter
                .convert(&source, &container_path, &target)
                .await
            {
                Ok(features) => {
                    edits.insert(
                        layer.id.clone(),
                        LayerEdit {
                            datasource: Some(format!(
                                "./{}|layername={}",
                                self.options.container_name, target
                            )),
                            provider: Some("ogr".to_string()),
                        },
                    );
                    converted.push(ConvertedLayer {
                        layer: layer.name.clone(),
                        target,
                        features,
                    });
                }
                Err(e) => {
                    warn!("conversion of '{}' failed: {}", layer.name, e);
                    failed.push((layer.name.clone(), e.to_string()));
                }
            }
        }

        // Layers that still point at their original source lose embedded
        // credentials, whatever their provider.
        let mut credentials_stripped = 0;
        for layer in document.layers() {
            if edits.contains_key(&layer.id) {
                continue;
            }
            if let Ok(ds) = Datasource::parse(&layer.datasource) {
                if ds.has_credentials() {
                    edits.insert(
                        layer.id.clone(),
                        LayerEdit {
                            datasource: Some(ds.strip_credentials().to_string()),
                            provider: None,
                        },
                    );
                    credentials_stripped += 1;
                }
            }
        }

        let portable_xml = document.apply(&edits)?;
        let portable_path = dest_root.join(document.variant_file_name("portable"));
        document.write_variant(&portable_xml, &portable_path)?;

        let report = ExportReport {
            project: project_path.to_path_buf(),
            destination: dest_root.to_path_buf(),
            files_copied,
            container: self.options.container_name.clone(),
            converted,
            failed,
            skipped,
            credentials_stripped,
            warnings: absolute_path_warnings(&portable_xml)?,
            portable_document: portable_path,
        };

        let rendered = render_report(&report)?;
        common::write_string_to_file(
            dest_root.join("archive_report.txt").to_string_lossy().as_ref(),
            &rendered,
        )?;

        info!(
            "export finished: {} converted, {} failed, {} skipped",
            report.converted.len(),
            report.failed.len(),
            report.skipped.len()
        );
        Ok(report)
    }
}

/// Canonical form of a path that may not exist yet: the deepest existing
/// ancestor is resolved, the remaining components are appended.
fn resolve_prospective(path: &Path) -> Result<PathBuf> {
    let mut base = path.to_path_buf();
    let mut pending = Vec::new();
    while !base.as_os_str().is_empty() && !base.exists() {
        match (base.parent(), base.file_name()) {
            (Some(parent), Some(name)) => {
                pending.push(name.to_os_string());
                base = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut resolved = if base.as_os_str().is_empty() {
        std::env::current_dir()?
    } else {
        base.canonicalize()?
    };
    for name in pending.iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

/// Container layer names in document order. The first use of a sanitized
/// display name keeps it, later collisions get `_2`, `_3` and so on, so
/// repeated runs over an unchanged document assign the same names.
fn allocate_names(document: &ProjectDocument) -> IndexMap<String, String> {
    let mut manifest = IndexMap::new();
    let mut used: HashSet<String> = HashSet::new();
    for layer in document.layers().iter().filter(|l| l.is_database_backed()) {
        let base = sanitize_layer_name(&layer.name);
        let mut target = base.clone();
        let mut n = 2;
        while !used.insert(target.clone()) {
            target = format!("{}_{}", base, n);
            n += 1;
        }
        manifest.insert(layer.id.clone(), target);
    }
    manifest
}

/// Flags absolute path references that survive into the portable
/// document: drive-letter and `file:///` forms. Scheme URLs such as
/// namespace declarations do not match.
fn absolute_path_warnings(xml: &str) -> Result<Vec<String>> {
    let file_url =
        Regex::new(r#"file:///[^"'<>\s]+"#).map_err(|e| anyhow!("invalid regex: {}", e))?;
    let drive = Regex::new(r#"(?:^|[^A-Za-z0-9+.:-])([A-Za-z]:[/\\][^"'<>\s]*)"#)
        .map_err(|e| anyhow!("invalid regex: {}", e))?;

    let mut seen = HashSet::new();
    let mut warnings = Vec::new();
    let mut flag = |path: &str| {
        if seen.insert(path.to_string()) {
            warnings.push(format!(
                "absolute path remains in the portable document: {}",
                path
            ));
        }
    };

    for m in file_url.find_iter(xml) {
        flag(m.as_str());
    }
    for caps in drive.captures_iter(xml) {
        if let Some(m) = caps.get(1) {
            flag(m.as_str());
        }
    }
    Ok(warnings)
}

/// Renders the human-readable `archive_report.txt` content.
pub fn render_report(report: &ExportReport) -> Result<String> {
    let handlebars = common::get_handlebars();

    let converted: Vec<_> = report
        .converted
        .iter()
        .map(|c| {
            json!({
                "layer": c.layer,
                "target": c.target,
                "features": c.features,
            })
        })
        .collect();
    let failed: Vec<_> = report
        .failed
        .iter()
        .map(|(layer, error)| json!({ "layer": layer, "error": error }))
        .collect();
    let skipped: Vec<_> = report
        .skipped
        .iter()
        .map(|(layer, reason)| json!({ "layer": layer, "reason": reason }))
        .collect();

    let res = handlebars
        .render_template(
            &get_template(),
            &json!({
                "generated": chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                "project": report.project.display().to_string(),
                "destination": report.destination.display().to_string(),
                "files_copied": report.files_copied,
                "container": report.container,
                "database_layers": report.database_layers(),
                "converted_count": report.converted.len(),
                "converted": converted,
                "failed": failed,
                "skipped": skipped,
                "credentials_stripped": report.credentials_stripped,
                "portable_document": report.portable_document.display().to_string(),
                "warnings": report.warnings,
            }),
        )
        .map_err(|e| anyhow!("failed to render archive report: {}", e))?;
    Ok(res)
}

pub fn get_template() -> String {
    include_str!("archive_report.hbs").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write as _;
    use std::sync::Mutex;

    use async_trait::async_trait;

    const ROADS_MAJOR: &str = "dbname='kgr' host=localhost port=5432 user='gis' password='pw' table=\"public\".\"roads_major\" (geom) sql=";
    const ROADS_MINOR: &str = "dbname='kgr' host=localhost port=5432 user='gis' password='pw' table=\"public\".\"roads_minor\" (geom) sql=";
    const SITES: &str = "dbname='kgr' host=localhost port=5432 user='gis' password='pw' table=\"public\".\"sites\" (geom) sql=";

    struct FakeConverter {
        calls: Mutex<Vec<(String, Option<String>, String)>>,
        fail_on: Option<String>,
    }

    impl FakeConverter {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }

        fn failing_on(layer: &str) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on: Some(layer.to_string()),
            }
        }
    }

    #[async_trait]
    impl VectorConverter for FakeConverter {
        async fn convert(
            &self,
            source: &ConversionSource,
            container: &Path,
            layer_name: &str,
        ) -> Result<Option<u64>> {
            if self.fail_on.as_deref() == Some(layer_name) {
                return Err(Error::ExternalTool {
                    tool: "fake".to_string(),
                    message: format!("cannot convert {}", layer_name),
                });
            }
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(container)?;
            writeln!(
                file,
                "{}.{} -> {}",
                source.schema, source.table, layer_name
            )?;
            self.calls.lock().unwrap().push((
                format!("{}.{}", source.schema, source.table),
                source.user.clone(),
                layer_name.to_string(),
            ));
            Ok(Some(42))
        }
    }

    fn attr(value: &str) -> String {
        value.replace('&', "&amp;").replace('"', "&quot;")
    }

    fn text(value: &str) -> String {
        value.replace('&', "&amp;").replace('<', "&lt;")
    }

    fn maplayer(id: &str, name: &str, provider: &str, datasource: &str) -> String {
        format!(
            "    <maplayer type=\"vector\">\n      <id>{}</id>\n      <datasource>{}</datasource>\n      <layername>{}</layername>\n      <provider encoding=\"UTF-8\">{}</provider>\n    </maplayer>\n",
            id,
            text(datasource),
            name,
            provider
        )
    }

    fn tree_layer(id: &str, name: &str, provider: &str, datasource: &str) -> String {
        format!(
            "    <layer-tree-layer checked=\"Qt::Checked\" id=\"{}\" name=\"{}\" providerKey=\"{}\" source=\"{}\"/>\n",
            id,
            name,
            provider,
            attr(datasource)
        )
    }

    fn project_xml(layers: &[(&str, &str, &str, &str)]) -> String {
        let mut tree = String::new();
        let mut map = String::new();
        for (id, name, provider, datasource) in layers {
            tree.push_str(&tree_layer(id, name, provider, datasource));
            map.push_str(&maplayer(id, name, provider, datasource));
        }
        format!(
            "<!DOCTYPE qgis PUBLIC 'http://mrcc.com/qgis.dtd' 'SYSTEM'>\n<qgis projectname=\"\" version=\"3.34.4-Prizren\">\n  <layer-tree-group>\n{}  </layer-tree-group>\n  <projectlayers>\n{}  </projectlayers>\n</qgis>\n",
            tree, map
        )
    }

    fn standard_layers() -> Vec<(&'static str, &'static str, &'static str, &'static str)> {
        vec![
            ("roads_a1", "Roads", "postgres", ROADS_MAJOR),
            ("roads_b2", "Roads", "postgres", ROADS_MINOR),
            ("sites_c3", "Sites", "postgres", SITES),
            ("hill_d4", "Hillshade", "gdal", "./media/hillshade.tif"),
        ]
    }

    fn write_project(root: &Path, layers: &[(&str, &str, &str, &str)]) -> PathBuf {
        fs::create_dir_all(root.join("media")).unwrap();
        fs::create_dir_all(root.join("notes")).unwrap();
        fs::write(root.join("media/hillshade.tif"), [0x49u8, 0x49]).unwrap();
        fs::write(root.join("notes/readme.txt"), "field notes").unwrap();
        let path = root.join("survey.qgs");
        fs::write(&path, project_xml(layers)).unwrap();
        path
    }

    fn exporter<'a>(converter: &'a FakeConverter) -> ArchiveExporter<'a> {
        ArchiveExporter::new(converter, ArchiveOptions::default(), CancelToken::new())
    }

    #[tokio::test]
    async fn export_builds_portable_archive() {
        let dir = tempfile::tempdir().unwrap();
        let project = write_project(&dir.path().join("source"), &standard_layers());
        let dest = dir.path().join("archive");

        let converter = FakeConverter::new();
        let report = exporter(&converter).export(&project, &dest).await.unwrap();

        assert!(report.is_full_success());
        assert_eq!(report.converted.len(), 3);
        assert_eq!(report.files_copied, 3);
        assert!(report.warnings.is_empty());

        // The tree is copied verbatim, credentials and all.
        assert!(dest.join("media/hillshade.tif").exists());
        assert!(dest.join("notes/readme.txt").exists());
        let original = fs::read_to_string(dest.join("survey.qgs")).unwrap();
        assert!(original.contains("password='pw'"));

        // One shared container; colliding names suffixed in document order.
        let container = fs::read_to_string(dest.join("data.gpkg")).unwrap();
        assert!(container.contains("public.roads_major -> Roads\n"));
        assert!(container.contains("public.roads_minor -> Roads_2\n"));
        assert!(container.contains("public.sites -> Sites\n"));

        // The portable document references the container and keeps no
        // secrets; the file-backed layer still points into the copy.
        let portable = fs::read_to_string(dest.join("survey_portable.qgs")).unwrap();
        assert!(portable.contains("./data.gpkg|layername=Roads"));
        assert!(portable.contains("./data.gpkg|layername=Roads_2"));
        assert!(portable.contains("./data.gpkg|layername=Sites"));
        assert!(portable.contains("./media/hillshade.tif"));
        assert!(!portable.contains("user='gis'"));
        assert!(!portable.contains("password="));

        let rendered = fs::read_to_string(dest.join("archive_report.txt")).unwrap();
        assert!(rendered.contains("Files copied: 3"));
        assert!(rendered.contains("Roads_2"));
    }

    #[tokio::test]
    async fn converter_receives_fallback_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let bare = SITES.replace("user='gis' password='pw' ", "");
        let layers = vec![("sites_c3", "Sites", "postgres", bare.as_str())];
        let project = write_project(&dir.path().join("source"), &layers);

        let converter = FakeConverter::new();
        let options = ArchiveOptions {
            fallback_user: Some("svc".to_string()),
            fallback_password: Some("secret".to_string()),
            ..ArchiveOptions::default()
        };
        let exporter = ArchiveExporter::new(&converter, options, CancelToken::new());
        let report = exporter
            .export(&project, &dir.path().join("archive"))
            .await
            .unwrap();

        assert!(report.is_full_success());
        let calls = converter.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.as_deref(), Some("svc"));
    }

    #[tokio::test]
    async fn name_assignment_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let project = write_project(&dir.path().join("source"), &standard_layers());

        let mut assignments = Vec::new();
        for dest_name in ["first", "second"] {
            let converter = FakeConverter::new();
            let report = exporter(&converter)
                .export(&project, &dir.path().join(dest_name))
                .await
                .unwrap();
            assignments.push(
                report
                    .converted
                    .iter()
                    .map(|c| c.target.clone())
                    .collect::<Vec<_>>(),
            );
        }

        assert_eq!(assignments[0], vec!["Roads", "Roads_2", "Sites"]);
        assert_eq!(assignments[0], assignments[1]);
    }

    #[tokio::test]
    async fn conversion_failure_keeps_remaining_layers() {
        let dir = tempfile::tempdir().unwrap();
        let project = write_project(&dir.path().join("source"), &standard_layers());
        let dest = dir.path().join("archive");

        let converter = FakeConverter::failing_on("Roads_2");
        let report = exporter(&converter).export(&project, &dest).await.unwrap();

        assert!(!report.is_full_success());
        assert_eq!(report.converted.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "Roads");
        assert_eq!(report.credentials_stripped, 1);

        // The failed layer keeps pointing at the database, minus the
        // credentials; the others reference the container.
        let portable = fs::read_to_string(dest.join("survey_portable.qgs")).unwrap();
        assert!(portable.contains("./data.gpkg|layername=Roads"));
        assert!(portable.contains("./data.gpkg|layername=Sites"));
        assert!(portable.contains("roads_minor"));
        assert!(portable.contains(">postgres</provider>"));
        assert!(!portable.contains("password="));

        match report.into_result() {
            Err(Error::PartialFailure {
                operation,
                failed,
                total,
            }) => {
                assert_eq!(operation, "archive export");
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
            }
            other => panic!("expected partial failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn unparseable_datasource_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let layers = vec![
            ("sites_c3", "Sites", "postgres", SITES),
            ("odd_e5", "Odd", "postgres", "not a connection string"),
        ];
        let project = write_project(&dir.path().join("source"), &layers);

        let converter = FakeConverter::new();
        let report = exporter(&converter)
            .export(&project, &dir.path().join("archive"))
            .await
            .unwrap();

        assert_eq!(report.converted.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "Odd");
        assert!(!report.is_full_success());
    }

    #[tokio::test]
    async fn destination_inside_source_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        let project = write_project(&source, &standard_layers());

        let converter = FakeConverter::new();
        let err = exporter(&converter)
            .export(&project, &source.join("archive"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidName(_)));
        assert!(converter.calls.lock().unwrap().is_empty());
        assert!(
            !source.join("archive").exists(),
            "a refused export must not create the destination"
        );
    }

    #[tokio::test]
    async fn cancelled_token_stops_export() {
        let dir = tempfile::tempdir().unwrap();
        let project = write_project(&dir.path().join("source"), &standard_layers());

        let converter = FakeConverter::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let exporter = ArchiveExporter::new(&converter, ArchiveOptions::default(), cancel);
        let err = exporter
            .export(&project, &dir.path().join("archive"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(converter.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn absolute_paths_are_flagged() {
        let xml = concat!(
            r#"<maplayer><datasource>C:\gis\flur.tif</datasource></maplayer>"#,
            "\n",
            r#"<layer source="file:///home/gis/base.gpkg"/>"#,
            "\n",
            r#"<qgis xmlns="http://qgis.org/ns"><a>./relative/ok.tif</a></qgis>"#,
        );

        let warnings = absolute_path_warnings(xml).unwrap();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains(r"C:\gis\flur.tif")));
        assert!(warnings
            .iter()
            .any(|w| w.contains("file:///home/gis/base.gpkg")));
        assert!(!warnings.iter().any(|w| w.contains("qgis.org")));
    }

    #[test]
    fn report_renders_outcomes() {
        let report = ExportReport {
            project: PathBuf::from("/data/survey.qgs"),
            destination: PathBuf::from("/out"),
            files_copied: 12,
            container: "data.gpkg".to_string(),
            converted: vec![ConvertedLayer {
                layer: "Roads".to_string(),
                target: "Roads".to_string(),
                features: Some(31),
            }],
            failed: vec![("Sites".to_string(), "boom".to_string())],
            skipped: vec![],
            credentials_stripped: 2,
            warnings: vec!["absolute path remains: C:\\x".to_string()],
            portable_document: PathBuf::from("/out/survey_portable.qgs"),
        };

        let rendered = render_report(&report).unwrap();
        assert!(rendered.contains("Files copied: 12"));
        assert!(rendered.contains("Roads -> Roads (31 features)"));
        assert!(rendered.contains("Sites: boom"));
        assert!(rendered.contains("Credentials stripped from 2 layer(s)."));
        assert!(rendered.contains("C:\\x"));
        assert!(!rendered.contains("Skipped layers"));
    }
}
