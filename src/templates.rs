use tracing::{info, warn};

use crate::common::{format_size, is_protected_database, validate_database_name, CancelToken};
use crate::db::{CatalogOps, DatabaseInfo, DatabaseState, SessionInfo};
use crate::error::{Error, Result};
use crate::truncate::{truncate_all, TruncationReport};

/// Outcome of a template creation. The truncation report is part of the
/// result so partial failures stay visible at the call site.
#[derive(Debug)]
pub struct CreateReport {
    pub template: String,
    pub source: String,
    pub sessions_terminated: usize,
    pub warnings: Vec<String>,
    pub truncation: TruncationReport,
}

#[derive(Debug)]
pub struct DeployReport {
    pub database: String,
    pub template: String,
    pub sessions_terminated: usize,
    pub warnings: Vec<String>,
}

/// Orchestrates template state transitions against the live catalog.
///
/// The engine holds no state of its own; every operation re-queries the
/// server. Transitions are sequences of discrete server calls, and a step
/// failing after the clone never rolls the clone back, since dropping a
/// database the operator may want to inspect is itself destructive.
pub struct LifecycleEngine<'a> {
    catalog: &'a dyn CatalogOps,
    cancel: CancelToken,
}

impl<'a> LifecycleEngine<'a> {
    pub fn new(catalog: &'a dyn CatalogOps, cancel: CancelToken) -> Self {
        LifecycleEngine { catalog, cancel }
    }

    /// Creates a structural template named `name` from `source`.
    ///
    /// Preflights fail before any destructive step. After the clone
    /// succeeds the new database exists on the server, so later failures
    /// surface as an inconsistency to resolve manually, never as a
    /// silent rollback.
    pub async fn create(
        &self,
        source: &str,
        name: &str,
        comment: Option<&str>,
    ) -> Result<CreateReport> {
        validate_database_name(name)?;
        if is_protected_database(name) {
            return Err(Error::PermissionDenied(format!(
                "'{}' is a protected system database",
                name
            )));
        }
        if !self.catalog.has_create_privilege().await? {
            return Err(Error::PermissionDenied(
                "the connected role may not create databases".to_string(),
            ));
        }
        if self.catalog.database_state(name).await? != DatabaseState::Absent {
            return Err(Error::Conflict(format!("database '{}' already exists", name)));
        }
        if self.catalog.database_state(source).await? == DatabaseState::Absent {
            return Err(Error::NotFound(format!(
                "source database '{}' does not exist",
                source
            )));
        }

        self.cancel.check()?;
        let sessions_terminated = self.evict_sessions(source).await?;

        self.cancel.check()?;
        self.catalog.create_database_from(name, source, true).await?;
        info!("created template '{}' from '{}'", name, source);

        let mut warnings = Vec::new();
        if let Some(comment) = comment {
            if let Err(e) = self.catalog.set_comment(name, comment).await {
                warn!("could not set comment on '{}': {}", name, e);
                warnings.push(format!("comment not set: {}", e));
            }
        }

        // From here on the template exists; report rather than roll back.
        self.cancel.check().map_err(|_| half_built(name, "cancelled"))?;
        let schema = self
            .catalog
            .open_schema(name)
            .await
            .map_err(|e| half_built(name, &e.to_string()))?;
        let truncation = truncate_all(schema.as_ref(), &self.cancel)
            .await
            .map_err(|e| half_built(name, &e.to_string()))?;

        Ok(CreateReport {
            template: name.to_string(),
            source: source.to_string(),
            sessions_terminated,
            warnings,
            truncation,
        })
    }

    /// Stamps out a new database `name` from an existing template. No
    /// truncation afterwards; the template holds no data.
    pub async fn deploy(
        &self,
        template: &str,
        name: &str,
        comment: Option<&str>,
    ) -> Result<DeployReport> {
        validate_database_name(name)?;
        if is_protected_database(name) {
            return Err(Error::PermissionDenied(format!(
                "'{}' is a protected system database",
                name
            )));
        }
        match self.catalog.database_state(template).await? {
            DatabaseState::Template => {}
            DatabaseState::Absent => {
                return Err(Error::NotFound(format!(
                    "template '{}' does not exist",
                    template
                )))
            }
            DatabaseState::Regular => {
                return Err(Error::NotFound(format!(
                    "'{}' is not a template",
                    template
                )))
            }
        }
        if self.catalog.database_state(name).await? != DatabaseState::Absent {
            return Err(Error::Conflict(format!("database '{}' already exists", name)));
        }

        self.cancel.check()?;
        // The server refuses to clone a database with open sessions.
        let sessions_terminated = self.evict_sessions(template).await?;

        self.cancel.check()?;
        self.catalog
            .create_database_from(name, template, false)
            .await?;
        info!("deployed '{}' from template '{}'", name, template);

        let mut warnings = Vec::new();
        if let Some(comment) = comment {
            if let Err(e) = self.catalog.set_comment(name, comment).await {
                warn!("could not set comment on '{}': {}", name, e);
                warnings.push(format!("comment not set: {}", e));
            }
        }

        Ok(DeployReport {
            database: name.to_string(),
            template: template.to_string(),
            sessions_terminated,
            warnings,
        })
    }

    /// Deletes a template: clear the template flag, then drop.
    ///
    /// When the flag is cleared but the drop fails the database is left
    /// behind as a regular database. That half-transition is a defined
    /// outcome and is reported as such.
    pub async fn delete(&self, name: &str) -> Result<()> {
        if is_protected_database(name) {
            return Err(Error::PermissionDenied(format!(
                "'{}' is a protected system database",
                name
            )));
        }
        match self.catalog.database_state(name).await? {
            DatabaseState::Template => {}
            DatabaseState::Absent => {
                return Err(Error::NotFound(format!("template '{}' does not exist", name)))
            }
            DatabaseState::Regular => {
                return Err(Error::NotFound(format!("'{}' is not a template", name)))
            }
        }

        self.cancel.check()?;
        self.catalog.set_template_flag(name, false).await?;
        if let Err(e) = self.catalog.drop_database(name).await {
            return Err(Error::Inconsistent(format!(
                "the template flag on '{}' was cleared but the drop failed: {}; \
                 the database is now regular, retry with 'db drop'",
                name, e
            )));
        }
        info!("deleted template '{}'", name);
        Ok(())
    }

    /// Drops a regular database. Templates must be deleted through
    /// [`LifecycleEngine::delete`] so the flag is cleared first.
    pub async fn drop_database(&self, name: &str) -> Result<()> {
        if is_protected_database(name) {
            return Err(Error::PermissionDenied(format!(
                "'{}' is a protected system database",
                name
            )));
        }
        match self.catalog.database_state(name).await? {
            DatabaseState::Regular => {}
            DatabaseState::Absent => {
                return Err(Error::NotFound(format!("database '{}' does not exist", name)))
            }
            DatabaseState::Template => {
                return Err(Error::Conflict(format!(
                    "'{}' is a template, delete it with 'template delete'",
                    name
                )))
            }
        }

        if let Some(info) = self
            .catalog
            .list_databases()
            .await?
            .into_iter()
            .find(|d| d.name == name)
        {
            let size = info
                .size_bytes
                .map(format_size)
                .unwrap_or_else(|| "unknown size".to_string());
            info!("dropping '{}' owned by '{}' ({})", name, info.owner, size);
        }

        self.cancel.check()?;
        self.evict_sessions(name).await?;
        self.catalog.drop_database(name).await?;
        info!("dropped database '{}'", name);
        Ok(())
    }

    /// Empties every user table of a database, leaving its schema intact.
    /// Other sessions stay connected; a lock one of them holds surfaces as
    /// a per-table failure in the report.
    pub async fn truncate_database(&self, name: &str) -> Result<TruncationReport> {
        if is_protected_database(name) {
            return Err(Error::PermissionDenied(format!(
                "'{}' is a protected system database",
                name
            )));
        }
        if self.catalog.database_state(name).await? == DatabaseState::Absent {
            return Err(Error::NotFound(format!("database '{}' does not exist", name)));
        }

        self.cancel.check()?;
        let schema = self.catalog.open_schema(name).await?;
        truncate_all(schema.as_ref(), &self.cancel).await
    }

    /// All template databases, live from the catalog.
    pub async fn templates(&self) -> Result<Vec<DatabaseInfo>> {
        let databases = self.catalog.list_databases().await?;
        Ok(databases
            .into_iter()
            .filter(|d| d.is_template && !is_protected_database(&d.name))
            .collect())
    }

    /// All regular user databases, live from the catalog.
    pub async fn user_databases(&self) -> Result<Vec<DatabaseInfo>> {
        let databases = self.catalog.list_databases().await?;
        Ok(databases
            .into_iter()
            .filter(|d| !d.is_template && !is_protected_database(&d.name))
            .collect())
    }

    /// Terminates foreign sessions on `database`. A session reconnecting
    /// mid-step is a known race; one retry, then the operation fails as
    /// busy rather than looping.
    async fn evict_sessions(&self, database: &str) -> Result<usize> {
        let sessions = self.catalog.active_sessions(database).await?;
        let mut terminated = self.terminate_each(&sessions).await?;
        let mut remaining = self.catalog.active_sessions(database).await?;
        if !remaining.is_empty() {
            terminated += self.terminate_each(&remaining).await?;
            remaining = self.catalog.active_sessions(database).await?;
        }
        if remaining.is_empty() {
            if terminated > 0 {
                info!("terminated {} sessions on '{}'", terminated, database);
            }
            Ok(terminated)
        } else {
            let sessions = remaining
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            Err(Error::Busy(format!(
                "{} sessions still connected to '{}': {}",
                remaining.len(),
                database,
                sessions
            )))
        }
    }

    async fn terminate_each(&self, sessions: &[SessionInfo]) -> Result<usize> {
        let mut terminated = 0;
        for session in sessions {
            if self.catalog.terminate_session(session.pid).await? {
                terminated += 1;
            }
        }
        Ok(terminated)
    }
}

fn half_built(name: &str, cause: &str) -> Error {
    Error::Inconsistent(format!(
        "template '{}' was created but not emptied: {}; delete it and retry",
        name, cause
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SchemaOps, TableRef};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct FakeDb {
        is_template: bool,
        sessions: usize,
        /// How many times a session reappears right after termination.
        reconnects: usize,
        tables: Vec<TableRef>,
    }

    impl FakeDb {
        fn regular(tables: &[&str]) -> Self {
            FakeDb {
                is_template: false,
                sessions: 0,
                reconnects: 0,
                tables: tables
                    .iter()
                    .map(|name| TableRef {
                        schema: "public".to_string(),
                        name: name.to_string(),
                    })
                    .collect(),
            }
        }

        fn template(tables: &[&str]) -> Self {
            FakeDb {
                is_template: true,
                ..FakeDb::regular(tables)
            }
        }
    }

    struct FakeCatalog {
        databases: Mutex<HashMap<String, FakeDb>>,
        calls: Arc<Mutex<Vec<String>>>,
        can_create: bool,
        fail_drop: bool,
        fail_open: bool,
    }

    impl FakeCatalog {
        fn new(databases: &[(&str, FakeDb)]) -> Self {
            FakeCatalog {
                databases: Mutex::new(
                    databases
                        .iter()
                        .map(|(name, db)| (name.to_string(), db.clone()))
                        .collect(),
                ),
                calls: Arc::new(Mutex::new(Vec::new())),
                can_create: true,
                fail_drop: false,
                fail_open: false,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn names(&self) -> Vec<String> {
            let mut names: Vec<String> =
                self.databases.lock().unwrap().keys().cloned().collect();
            names.sort();
            names
        }

        fn log(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    #[async_trait]
    impl CatalogOps for FakeCatalog {
        async fn database_state(&self, name: &str) -> Result<DatabaseState> {
            self.log(&format!("state {}", name));
            Ok(match self.databases.lock().unwrap().get(name) {
                None => DatabaseState::Absent,
                Some(db) if db.is_template => DatabaseState::Template,
                Some(_) => DatabaseState::Regular,
            })
        }

        async fn list_databases(&self) -> Result<Vec<DatabaseInfo>> {
            self.log("list");
            let databases = self.databases.lock().unwrap();
            let mut infos: Vec<DatabaseInfo> = databases
                .iter()
                .map(|(name, db)| DatabaseInfo {
                    name: name.clone(),
                    owner: "gis".to_string(),
                    is_template: db.is_template,
                    allows_connections: true,
                    size_bytes: Some(8_192_000),
                    comment: None,
                })
                .collect();
            infos.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(infos)
        }

        async fn has_create_privilege(&self) -> Result<bool> {
            self.log("privilege");
            Ok(self.can_create)
        }

        async fn active_sessions(&self, database: &str) -> Result<Vec<SessionInfo>> {
            self.log(&format!("sessions {}", database));
            let databases = self.databases.lock().unwrap();
            let count = databases.get(database).map(|db| db.sessions).unwrap_or(0);
            Ok((0..count)
                .map(|i| SessionInfo {
                    pid: 100 + i as i32,
                    user: Some("qgis".to_string()),
                    application: Some("QGIS".to_string()),
                    client_addr: Some("10.0.0.7".to_string()),
                })
                .collect())
        }

        async fn terminate_session(&self, pid: i32) -> Result<bool> {
            self.log(&format!("terminate {}", pid));
            let mut databases = self.databases.lock().unwrap();
            for db in databases.values_mut() {
                if db.sessions > 0 {
                    db.sessions -= 1;
                    if db.sessions == 0 && db.reconnects > 0 {
                        db.reconnects -= 1;
                        db.sessions = 1;
                    }
                    return Ok(true);
                }
            }
            Ok(false)
        }

        async fn create_database_from(
            &self,
            name: &str,
            template: &str,
            as_template: bool,
        ) -> Result<()> {
            self.log(&format!("create {} from {} template={}", name, template, as_template));
            let mut databases = self.databases.lock().unwrap();
            let source = databases
                .get(template)
                .ok_or_else(|| Error::NotFound(format!("no '{}'", template)))?
                .clone();
            databases.insert(
                name.to_string(),
                FakeDb {
                    is_template: as_template,
                    sessions: 0,
                    reconnects: 0,
                    tables: source.tables,
                },
            );
            Ok(())
        }

        async fn set_template_flag(&self, name: &str, value: bool) -> Result<()> {
            self.log(&format!("flag {} {}", name, value));
            let mut databases = self.databases.lock().unwrap();
            match databases.get_mut(name) {
                Some(db) => {
                    db.is_template = value;
                    Ok(())
                }
                None => Err(Error::NotFound(format!("no '{}'", name))),
            }
        }

        async fn drop_database(&self, name: &str) -> Result<()> {
            self.log(&format!("drop {}", name));
            if self.fail_drop {
                return Err(Error::Busy("lingering connection".to_string()));
            }
            self.databases.lock().unwrap().remove(name);
            Ok(())
        }

        async fn set_comment(&self, name: &str, comment: &str) -> Result<()> {
            self.log(&format!("comment {} '{}'", name, comment));
            Ok(())
        }

        async fn open_schema(&self, database: &str) -> Result<Box<dyn SchemaOps>> {
            self.log(&format!("open {}", database));
            if self.fail_open {
                return Err(Error::Database(sqlx::Error::PoolClosed));
            }
            let databases = self.databases.lock().unwrap();
            let db = databases
                .get(database)
                .ok_or_else(|| Error::NotFound(format!("no '{}'", database)))?;
            Ok(Box::new(FakeSchema {
                database: database.to_string(),
                tables: db.tables.clone(),
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    struct FakeSchema {
        database: String,
        tables: Vec<TableRef>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SchemaOps for FakeSchema {
        async fn list_tables(&self) -> Result<Vec<TableRef>> {
            Ok(self.tables.clone())
        }

        async fn truncate_cascade(&self, table: &TableRef) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("truncate {} {}", self.database, table));
            Ok(())
        }
    }

    fn engine(catalog: &FakeCatalog) -> LifecycleEngine<'_> {
        LifecycleEngine::new(catalog, CancelToken::new())
    }

    #[tokio::test]
    async fn create_clones_flags_and_empties() {
        let catalog = FakeCatalog::new(&[("kgr_survey", FakeDb::regular(&["sites", "finds"]))]);
        let report = engine(&catalog)
            .create("kgr_survey", "kgr_template", None)
            .await
            .unwrap();

        assert!(report.truncation.is_full_success());
        assert_eq!(report.truncation.succeeded.len(), 2);
        assert!(catalog.databases.lock().unwrap()["kgr_template"].is_template);

        let calls = catalog.calls();
        assert!(calls.contains(&"create kgr_template from kgr_survey template=true".to_string()));
        assert!(calls.contains(&"truncate kgr_template public.sites".to_string()));
        assert!(calls.contains(&"truncate kgr_template public.finds".to_string()));
    }

    #[tokio::test]
    async fn create_conflict_runs_no_destructive_step() {
        let catalog = FakeCatalog::new(&[
            ("kgr_survey", FakeDb::regular(&["sites"])),
            ("kgr_template", FakeDb::regular(&[])),
        ]);
        let err = engine(&catalog)
            .create("kgr_survey", "kgr_template", None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Conflict(_)));
        let calls = catalog.calls();
        assert!(!calls.iter().any(|c| c.starts_with("terminate")));
        assert!(!calls.iter().any(|c| c.starts_with("create")));
    }

    #[tokio::test]
    async fn create_requires_privilege() {
        let mut catalog = FakeCatalog::new(&[("src", FakeDb::regular(&[]))]);
        catalog.can_create = false;
        let err = engine(&catalog).create("src", "tpl", None).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        assert!(!catalog.calls().iter().any(|c| c.starts_with("create")));
    }

    #[tokio::test]
    async fn create_missing_source_is_not_found() {
        let catalog = FakeCatalog::new(&[]);
        let err = engine(&catalog).create("nope", "tpl", None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn create_rejects_invalid_names_before_any_call() {
        let catalog = FakeCatalog::new(&[("src", FakeDb::regular(&[]))]);
        let err = engine(&catalog).create("src", "1bad", None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidName(_)));
        assert!(catalog.calls().is_empty());
    }

    #[tokio::test]
    async fn session_race_is_retried_once_then_succeeds() {
        let mut src = FakeDb::regular(&["sites"]);
        src.sessions = 2;
        src.reconnects = 1;
        let catalog = FakeCatalog::new(&[("src", src)]);
        let report = engine(&catalog).create("src", "tpl", None).await.unwrap();

        assert_eq!(report.sessions_terminated, 3);
        let calls = catalog.calls();
        let terminates = calls.iter().filter(|c| c.starts_with("terminate")).count();
        assert_eq!(terminates, 3);
        let enumerations = calls.iter().filter(|c| *c == "sessions src").count();
        assert_eq!(enumerations, 3, "initial pass plus one retry");
    }

    #[tokio::test]
    async fn persistent_sessions_fail_busy_after_one_retry() {
        let mut src = FakeDb::regular(&["sites"]);
        src.sessions = 1;
        src.reconnects = 5;
        let catalog = FakeCatalog::new(&[("src", src)]);
        let err = engine(&catalog).create("src", "tpl", None).await.unwrap_err();

        assert!(matches!(err, Error::Busy(_)));
        let terminates = catalog
            .calls()
            .iter()
            .filter(|c| c.starts_with("terminate"))
            .count();
        assert_eq!(terminates, 2, "single retry, then surface busy");
        assert!(!catalog.calls().iter().any(|c| c.starts_with("create")));
    }

    #[tokio::test]
    async fn failure_after_clone_reports_inconsistency_and_keeps_the_clone() {
        let mut catalog = FakeCatalog::new(&[("src", FakeDb::regular(&["sites"]))]);
        catalog.fail_open = true;
        let err = engine(&catalog).create("src", "tpl", None).await.unwrap_err();

        assert!(matches!(err, Error::Inconsistent(_)));
        let databases = catalog.databases.lock().unwrap();
        assert!(databases.contains_key("tpl"), "half-built template stays");
        assert!(databases["tpl"].is_template);
    }

    #[tokio::test]
    async fn deploy_clones_without_truncation() {
        let catalog = FakeCatalog::new(&[("tpl", FakeDb::template(&["sites"]))]);
        let report = engine(&catalog)
            .deploy("tpl", "survey_2026", Some("season 2026"))
            .await
            .unwrap();

        assert_eq!(report.database, "survey_2026");
        let databases = catalog.databases.lock().unwrap();
        assert!(!databases["survey_2026"].is_template);
        drop(databases);

        let calls = catalog.calls();
        assert!(calls.contains(&"create survey_2026 from tpl template=false".to_string()));
        assert!(calls.contains(&"comment survey_2026 'season 2026'".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("truncate")));
    }

    #[tokio::test]
    async fn deploy_rejects_missing_or_regular_templates() {
        let catalog = FakeCatalog::new(&[("plain", FakeDb::regular(&[]))]);
        let engine = engine(&catalog);

        let err = engine.deploy("ghost", "d1", None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = engine.deploy("plain", "d1", None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn deploy_into_existing_name_is_a_conflict() {
        let catalog = FakeCatalog::new(&[
            ("tpl", FakeDb::template(&[])),
            ("taken", FakeDb::regular(&[])),
        ]);
        let err = engine(&catalog).deploy("tpl", "taken", None).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_unflags_then_drops() {
        let catalog = FakeCatalog::new(&[("tpl", FakeDb::template(&[]))]);
        engine(&catalog).delete("tpl").await.unwrap();

        assert!(!catalog.databases.lock().unwrap().contains_key("tpl"));
        let calls = catalog.calls();
        let flag = calls.iter().position(|c| c == "flag tpl false").unwrap();
        let dropped = calls.iter().position(|c| c == "drop tpl").unwrap();
        assert!(flag < dropped);
    }

    #[tokio::test]
    async fn delete_of_missing_template_is_not_found() {
        let catalog = FakeCatalog::new(&[]);
        let err = engine(&catalog).delete("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_refuses_protected_databases() {
        let catalog = FakeCatalog::new(&[("template1", FakeDb::template(&[]))]);
        let err = engine(&catalog).delete("template1").await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        assert!(catalog.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_drop_leaves_a_reported_regular_database() {
        let mut catalog = FakeCatalog::new(&[("tpl", FakeDb::template(&[]))]);
        catalog.fail_drop = true;
        let err = engine(&catalog).delete("tpl").await.unwrap_err();

        assert!(matches!(err, Error::Inconsistent(_)));
        let databases = catalog.databases.lock().unwrap();
        assert!(databases.contains_key("tpl"));
        assert!(!databases["tpl"].is_template, "flag stays cleared");
    }

    #[tokio::test]
    async fn create_then_delete_restores_the_catalog() {
        let catalog = FakeCatalog::new(&[("src", FakeDb::regular(&["sites"]))]);
        let before = catalog.names();

        let engine = engine(&catalog);
        engine.create("src", "t1", None).await.unwrap();
        engine.delete("t1").await.unwrap();

        assert_eq!(catalog.names(), before);
    }

    #[tokio::test]
    async fn drop_database_refuses_templates() {
        let catalog = FakeCatalog::new(&[
            ("tpl", FakeDb::template(&[])),
            ("plain", FakeDb::regular(&[])),
        ]);
        let engine = engine(&catalog);

        let err = engine.drop_database("tpl").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        engine.drop_database("plain").await.unwrap();
        assert!(!catalog.databases.lock().unwrap().contains_key("plain"));
    }

    #[tokio::test]
    async fn listings_split_templates_from_user_databases() {
        let catalog = FakeCatalog::new(&[
            ("tpl", FakeDb::template(&[])),
            ("plain", FakeDb::regular(&[])),
            ("postgres", FakeDb::regular(&[])),
            ("template1", FakeDb::template(&[])),
        ]);
        let engine = engine(&catalog);

        let templates = engine.templates().await.unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].name, "tpl");

        let databases = engine.user_databases().await.unwrap();
        assert_eq!(databases.len(), 1);
        assert_eq!(databases[0].name, "plain");
    }

    #[tokio::test]
    async fn truncate_leaves_foreign_sessions_alone() {
        let mut db = FakeDb::regular(&["sites"]);
        db.sessions = 1;
        let catalog = FakeCatalog::new(&[("plain", db)]);
        let report = engine(&catalog).truncate_database("plain").await.unwrap();

        assert!(report.is_full_success());
        let calls = catalog.calls();
        assert!(!calls.iter().any(|c| c.starts_with("terminate")));
        assert!(!calls.iter().any(|c| c.starts_with("sessions")));
    }

    #[tokio::test]
    async fn delete_leaves_foreign_sessions_alone() {
        let mut db = FakeDb::template(&[]);
        db.sessions = 1;
        let catalog = FakeCatalog::new(&[("tpl", db)]);
        engine(&catalog).delete("tpl").await.unwrap();

        let calls = catalog.calls();
        assert!(!calls.iter().any(|c| c.starts_with("terminate")));
        assert!(!calls.iter().any(|c| c.starts_with("sessions")));
    }

    #[tokio::test]
    async fn truncate_database_guards_and_delegates() {
        let catalog = FakeCatalog::new(&[("plain", FakeDb::regular(&["a", "b"]))]);
        let engine = engine(&catalog);

        let err = engine.truncate_database("postgres").await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        let report = engine.truncate_database("plain").await.unwrap();
        assert!(report.is_full_success());
        assert_eq!(report.succeeded.len(), 2);
    }
}
