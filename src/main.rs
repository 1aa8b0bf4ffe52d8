use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use geostamp::archive::{render_report, ArchiveExporter, ArchiveOptions};
use geostamp::common::{self, format_size, CancelToken};
use geostamp::config::ConnectionProfile;
use geostamp::convert::Ogr2ogrConverter;
use geostamp::datasource::{FieldEdit, FieldOverrides};
use geostamp::db::postgres::PgCatalog;
use geostamp::db::DatabaseInfo;
use geostamp::project::{clean_document, fix_layers, ProjectDocument, SourceMatch};
use geostamp::templates::LifecycleEngine;

#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    #[clap(short, long, global = true)]
    log_level: Option<String>,
    /// Connection profile for commands that talk to the server.
    #[clap(short, long, global = true, default_value = "connection.yaml")]
    connection: String,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter connection profile.
    Init,
    Template {
        #[clap(subcommand)]
        command: TemplateCommands,
    },
    Db {
        #[clap(subcommand)]
        command: DbCommands,
    },
    Archive {
        #[clap(subcommand)]
        command: ArchiveCommands,
    },
    Project {
        #[clap(subcommand)]
        command: ProjectCommands,
    },
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// Clone a database into a new template and empty every table.
    Create { source: String, name: String },
    /// Clone a template into a new working database.
    Deploy {
        template: String,
        name: String,
        #[clap(long)]
        comment: Option<String>,
    },
    /// Unflag and drop a template.
    Delete { name: String },
    /// List template databases.
    List,
}

#[derive(Subcommand)]
enum DbCommands {
    /// List regular databases.
    List,
    /// Empty every user table in a database.
    Truncate { name: String },
    /// Drop a regular database.
    Drop { name: String },
}

#[derive(Subcommand)]
enum ArchiveCommands {
    /// Export a project into a self-contained folder.
    Export {
        project: PathBuf,
        dest: PathBuf,
        /// File name of the GeoPackage written into the destination.
        #[clap(long, default_value = "data.gpkg")]
        container: String,
        /// Conversion binary to invoke.
        #[clap(long, default_value = "ogr2ogr")]
        ogr2ogr: String,
    },
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Strip credentials from every layer of a project document.
    Clean { project: PathBuf },
    /// Rewrite connection fields of layers matching a source database.
    Fix {
        project: PathBuf,
        #[clap(long)]
        match_host: String,
        #[clap(long)]
        match_port: String,
        #[clap(long)]
        match_dbname: String,
        #[clap(long)]
        set_host: Option<String>,
        #[clap(long)]
        set_port: Option<String>,
        #[clap(long)]
        set_dbname: Option<String>,
        #[clap(long)]
        set_user: Option<String>,
        #[clap(long)]
        set_password: Option<String>,
        #[clap(long)]
        set_schema: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    setup_logging(&args.log_level);

    let cancel = CancelToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            interrupt.cancel();
        }
    });

    match args.command {
        Commands::Init => init_profile(&args.connection)?,
        Commands::Template { command } => {
            run_template(command, &args.connection, cancel).await?
        }
        Commands::Db { command } => run_db(command, &args.connection, cancel).await?,
        Commands::Archive { command } => run_archive(command, &args.connection, cancel).await?,
        Commands::Project { command } => run_project(command)?,
    }

    Ok(())
}

fn init_profile(path: &str) -> Result<()> {
    let profile = ConnectionProfile::default();
    common::write_string_to_file(path, &serde_yaml::to_string(&profile)?)?;
    info!("Wrote starter connection profile: {}", path);
    println!("{} edit '{}' and set host, user and password.", "ok:".green(), path);
    Ok(())
}

async fn run_template(
    command: TemplateCommands,
    connection: &str,
    cancel: CancelToken,
) -> Result<()> {
    let profile = ConnectionProfile::from_file(connection)?;
    let catalog = PgCatalog::connect(&profile).await?;
    let engine = LifecycleEngine::new(&catalog, cancel);

    match command {
        TemplateCommands::Create { source, name } => {
            let report = engine.create(&source, &name, None).await?;
            if report.sessions_terminated > 0 {
                println!(
                    "Terminated {} session(s) on '{}'.",
                    report.sessions_terminated, source
                );
            }
            println!("{}", report.truncation);
            for warning in &report.warnings {
                println!("{} {}", "warning:".yellow(), warning);
            }
            report.truncation.into_result("template create")?;
            println!(
                "{} template '{}' created from '{}'.",
                "ok:".green(),
                name,
                source
            );
        }
        TemplateCommands::Deploy {
            template,
            name,
            comment,
        } => {
            let report = engine.deploy(&template, &name, comment.as_deref()).await?;
            if report.sessions_terminated > 0 {
                println!(
                    "Terminated {} session(s) on '{}'.",
                    report.sessions_terminated, template
                );
            }
            for warning in &report.warnings {
                println!("{} {}", "warning:".yellow(), warning);
            }
            println!(
                "{} database '{}' deployed from template '{}'.",
                "ok:".green(),
                name,
                template
            );
        }
        TemplateCommands::Delete { name } => {
            engine.delete(&name).await?;
            println!("{} template '{}' deleted.", "ok:".green(), name);
        }
        TemplateCommands::List => {
            let templates = engine.templates().await?;
            print_databases("Templates", &templates);
        }
    }
    Ok(())
}

async fn run_db(command: DbCommands, connection: &str, cancel: CancelToken) -> Result<()> {
    let profile = ConnectionProfile::from_file(connection)?;
    let catalog = PgCatalog::connect(&profile).await?;
    let engine = LifecycleEngine::new(&catalog, cancel);

    match command {
        DbCommands::List => {
            let databases = engine.user_databases().await?;
            print_databases("Databases", &databases);
        }
        DbCommands::Truncate { name } => {
            let report = engine.truncate_database(&name).await?;
            println!("{}", report);
            report.into_result("db truncate")?;
            println!("{} database '{}' emptied.", "ok:".green(), name);
        }
        DbCommands::Drop { name } => {
            engine.drop_database(&name).await?;
            println!("{} database '{}' dropped.", "ok:".green(), name);
        }
    }
    Ok(())
}

async fn run_archive(
    command: ArchiveCommands,
    connection: &str,
    cancel: CancelToken,
) -> Result<()> {
    match command {
        ArchiveCommands::Export {
            project,
            dest,
            container,
            ogr2ogr,
        } => {
            // The profile only supplies fallback credentials here; layers
            // whose connection strings are complete work without it.
            let profile = match ConnectionProfile::from_file(connection) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("no connection profile: {}", e);
                    None
                }
            };
            let options = ArchiveOptions {
                container_name: container,
                fallback_user: profile.as_ref().map(|p| p.user.clone()),
                fallback_password: profile.as_ref().and_then(|p| p.resolved_password()),
            };
            let converter = Ogr2ogrConverter::new(ogr2ogr);
            let exporter = ArchiveExporter::new(&converter, options, cancel);

            let report = exporter.export(&project, &dest).await?;
            println!("{}", render_report(&report)?);
            let report = report.into_result()?;
            println!(
                "{} portable archive written to '{}'.",
                "ok:".green(),
                report.destination.display()
            );
        }
    }
    Ok(())
}

fn run_project(command: ProjectCommands) -> Result<()> {
    match command {
        ProjectCommands::Clean { project } => {
            let doc = ProjectDocument::read(&project)?;
            let outcome = clean_document(&doc)?;
            let path = doc.variant_path("cleaned");
            doc.write_variant(&outcome.xml, &path)?;
            println!("Stripped credentials from {} layer(s).", outcome.stripped);
            for name in &outcome.skipped {
                println!(
                    "{} could not parse the datasource of layer '{}'",
                    "warning:".yellow(),
                    name
                );
            }
            println!("{} wrote '{}'.", "ok:".green(), path.display());
        }
        ProjectCommands::Fix {
            project,
            match_host,
            match_port,
            match_dbname,
            set_host,
            set_port,
            set_dbname,
            set_user,
            set_password,
            set_schema,
        } => {
            let doc = ProjectDocument::read(&project)?;
            let source = SourceMatch {
                host: match_host,
                port: match_port,
                dbname: match_dbname,
            };
            let overrides = FieldOverrides {
                host: FieldEdit::from_option(set_host),
                port: FieldEdit::from_option(set_port),
                dbname: FieldEdit::from_option(set_dbname),
                user: FieldEdit::from_option(set_user),
                password: FieldEdit::from_option(set_password),
                schema: FieldEdit::from_option(set_schema),
            };
            let outcome = fix_layers(&doc, &source, &overrides)?;
            let path = doc.variant_path("fixed");
            doc.write_variant(&outcome.xml, &path)?;
            println!("Rewrote {} matching layer(s).", outcome.changed);
            for name in &outcome.skipped {
                println!(
                    "{} could not parse the datasource of layer '{}'",
                    "warning:".yellow(),
                    name
                );
            }
            println!("{} wrote '{}'.", "ok:".green(), path.display());
        }
    }
    Ok(())
}

fn print_databases(heading: &str, rows: &[DatabaseInfo]) {
    println!("{}", heading.bold());
    if rows.is_empty() {
        println!("  (none)");
        return;
    }
    for info in rows {
        let size = info
            .size_bytes
            .map(format_size)
            .unwrap_or_else(|| "-".to_string());
        let comment = info.comment.as_deref().unwrap_or("");
        println!(
            "  {:<32} {:<16} {:>10}  {}",
            info.name, info.owner, size, comment
        );
    }
}

fn setup_logging(log_level: &Option<String>) {
    let log_level = match log_level
        .as_ref()
        .unwrap_or(&"info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!("handlebars=off,{}", log_level)))
        .without_time()
        .init();
}
