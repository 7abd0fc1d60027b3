mod models;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::{EntityTrait, QueryOrder};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use sqlbind::cli::{self as db_cli, DbArgs};
use sqlbind::pagination::{PageRequest, Paginator};
use sqlbind::{DatabaseConfig, EngineManager, RoutingSession};

use models::{GROUPS_KEY, group, user};

/// Demo application for sqlbind: two databases, one migration tree
#[derive(Parser)]
#[command(name = "sqlbind-demo")]
#[command(version)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory relative sqlite paths and migrations resolve against
    #[arg(long)]
    root: Option<PathBuf>,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database migration commands
    Db(DbArgs),
    /// Create every missing table without migrations
    CreateAll,
    /// Add a user (default database)
    AddUser { name: String },
    /// Add a group (`groups` database)
    AddGroup { name: String },
    /// List users a page at a time
    ListUsers {
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 20)]
        per_page: i64,
    },
}

fn init_logging(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Layered config: built-in defaults, then the YAML file, then `SQLBIND_*` env.
fn load_config(cli: &Cli) -> Result<DatabaseConfig> {
    let defaults = DatabaseConfig::multi([
        ("default", "sqlite:///demo.db"),
        (GROUPS_KEY, "sqlite:///groups.db"),
    ]);
    let mut figment = Figment::new().merge(Serialized::default("database", defaults));
    if let Some(path) = &cli.config {
        if !path.is_file() {
            anyhow::bail!("config file does not exist: {}", path.display());
        }
        figment = figment.merge(Yaml::file(path));
    }
    figment = figment.merge(Env::prefixed("SQLBIND_").split("__"));

    let mut config = DatabaseConfig::from_figment(&figment)?;
    if let Some(root) = &cli.root {
        config.root_path = Some(root.clone());
    }
    if config.root_path.is_none() {
        config.root_path = Some(std::env::current_dir().context("resolving working directory")?);
    }
    Ok(config)
}

async fn list_users(session: &RoutingSession, page: i64, per_page: i64) -> Result<String> {
    let select = user::Entity::find().order_by_asc(user::Column::Id);
    let page = Paginator::new(session, select, PageRequest::page(page, per_page)).await?;
    let mut lines: Vec<String> = page
        .items
        .iter()
        .map(|u| format!("{:>4}  {}", u.id, u.name))
        .collect();
    lines.push(format!(
        "page {} of {} ({} users)",
        page.page,
        page.pages(),
        page.total.unwrap_or_default()
    ));
    session.close().await?;
    Ok(lines.join("\n"))
}

fn run(cli: Cli) -> Result<String> {
    models::register()?;
    let config = load_config(&cli)?;
    let db = EngineManager::new(config)?;
    tracing::debug!(engines = db.engines().len(), "engine manager ready");

    let output = match cli.command {
        Commands::Db(args) => db_cli::run(&db, args)?,
        Commands::CreateAll => {
            db.create_all_blocking(&sqlbind::Binds::All)?;
            "tables created".to_owned()
        }
        Commands::AddUser { name } => {
            let session = db.session();
            let saved = db.block_on(async {
                let saved = session
                    .insert(user::ActiveModel {
                        id: NotSet,
                        name: Set(name),
                    })
                    .await?;
                session.commit().await?;
                Ok::<_, sqlbind::DbError>(saved)
            })?;
            format!("user {} added", saved.id)
        }
        Commands::AddGroup { name } => {
            let session = db.session();
            let saved = db.block_on(async {
                let saved = session
                    .insert(group::ActiveModel {
                        id: NotSet,
                        name: Set(name),
                    })
                    .await?;
                session.commit().await?;
                Ok::<_, sqlbind::DbError>(saved)
            })?;
            format!("group {} added to '{GROUPS_KEY}'", saved.id)
        }
        Commands::ListUsers { page, per_page } => {
            let session = db.session();
            db.block_on(list_users(&session, page, per_page))?
        }
    };
    db.dispose_blocking();
    Ok(output)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{output}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
