use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use estate::api::{self, AppState};
use estate::config::AppConfig;
use estate_core::jobs::ImportMode;
use estate_core::{db, ImportRequest, ImportService, PgStore, Principal, Role};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about = "Estate ledger import CLI and API server", long_about = None)]
struct Cli {
    /// Path to a TOML config file (defaults to $ESTATE_CONFIG when set)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP import API
    Serve(ServeArgs),
    /// Run database migrations
    Migrate,
    /// Validate or commit a CSV file from the command line
    Import(ImportArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Address to listen on, overriding the config file
    #[arg(long)]
    bind: Option<String>,
    /// Skip running migrations on startup
    #[arg(long)]
    skip_migrations: bool,
}

#[derive(Args, Debug)]
struct ImportArgs {
    /// Dataset identifier, e.g. `processing` or `sales`
    dataset: String,
    /// CSV file to import (ignored when committing a token)
    file: Option<PathBuf>,
    #[arg(long, default_value = "validate")]
    mode: ImportMode,
    /// Validation token returned by an earlier validate run
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    tenant: Uuid,
    #[arg(long, default_value = "cli")]
    user: String,
    #[arg(long)]
    user_id: Option<Uuid>,
    #[arg(long, default_value = "owner")]
    role: Role,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve(args) => serve(config, args).await,
        Command::Migrate => {
            let pool = connect_pool(&config).await?;
            db::run_migrations(&pool).await?;
            info!("Database migrations applied");
            Ok(())
        }
        Command::Import(args) => import(config, args).await,
    }
}

async fn serve(config: AppConfig, args: ServeArgs) -> Result<()> {
    let pool = connect_pool(&config).await?;
    if !args.skip_migrations {
        db::run_migrations(&pool).await?;
    }

    let store = Arc::new(PgStore::new(pool));
    let imports = ImportService::new(store.clone(), store.clone(), store, config.import.clone());
    let router = api::router(Arc::new(AppState { imports }));

    let bind = args.bind.unwrap_or(config.bind);
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(address = %listener.local_addr()?, "import API listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn import(config: AppConfig, args: ImportArgs) -> Result<()> {
    let csv = match (&args.file, &args.token) {
        (Some(path), _) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, Some(_)) => String::new(),
        (None, None) => anyhow::bail!("a CSV file is required unless --token is given"),
    };

    let pool = connect_pool(&config).await?;
    let store = Arc::new(PgStore::new(pool));
    let service = ImportService::new(store.clone(), store.clone(), store, config.import.clone());

    let mut principal = Principal::new(args.tenant, args.user, args.role);
    if let Some(user_id) = args.user_id {
        principal = principal.with_user_id(user_id);
    }

    let request = ImportRequest {
        dataset: args.dataset,
        mode: args.mode,
        csv,
        validation_token: args.token,
    };
    let response = service
        .handle(&principal, request)
        .await
        .map_err(|err| anyhow::anyhow!("{} ({})", err, err.code()))?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn connect_pool(config: &AppConfig) -> Result<db::DbPool> {
    db::connect(config.database_url()?, config.max_connections).await
}
