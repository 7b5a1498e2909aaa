use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sanitizer::catalog::CatalogInspector;
use sanitizer::db::postgres::{PostgresConfig, PostgresConnector, PostgresDatabase, redact_db_url};
use sanitizer::orchestrator::{Orchestrator, RunOptions};
use sanitizer::plan::parse_plan;
use sanitizer::resequence::DEFAULT_SAFETY_MARGIN;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "sanitizer",
    about = "Key renumbering and referential-integrity maintenance"
)]
struct Cli {
    /// Overrides SANITIZER_DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan and print the report as JSON
    Run {
        /// JSON array of table descriptors
        #[arg(long)]
        plan: PathBuf,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        stop_on_error: bool,
        /// Deferred pool size; 0 keeps every phase inside the table transaction
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long, default_value_t = DEFAULT_SAFETY_MARGIN)]
        safety_margin: i64,
    },
    /// Show existence, size, max key and incoming foreign keys of a table
    Inspect {
        table: String,
        #[arg(long, default_value = "id")]
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Init structured logging (respects RUST_LOG; defaults to info)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Load .env if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let Some(database_url) = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("SANITIZER_DATABASE_URL").ok())
    else {
        eprintln!("FATAL: set SANITIZER_DATABASE_URL or pass --database-url");
        std::process::exit(2);
    };
    let cfg = postgres_config(database_url);

    tracing::info!(
        database = %redact_db_url(&cfg.url),
        schema = %cfg.schema,
        "connecting to database"
    );

    let cancel = CancellationToken::new();
    let db = Arc::new(PostgresDatabase::connect(&cfg, &cancel).await?);

    match cli.command {
        Commands::Run {
            plan,
            stop_on_error,
            workers,
            safety_margin,
        } => {
            let text = std::fs::read_to_string(&plan)?;
            let plan = parse_plan(&text)?;
            let workers = workers.unwrap_or_else(|| env_or("SANITIZER_WORKERS", 4));
            let options = RunOptions {
                stop_on_error,
                workers,
                safety_margin,
                target: None,
            };

            spawn_ctrl_c(cancel.clone());
            // Deferred work of already committed tables still finishes after Ctrl-C.
            let connector = PostgresConnector::new(cfg, CancellationToken::new());
            let orchestrator = Orchestrator::new(db, options)
                .with_connector(Arc::new(connector))
                .with_cancellation(cancel);
            let report = orchestrator.run(&plan).await;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.failed() > 0 || report.aborted {
                std::process::exit(1);
            }
        }
        Commands::Inspect { table, key } => {
            let info = CatalogInspector::new(db.as_ref()).describe(&table, &key).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}

fn postgres_config(url: String) -> PostgresConfig {
    let mut cfg = PostgresConfig::new(url);
    if let Ok(schema) = std::env::var("SANITIZER_SCHEMA") {
        cfg.schema = schema;
    }
    cfg.statement_timeout = Duration::from_secs(env_or("SANITIZER_STATEMENT_TIMEOUT_SECS", 300));
    cfg
}

/// Parse an env var, falling back to `default` when unset or malformed.
fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// First Ctrl-C stops the run at the next table boundary.
fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current table");
            cancel.cancel();
        }
    });
}
