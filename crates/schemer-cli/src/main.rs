mod config;
mod tls;

use clap::{Parser, Subcommand, ValueEnum};
use owo_colors::OwoColorize;
use schemer::{Action, ColumnUpdate, Migration, MigrationReport, Migrator};
use std::error::Error as _;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tls::SslMode;
use tracing_subscriber::EnvFilter;

/// Declarative Postgres schema reconciliation.
#[derive(Parser, Debug)]
#[command(name = "schemer", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring the database schema in line with a declaration
    Migrate {
        /// Declaration file (defaults to the one named in the config)
        file: Option<PathBuf>,

        /// Database connection URL (overrides the config's connection)
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,

        /// Schema to reconcile
        #[arg(long)]
        schema: Option<String>,

        /// How to apply column type and nullability changes
        #[arg(long, value_enum)]
        column_update: Option<ColumnUpdateArg>,

        /// TLS mode (overrides the config's `sslmode`)
        #[arg(long, value_enum)]
        sslmode: Option<SslMode>,
    },
    /// Parse and validate a declaration without connecting
    Check {
        /// Declaration file (defaults to the one named in the config)
        file: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ColumnUpdateArg {
    Alter,
    Recreate,
}

impl From<ColumnUpdateArg> for ColumnUpdate {
    fn from(arg: ColumnUpdateArg) -> Self {
        match arg {
            ColumnUpdateArg::Alter => ColumnUpdate::Alter,
            ColumnUpdateArg::Recreate => ColumnUpdate::Recreate,
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid column_update {0:?} in config, expected `alter` or `recreate`")]
    ColumnUpdate(String),

    #[error("invalid sslmode {0:?} in config, expected `disable`, `require` or `verify-full`")]
    SslMode(String),

    #[error("failed to connect to {target}")]
    Connect {
        target: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error(transparent)]
    Schema(#[from] schemer::Error),
}

#[tokio::main]
async fn main() {
    // Load .env before clap reads DATABASE_URL
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("schemer=info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("{} {}", "error:".red().bold(), err);
        let mut source = err.source();
        while let Some(cause) = source {
            eprintln!("  {} {}", "caused by:".dimmed(), cause);
            source = cause.source();
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let loaded = config::load()?;
    if let Some(path) = &loaded.path {
        tracing::debug!(config = %path.display(), "using config");
    }

    match cli.command {
        Command::Check { file } => {
            let path = file.unwrap_or_else(|| loaded.declaration_path());
            let migration = read_declaration(&path)?;
            migration.validate()?;
            println!(
                "{} {} ({} tables)",
                "ok".green().bold(),
                path.display(),
                migration.tables.len()
            );
            Ok(())
        }
        Command::Migrate {
            file,
            database_url,
            schema,
            column_update,
            sslmode,
        } => {
            let path = file.unwrap_or_else(|| loaded.declaration_path());
            let migration = read_declaration(&path)?;

            let column_update = match column_update {
                Some(arg) => arg.into(),
                None => parse_column_update(loaded.config.column_update.as_deref())?,
            };
            let sslmode = match sslmode {
                Some(mode) => mode,
                None => {
                    let configured = loaded.config.connection.sslmode();
                    SslMode::parse(configured)
                        .ok_or_else(|| CliError::SslMode(configured.to_string()))?
                }
            };
            let schema = schema.unwrap_or_else(|| loaded.config.connection.schema().to_string());
            let (conn_str, target) = match database_url {
                Some(url) => {
                    let target = mask_password(&url);
                    (url, target)
                }
                None => {
                    let connection = &loaded.config.connection;
                    let target = format!(
                        "{}@{}:{}/{}",
                        connection.user(),
                        connection.host(),
                        connection.port(),
                        connection.database()
                    );
                    (connection.to_conn_string(), target)
                }
            };

            tracing::info!(database = %target, schema = %schema, sslmode = ?sslmode, "connecting");
            let client = tls::connect(&conn_str, sslmode)
                .await
                .map_err(|source| CliError::Connect {
                    target: target.clone(),
                    source,
                })?;

            let migrator = Migrator::new(&client)
                .with_schema(schema)?
                .column_update(column_update);
            tracing::debug!(
                schema = %migrator.schema(),
                column_update = ?column_update,
                "starting migration"
            );
            let report = migrator.migrate(&migration).await?;
            print_report(&report);
            Ok(())
        }
    }
}

fn read_declaration(path: &Path) -> Result<Migration, CliError> {
    let content = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    facet_styx::from_str(&content).map_err(|e| CliError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn parse_column_update(value: Option<&str>) -> Result<ColumnUpdate, CliError> {
    match value.map(str::trim) {
        None => Ok(ColumnUpdate::default()),
        Some(s) if s.eq_ignore_ascii_case("alter") => Ok(ColumnUpdate::Alter),
        Some(s) if s.eq_ignore_ascii_case("recreate") => Ok(ColumnUpdate::Recreate),
        Some(other) => Err(CliError::ColumnUpdate(other.to_string())),
    }
}

fn print_report(report: &MigrationReport) {
    if report.is_empty() {
        println!("{}", "Schema is up to date.".green());
        return;
    }

    let mut current: Option<&str> = None;
    for change in &report.changes {
        if current != Some(change.table.as_str()) {
            println!("{}:", change.table.bold());
            current = Some(change.table.as_str());
        }
        let line = change.to_string();
        match change.action {
            Action::Create => println!("  {}", line.green()),
            Action::Delete => println!("  {}", line.red()),
            Action::Update | Action::Noop => println!("  {}", line.yellow()),
        }
        for sql in &change.statements {
            println!("      {}", sql.dimmed());
        }
    }
    println!();
    println!(
        "{} changes, {} statements",
        report.changes.len(),
        report.statement_count()
    );
}

fn mask_password(url: &str) -> String {
    // Replace the password between :// and @
    if let Some(start) = url.find("://") {
        if let Some(at) = url.rfind('@') {
            if at > start + 3 {
                let prefix = &url[..start + 3];
                let suffix = &url[at..];
                if let Some(colon) = url[start + 3..at].find(':') {
                    let user = &url[start + 3..start + 3 + colon];
                    return format!("{}{}:***{}", prefix, user, suffix);
                }
            }
        }
    }
    url.to_string()
}
