use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

mod codec;
mod command;
mod config;
mod domain;
mod error;
mod executor;
mod filter;
mod ledger;
mod loader;
mod logger;
mod migrate;
mod program;
mod report;
mod template;

use config::{Config, Format};
use logger::ConsoleLogger;
use migrate::Migrator;

/// Version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

const EXIT_SUCCESS: i32 = 0;
const EXIT_FAILURE: i32 = 1;
/// Exit code reported when the run is interrupted by the user.
const EXIT_INTERRUPTED: i32 = 15;

/// How long in-flight work may wind down after an interrupt.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "migrator")]
#[command(version = VERSION)]
#[command(about = "Migration tool for PostgreSQL")]
#[command(
    long_about = "Tool for working with migrations written in Rust or represented as SQL files.\n\
                  Capabilities:\n\
                  \t* create - generate a migration template\n\
                  \t* up - apply migrations\n\
                  \t* down - roll back migrations\n\
                  \t* redo - repeat the last applied migration (down and up again)\n\
                  \t* status - display the status of migrations in a table\n\
                  \t* version - print the current migration version"
)]
#[command(subcommand_required = true, arg_required_else_help = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Database connection string (Data Source Name or DSN)
    #[arg(long, global = true)]
    dsn: Option<String>,

    /// Path to the migration folder
    #[arg(short = 'p', long = "path", global = true)]
    path: Option<PathBuf>,

    /// Format of migrations
    #[arg(short = 'f', long = "format", global = true, value_enum)]
    format: Option<Format>,

    /// Path to the log file
    #[arg(long = "log-path", global = true)]
    log_path: Option<PathBuf>,

    /// Logging level ("debug", "info", "warn", "error" and "fatal")
    #[arg(long = "log-level", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create migration files
    ///
    /// Creates migration files with a timestamped version and the given name
    /// in the migration directory. The "sql" format produces two files with
    /// up/down postfixes; the "rust" format produces a single source with
    /// up/down entry points.
    Create {
        /// Migration name
        name: String,
    },
    /// Apply all or up to <version> migrations
    ///
    /// Applies every migration since the last applied one. An optional
    /// version bounds the plan inclusively; the version is a boundary and
    /// does not have to exist.
    Up {
        /// Apply up to this version inclusive
        version: Option<String>,
    },
    /// Roll back to <version>, or all migrations
    ///
    /// Rolls back applied migrations down to the given version inclusive.
    /// Pass "all" to roll back everything.
    Down {
        /// Version to roll back to (inclusive), or "all"
        target: String,
    },
    /// Roll back the most recently applied migration, then run it again
    Redo,
    /// Display the status of migrations in a table
    Status,
    /// Print the current migration version
    Version,
    /// Generate a shell completion file in the home directory
    Completion {
        /// Target shell (bash or zsh); detected from $SHELL when omitted
        shell: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    // Load .env if present so the DSN can come from the environment.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err:#}");
            return EXIT_FAILURE;
        }
    };

    let logger = match ConsoleLogger::new(config.log_level, config.log_path.as_deref()) {
        Ok(logger) => Arc::new(logger),
        Err(err) => {
            eprintln!("Error: {err:#}");
            return EXIT_FAILURE;
        }
    };

    let token = CancellationToken::new();
    let migrator = Migrator::new(config, logger.clone(), token.clone());

    let exec_logger = logger.clone();
    let command = cli.command;
    let mut operation = tokio::spawn(async move { execute(command, migrator, exec_logger).await });

    let joined = tokio::select! {
        joined = &mut operation => Some(joined),
        _ = tokio::signal::ctrl_c() => None,
    };

    match joined {
        Some(Ok(Ok(()))) => EXIT_SUCCESS,
        Some(Ok(Err(err))) => {
            logger.error(&format!("program terminated with an error: {err:#}"));
            EXIT_FAILURE
        }
        Some(Err(err)) => {
            logger.error(&format!("migration task failed: {err}"));
            EXIT_FAILURE
        }
        None => {
            token.cancel();
            logger.error("program was interrupted by the user");
            // Give the in-flight migration and any child process a moment
            // to wind down, then leave with the interrupt code.
            let _ = timeout(SHUTDOWN_TIMEOUT, &mut operation).await;
            EXIT_INTERRUPTED
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config =
        Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    config.apply_cli(
        cli.dsn.as_deref(),
        cli.path.as_deref(),
        cli.format,
        cli.log_path.as_deref(),
        cli.log_level.as_deref(),
    )?;
    config.absolutize()?;
    Ok(config)
}

async fn execute(
    command: Commands,
    migrator: Migrator,
    logger: Arc<ConsoleLogger>,
) -> Result<()> {
    match command {
        Commands::Create { name } => {
            migrator.create(&name)?;
        }
        Commands::Up { version } => {
            let target = version.as_deref().map(codec::version_from_str).transpose()?;
            let count = migrator.up(target).await?;
            logger.info(&format!("total applied {count} migrations"));
        }
        Commands::Down { target } => {
            let count = if target == "all" {
                migrator.down_all().await?
            } else {
                migrator.down(codec::version_from_str(&target)?).await?
            };
            logger.info(&format!("total {count} migrations rolled back"));
        }
        Commands::Redo => match migrator.redo().await? {
            Some(migration) => logger.info(&format!(
                "version {} successfully rolled back and applied again",
                migration.version
            )),
            None => logger.warn("no applied migrations found in the database"),
        },
        Commands::Status => {
            let migrations = migrator.status().await?;
            if migrations.is_empty() {
                logger.warn("no migration found");
            } else {
                report::print_migrations(&migrations);
            }
        }
        Commands::Version => match migrator.version().await? {
            Some(migration) => report::print_migration(&migration),
            None => logger.warn("no migration applied"),
        },
        Commands::Completion { shell } => {
            write_completion(shell.as_deref(), &logger)?;
        }
    }

    Ok(())
}

/// Write a completion script to `~/.bash_completion_migrator` or
/// `~/.zsh_completion_migrator`, detecting the shell from `$SHELL` when no
/// argument was given.
fn write_completion(shell: Option<&str>, logger: &ConsoleLogger) -> Result<()> {
    let shell = match shell {
        Some(shell) => shell.to_string(),
        None => {
            let env_shell = std::env::var("SHELL").unwrap_or_default();
            let detected = if env_shell.ends_with("bash") {
                "bash"
            } else if env_shell.ends_with("zsh") {
                "zsh"
            } else {
                ""
            };
            if !detected.is_empty() {
                logger.info("command shell was detected automatically");
            }
            detected.to_string()
        }
    };

    let (generator, file_name) = match shell.as_str() {
        "bash" => (Shell::Bash, ".bash_completion_migrator"),
        "zsh" => (Shell::Zsh, ".zsh_completion_migrator"),
        _ => bail!("could not determine shell, use bash or zsh arguments"),
    };

    let home = std::env::var("HOME").context("could not determine home directory")?;
    let path = Path::new(&home).join(file_name);
    let mut file = fs::File::create(&path)
        .with_context(|| format!("could not create file on path {}", path.display()))?;

    let mut cli = Cli::command();
    clap_complete::generate(generator, &mut cli, "migrator", &mut file);

    logger.info(&format!(
        "{} file to completion was created successfully",
        path.display()
    ));
    Ok(())
}
