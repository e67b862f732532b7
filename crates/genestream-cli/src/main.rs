//! genestream CLI - stream gene expression vectors through the prefetching loader.

use anyhow::Result;
use clap::{Parser, Subcommand};
use genestream_core::config::LogFormat;
use genestream_core::{Config, Error};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (unreadable or invalid config file)
    ConfigError = 1,
    /// Item store error (missing directory, unreadable vectors)
    StoreError = 2,
    /// Invalid request (empty or duplicate keys, malformed group)
    InvalidRequest = 3,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Convert an error to an exit code by inspecting its source.
    fn from_error(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<Error>() {
            Some(Error::Config(_)) | Some(Error::Serialization(_)) => ExitCode::ConfigError,
            Some(Error::Store(_)) | Some(Error::Load(_)) | Some(Error::Io(_)) => {
                ExitCode::StoreError
            }
            Some(Error::InvalidRequest(_)) => ExitCode::InvalidRequest,
            Some(Error::Metrics(_)) | None => ExitCode::RuntimeError,
        }
    }
}

mod commands;

use commands::Outcome;

#[derive(Parser)]
#[command(name = "genestream")]
#[command(about = "Prefetching streaming loader for gene expression vectors", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream genes from a directory of packed vectors
    Stream(commands::stream::StreamArgs),

    /// Stream synthetic genes and report throughput
    Bench(commands::bench::BenchArgs),

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Try to load config for log settings (optional - falls back to defaults)
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring)
        .unwrap_or_default();

    // Initialize logging
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(monitoring.log_level.as_directive()),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    // Logs go to stderr so per-gene output on stdout stays pipeable
    match monitoring.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(Outcome::Completed) => ExitCode::Success,
        Ok(Outcome::Interrupted) => ExitCode::SignalInterrupt,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<Outcome> {
    match cli.command {
        Commands::Stream(args) => {
            let config = load_config_or_default(cli.config.as_deref())?;
            commands::stream::run(config, args).await
        }

        Commands::Bench(args) => {
            let config = load_config_or_default(cli.config.as_deref())?;
            commands::bench::run(config, args).await
        }

        Commands::Validate => {
            let path = cli
                .config
                .unwrap_or_else(|| PathBuf::from("genestream.toml"));
            let config = load_config(&path)?;
            commands::validate::run(&path, &config);
            Ok(Outcome::Completed)
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).map_err(|e| match e {
        Error::Io(io) => Error::Config(format!("Cannot read {}: {}", path.display(), io)).into(),
        other => other.into(),
    })
}

fn load_config_or_default(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => Ok(Config::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genestream_core::{LoadError, StoreError};

    #[test]
    fn test_exit_code_from_error() {
        let config: anyhow::Error = Error::Config("bad".into()).into();
        assert_eq!(ExitCode::from_error(&config), ExitCode::ConfigError);

        let store: anyhow::Error = Error::Store(StoreError::NotFound("x".into())).into();
        assert_eq!(ExitCode::from_error(&store), ExitCode::StoreError);

        let load: anyhow::Error = Error::Load(LoadError::Aborted).into();
        assert_eq!(ExitCode::from_error(&load), ExitCode::StoreError);

        let request: anyhow::Error = Error::InvalidRequest("empty".into()).into();
        assert_eq!(ExitCode::from_error(&request), ExitCode::InvalidRequest);

        let other = anyhow::anyhow!("something else");
        assert_eq!(ExitCode::from_error(&other), ExitCode::RuntimeError);
    }

    #[test]
    fn test_missing_config_is_config_error() {
        let err = load_config(Path::new("/nonexistent/genestream.toml")).unwrap_err();
        assert_eq!(ExitCode::from_error(&err), ExitCode::ConfigError);
    }

    #[test]
    fn test_cli_parses_stream() {
        let cli = Cli::try_parse_from([
            "genestream",
            "-vv",
            "stream",
            "--dir",
            "/data",
            "--genes",
            "CD3E,MS4A1",
            "--exclude",
            "3,4",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Stream(_)));
    }

    #[test]
    fn test_cli_rejects_cells_with_exclude() {
        let result = Cli::try_parse_from([
            "genestream", "stream", "--dir", "/data", "--cells", "1", "--exclude", "2",
        ]);
        assert!(result.is_err());
    }
}
