//! # jobctl
//!
//! Command-line interface for the job runtime.
//!
//! This module provides CLI commands for:
//! - Pushing a job to either backend
//! - Running a logging worker for a set of (topic, channel) bindings
//! - Validating and printing the resolved configuration
//!
//! Configuration is read from a YAML, TOML or JSON file named by `--config`
//! (or `JOBCTL_CONFIG`) and overlaid by `JOBCTL__...` environment variables,
//! e.g. `JOBCTL__WORKER__CONCURRENCY=5` sets `worker.concurrency`.

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use job_runtime::helper::Helper;
use job_runtime::job::parse_timestamp;
use job_runtime::{
    Backend, BackendConfig, Job, JobBackend, JobError, ProcessingError, ProcessorBindings,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "JOBCTL";

// ============================================================================
// CLI Structure
// ============================================================================

/// jobctl - push and work background jobs
#[derive(Debug, Parser)]
#[command(name = "jobctl")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Push and process background jobs on a queue service or pub/sub broker")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "JOBCTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level or filter directive; RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Push one job
    Push(PushArgs),

    /// Run a logging worker until Ctrl+C or SIGTERM
    Work {
        /// Binding as topic:channel (queue:job-type for the queue service)
        #[arg(short, long = "bind", required = true)]
        bindings: Vec<String>,
    },

    /// Validate the configuration
    Config {
        /// Print the resolved configuration
        #[arg(short, long)]
        show: bool,

        /// Output format for --show
        #[arg(short, long, value_enum, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Arguments of `jobctl push`
#[derive(Debug, Clone, clap::Args)]
pub struct PushArgs {
    /// Target queue (pub/sub topic)
    #[arg(short, long, default_value = job_runtime::job::DEFAULT_QUEUE)]
    pub queue: String,

    /// Job type
    #[arg(short = 't', long = "type")]
    pub job_type: String,

    /// Positional job argument as JSON; repeatable
    #[arg(short, long = "arg")]
    pub args: Vec<String>,

    /// Custom entry as key=<json>; repeatable
    #[arg(long = "custom")]
    pub custom: Vec<String>,

    /// Scheduled time, RFC 3339
    #[arg(long, conflicts_with = "delay_seconds")]
    pub at: Option<String>,

    /// Schedule relative to now
    #[arg(long)]
    pub delay_seconds: Option<i64>,
}

/// Configuration output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Connection failed: {0}")]
    Connection(JobError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Connection(_) => 2,
            Self::CommandFailed { .. } => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
        }
    }

    fn invalid_argument(arg: &str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg: arg.to_string(),
            message: message.into(),
        }
    }
}

impl From<JobError> for CliError {
    fn from(error: JobError) -> Self {
        match error {
            JobError::Connect { .. } => Self::Connection(error),
            JobError::Configuration(e) => Self::Configuration(ConfigError::Invalid(e)),
            JobError::Io(e) => Self::Io(e),
            other => Self::CommandFailed {
                message: other.to_string(),
            },
        }
    }
}

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] job_runtime::ConfigurationError),

    #[error("Failed to render configuration: {message}")]
    Render { message: String },
}

// ============================================================================
// Configuration
// ============================================================================

/// Load the backend configuration from `path` and `JOBCTL__` variables, then validate it
pub fn load_configuration(path: Option<&Path>) -> Result<BackendConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        builder = builder.add_source(config::File::from(path).required(true));
        info!(path = %path.display(), "Loading configuration file");
    }

    let config = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("sender.nsqd_addresses")
                .with_list_parse_key("worker.lookupd_addresses")
                .with_list_parse_key("worker.labels"),
        )
        .build()?;

    let backend: BackendConfig = config.try_deserialize()?;
    backend.validate()?;
    Ok(backend)
}

/// Serialize `config` in `format`
pub fn render_config(config: &BackendConfig, format: ConfigFormat) -> Result<String, ConfigError> {
    let render_error = |message: String| ConfigError::Render { message };
    match format {
        ConfigFormat::Yaml => serde_yaml::to_string(config).map_err(|e| render_error(e.to_string())),
        ConfigFormat::Json => {
            serde_json::to_string_pretty(config).map_err(|e| render_error(e.to_string()))
        }
        ConfigFormat::Toml => toml::to_string(config).map_err(|e| render_error(e.to_string())),
    }
}

// ============================================================================
// Argument Parsing
// ============================================================================

/// Build the job described by `jobctl push` arguments
pub fn build_job(args: &PushArgs) -> Result<Job, CliError> {
    let values = args
        .args
        .iter()
        .map(|raw| {
            serde_json::from_str::<Value>(raw)
                .map_err(|e| CliError::invalid_argument("--arg", format!("'{}': {}", raw, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut job = Job::new(args.job_type.clone(), values).with_queue(args.queue.clone());

    for entry in &args.custom {
        let (key, raw) = entry.split_once('=').ok_or_else(|| {
            CliError::invalid_argument("--custom", format!("'{}' is not key=<json>", entry))
        })?;
        if key.is_empty() {
            return Err(CliError::invalid_argument("--custom", "key must not be empty"));
        }
        let value = serde_json::from_str::<Value>(raw)
            .map_err(|e| CliError::invalid_argument("--custom", format!("'{}': {}", raw, e)))?;
        job = job.with_custom(key, value);
    }

    if let Some(at) = &args.at {
        let at = parse_timestamp(at).map_err(|e| CliError::invalid_argument("--at", e.to_string()))?;
        job = job.with_at(at);
    } else if let Some(seconds) = args.delay_seconds {
        if seconds < 0 {
            return Err(CliError::invalid_argument(
                "--delay-seconds",
                "must not be negative",
            ));
        }
        job = job.with_delay(chrono::Duration::seconds(seconds));
    }

    job.validate()
        .map_err(|e| CliError::invalid_argument("job", e.to_string()))?;
    Ok(job)
}

/// Parse `topic:channel` bindings
pub fn parse_bindings(raw: &[String]) -> Result<Vec<(String, String)>, CliError> {
    raw.iter()
        .map(|binding| match binding.split_once(':') {
            Some((topic, channel)) if !topic.is_empty() && !channel.is_empty() => {
                Ok((topic.to_string(), channel.to_string()))
            }
            _ => Err(CliError::invalid_argument(
                "--bind",
                format!("'{}' is not topic:channel", binding),
            )),
        })
        .collect()
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Run a parsed command line
pub async fn run_cli(cli: Cli) -> Result<(), CliError> {
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "jobctl", &mut std::io::stdout());
        return Ok(());
    }

    initialize_logging(&cli)?;
    let config = load_configuration(cli.config.as_deref())?;

    match cli.command {
        Commands::Push(args) => execute_push_command(&args, config).await,
        Commands::Work { bindings } => execute_work_command(&bindings, config).await,
        Commands::Config { show, format } => execute_config_command(&config, show, format),
        Commands::Completions { .. } => Ok(()),
    }
}

/// Initialize logging from the CLI flags; `RUST_LOG` wins over `--log-level`
fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cli.log_level)
            .map_err(|e| CliError::invalid_argument("--log-level", e.to_string()))?,
    };

    let (json, text) = if cli.json_logs {
        (
            Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
            None,
        )
    } else {
        (
            None,
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
        .map_err(|e| CliError::CommandFailed {
            message: format!("failed to initialize logging: {}", e),
        })
}

async fn execute_push_command(args: &PushArgs, config: BackendConfig) -> Result<(), CliError> {
    let job = build_job(args)?;
    let backend = Backend::connect(config).await?;

    let result = backend.push(&job).await;
    backend.stop().await;
    result?;

    info!(queue = %job.queue, job_type = %job.job_type, at = ?job.at, "Job pushed");
    println!("Pushed {} to {}", job.job_type, job.queue);
    Ok(())
}

async fn execute_work_command(bindings: &[String], config: BackendConfig) -> Result<(), CliError> {
    let pairs = parse_bindings(bindings)?;
    let backend = Backend::connect(config).await?;

    let table = pairs
        .iter()
        .fold(ProcessorBindings::new(), |table, (topic, channel)| {
            table.bind(topic.as_str(), channel.as_str(), log_job)
        });
    backend.set_processor(table)?;
    backend.start().await?;
    info!(bindings = ?pairs, backend = %backend.kind(), "Worker running; press Ctrl+C to stop");

    let stopped = backend.context();
    tokio::select! {
        result = shutdown_signal() => result?,
        _ = stopped.cancelled() => warn!("Backend stopped unexpectedly"),
    }

    info!("Shutting down worker");
    backend.stop().await;
    Ok(())
}

fn execute_config_command(
    config: &BackendConfig,
    show: bool,
    format: ConfigFormat,
) -> Result<(), CliError> {
    if show {
        print!("{}", render_config(config, format)?);
    } else {
        println!("Configuration is valid (backend: {})", config.kind());
    }
    Ok(())
}

/// Processor used by `jobctl work`
async fn log_job(helper: Arc<dyn Helper>, args: Vec<Value>) -> Result<(), ProcessingError> {
    info!(
        jid = %helper.jid(),
        job_type = %helper.job_type(),
        queue = %helper.job().queue,
        args = %serde_json::Value::Array(args),
        "Received job"
    );
    Ok(())
}

/// Wait for Ctrl+C, or SIGTERM on Unix
async fn shutdown_signal() -> Result<(), CliError> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
