//! # Queue Engine CLI
//!
//! Command-line interface for the queue engine.
//!
//! This module provides CLI commands for:
//! - Running a scripted demo scenario on a simulated clock
//! - Inspecting a snapshot persisted by the filesystem storage driver
//! - Validating and showing the resolved configuration
//! - Generating shell completions
//!
//! Configuration is resolved from an optional file (`--config` or
//! `QUEUE_ENGINE_CONFIG`), then environment variables prefixed
//! `QUEUE_ENGINE__` with `__` between path segments, e.g.
//! `QUEUE_ENGINE__QUEUE__MAX_RETRIES=5`.

use clap::{CommandFactory, Parser, Subcommand};
use queue_engine_core::adapters::FilesystemStorage;
use queue_engine_core::{
    Clock, ConfigurationError, EnqueueOptions, ManualClock, Message, PersistenceError,
    QueueEngine, QueueId, QueueOptions, QueueStats, SequentialIdGenerator, Snapshot,
    StorageBackend,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Delay of the scheduled message in the demo scenario
const DEMO_SCHEDULED_DELAY: Duration = Duration::from_millis(500);

// ============================================================================
// CLI Structure
// ============================================================================

/// Queue engine CLI
#[derive(Parser)]
#[command(name = "queue-engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Embeddable message queue engine")]
#[command(
    long_about = "Priority queue engine with delayed delivery, retries, dead-lettering and snapshot persistence"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QUEUE_ENGINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level
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
#[derive(Subcommand)]
pub enum Commands {
    /// Run a scripted scenario against an in-memory queue
    Demo {
        /// Number of messages to enqueue
        #[arg(short, long, default_value = "5")]
        messages: usize,

        /// Output format
        #[arg(short, long)]
        format: Option<OutputFormat>,
    },

    /// Show a snapshot stored by the filesystem driver
    Inspect {
        /// Queue whose snapshot to load
        #[arg(short, long)]
        queue_id: String,

        /// Output format
        #[arg(short, long)]
        format: Option<OutputFormat>,
    },

    /// Validate configuration
    Config {
        /// Show resolved configuration
        #[arg(short, long)]
        show: bool,

        /// Output format for configuration
        #[arg(short = 'f', long, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Output format options
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
}

/// Configuration format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// JSON format
    Json,
    /// TOML format
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

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output formatting failed: {message}")]
    Output { message: String },
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Persistence(_) => 2,
            Self::CommandFailed { .. } => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
            Self::Output { .. } => 6,
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

    #[error("Validation error: {0}")]
    Validation(#[from] ConfigurationError),
}

fn output_error(e: impl std::fmt::Display) -> CliError {
    CliError::Output {
        message: e.to_string(),
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// CLI configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CliConfig {
    /// Options for every engine the CLI builds
    pub queue: QueueOptions,

    /// Output formatting preferences
    pub output: OutputConfig,
}

/// Output formatting preferences
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Format used when a command is given no `--format`
    pub default_format: OutputFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            default_format: OutputFormat::Text,
        }
    }
}

/// Resolve configuration from an optional file and the environment
///
/// The file format is taken from its extension (yaml, toml or json).
pub fn load_configuration(path: Option<&Path>) -> Result<CliConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        info!(path = %path.display(), "Loading configuration file");
        builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
    }

    let config = builder
        .add_source(
            config::Environment::with_prefix("QUEUE_ENGINE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let cli_config: CliConfig = config.try_deserialize()?;
    cli_config.queue.validate()?;

    debug!(config = ?cli_config, "Resolved configuration");
    Ok(cli_config)
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `level`. Logs go to stderr so command
/// output on stdout stays machine-readable.
pub fn initialize_logging(level: &str, json: bool) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| CliError::InvalidArgument {
            arg: "log-level".to_string(),
            message: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::CommandFailed {
        message: format!("Failed to initialize logging: {}", e),
    })
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli.log_level, cli.json_logs)?;

    let config = load_configuration(cli.config.as_deref())?;
    let output = execute(cli.command, &config).await?;
    write_output(&mut std::io::stdout().lock(), &output)
}

/// Write rendered command output, surfacing write failures as [`CliError::Io`]
pub fn write_output<W: std::io::Write>(writer: &mut W, output: &str) -> Result<(), CliError> {
    writer.write_all(output.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Run one command and return what it prints
pub async fn execute(command: Commands, config: &CliConfig) -> Result<String, CliError> {
    let default_format = config.output.default_format;

    match command {
        Commands::Demo { messages, format } => {
            let report = run_demo(messages, &config.queue)?;
            render_demo(&report, format.unwrap_or(default_format))
        }
        Commands::Inspect { queue_id, format } => {
            let queue_id = QueueId::new(queue_id).map_err(|e| CliError::InvalidArgument {
                arg: "queue-id".to_string(),
                message: e.to_string(),
            })?;
            let snapshot = load_snapshot(&queue_id, &config.queue.persistence_path).await?;
            render_snapshot(&snapshot, format.unwrap_or(default_format))
        }
        Commands::Config { show, format } => {
            if show {
                render_config(config, format)
            } else {
                Ok("Configuration is valid\n".to_string())
            }
        }
        Commands::Completions { shell } => {
            let mut buffer = Vec::new();
            clap_complete::generate(shell, &mut Cli::command(), "queue-engine", &mut buffer);
            String::from_utf8(buffer).map_err(output_error)
        }
    }
}

// ============================================================================
// Demo Command
// ============================================================================

/// How the demo consumer handled one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DemoOutcome {
    Completed,
    Failed,
}

/// One delivery made during the demo
#[derive(Debug, Clone, Serialize)]
pub struct DemoDelivery {
    pub id: String,
    pub priority: i32,
    pub attempt: u32,
    pub outcome: DemoOutcome,
}

/// Result of the demo scenario
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub queue_id: String,
    pub deliveries: Vec<DemoDelivery>,
    /// Dead-lettered ids before the manual retry
    pub dead_letter: Vec<String>,
    pub retried_from_dead_letter: Option<String>,
    pub stats: QueueStats,
    /// Simulated time the scenario took
    pub elapsed_ms: u64,
}

/// Run the demo scenario
///
/// Enqueues `messages` messages with rotating priorities plus one delayed
/// message, then consumes until nothing is left: odd-numbered messages fail
/// every attempt and end up dead-lettered (or parked), the rest complete.
/// Finally the first dead-lettered message is retried and completed. The
/// engine runs on a manual clock that jumps to the next delay, so the
/// scenario finishes instantly.
pub fn run_demo(messages: usize, options: &QueueOptions) -> Result<DemoReport, CliError> {
    let mut options = options.clone();
    options.persistence_enabled = false;
    options.auto_check_delayed = false;

    let clock = Arc::new(ManualClock::new());
    let start = clock.now();
    let queue_id = QueueId::new("demo").map_err(|e| CliError::CommandFailed {
        message: e.to_string(),
    })?;
    let engine = QueueEngine::<Value>::builder(queue_id)
        .options(options)
        .clock(clock.clone())
        .id_generator(Arc::new(SequentialIdGenerator::new("demo")))
        .build()
        .map_err(ConfigError::from)?;

    info!(messages = messages, "Running demo scenario");

    for n in 0..messages {
        engine.enqueue(
            serde_json::json!({ "n": n, "fail": n % 2 == 1 }),
            EnqueueOptions::new().with_priority((n % 3) as i32),
        );
    }
    engine.enqueue(
        serde_json::json!({ "n": "scheduled", "fail": false }),
        EnqueueOptions::new().with_delay(DEMO_SCHEDULED_DELAY),
    );

    let mut deliveries = Vec::new();
    loop {
        while let Some(message) = engine.dequeue() {
            deliveries.push(consume(&engine, &message));
        }

        let next_due = engine
            .get_delayed_messages()
            .iter()
            .filter_map(|m| m.delay_until)
            .min();
        match next_due {
            Some(due) => clock.set(due),
            None => break,
        }
    }

    let dead_letter: Vec<String> = engine
        .get_dead_letter_messages()
        .iter()
        .map(|m| m.id.to_string())
        .collect();

    let retried = dead_letter.first().cloned();
    if let Some(id) = &retried {
        engine.retry_dead_letter(id);
        if let Some(message) = engine.dequeue() {
            engine.complete(message.id.as_str());
            deliveries.push(delivery(&message, DemoOutcome::Completed));
        }
    }

    let report = DemoReport {
        queue_id: engine.queue_id().to_string(),
        deliveries,
        dead_letter,
        retried_from_dead_letter: retried,
        stats: engine.stats(),
        elapsed_ms: u64::try_from(clock.now().duration_since(start).as_millis())
            .unwrap_or(u64::MAX),
    };
    engine.dispose();

    Ok(report)
}

fn consume(engine: &QueueEngine<Value>, message: &Message<Value>) -> DemoDelivery {
    let should_fail = message
        .payload
        .get("fail")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if should_fail {
        engine.fail(message.id.as_str(), Some("simulated failure"));
        delivery(message, DemoOutcome::Failed)
    } else {
        engine.complete(message.id.as_str());
        delivery(message, DemoOutcome::Completed)
    }
}

fn delivery(message: &Message<Value>, outcome: DemoOutcome) -> DemoDelivery {
    DemoDelivery {
        id: message.id.to_string(),
        priority: message.priority,
        attempt: message.processing_attempts + 1,
        outcome,
    }
}

/// Format a demo report
pub fn render_demo(report: &DemoReport, format: OutputFormat) -> Result<String, CliError> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(report)
            .map(|s| s + "\n")
            .map_err(output_error),
        OutputFormat::Text => {
            let mut out = String::new();
            writeln!(out, "Queue: {}", report.queue_id).map_err(output_error)?;
            writeln!(out, "Deliveries:").map_err(output_error)?;
            for d in &report.deliveries {
                writeln!(
                    out,
                    "  {}  priority {:>3}  attempt {}  {:?}",
                    d.id, d.priority, d.attempt, d.outcome
                )
                .map_err(output_error)?;
            }
            writeln!(out, "Dead-lettered: {}", report.dead_letter.join(", "))
                .map_err(output_error)?;
            if let Some(id) = &report.retried_from_dead_letter {
                writeln!(out, "Retried from dead-letter: {}", id).map_err(output_error)?;
            }
            write_stats(&mut out, &report.stats).map_err(output_error)?;
            writeln!(out, "Simulated time: {} ms", report.elapsed_ms).map_err(output_error)?;
            Ok(out)
        }
    }
}

fn write_stats(out: &mut String, stats: &QueueStats) -> std::fmt::Result {
    writeln!(
        out,
        "Stats: pending {}, processing {}, completed {}, failed {}, delayed {}, dead-letter {}",
        stats.pending,
        stats.processing,
        stats.completed,
        stats.failed,
        stats.delayed,
        stats.dead_letter
    )
}

// ============================================================================
// Inspect Command
// ============================================================================

/// Load the snapshot of `queue_id` stored under `path`
pub async fn load_snapshot(
    queue_id: &QueueId,
    path: &Path,
) -> Result<Snapshot<Value>, CliError> {
    let storage = FilesystemStorage::new(path);
    let raw = storage
        .load(&queue_id.storage_key())
        .await
        .map_err(PersistenceError::from)?
        .ok_or_else(|| CliError::CommandFailed {
            message: format!(
                "No snapshot stored for queue '{}' in {}",
                queue_id,
                path.display()
            ),
        })?;

    Ok(Snapshot::decode(&raw, queue_id).map_err(PersistenceError::from)?)
}

/// Format a snapshot
pub fn render_snapshot(
    snapshot: &Snapshot<Value>,
    format: OutputFormat,
) -> Result<String, CliError> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(snapshot)
            .map(|s| s + "\n")
            .map_err(output_error),
        OutputFormat::Text => {
            let mut out = String::new();
            writeln!(
                out,
                "Queue: {} ({} messages)",
                snapshot.queue_id,
                snapshot.len()
            )
            .map_err(output_error)?;

            for (title, messages) in [
                ("Ready", &snapshot.messages),
                ("Delayed", &snapshot.delayed_messages),
                ("Dead-letter", &snapshot.dead_letter_messages),
            ] {
                writeln!(out, "{} ({}):", title, messages.len()).map_err(output_error)?;
                for m in messages {
                    write!(
                        out,
                        "  {}  {}  priority {}  attempts {}",
                        m.id, m.status, m.priority, m.processing_attempts
                    )
                    .map_err(output_error)?;
                    if let Some(until) = m.delay_until {
                        write!(out, "  until {}", until).map_err(output_error)?;
                    }
                    if let Some(reason) = &m.failure_reason {
                        write!(out, "  reason: {}", reason).map_err(output_error)?;
                    }
                    writeln!(out).map_err(output_error)?;
                }
            }
            Ok(out)
        }
    }
}

// ============================================================================
// Config Command
// ============================================================================

/// Serialize the resolved configuration
pub fn render_config(config: &CliConfig, format: ConfigFormat) -> Result<String, CliError> {
    match format {
        ConfigFormat::Yaml => serde_yaml::to_string(config).map_err(output_error),
        ConfigFormat::Json => serde_json::to_string_pretty(config)
            .map(|s| s + "\n")
            .map_err(output_error),
        ConfigFormat::Toml => toml::to_string(config).map_err(output_error),
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
