//! Taskline CLI - administer jobs directly against the durable store.
//!
//! Lists, inspects, retries and cancels jobs, runs stale-lock recovery and
//! purges old settled jobs. No worker process needs to be running.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

use taskline_core::config::{Config, StrategyKind};
use taskline_core::jobs::{build_strategy, JobId, JobListOptions, JobQueueStrategy, JobRecord, JobState};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Structure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(
    name = "taskline",
    version,
    about = "Taskline - job queue administration",
    long_about = "Inspect and repair Taskline jobs in the configured PostgreSQL or Redis store.",
    propagate_version = true
)]
struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    format: OutputFormat,

    /// Configuration file path
    #[arg(short, long, global = true, env = "TASKLINE_CONFIG")]
    config: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    Text,
    Json,
    #[default]
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Job operations
    #[command(subcommand)]
    Jobs(JobCommands),

    /// Requeue or fail running jobs whose lease expired
    Recover {
        /// Override `recovery.stale_after` (e.g. 90s, 5m)
        #[arg(long, value_parser = parse_duration)]
        stale_after: Option<Duration>,
    },

    /// Delete settled jobs
    Purge {
        /// Only these queues (repeatable); every queue when omitted
        #[arg(short, long = "queue")]
        queues: Vec<String>,

        /// Minimum age of the settled jobs to delete (e.g. 12h, 7d)
        #[arg(long, default_value = "7d", value_parser = parse_duration)]
        older_than: Duration,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// List jobs
    List {
        /// Only these queues (repeatable)
        #[arg(short, long = "queue")]
        queues: Vec<String>,

        /// Only these states (repeatable), e.g. failed
        #[arg(short, long = "state")]
        states: Vec<JobState>,

        #[arg(long, default_value = "0")]
        skip: usize,

        #[arg(short = 'n', long, default_value = "50")]
        take: usize,
    },

    /// Show one job
    Show {
        id: JobId,
    },

    /// Put a failed job back in its queue for one more attempt
    Retry {
        id: JobId,
    },

    /// Cancel a job. Running jobs settle when their handler returns.
    Cancel {
        id: JobId,
    },
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    #[derive(Deserialize)]
    struct Human(#[serde(with = "humantime_serde")] Duration);

    serde_json::from_value::<Human>(serde_json::Value::String(s.to_string()))
        .map(|h| h.0)
        .map_err(|e| format!("invalid duration '{}': {}", s, e))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Data Types for Output
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Tabled)]
struct JobSummary {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Queue")]
    queue: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Attempts")]
    attempts: String,
    #[tabled(rename = "Progress")]
    progress: String,
    #[tabled(rename = "Created")]
    created_at: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl From<&JobRecord> for JobSummary {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: record.id.to_string(),
            queue: record.queue_name.clone(),
            state: format_state(record.state),
            attempts: format!("{}/{}", record.attempts, record.retries + 1),
            progress: format!("{}%", record.progress),
            created_at: format_time(record.created_at),
            error: record.error.as_deref().map(|e| truncate(e, 40)).unwrap_or_default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Output Helpers
// ═══════════════════════════════════════════════════════════════════════════════

struct OutputHelper {
    format: OutputFormat,
}

impl OutputHelper {
    fn new(format: OutputFormat, no_color: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format }
    }

    fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    fn print_success(&self, message: &str) {
        if self.is_json() {
            self.print_status("success", message);
        } else {
            println!("{} {}", "[OK]".green().bold(), message);
        }
    }

    fn print_error(&self, message: &str) {
        if self.is_json() {
            let body = serde_json::json!({ "status": "error", "message": message });
            eprintln!("{}", body);
        } else {
            eprintln!("{} {}", "[ERROR]".red().bold(), message);
        }
    }

    fn print_warning(&self, message: &str) {
        if self.is_json() {
            self.print_status("warning", message);
        } else {
            println!("{} {}", "[WARN]".yellow().bold(), message);
        }
    }

    fn print_status(&self, status: &str, message: &str) {
        println!("{}", serde_json::json!({ "status": status, "message": message }));
    }

    fn print_table<T: Tabled>(&self, items: &[T]) {
        if items.is_empty() {
            println!("{}", "No results found.".dimmed());
            return;
        }
        let table = Table::new(items)
            .with(Style::rounded())
            .with(Modify::new(Columns::first()).with(Alignment::left()))
            .to_string();
        println!("{}", table);
    }

    fn print_json<T: Serialize>(&self, data: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(data)?);
        Ok(())
    }

    fn print_header(&self, title: &str) {
        println!();
        println!("{}", title.bold().underline());
        println!();
    }

    fn print_key_value(&self, key: &str, value: &str) {
        println!("  {}: {}", format!("{:<14}", key).cyan(), value);
    }

    fn print_record(&self, record: &JobRecord) -> Result<()> {
        if self.is_json() {
            return self.print_json(record);
        }
        self.print_header(&format!("Job {}", record.id));
        self.print_key_value("Queue", &record.queue_name);
        self.print_key_value("State", &format_state(record.state));
        self.print_key_value("Progress", &format!("{}%", record.progress));
        self.print_key_value("Attempts", &format!("{} of {}", record.attempts, record.retries + 1));
        self.print_key_value("Created", &format_time(record.created_at));
        if let Some(at) = record.started_at {
            self.print_key_value("Started", &format_time(at));
        }
        if let Some(at) = record.settled_at {
            self.print_key_value("Settled", &format_time(at));
        }
        if let Some(at) = record.retry_at {
            self.print_key_value("Retry at", &format_time(at));
        }
        if let Some(worker) = &record.worker_id {
            self.print_key_value("Worker", worker);
        }
        if let Some(at) = record.heartbeat_at {
            self.print_key_value("Heartbeat", &format_time(at));
        }
        if record.cancel_requested {
            self.print_key_value("Cancel", &"requested".yellow().to_string());
        }
        if let Some(error) = &record.error {
            let kind = record.error_kind.map(|k| k.as_str()).unwrap_or("handler");
            self.print_key_value("Error", &format!("{} ({})", error.red(), kind));
        }
        self.print_key_value("Data", &serde_json::to_string(&record.data)?);
        if let Some(result) = &record.result {
            self.print_key_value("Result", &serde_json::to_string(result)?);
        }
        println!();
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command Handlers
// ═══════════════════════════════════════════════════════════════════════════════

async fn connect(config: &Config, output: &OutputHelper) -> Result<Arc<dyn JobQueueStrategy>> {
    if config.strategy == StrategyKind::InMemory {
        output.print_warning("strategy is in_memory; this process sees no jobs from other processes");
    }
    build_strategy(config).await.context("connecting to the job store")
}

async fn handle_job_command(
    cmd: JobCommands,
    strategy: &dyn JobQueueStrategy,
    output: &OutputHelper,
) -> Result<()> {
    match cmd {
        JobCommands::List {
            queues,
            states,
            skip,
            take,
        } => {
            let options = JobListOptions {
                queue_names: queues,
                states,
                skip,
                take: Some(take),
            };
            let page = strategy.list_jobs(&options).await?;

            match output.format {
                OutputFormat::Json => output.print_json(&page)?,
                OutputFormat::Text => {
                    for record in &page.items {
                        println!(
                            "{}  {:<20} {:<10} {}/{}",
                            record.id,
                            record.queue_name,
                            format_state(record.state),
                            record.attempts,
                            record.retries + 1
                        );
                    }
                }
                OutputFormat::Table => {
                    let rows: Vec<JobSummary> = page.items.iter().map(JobSummary::from).collect();
                    output.print_table(&rows);
                }
            }
            if !output.is_json() {
                println!(
                    "{}",
                    format!("Showing {} of {} jobs", page.items.len(), page.total).dimmed()
                );
            }
        }

        JobCommands::Show { id } => match strategy.find_job(id).await? {
            Some(record) => output.print_record(&record)?,
            None => anyhow::bail!("job {} not found", id),
        },

        JobCommands::Retry { id } => {
            let record = strategy.retry_job(id).await?;
            if output.is_json() {
                output.print_json(&record)?;
            } else {
                output.print_success(&format!(
                    "Job {} requeued (attempt {} of {})",
                    id,
                    record.attempts + 1,
                    record.retries + 1
                ));
            }
        }

        JobCommands::Cancel { id } => {
            let record = strategy.cancel_job(id).await?;
            if output.is_json() {
                output.print_json(&record)?;
            } else if record.state == JobState::Cancelled {
                output.print_success(&format!("Job {} cancelled", id));
            } else {
                output.print_warning(&format!(
                    "Job {} is running; it settles as cancelled when its handler returns",
                    id
                ));
            }
        }
    }

    Ok(())
}

async fn handle_recover_command(
    stale_after: Option<Duration>,
    config: &Config,
    strategy: &dyn JobQueueStrategy,
    output: &OutputHelper,
) -> Result<()> {
    let stale_after = stale_after.unwrap_or(config.recovery.stale_after);
    let report = strategy.recover_stale(stale_after, Utc::now()).await?;

    if output.is_json() {
        return output.print_json(&report);
    }
    if report.is_empty() {
        output.print_success("No stale jobs found");
        return Ok(());
    }
    output.print_success(&format!(
        "Recovery finished: {} requeued, {} failed as orphaned, {} cancelled, {} skipped",
        report.requeued, report.failed, report.cancelled, report.skipped
    ));
    Ok(())
}

async fn handle_purge_command(
    queues: Vec<String>,
    older_than: Duration,
    strategy: &dyn JobQueueStrategy,
    output: &OutputHelper,
) -> Result<()> {
    let cutoff = chrono::Duration::from_std(older_than)
        .ok()
        .and_then(|retention| Utc::now().checked_sub_signed(retention))
        .context("--older-than is too large")?;
    let removed = strategy.remove_settled_jobs(&queues, cutoff).await?;

    if output.is_json() {
        output.print_json(&serde_json::json!({ "removed": removed, "cutoff": cutoff }))
    } else {
        output.print_success(&format!("Removed {} settled jobs older than {}", removed, format_time(cutoff)));
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Formatting Helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn format_state(state: JobState) -> String {
    let label = state.as_str().to_lowercase();
    match state {
        JobState::Pending => label.yellow().to_string(),
        JobState::Retrying => label.cyan().to_string(),
        JobState::Running => label.blue().bold().to_string(),
        JobState::Completed => label.green().to_string(),
        JobState::Failed => label.red().to_string(),
        JobState::Cancelled => label.dimmed().to_string(),
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Entry Point
// ═══════════════════════════════════════════════════════════════════════════════

async fn run(cli: Cli, output: &OutputHelper) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    }
    .context("loading configuration")?;

    let strategy = connect(&config, output).await?;
    let result = match cli.command {
        Commands::Jobs(cmd) => handle_job_command(cmd, strategy.as_ref(), output).await,
        Commands::Recover { stale_after } => {
            handle_recover_command(stale_after, &config, strategy.as_ref(), output).await
        }
        Commands::Purge { queues, older_than } => {
            handle_purge_command(queues, older_than, strategy.as_ref(), output).await
        }
    };
    strategy.destroy().await?;
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = OutputHelper::new(cli.format, cli.no_color);

    if let Err(e) = run(cli, &output).await {
        output.print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
