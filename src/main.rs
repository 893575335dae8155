//! # FlowCron — scheduled AI workflow runner
//!
//! Usage:
//!   flowcron init                          # Write a default config
//!   flowcron import jobs.json              # Load workflows and schedules
//!   flowcron run                           # Tick loop until Ctrl-C
//!   flowcron trigger <id> --input '{..}'   # Run a schedule once
//!   flowcron logs --status failed          # Audit trail

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use flowcron_core::config::FlowCronConfig;
use flowcron_core::traits::Repository;
use flowcron_core::types::{ExecutionRecord, WorkflowDefinition};
use flowcron_pipeline::PipelineExecutor;
use flowcron_providers::ClientRegistry;
use flowcron_scheduler::{
    CronEvaluator, LogFilter, LogSink, LogStatus, NotifyRouter, RuntimeDeps, ScheduleDefinition,
    ScheduleFilter, ScheduleLogEntry, ScheduleRuntime, ScheduleStatus, SqliteStore, TriggerType,
    WebhookSink,
};
use flowcron_tools::ToolRegistry;

#[derive(Parser)]
#[command(
    name = "flowcron",
    version,
    about = "⏰ FlowCron — scheduled multi-step AI workflows"
)]
struct Cli {
    /// Config file (default: ~/.flowcron/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Run,
    /// List schedules
    Schedules {
        #[arg(long)]
        enabled: Option<bool>,
        /// active | paused
        #[arg(long)]
        status: Option<String>,
    },
    /// Pause a schedule
    Pause { id: String },
    /// Resume a paused schedule
    Resume { id: String },
    /// Delete a schedule (its logs are kept)
    Delete { id: String },
    /// Run a schedule once and wait for the result
    Trigger {
        id: String,
        /// JSON object merged over the schedule's input template
        #[arg(long)]
        input: Option<String>,
    },
    /// Show schedule log entries, newest first
    Logs {
        #[arg(long)]
        schedule: Option<String>,
        #[arg(long)]
        workflow: Option<String>,
        /// running | completed | failed | timeout | cancelled
        #[arg(long)]
        status: Option<String>,
        /// scheduled | manual | retry
        #[arg(long)]
        trigger: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// List available tools
    Tools,
    /// Load workflows and schedules from a JSON file
    Import { path: String },
    /// Write a default config file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
}

/// `flowcron import` file layout.
#[derive(Deserialize)]
struct ImportFile {
    #[serde(default)]
    workflows: Vec<WorkflowDefinition>,
    #[serde(default)]
    schedules: Vec<ScheduleDefinition>,
}

fn config_path(cli: &Cli) -> PathBuf {
    match &cli.config {
        Some(path) => PathBuf::from(shellexpand::tilde(path).to_string()),
        None => FlowCronConfig::default_path(),
    }
}

struct App {
    runtime: ScheduleRuntime,
    store: Arc<SqliteStore>,
    tools: Arc<ToolRegistry>,
    config: FlowCronConfig,
}

fn build(config: FlowCronConfig) -> Result<App> {
    let db_path = config.storage.expanded_db_path();
    let store = Arc::new(SqliteStore::open(&db_path).context("opening database")?);

    let tools = Arc::new(ToolRegistry::with_defaults());
    let clients = match ClientRegistry::from_config(&config.llm) {
        Ok(clients) => clients,
        Err(e) => {
            // steps naming these models fail at dispatch instead
            tracing::warn!("⚠️ Models unavailable: {e}");
            ClientRegistry::new()
        }
    };

    let workflows: Arc<dyn Repository<WorkflowDefinition>> = store.clone();
    let executions: Arc<dyn Repository<ExecutionRecord>> = store.clone();
    let executor = PipelineExecutor::new(workflows, executions, tools.clone(), Arc::new(clients));

    let mut notifier = NotifyRouter::new(config.notify.history_size).with_sink(Arc::new(LogSink));
    if let Some(webhook) = WebhookSink::from_config(&config.notify) {
        notifier = notifier.with_sink(Arc::new(webhook));
    }

    let runtime = ScheduleRuntime::new(RuntimeDeps {
        schedules: store.clone(),
        logs: store.clone(),
        executor: Arc::new(executor),
        evaluator: Arc::new(CronEvaluator::new()),
        notifier: Arc::new(notifier),
        config: config.scheduler.clone(),
    });
    Ok(App { runtime, store, tools, config })
}

fn parse_json_object(raw: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(raw).context("--input is not valid JSON")?;
    anyhow::ensure!(value.is_object(), "--input must be a JSON object");
    Ok(value)
}

fn print_log(entry: &ScheduleLogEntry) {
    let icon = match entry.status {
        LogStatus::Running => "⏳",
        LogStatus::Completed => "✅",
        LogStatus::Failed => "❌",
        LogStatus::Timeout => "⌛",
        LogStatus::Cancelled => "🚫",
    };
    println!(
        "{icon} {} [{}] {} {} retry {}/{} {}ms — {}",
        entry.id,
        entry.trigger_type.as_str(),
        entry.schedule_id,
        entry.scheduled_time.format("%Y-%m-%d %H:%M:%S"),
        entry.retry_count,
        entry.max_retry_count,
        entry.duration_ms.unwrap_or(0),
        entry.message
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let path = config_path(&cli);
    if let Command::Init { force } = cli.command {
        if path.exists() && !force {
            println!("⚠️  Config already exists: {}", path.display());
            return Ok(());
        }
        FlowCronConfig::default().save_to(&path)?;
        println!("✅ Config written to {}", path.display());
        return Ok(());
    }

    let config = if path.exists() {
        FlowCronConfig::load_from(&path)?
    } else {
        FlowCronConfig::default()
    };
    let app = build(config)?;

    match cli.command {
        Command::Init { .. } => {}
        Command::Run => {
            let recovered = app.runtime.recover().await?;
            println!("⏰ FlowCron v{}", env!("CARGO_PKG_VERSION"));
            println!("   🗄️  Database:  {}", app.config.storage.expanded_db_path().display());
            println!("   🆔 Instance:  {}", app.runtime.instance_id());
            println!("   🔧 Tools:     {}", app.tools.names().join(", "));
            println!("   📢 Sinks:     {}", app.runtime.notifier().sink_names().join(", "));
            if recovered > 0 {
                println!("   🩹 Recovered: {recovered} interrupted run(s)");
            }
            println!();

            let shutdown = CancellationToken::new();
            let interval = Duration::from_secs(app.config.scheduler.tick_interval_secs.max(1));
            let handle = app.runtime.spawn(interval, shutdown.clone());
            tokio::signal::ctrl_c().await?;
            tracing::info!("🛑 Shutting down, waiting for running workflows...");
            shutdown.cancel();
            handle.await?;
            app.runtime.wait_idle().await;
        }
        Command::Schedules { enabled, status } => {
            let status = status
                .map(|s| ScheduleStatus::parse(&s).with_context(|| format!("unknown status '{s}'")))
                .transpose()?;
            let schedules = app
                .runtime
                .list_schedules(&ScheduleFilter { enabled, status, ..Default::default() })
                .await?;
            if schedules.is_empty() {
                println!("No schedules.");
            }
            for s in schedules {
                println!(
                    "{} {} '{}' [{}] → workflow {} | fired {}{} | next {}",
                    if s.is_active() { "🟢" } else { "⏸️" },
                    s.id,
                    s.name,
                    s.trigger_expression,
                    s.workflow_id,
                    s.execution_count,
                    if s.max_execution_count > 0 { format!("/{}", s.max_execution_count) } else { String::new() },
                    s.next_fire_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into())
                );
            }
        }
        Command::Pause { id } => {
            let s = app.runtime.pause(&id).await?;
            println!("⏸️  Paused '{}'", s.name);
        }
        Command::Resume { id } => {
            let s = app.runtime.resume(&id).await?;
            println!(
                "▶️  Resumed '{}' (next: {})",
                s.name,
                s.next_fire_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".into())
            );
        }
        Command::Delete { id } => {
            app.runtime.delete(&id).await?;
            println!("🗑️  Deleted {id}");
        }
        Command::Trigger { id, input } => {
            let overrides = input.as_deref().map(parse_json_object).transpose()?;
            let log_id = app.runtime.trigger_manually(&id, overrides).await?;
            app.runtime.wait_idle().await;
            let entries = app
                .runtime
                .list_logs(&LogFilter { schedule_id: Some(id), ..Default::default() })
                .await?;
            let fired_for = entries.iter().find(|e| e.id == log_id).map(|e| e.scheduled_time);
            // retries of this run share its scheduled time
            for entry in entries.iter().rev().filter(|e| Some(e.scheduled_time) == fired_for) {
                print_log(entry);
                if entry.id == log_id
                    && let Some(output) = &entry.output
                {
                    println!("{}", serde_json::to_string_pretty(output)?);
                }
            }
        }
        Command::Logs { schedule, workflow, status, trigger, limit } => {
            let status = status
                .map(|s| LogStatus::parse(&s).with_context(|| format!("unknown status '{s}'")))
                .transpose()?;
            let trigger_type = trigger
                .map(|t| TriggerType::parse(&t).with_context(|| format!("unknown trigger type '{t}'")))
                .transpose()?;
            let filter = LogFilter {
                schedule_id: schedule,
                workflow_id: workflow,
                status,
                trigger_type,
                ..Default::default()
            };
            let entries = app.runtime.list_logs(&filter).await?;
            if entries.is_empty() {
                println!("No log entries.");
            }
            entries.iter().take(limit).for_each(print_log);
        }
        Command::Tools => {
            for info in app.tools.infos() {
                println!("🔧 {} — {}", info.name, info.description);
            }
        }
        Command::Import { path } => {
            let raw = std::fs::read_to_string(shellexpand::tilde(&path).into_owned())
                .with_context(|| format!("reading {path}"))?;
            let file: ImportFile = serde_json::from_str(&raw).context("parsing import file")?;
            for workflow in &file.workflows {
                workflow.ordered_steps()?;
                Repository::<WorkflowDefinition>::save(app.store.as_ref(), workflow).await?;
                println!("✅ Workflow '{}' ({})", workflow.name, workflow.id);
            }
            for schedule in file.schedules {
                let s = app.runtime.register(schedule).await?;
                println!(
                    "📅 Schedule '{}' ({}) next: {}",
                    s.name,
                    s.id,
                    s.next_fire_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".into())
                );
            }
        }
    }

    Ok(())
}
