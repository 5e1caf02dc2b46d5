// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sf_cli::commands::{self, build_engine};
use sf_cli::format::{Formatter, OutputFormat};
use sf_config::EngineConfig;
use sf_envelope::{RunStatus, StepStatus};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 1;

/// How long `trigger --wait` polls for a run to reach a terminal state.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(name = "sf-cli", version, about = "Run engine local control surface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Root directory for this process's state (runs, artifacts, workspaces).
    #[arg(long, global = true, default_value = ".skillforge")]
    data_dir: PathBuf,

    /// Directory of skill descriptor YAML files.
    #[arg(long, global = true)]
    catalog_dir: Option<PathBuf>,

    /// Path to a TOML `EngineConfig` file; defaults are used if omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a skill catalog directory and report descriptor errors.
    ValidateCatalog,

    /// List the workflows this engine knows how to plan.
    Workflows,

    /// Trigger a run against an in-process engine.
    Trigger {
        /// Workflow name, e.g. `campaign.build`.
        #[arg(long)]
        workflow: String,

        /// Tenant id the run belongs to.
        #[arg(long, default_value = "default")]
        tenant: String,

        /// Path to a JSON file with the trigger payload (defaults to `{}`).
        #[arg(long)]
        payload_file: Option<PathBuf>,

        /// Wait for the run to reach a terminal state before exiting.
        #[arg(long)]
        wait: bool,
    },

    /// Inspect a run.
    Run {
        /// Run id.
        #[arg(long)]
        run_id: Uuid,

        /// Tenant id the run belongs to.
        #[arg(long, default_value = "default")]
        tenant: String,
    },

    /// List a run's steps.
    Steps {
        /// Run id.
        #[arg(long)]
        run_id: Uuid,

        /// Tenant id the run belongs to.
        #[arg(long, default_value = "default")]
        tenant: String,

        /// Filter by step status.
        #[arg(long)]
        status: Option<String>,
    },

    /// List a run's artifacts.
    Artifacts {
        /// Run id.
        #[arg(long)]
        run_id: Uuid,

        /// Tenant id the run belongs to.
        #[arg(long, default_value = "default")]
        tenant: String,

        /// Restrict to a single step id.
        #[arg(long)]
        step_id: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { EnvFilter::new("sf=debug") } else { EnvFilter::new("sf=info") };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let fmt = Formatter::new(cli.format.clone());
    let result = run(cli).await;

    if let Err(e) = result {
        eprintln!("{}", fmt.format_error(&format!("{e:#}")));
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let fmt = Formatter::new(cli.format.clone());

    match cli.command {
        Commands::ValidateCatalog => cmd_validate_catalog(&resolve_catalog_dir(&cli)),
        Commands::Workflows => cmd_workflows(&fmt),
        Commands::Trigger { workflow, tenant, payload_file, wait } => {
            cmd_trigger(&cli, &fmt, workflow, tenant, payload_file, wait).await
        }
        Commands::Run { run_id, tenant } => cmd_run(&cli, &fmt, run_id, tenant).await,
        Commands::Steps { run_id, tenant, status } => cmd_steps(&cli, &fmt, run_id, tenant, status).await,
        Commands::Artifacts { run_id, tenant, step_id } => {
            cmd_artifacts(&cli, &fmt, run_id, tenant, step_id).await
        }
    }
}

fn resolve_catalog_dir(cli: &Cli) -> PathBuf {
    cli.catalog_dir.clone().unwrap_or_else(|| cli.data_dir.join("catalog"))
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    sf_config::load_config(cli.config.as_deref()).context("load engine config")
}

fn cmd_validate_catalog(catalog_dir: &std::path::Path) -> Result<()> {
    let diagnostics = commands::validate_catalog(catalog_dir)?;
    if diagnostics.is_empty() {
        println!("catalog: ok");
        Ok(())
    } else {
        for d in &diagnostics {
            println!("{d}");
        }
        anyhow::bail!("catalog has {} error(s)", diagnostics.len())
    }
}

fn cmd_workflows(_fmt: &Formatter) -> Result<()> {
    for w in commands::list_workflows() {
        println!("{:<28} v{:<10} {} step(s)", w.name, w.version, w.step_count);
    }
    Ok(())
}

async fn cmd_trigger(
    cli: &Cli,
    fmt: &Formatter,
    workflow: String,
    tenant: String,
    payload_file: Option<PathBuf>,
    wait: bool,
) -> Result<()> {
    let payload = match payload_file {
        Some(ref p) => {
            let content = std::fs::read_to_string(p)
                .with_context(|| format!("read trigger payload '{}'", p.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parse trigger payload '{}'", p.display()))?
        }
        None => serde_json::json!({}),
    };

    let config = load_config(cli)?;
    let engine = build_engine(&resolve_catalog_dir(cli), &cli.data_dir, config).await?;
    let orchestrator = engine.orchestrator;
    tokio::spawn(std::sync::Arc::clone(&orchestrator).run_forever());

    let run = orchestrator.trigger_run(&tenant, &workflow, payload).await?;
    println!("run_id: {}", run.id);

    if !wait {
        return Ok(());
    }

    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let run = orchestrator.get_run(&tenant, run.id).await?;
        if run.status.is_terminal() {
            let steps = orchestrator.list_steps(&tenant, run.id, None).await?;
            let summary = summarize(&steps);
            println!("{}", fmt.format_run(&run, &summary));
            if matches!(run.status, RunStatus::Failed | RunStatus::Cancelled) {
                anyhow::bail!("run ended as {:?}", run.status);
            }
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for run {} to finish", run.id);
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}

async fn cmd_run(cli: &Cli, fmt: &Formatter, run_id: Uuid, tenant: String) -> Result<()> {
    let config = load_config(cli)?;
    let engine = build_engine(&resolve_catalog_dir(cli), &cli.data_dir, config).await?;
    let run = engine.orchestrator.get_run(&tenant, run_id).await?;
    let steps = engine.orchestrator.list_steps(&tenant, run_id, None).await?;
    println!("{}", fmt.format_run(&run, &summarize(&steps)));
    Ok(())
}

async fn cmd_steps(
    cli: &Cli,
    fmt: &Formatter,
    run_id: Uuid,
    tenant: String,
    status: Option<String>,
) -> Result<()> {
    let status = status.map(|s| parse_step_status(&s)).transpose()?;
    let config = load_config(cli)?;
    let engine = build_engine(&resolve_catalog_dir(cli), &cli.data_dir, config).await?;
    let steps = engine.orchestrator.list_steps(&tenant, run_id, status).await?;
    for step in &steps {
        println!("{}", fmt.format_step(step));
    }
    Ok(())
}

async fn cmd_artifacts(
    cli: &Cli,
    fmt: &Formatter,
    run_id: Uuid,
    tenant: String,
    step_id: Option<String>,
) -> Result<()> {
    let config = load_config(cli)?;
    let engine = build_engine(&resolve_catalog_dir(cli), &cli.data_dir, config).await?;
    let artifacts = engine.orchestrator.list_artifacts(&tenant, run_id, step_id.as_deref()).await?;
    for artifact in &artifacts {
        println!("{}", fmt.format_artifact(artifact));
    }
    Ok(())
}

fn parse_step_status(raw: &str) -> Result<StepStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "pending" => Ok(StepStatus::Pending),
        "running" => Ok(StepStatus::Running),
        "completed" => Ok(StepStatus::Completed),
        "failed" => Ok(StepStatus::Failed),
        "skipped" => Ok(StepStatus::Skipped),
        other => anyhow::bail!("unknown step status '{other}'"),
    }
}

fn summarize(steps: &[sf_envelope::RunStep]) -> sf_envelope::StepsSummary {
    let mut s = sf_envelope::StepsSummary { total: steps.len() as u32, ..Default::default() };
    for step in steps {
        match step.status {
            StepStatus::Pending => s.pending += 1,
            StepStatus::Running => s.running += 1,
            StepStatus::Completed => s.completed += 1,
            StepStatus::Failed => s.failed += 1,
            StepStatus::Skipped => s.skipped += 1,
        }
    }
    s
}
