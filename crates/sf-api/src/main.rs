// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use sf_api::{AppState, build_app};
use sf_artifact_store::ArtifactStore;
use sf_cache::StepCache;
use sf_config::EngineConfig;
use sf_context::ContextFactory;
use sf_handlers::{EchoHandler, HandlerRegistry};
use sf_orchestrator::Orchestrator;
use sf_planner::{Planner, builtin};
use sf_queue::RunOrchestrationQueue;
use sf_registry::SkillRegistry;
use sf_store::RunStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// HTTP control-plane daemon for the run engine.
#[derive(Parser, Debug)]
#[command(name = "sf-api", version, about = "Run engine HTTP control plane")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8089")]
    bind: String,

    /// Path to a TOML `EngineConfig` file; defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory of skill descriptor YAML files (overrides config/env).
    #[arg(long)]
    catalog_dir: Option<PathBuf>,

    /// Root directory for this process's state (runs, artifacts, workspaces).
    #[arg(long, default_value = ".skillforge")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = sf_config::load_config(args.config.as_deref()).context("load engine config")?;
    let filter = EnvFilter::new(config.log_level.clone().unwrap_or_else(|| "info".to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let catalog_dir = args
        .catalog_dir
        .or_else(|| config.registry_dir.clone().map(PathBuf::from))
        .unwrap_or_else(|| args.data_dir.join("catalog"));
    let registry = SkillRegistry::from_catalog_dir(&catalog_dir).context("load skill catalog")?;
    for err in registry.errors() {
        tracing::warn!(skill_id = %err.skill_id, reason = %err.message, "skill descriptor failed to load");
    }

    // No concrete provider SDKs are wired (spec.md §1 places provider
    // adapters out of scope): every handler id named by an active
    // descriptor is bound to EchoHandler, the documented local-development
    // stand-in (sf-handlers::EchoHandler).
    let mut handlers = HandlerRegistry::new();
    for descriptor in registry.list() {
        if !handlers.has(&descriptor.implementation.handler) {
            handlers.register(descriptor.implementation.handler.clone(), Arc::new(EchoHandler));
        }
    }

    let mut planner = Planner::new();
    for workflow in builtin::all() {
        planner.register(workflow);
    }

    let run_store_dir = config.run_store_dir.clone().map(PathBuf::from).unwrap_or_else(|| args.data_dir.join("runs"));
    let artifact_store_dir =
        config.artifact_store_dir.clone().map(PathBuf::from).unwrap_or_else(|| args.data_dir.join("artifacts"));
    let workspace_dir = config.workspace_dir.clone().map(PathBuf::from).unwrap_or_else(|| args.data_dir.join("workspaces"));

    let store = Arc::new(RunStore::open(run_store_dir).await.context("open run store")?);
    let artifacts = Arc::new(ArtifactStore::open(artifact_store_dir).context("open artifact store")?);
    let cache = Arc::new(StepCache::new());
    let queue = Arc::new(RunOrchestrationQueue::new());
    let contexts = Arc::new(ContextFactory::new(workspace_dir, "artifact://store"));

    let orchestrator = Orchestrator::new(store, artifacts, cache, queue, Arc::new(registry), Arc::new(handlers), Arc::new(planner), contexts, config);

    tokio::spawn(Arc::clone(&orchestrator).run_forever());

    let state = Arc::new(AppState { orchestrator });
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind).await.with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "sf-api listening");

    axum::serve(listener, app).await.context("serve")
}
