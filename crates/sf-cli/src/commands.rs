// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared command implementations for the run engine CLI.
//!
//! These functions are library-level so they can be tested without
//! spawning the binary.

use anyhow::{Context, Result};
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
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Load a skill catalog and report every descriptor that failed to parse.
///
/// Returns the human-readable diagnostics; an empty vec means the catalog
/// is clean.
pub fn validate_catalog(catalog_dir: &Path) -> Result<Vec<String>> {
    let registry = SkillRegistry::from_catalog_dir(catalog_dir)
        .with_context(|| format!("scan catalog directory '{}'", catalog_dir.display()))?;
    let diagnostics = registry
        .errors()
        .iter()
        .map(|e| format!("error: {} ({})", e.skill_id, e.message))
        .collect();
    Ok(diagnostics)
}

/// A single entry in the `workflows list` output.
#[derive(Debug, Clone)]
pub struct WorkflowSummary {
    pub name: String,
    pub version: String,
    pub step_count: usize,
}

/// List every built-in workflow definition this engine knows how to plan.
#[must_use]
pub fn list_workflows() -> Vec<WorkflowSummary> {
    builtin::all()
        .into_iter()
        .map(|w| WorkflowSummary { name: w.name, version: w.version, step_count: w.steps.len() })
        .collect()
}

/// Everything needed to drive an in-process engine: the orchestrator plus
/// the store/artifact paths it was opened against.
pub struct Engine {
    pub orchestrator: Arc<Orchestrator>,
}

/// Assemble an in-process orchestrator rooted at `data_dir`, the same
/// bootstrap `sf-api`'s daemon performs, minus the HTTP listener.
///
/// No concrete provider SDKs are wired in (provider adapters are out of
/// scope): every handler id named by an active descriptor is bound to
/// [`EchoHandler`], the documented local-development stand-in.
pub async fn build_engine(catalog_dir: &Path, data_dir: &Path, config: EngineConfig) -> Result<Engine> {
    let registry = SkillRegistry::from_catalog_dir(catalog_dir)
        .with_context(|| format!("load skill catalog from '{}'", catalog_dir.display()))?;
    for err in registry.errors() {
        tracing::warn!(skill_id = %err.skill_id, reason = %err.message, "skill descriptor failed to load");
    }

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

    let run_store_dir = path_under(data_dir, config.run_store_dir.as_deref(), "runs");
    let artifact_store_dir = path_under(data_dir, config.artifact_store_dir.as_deref(), "artifacts");
    let workspace_dir = path_under(data_dir, config.workspace_dir.as_deref(), "workspaces");

    let store = Arc::new(RunStore::open(run_store_dir).await.context("open run store")?);
    let artifacts = Arc::new(ArtifactStore::open(artifact_store_dir).context("open artifact store")?);
    let cache = Arc::new(StepCache::new());
    let queue = Arc::new(RunOrchestrationQueue::new());
    let contexts = Arc::new(ContextFactory::new(workspace_dir, "artifact://store"));

    let orchestrator = Orchestrator::new(
        store,
        artifacts,
        cache,
        queue,
        Arc::new(registry),
        Arc::new(handlers),
        Arc::new(planner),
        contexts,
        config,
    );

    Ok(Engine { orchestrator })
}

fn path_under(data_dir: &Path, configured: Option<&str>, leaf: &str) -> PathBuf {
    configured.map(PathBuf::from).unwrap_or_else(|| data_dir.join(leaf))
}
