// SPDX-License-Identifier: MIT OR Apache-2.0
//! The run orchestrator: ingress, per-run scheduling, and the per-step
//! lifecycle (spec.md §4.I).
//!
//! [`Orchestrator::run_forever`] drains the `run-orchestration` queue and
//! spawns one [`Orchestrator::drive_run`] task per message. Driving a run is
//! a small scheduling loop: at each tick it re-plans the workflow (planning
//! is a pure function of `(workflow_name, trigger_payload)`, so re-deriving
//! the dependency graph on every drive is replay-safe), determines which
//! pending steps are now ready or skip-cascaded, and dispatches up to
//! [`PER_RUN_PARALLELISM`] of them concurrently via [`Orchestrator::run_step`].
//!
//! Concurrency is bounded at three independent levels (spec.md §5): a global
//! semaphore across all tenants, a per-tenant semaphore over in-flight step
//! handlers, and a per-tenant semaphore over concurrently-driven runs.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use sf_artifact_store::ArtifactStore;
use sf_cache::{StepCache, StepCacheEntry, StepCacheKey};
use sf_config::EngineConfig;
use sf_context::{CancellationSignal, ContextFactory};
use sf_envelope::{
    NetworkAccess, Run, RunError, RunStatus, RunStep, SkillDescriptor, SkillResult, StepStatus, TriggerType,
};
use sf_error::{ErrorCode, ErrorRecord, SfError};
use sf_handlers::HandlerRegistry;
use sf_planner::{Planner, PlannedStep, PlannerError, RunState};
use sf_queue::{QueueError, QueueMessage, QueuePriority, RunOrchestrationQueue};
use sf_registry::SkillRegistry;
use sf_retry::RetryPolicy;
use sf_store::{RunStore, StoreError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

/// Maximum number of a run's steps dispatched concurrently (spec.md §4.I).
const PER_RUN_PARALLELISM: usize = 4;

/// How long a running step is given to self-observe cancellation before the
/// orchestrator force-abandons it (spec.md §4.I, §5).
const CANCEL_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

/// Maximum number of runs a single tenant may have concurrently driven by
/// this orchestrator (spec.md §4.I "Ingress", distinct from the per-run step
/// concurrency and the handler-invocation semaphores below).
const MAX_PARALLEL_RUNS_PER_TENANT: usize = 4;

/// How long `run_forever` sleeps after finding the queue empty.
const POLL_IDLE_DELAY: std::time::Duration = std::time::Duration::from_millis(50);

/// How long the drive loop sleeps when nothing is dispatchable and nothing
/// is in flight, before re-checking (a defensive backstop, not the steady
/// state path).
const DRIVE_IDLE_DELAY: std::time::Duration = std::time::Duration::from_millis(20);

/// Failures surfaced by [`Orchestrator`] operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The requested workflow has no registered definition.
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    /// Planning the workflow against its trigger payload failed.
    #[error(transparent)]
    Planner(#[from] PlannerError),

    /// A run/step store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Enqueuing the run-orchestration message failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// An unrecoverable skill-level error occurred outside the normal
    /// failure envelope (e.g. building a step's execution context).
    #[error(transparent)]
    Skill(#[from] SfError),
}

/// Drives runs end to end: ingress, per-run scheduling, retry/cache/
/// cancellation wiring.
pub struct Orchestrator {
    store: Arc<RunStore>,
    artifacts: Arc<ArtifactStore>,
    cache: Arc<StepCache>,
    queue: Arc<RunOrchestrationQueue>,
    registry: Arc<SkillRegistry>,
    handlers: Arc<HandlerRegistry>,
    planner: Arc<Planner>,
    contexts: Arc<ContextFactory>,
    config: EngineConfig,
    global_semaphore: Arc<Semaphore>,
    tenant_step_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    tenant_run_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    run_signals: Mutex<HashMap<Uuid, CancellationSignal>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Assemble an orchestrator from its component parts.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<RunStore>,
        artifacts: Arc<ArtifactStore>,
        cache: Arc<StepCache>,
        queue: Arc<RunOrchestrationQueue>,
        registry: Arc<SkillRegistry>,
        handlers: Arc<HandlerRegistry>,
        planner: Arc<Planner>,
        contexts: Arc<ContextFactory>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let global_semaphore = Arc::new(Semaphore::new(config.max_global_concurrency as usize));
        Arc::new(Self {
            store,
            artifacts,
            cache,
            queue,
            registry,
            handlers,
            planner,
            contexts,
            config,
            global_semaphore,
            tenant_step_semaphores: Mutex::new(HashMap::new()),
            tenant_run_semaphores: Mutex::new(HashMap::new()),
            run_signals: Mutex::new(HashMap::new()),
        })
    }

    async fn tenant_step_semaphore(&self, tenant_id: &str) -> Arc<Semaphore> {
        let mut map = self.tenant_step_semaphores.lock().await;
        map.entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.tenant_concurrency(tenant_id) as usize)))
            .clone()
    }

    async fn tenant_run_semaphore(&self, tenant_id: &str) -> Arc<Semaphore> {
        let mut map = self.tenant_run_semaphores.lock().await;
        map.entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(MAX_PARALLEL_RUNS_PER_TENANT)))
            .clone()
    }

    /// The cancellation signal for a run, creating an unfired one if this is
    /// the first reference to it (from either `drive_run` or `cancel_run`,
    /// whichever reaches it first).
    async fn signal_for(&self, run_id: Uuid) -> CancellationSignal {
        let mut signals = self.run_signals.lock().await;
        signals.entry(run_id).or_insert_with(CancellationSignal::new).clone()
    }

    fn parse_version(raw: &str) -> Option<semver::Version> {
        semver::Version::parse(raw).ok()
    }

    // -----------------------------------------------------------------
    // Run API surface (spec.md §4.J)
    // -----------------------------------------------------------------

    /// `TriggerRun`: plan the workflow, persist the run and its steps in
    /// `queued`/`pending`, and enqueue it for a worker to drive.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::UnknownWorkflow`] /
    /// [`OrchestratorError::Planner`] if the workflow or trigger payload is
    /// invalid, or propagates a store/queue failure.
    pub async fn trigger_run(
        &self,
        tenant_id: &str,
        workflow_name: &str,
        trigger_payload: serde_json::Value,
    ) -> Result<Run, OrchestratorError> {
        let version = self
            .planner
            .workflow_version(workflow_name)
            .ok_or_else(|| OrchestratorError::UnknownWorkflow(workflow_name.to_string()))?
            .to_string();
        let planned_steps = self.planner.plan(workflow_name, &trigger_payload)?;

        let run = self
            .store
            .create_run(tenant_id, workflow_name, version, TriggerType::Initial, trigger_payload, None)
            .await?;

        let steps: Vec<RunStep> = planned_steps
            .iter()
            .map(|p| RunStep {
                id: Uuid::new_v4(),
                run_id: run.id,
                tenant_id: tenant_id.to_string(),
                step_id: p.step_id.clone(),
                skill_id: p.skill_id.clone(),
                skill_version: p.skill_version.clone(),
                input_fingerprint: None,
                attempt: 1,
                status: StepStatus::Pending,
                output_artifact_ids: vec![],
                output_data: None,
                error: None,
                cache_hit: false,
                started_at: None,
                ended_at: None,
                duration_ms: None,
            })
            .collect();
        self.store.insert_planned_steps(tenant_id, run.id, steps).await?;

        self.queue
            .enqueue(QueueMessage { run_id: run.id, tenant_id: tenant_id.to_string() }, QueuePriority::Normal)
            .await?;

        Ok(run)
    }

    /// `GetRun`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Store`] if the run doesn't exist for
    /// this tenant — cross-tenant reads are `NOT_FOUND`, never `FORBIDDEN`.
    pub async fn get_run(&self, tenant_id: &str, run_id: Uuid) -> Result<Run, OrchestratorError> {
        Ok(self.store.get_run(tenant_id, run_id).await?)
    }

    /// `ListSteps`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Store`] if the run doesn't exist.
    pub async fn list_steps(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        status: Option<StepStatus>,
    ) -> Result<Vec<RunStep>, OrchestratorError> {
        Ok(self.store.list_steps(tenant_id, run_id, status).await?)
    }

    /// `ListArtifacts`: artifact metadata for a run, optionally scoped to
    /// one step (spec.md §4.J). Bytes are served by a separate media
    /// endpoint, never inlined here.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Store`] if the run doesn't exist, or
    /// [`OrchestratorError::Skill`] if an artifact recorded on a step is
    /// missing from the artifact store (a storage-layer inconsistency).
    pub async fn list_artifacts(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        step_id: Option<&str>,
    ) -> Result<Vec<sf_envelope::Artifact>, OrchestratorError> {
        let steps = self.store.list_steps(tenant_id, run_id, None).await?;
        let mut artifacts = Vec::new();
        for step in steps.iter().filter(|s| step_id.is_none_or(|id| id == s.step_id)) {
            for artifact_id in &step.output_artifact_ids {
                let (artifact, _bytes) = self.artifacts.get(tenant_id, *artifact_id).await?;
                artifacts.push(artifact);
            }
        }
        Ok(artifacts)
    }

    /// `CacheAnalysis`: per-skill cache-hit counts for a run's completed
    /// steps (spec.md §4.J).
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Store`] if the run doesn't exist.
    pub async fn cache_analysis(&self, tenant_id: &str, run_id: Uuid) -> Result<BTreeMap<String, CacheAnalysisEntry>, OrchestratorError> {
        let steps = self.store.list_steps(tenant_id, run_id, None).await?;
        let mut by_skill: BTreeMap<String, CacheAnalysisEntry> = BTreeMap::new();
        for step in steps.iter().filter(|s| s.status == StepStatus::Completed) {
            let entry = by_skill.entry(step.skill_id.clone()).or_default();
            entry.total += 1;
            if step.cache_hit {
                entry.cache_hits += 1;
            }
        }
        Ok(by_skill)
    }

    /// `CancelRun`: transition the run to `cancelling` and fire its
    /// cancellation signal; running steps have [`CANCEL_GRACE`] to self-
    /// finish before the orchestrator abandons them.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Store`] if the run doesn't exist.
    pub async fn cancel_run(&self, tenant_id: &str, run_id: Uuid) -> Result<Run, OrchestratorError> {
        let run = self.store.get_run(tenant_id, run_id).await?;
        let updated = match run.status {
            RunStatus::Queued | RunStatus::Running => {
                self.store.transition_run(tenant_id, run_id, run.status, RunStatus::Cancelling).await?
            }
            _ => run,
        };
        self.signal_for(run_id).await.fire();
        Ok(updated)
    }

    // -----------------------------------------------------------------
    // Ingress
    // -----------------------------------------------------------------

    /// Drain the run-orchestration queue forever, spawning one
    /// [`drive_run`](Self::drive_run) task per dequeued message. A task that
    /// returns an error nacks its message so the run is retried by a future
    /// worker rather than lost.
    pub async fn run_forever(self: Arc<Self>) -> ! {
        loop {
            match self.queue.dequeue().await {
                Some(msg) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        let run_id = msg.run_id;
                        if let Err(err) = Arc::clone(&this).drive_run(msg.tenant_id, msg.run_id).await {
                            tracing::error!(run_id = %run_id, error = %err, "run driving failed, nacking for retry");
                            this.queue.nack(run_id).await;
                        }
                    });
                }
                None => tokio::time::sleep(POLL_IDLE_DELAY).await,
            }
        }
    }

    // -----------------------------------------------------------------
    // Per-run loop
    // -----------------------------------------------------------------

    /// Drive one run to a terminal status: claim it, schedule its steps
    /// (respecting readiness, skip-cascade, and the per-run parallelism
    /// cap), and finalize its status once every step is terminal.
    ///
    /// # Errors
    ///
    /// Propagates any store failure encountered while driving the run.
    pub async fn drive_run(self: Arc<Self>, tenant_id: String, run_id: Uuid) -> Result<(), OrchestratorError> {
        let _run_permit = self.tenant_run_semaphore(&tenant_id).await.acquire_owned().await.expect("semaphore never closed");

        let run = self.store.get_run(&tenant_id, run_id).await?;
        if run.status == RunStatus::Queued {
            match self.store.transition_run(&tenant_id, run_id, RunStatus::Queued, RunStatus::Running).await {
                Ok(_) => {}
                Err(StoreError::IllegalTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let run = self.store.get_run(&tenant_id, run_id).await?;
        if run.status.is_terminal() {
            self.queue.ack(run_id).await;
            return Ok(());
        }
        if run.status == RunStatus::Cancelling {
            // Cancelled before any worker began dispatching its steps.
            self.store.transition_run(&tenant_id, run_id, RunStatus::Cancelling, RunStatus::Cancelled).await?;
            self.queue.ack(run_id).await;
            return Ok(());
        }

        let run_signal = self.signal_for(run_id).await;
        let trigger_payload = run.trigger_payload.clone();
        let planned_steps = self.planner.plan(&run.workflow_name, &trigger_payload)?;

        let mut join_set: JoinSet<(String, Result<(), OrchestratorError>)> = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();

        loop {
            let run_now = self.store.get_run(&tenant_id, run_id).await?;
            let steps = self.store.list_steps(&tenant_id, run_id, None).await?;
            let status_by_id: HashMap<&str, StepStatus> = steps.iter().map(|s| (s.step_id.as_str(), s.status)).collect();

            if run_now.error.is_none() {
                if let Some(failed) = steps.iter().find(|s| s.status == StepStatus::Failed) {
                    let record = failed.error.clone().unwrap_or_else(|| ErrorRecord {
                        code: ErrorCode::Internal,
                        message: "step failed without a recorded error".to_string(),
                        context: BTreeMap::new(),
                        source_message: None,
                    });
                    self.store
                        .set_run_error(
                            &tenant_id,
                            run_id,
                            RunError { record, failed_step_id: Some(failed.step_id.clone()), timestamp: Utc::now() },
                        )
                        .await?;
                }
            }

            let cancelled = run_signal.is_cancelled();
            if !cancelled {
                for planned in &planned_steps {
                    if in_flight.contains(&planned.step_id) || in_flight.len() >= PER_RUN_PARALLELISM {
                        continue;
                    }
                    let status = status_by_id.get(planned.step_id.as_str()).copied().unwrap_or(StepStatus::Pending);
                    if status != StepStatus::Pending {
                        continue;
                    }

                    let mut ready = true;
                    let mut cascade = false;
                    for dep in &planned.depends_on {
                        let dep_status = status_by_id.get(dep.as_str()).copied().unwrap_or(StepStatus::Pending);
                        if !dep_status.is_terminal() {
                            ready = false;
                            break;
                        }
                        if matches!(dep_status, StepStatus::Failed | StepStatus::Skipped) && planned.cascades_on(dep) {
                            cascade = true;
                        }
                    }
                    if !ready {
                        continue;
                    }

                    if cascade {
                        let _ = self
                            .store
                            .transition_step(&tenant_id, run_id, &planned.step_id, StepStatus::Pending, StepStatus::Skipped, |step| {
                                step.error = Some(ErrorRecord {
                                    code: ErrorCode::SkippedDueToUpstream,
                                    message: "a non-optional predecessor failed or was skipped".to_string(),
                                    context: BTreeMap::new(),
                                    source_message: None,
                                });
                                step.ended_at = Some(Utc::now());
                            })
                            .await;
                        continue;
                    }

                    in_flight.insert(planned.step_id.clone());
                    let this = Arc::clone(&self);
                    let tenant_id_owned = tenant_id.clone();
                    let planned_owned = planned.clone();
                    let run_signal_owned = run_signal.clone();
                    let trigger_payload_owned = trigger_payload.clone();
                    join_set.spawn(async move {
                        let step_id = planned_owned.step_id.clone();
                        let result = this.run_step(tenant_id_owned, run_id, planned_owned, trigger_payload_owned, run_signal_owned).await;
                        (step_id, result)
                    });
                }
            }

            if in_flight.is_empty() {
                let summary = self.store.aggregate(&tenant_id, run_id).await?;
                if summary.pending == 0 && summary.running == 0 {
                    break;
                }
                if cancelled {
                    break;
                }
            }

            match join_set.join_next().await {
                Some(Ok((step_id, Ok(())))) => {
                    in_flight.remove(&step_id);
                }
                Some(Ok((step_id, Err(err)))) => {
                    in_flight.remove(&step_id);
                    tracing::error!(run_id = %run_id, step_id, error = %err, "step task returned an error");
                }
                Some(Err(join_err)) => {
                    tracing::error!(run_id = %run_id, error = %join_err, "step task panicked");
                }
                None => {
                    tokio::time::sleep(DRIVE_IDLE_DELAY).await;
                }
            }
        }

        let summary = self.store.aggregate(&tenant_id, run_id).await?;
        let final_status = if run_signal.is_cancelled() {
            RunStatus::Cancelled
        } else if summary.failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        let current = self.store.get_run(&tenant_id, run_id).await?;
        if !current.status.is_terminal() {
            self.store.transition_run(&tenant_id, run_id, current.status, final_status).await?;
        }

        self.queue.ack(run_id).await;
        self.run_signals.lock().await.remove(&run_id);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Per-step lifecycle
    // -----------------------------------------------------------------

    async fn collect_run_state(&self, tenant_id: &str, run_id: Uuid, trigger_payload: serde_json::Value) -> Result<RunState, OrchestratorError> {
        let completed = self.store.list_steps(tenant_id, run_id, Some(StepStatus::Completed)).await?;
        let mut step_outputs = HashMap::new();
        let mut step_artifact_ids = HashMap::new();
        for step in completed {
            if let Some(data) = step.output_data {
                step_outputs.insert(step.step_id.clone(), data);
            }
            step_artifact_ids.insert(step.step_id.clone(), step.output_artifact_ids.iter().map(ToString::to_string).collect());
        }
        Ok(RunState { trigger_payload, step_outputs, step_artifact_ids })
    }

    /// Run one step to a terminal status: resolve its input, fingerprint it,
    /// check the step cache, and otherwise claim and invoke its handler with
    /// retry (spec.md §4.I "Per-step lifecycle").
    async fn run_step(
        self: Arc<Self>,
        tenant_id: String,
        run_id: Uuid,
        planned: PlannedStep,
        trigger_payload: serde_json::Value,
        run_signal: CancellationSignal,
    ) -> Result<(), OrchestratorError> {
        let Some(descriptor) = self.registry.get(&planned.skill_id, Self::parse_version(&planned.skill_version).as_ref()).cloned() else {
            let err = SfError::new(ErrorCode::Internal, format!("skill '{}' is not registered", planned.skill_id));
            self.fail_step(&tenant_id, run_id, &planned.step_id, &err).await?;
            return Ok(());
        };

        let Some(handler) = self.handlers.get(&descriptor.implementation.handler) else {
            let err = SfError::new(ErrorCode::Internal, format!("no handler bound for '{}'", descriptor.implementation.handler));
            self.fail_step(&tenant_id, run_id, &planned.step_id, &err).await?;
            return Ok(());
        };

        let state = self.collect_run_state(&tenant_id, run_id, trigger_payload).await?;
        let input = match planned.resolve_input(&state) {
            Ok(v) => v,
            Err(e) => {
                let err = SfError::new(ErrorCode::InputResolutionError, e.to_string());
                self.fail_step(&tenant_id, run_id, &planned.step_id, &err).await?;
                return Ok(());
            }
        };

        let fingerprint = match sf_fingerprint::fingerprint(&input, &descriptor.volatile_fields) {
            Ok(f) => f,
            Err(e) => {
                let err = SfError::new(ErrorCode::InputResolutionError, e.to_string());
                self.fail_step(&tenant_id, run_id, &planned.step_id, &err).await?;
                return Ok(());
            }
        };

        let cache_key = StepCacheKey {
            tenant_id: tenant_id.clone(),
            skill_id: descriptor.skill_id.clone(),
            version: descriptor.version.clone(),
            input_fingerprint: fingerprint.clone(),
        };

        let artifacts = Arc::clone(&self.artifacts);
        let tenant_for_check = tenant_id.clone();
        if let Some(hit) = self
            .cache
            .lookup_valid(&cache_key, |entry| entry.output_artifact_ids.iter().all(|id| artifacts.contains(&tenant_for_check, *id)))
            .await
        {
            self.store
                .complete_from_cache(&tenant_id, run_id, &planned.step_id, fingerprint, hit.output_artifact_ids.clone(), hit.output_data.clone())
                .await?;
            return Ok(());
        }

        // Producer path: claim running, bounded by both concurrency gates.
        let _tenant_permit = self.tenant_step_semaphore(&tenant_id).await.acquire_owned().await.expect("semaphore never closed");
        let _global_permit = Arc::clone(&self.global_semaphore).acquire_owned().await.expect("semaphore never closed");

        self.store
            .transition_step(&tenant_id, run_id, &planned.step_id, StepStatus::Pending, StepStatus::Running, |step| {
                step.started_at = Some(Utc::now());
            })
            .await?;

        let retry_policy = if descriptor.policy.network == NetworkAccess::Outbound {
            RetryPolicy::provider_backed()
        } else {
            RetryPolicy::deterministic()
        };
        let secret_keys = sf_policy::SecretPolicy::default_keys();

        let started = std::time::Instant::now();
        let produced = self
            .cache
            .single_flight(&cache_key, || {
                self.invoke_with_retry(&tenant_id, run_id, &planned, &descriptor, &handler, input.clone(), &retry_policy, secret_keys.clone(), run_signal.clone())
            })
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match produced {
            Ok(entry) => {
                self.store
                    .append_artifacts_and_complete(
                        &tenant_id,
                        run_id,
                        &planned.step_id,
                        fingerprint,
                        entry.output_artifact_ids.clone(),
                        entry.output_data.clone(),
                        duration_ms,
                    )
                    .await?;
            }
            Err(err) => {
                self.fail_step(&tenant_id, run_id, &planned.step_id, &err).await?;
            }
        }

        Ok(())
    }

    /// Transition a step to `failed`, always passing through `running` first
    /// (no-op if it's already there) so every failed step satisfies "every
    /// failed step passed through running," regardless of how early the
    /// failure occurred.
    async fn fail_step(&self, tenant_id: &str, run_id: Uuid, step_id: &str, err: &SfError) -> Result<(), StoreError> {
        let record = ErrorRecord::from(err);
        let _ = self
            .store
            .transition_step(tenant_id, run_id, step_id, StepStatus::Pending, StepStatus::Running, |step| {
                step.started_at.get_or_insert(Utc::now());
            })
            .await;
        self.store
            .transition_step(tenant_id, run_id, step_id, StepStatus::Running, StepStatus::Failed, |step| {
                step.error = Some(record);
                step.ended_at = Some(Utc::now());
            })
            .await?;
        Ok(())
    }

    /// Invoke a step's handler with retry, creating a fresh
    /// [`ExecutionContext`](sf_context::ExecutionContext) (and bumping
    /// `attempt` on the step row) for each attempt, racing the handler
    /// against its policy timeout and the run's cancellation signal.
    #[allow(clippy::too_many_arguments)]
    async fn invoke_with_retry(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        planned: &PlannedStep,
        descriptor: &SkillDescriptor,
        handler: &Arc<dyn sf_handlers::Handler>,
        input: serde_json::Value,
        retry_policy: &RetryPolicy,
        secret_keys: Vec<String>,
        run_signal: CancellationSignal,
    ) -> Result<StepCacheEntry, SfError> {
        let outcome = sf_retry::retry_async(retry_policy, |attempt| {
            let input = input.clone();
            let secret_keys = secret_keys.clone();
            let run_signal = run_signal.clone();
            let handler = Arc::clone(handler);
            async move {
                if attempt > 0 {
                    let _ = self
                        .store
                        .transition_step(tenant_id, run_id, &planned.step_id, StepStatus::Running, StepStatus::Pending, |_| {})
                        .await;
                    self.store
                        .transition_step(tenant_id, run_id, &planned.step_id, StepStatus::Pending, StepStatus::Running, |step| {
                            step.attempt = attempt + 1;
                            step.started_at = Some(Utc::now());
                        })
                        .await
                        .map_err(|e| SfError::new(ErrorCode::Internal, e.to_string()))?;
                }

                let ctx = self
                    .contexts
                    .create(
                        tenant_id.to_string(),
                        run_id.to_string(),
                        planned.step_id.clone(),
                        attempt + 1,
                        descriptor.skill_id.clone(),
                        &descriptor.policy,
                        secret_keys,
                    )
                    .await
                    .map_err(|e| SfError::new(ErrorCode::Internal, e.to_string()))?;
                let ctx_signal = ctx.signal.clone();
                let timeout = std::time::Duration::from_secs(descriptor.policy.max_runtime_sec);

                tokio::select! {
                    result = handler.execute(input, &ctx) => {
                        match result {
                            SkillResult::Success { data, artifacts, .. } => {
                                let mut artifact_ids = Vec::with_capacity(artifacts.len());
                                for artifact in artifacts {
                                    let persisted = self
                                        .artifacts
                                        .put(tenant_id, run_id, &planned.step_id, &artifact.type_tag, artifact.bytes, artifact.filename, artifact.metadata)
                                        .await?;
                                    artifact_ids.push(persisted.id);
                                }
                                Ok(StepCacheEntry {
                                    output_data: data,
                                    output_artifact_ids: artifact_ids,
                                    cached_at: Utc::now(),
                                    ttl: None,
                                })
                            }
                            SkillResult::Failure { error, error_code, .. } => Err(SfError::new(error_code, error)),
                        }
                    }
                    () = tokio::time::sleep(timeout) => {
                        ctx_signal.fire();
                        Err(SfError::new(ErrorCode::Timeout, format!("step exceeded max_runtime_sec={}", descriptor.policy.max_runtime_sec)))
                    }
                    () = async { run_signal.cancelled().await; tokio::time::sleep(CANCEL_GRACE).await; } => {
                        ctx_signal.fire();
                        Err(SfError::new(ErrorCode::Cancelled, "run was cancelled"))
                    }
                }
            }
        })
        .await;

        outcome.map(|o| o.value)
    }
}

/// Per-skill cache-hit tally for [`Orchestrator::cache_analysis`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheAnalysisEntry {
    /// Completed invocations of this skill within the run.
    pub total: u32,
    /// How many of those were served from the step cache.
    pub cache_hits: u32,
}
