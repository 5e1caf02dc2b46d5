// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transactional state store for Runs, RunSteps, and Artifact linkage
//! (spec.md §4.G).
//!
//! Each run is held in memory behind a single mutex and persisted to
//! `<root>/<tenant>/runs/<run_id>.json` via the same staged-write-then-rename
//! pattern used by the artifact store, so a crash never leaves a half
//! written file. All transitions are compare-and-set against the in-memory
//! state; the persisted copy is best-effort durability, not the source of
//! truth for a live process.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sf_envelope::{Run, RunError, RunStatus, RunStep, StepStatus, StepsSummary, TriggerType};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Failures from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No run exists with the given id (scoped to the given tenant).
    #[error("run '{run_id}' not found for tenant '{tenant_id}'")]
    RunNotFound {
        /// Tenant the caller scoped the lookup to.
        tenant_id: String,
        /// Run id that was requested.
        run_id: Uuid,
    },

    /// No step exists with the given local id within the run.
    #[error("step '{step_id}' not found in run '{run_id}'")]
    StepNotFound {
        /// Owning run.
        run_id: Uuid,
        /// Planner-assigned local step id.
        step_id: String,
    },

    /// A compare-and-set transition did not match the expected prior status.
    #[error("cannot transition {entity} from {from:?} to {to:?}: current status is {actual:?}")]
    IllegalTransition {
        /// `"run"` or `"step"`.
        entity: &'static str,
        /// Status the caller expected to be transitioning from.
        from: String,
        /// Status the caller requested transitioning to.
        to: String,
        /// The status actually found.
        actual: String,
    },

    /// Persisting the run to disk failed.
    #[error("failed to persist run '{run_id}': {reason}")]
    PersistFailed {
        /// Run that failed to persist.
        run_id: Uuid,
        /// Underlying I/O error text.
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunRecord {
    run: Run,
    steps: BTreeMap<String, RunStep>,
}

/// Transactional Run/RunStep/Artifact-linkage store.
#[derive(Debug)]
pub struct RunStore {
    root: PathBuf,
    runs: Mutex<HashMap<Uuid, RunRecord>>,
}

impl RunStore {
    /// Open a store rooted at `root`, rebuilding its in-memory state from any
    /// previously persisted run files.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` cannot be created or an existing run file
    /// cannot be read back.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let store = Self {
            root,
            runs: Mutex::new(HashMap::new()),
        };
        store.rebuild_index().await?;
        Ok(store)
    }

    async fn rebuild_index(&self) -> Result<(), StoreError> {
        let Ok(mut tenants) = tokio::fs::read_dir(&self.root).await else {
            return Ok(());
        };
        let mut runs = self.runs.lock().await;
        while let Ok(Some(tenant_entry)) = tenants.next_entry().await {
            let runs_dir = tenant_entry.path().join("runs");
            let Ok(mut files) = tokio::fs::read_dir(&runs_dir).await else {
                continue;
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Ok(content) = tokio::fs::read_to_string(&path).await else {
                    continue;
                };
                if let Ok(record) = serde_json::from_str::<RunRecord>(&content) {
                    runs.insert(record.run.id, record);
                }
            }
        }
        Ok(())
    }

    fn run_path(&self, tenant_id: &str, run_id: Uuid) -> PathBuf {
        self.root.join(tenant_id).join("runs").join(format!("{run_id}.json"))
    }

    async fn persist(&self, record: &RunRecord) -> Result<(), StoreError> {
        let path = self.run_path(&record.run.tenant_id, record.run.id);
        let parent = path.parent().expect("run path always has a parent");
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::PersistFailed {
                run_id: record.run.id,
                reason: e.to_string(),
            })?;

        let staging = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(record).map_err(|e| StoreError::PersistFailed {
            run_id: record.run.id,
            reason: e.to_string(),
        })?;
        tokio::fs::write(&staging, &json)
            .await
            .map_err(|e| StoreError::PersistFailed {
                run_id: record.run.id,
                reason: e.to_string(),
            })?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| StoreError::PersistFailed {
                run_id: record.run.id,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Create a new run in `queued` status and persist it.
    ///
    /// # Errors
    ///
    /// Returns an error if the new run cannot be persisted to disk.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_run(
        &self,
        tenant_id: impl Into<String>,
        workflow_name: impl Into<String>,
        workflow_version: impl Into<String>,
        trigger_type: TriggerType,
        trigger_payload: serde_json::Value,
        base_run_id: Option<Uuid>,
    ) -> Result<Run, StoreError> {
        let run = Run {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            workflow_name: workflow_name.into(),
            workflow_version: workflow_version.into(),
            trigger_type,
            trigger_payload,
            status: RunStatus::Queued,
            base_run_id,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let record = RunRecord {
            run: run.clone(),
            steps: BTreeMap::new(),
        };
        self.persist(&record).await?;
        self.runs.lock().await.insert(run.id, record);
        Ok(run)
    }

    /// Fetch a run, scoped to the given tenant.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RunNotFound`] if the run doesn't exist or
    /// belongs to a different tenant.
    pub async fn get_run(&self, tenant_id: &str, run_id: Uuid) -> Result<Run, StoreError> {
        let runs = self.runs.lock().await;
        let record = runs
            .get(&run_id)
            .filter(|r| r.run.tenant_id == tenant_id)
            .ok_or_else(|| StoreError::RunNotFound {
                tenant_id: tenant_id.to_string(),
                run_id,
            })?;
        Ok(record.run.clone())
    }

    /// Insert planner-produced steps in `pending`, skipping any step id
    /// already present — the planner is deterministic for a given
    /// `(workflow_version, payload)`, so replays of the same run are safe to
    /// re-plan and re-insert.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RunNotFound`] if the run doesn't exist, or
    /// propagates a persistence failure.
    pub async fn insert_planned_steps(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        steps: Vec<RunStep>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().await;
        let record = runs
            .get_mut(&run_id)
            .filter(|r| r.run.tenant_id == tenant_id)
            .ok_or_else(|| StoreError::RunNotFound {
                tenant_id: tenant_id.to_string(),
                run_id,
            })?;
        for step in steps {
            record.steps.entry(step.step_id.clone()).or_insert(step);
        }
        let snapshot = record.clone();
        drop(runs);
        self.persist(&snapshot).await
    }

    /// List a run's steps, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RunNotFound`] if the run doesn't exist.
    pub async fn list_steps(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        status: Option<StepStatus>,
    ) -> Result<Vec<RunStep>, StoreError> {
        let runs = self.runs.lock().await;
        let record = runs
            .get(&run_id)
            .filter(|r| r.run.tenant_id == tenant_id)
            .ok_or_else(|| StoreError::RunNotFound {
                tenant_id: tenant_id.to_string(),
                run_id,
            })?;
        Ok(record
            .steps
            .values()
            .filter(|s| status.is_none_or(|st| s.status == st))
            .cloned()
            .collect())
    }

    /// Compare-and-set the run's status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RunNotFound`] if the run doesn't exist, or
    /// [`StoreError::IllegalTransition`] if `from` doesn't match the run's
    /// current status or the transition isn't in
    /// [`RunStatus::valid_transitions`].
    pub async fn transition_run(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<Run, StoreError> {
        let mut runs = self.runs.lock().await;
        let record = runs
            .get_mut(&run_id)
            .filter(|r| r.run.tenant_id == tenant_id)
            .ok_or_else(|| StoreError::RunNotFound {
                tenant_id: tenant_id.to_string(),
                run_id,
            })?;

        if record.run.status != from || !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                entity: "run",
                from: format!("{from:?}"),
                to: format!("{to:?}"),
                actual: format!("{:?}", record.run.status),
            });
        }

        record.run.status = to;
        match to {
            RunStatus::Running if record.run.started_at.is_none() => {
                record.run.started_at = Some(Utc::now());
            }
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled => {
                record.run.completed_at = Some(Utc::now());
            }
            _ => {}
        }

        let snapshot = record.clone();
        drop(runs);
        self.persist(&snapshot).await?;
        Ok(snapshot.run)
    }

    /// Record a run-level error, naming the step that caused it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RunNotFound`] if the run doesn't exist.
    pub async fn set_run_error(&self, tenant_id: &str, run_id: Uuid, error: RunError) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().await;
        let record = runs
            .get_mut(&run_id)
            .filter(|r| r.run.tenant_id == tenant_id)
            .ok_or_else(|| StoreError::RunNotFound {
                tenant_id: tenant_id.to_string(),
                run_id,
            })?;
        record.run.error = Some(error);
        let snapshot = record.clone();
        drop(runs);
        self.persist(&snapshot).await
    }

    /// Compare-and-set a step's status and merge in the supplied field
    /// updates, failing loudly on an illegal transition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RunNotFound`] / [`StoreError::StepNotFound`] if
    /// the run or step doesn't exist, or [`StoreError::IllegalTransition`] if
    /// `from` doesn't match the step's current status or the transition
    /// isn't in [`StepStatus::valid_transitions`].
    pub async fn transition_step(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        step_id: &str,
        from: StepStatus,
        to: StepStatus,
        apply: impl FnOnce(&mut RunStep),
    ) -> Result<RunStep, StoreError> {
        let mut runs = self.runs.lock().await;
        let record = runs
            .get_mut(&run_id)
            .filter(|r| r.run.tenant_id == tenant_id)
            .ok_or_else(|| StoreError::RunNotFound {
                tenant_id: tenant_id.to_string(),
                run_id,
            })?;
        let step = record
            .steps
            .get_mut(step_id)
            .ok_or_else(|| StoreError::StepNotFound {
                run_id,
                step_id: step_id.to_string(),
            })?;

        if step.status != from || !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                entity: "step",
                from: format!("{from:?}"),
                to: format!("{to:?}"),
                actual: format!("{:?}", step.status),
            });
        }

        step.status = to;
        apply(step);

        let updated = step.clone();
        let snapshot = record.clone();
        drop(runs);
        self.persist(&snapshot).await?;
        Ok(updated)
    }

    /// Transactionally append artifact ids to a step and transition it from
    /// `running` (the producer path) to `completed` in one compare-and-set,
    /// so readers can never observe a `completed` step without its
    /// artifacts present.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`RunStore::transition_step`].
    #[allow(clippy::too_many_arguments)]
    pub async fn append_artifacts_and_complete(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        step_id: &str,
        input_fingerprint: String,
        artifact_ids: Vec<Uuid>,
        output_data: serde_json::Value,
        duration_ms: u64,
    ) -> Result<RunStep, StoreError> {
        self.transition_step(tenant_id, run_id, step_id, StepStatus::Running, StepStatus::Completed, |step| {
            step.input_fingerprint = Some(input_fingerprint);
            step.output_artifact_ids = artifact_ids;
            step.output_data = Some(output_data);
            step.cache_hit = false;
            step.ended_at = Some(Utc::now());
            step.duration_ms = Some(duration_ms);
        })
        .await
    }

    /// Transition a step directly from `pending` to `completed` on a step
    /// cache hit, skipping the handler (and therefore `running`) entirely
    /// (spec.md §4.I step 3).
    ///
    /// # Errors
    ///
    /// Same failure modes as [`RunStore::transition_step`].
    pub async fn complete_from_cache(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        step_id: &str,
        input_fingerprint: String,
        artifact_ids: Vec<Uuid>,
        output_data: serde_json::Value,
    ) -> Result<RunStep, StoreError> {
        self.transition_step(tenant_id, run_id, step_id, StepStatus::Pending, StepStatus::Completed, |step| {
            step.input_fingerprint = Some(input_fingerprint);
            step.output_artifact_ids = artifact_ids;
            step.output_data = Some(output_data);
            step.cache_hit = true;
            step.ended_at = Some(Utc::now());
            step.duration_ms = Some(0);
        })
        .await
    }

    /// Recompute the run's step-status summary from its current step set in
    /// one read.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RunNotFound`] if the run doesn't exist.
    pub async fn aggregate(&self, tenant_id: &str, run_id: Uuid) -> Result<StepsSummary, StoreError> {
        let runs = self.runs.lock().await;
        let record = runs
            .get(&run_id)
            .filter(|r| r.run.tenant_id == tenant_id)
            .ok_or_else(|| StoreError::RunNotFound {
                tenant_id: tenant_id.to_string(),
                run_id,
            })?;
        Ok(StepsSummary::from_steps(record.steps.values()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(run_id: Uuid, tenant_id: &str, step_id: &str) -> RunStep {
        RunStep {
            id: Uuid::new_v4(),
            run_id,
            tenant_id: tenant_id.to_string(),
            step_id: step_id.to_string(),
            skill_id: "plan_campaign".to_string(),
            skill_version: "1.0.0".to_string(),
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
        }
    }

    #[tokio::test]
    async fn create_and_get_run_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).await.unwrap();
        let run = store
            .create_run("acme", "campaign.build", "1.0.0", TriggerType::Initial, serde_json::json!({}), None)
            .await
            .unwrap();
        let fetched = store.get_run("acme", run.id).await.unwrap();
        assert_eq!(fetched.id, run.id);
        assert_eq!(fetched.status, RunStatus::Queued);
    }

    #[tokio::test]
    async fn get_run_denies_cross_tenant_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).await.unwrap();
        let run = store
            .create_run("acme", "campaign.build", "1.0.0", TriggerType::Initial, serde_json::json!({}), None)
            .await
            .unwrap();
        let result = store.get_run("globex", run.id).await;
        assert!(matches!(result, Err(StoreError::RunNotFound { .. })));
    }

    #[tokio::test]
    async fn transition_run_enforces_cas() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).await.unwrap();
        let run = store
            .create_run("acme", "campaign.build", "1.0.0", TriggerType::Initial, serde_json::json!({}), None)
            .await
            .unwrap();

        let running = store
            .transition_run("acme", run.id, RunStatus::Queued, RunStatus::Running)
            .await
            .unwrap();
        assert_eq!(running.status, RunStatus::Running);
        assert!(running.started_at.is_some());

        let result = store.transition_run("acme", run.id, RunStatus::Queued, RunStatus::Running).await;
        assert!(matches!(result, Err(StoreError::IllegalTransition { .. })));
    }

    #[tokio::test]
    async fn transition_step_enforces_cas_and_applies_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).await.unwrap();
        let run = store
            .create_run("acme", "campaign.build", "1.0.0", TriggerType::Initial, serde_json::json!({}), None)
            .await
            .unwrap();
        store
            .insert_planned_steps("acme", run.id, vec![step(run.id, "acme", "plan")])
            .await
            .unwrap();

        let running = store
            .transition_step("acme", run.id, "plan", StepStatus::Pending, StepStatus::Running, |s| {
                s.started_at = Some(Utc::now());
            })
            .await
            .unwrap();
        assert_eq!(running.status, StepStatus::Running);

        let illegal = store
            .transition_step("acme", run.id, "plan", StepStatus::Pending, StepStatus::Running, |_| {})
            .await;
        assert!(matches!(illegal, Err(StoreError::IllegalTransition { .. })));
    }

    #[tokio::test]
    async fn append_artifacts_and_complete_sets_fields_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).await.unwrap();
        let run = store
            .create_run("acme", "campaign.build", "1.0.0", TriggerType::Initial, serde_json::json!({}), None)
            .await
            .unwrap();
        store
            .insert_planned_steps("acme", run.id, vec![step(run.id, "acme", "plan")])
            .await
            .unwrap();
        store
            .transition_step("acme", run.id, "plan", StepStatus::Pending, StepStatus::Running, |_| {})
            .await
            .unwrap();

        let artifact_id = Uuid::new_v4();
        let completed = store
            .append_artifacts_and_complete(
                "acme",
                run.id,
                "plan",
                "fp-abc123".to_string(),
                vec![artifact_id],
                serde_json::json!({"theme": "neon"}),
                42,
            )
            .await
            .unwrap();
        assert_eq!(completed.status, StepStatus::Completed);
        assert_eq!(completed.output_artifact_ids, vec![artifact_id]);
        assert_eq!(completed.output_data, Some(serde_json::json!({"theme": "neon"})));
        assert_eq!(completed.duration_ms, Some(42));
    }

    #[tokio::test]
    async fn complete_from_cache_skips_running_and_marks_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).await.unwrap();
        let run = store
            .create_run("acme", "campaign.build", "1.0.0", TriggerType::Initial, serde_json::json!({}), None)
            .await
            .unwrap();
        store
            .insert_planned_steps("acme", run.id, vec![step(run.id, "acme", "plan")])
            .await
            .unwrap();

        let artifact_id = Uuid::new_v4();
        let completed = store
            .complete_from_cache(
                "acme",
                run.id,
                "plan",
                "fp-abc123".to_string(),
                vec![artifact_id],
                serde_json::json!({"theme": "neon"}),
            )
            .await
            .unwrap();
        assert_eq!(completed.status, StepStatus::Completed);
        assert!(completed.cache_hit);
        assert_eq!(completed.output_artifact_ids, vec![artifact_id]);
    }

    #[tokio::test]
    async fn aggregate_counts_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).await.unwrap();
        let run = store
            .create_run("acme", "campaign.build", "1.0.0", TriggerType::Initial, serde_json::json!({}), None)
            .await
            .unwrap();
        store
            .insert_planned_steps(
                "acme",
                run.id,
                vec![step(run.id, "acme", "a"), step(run.id, "acme", "b")],
            )
            .await
            .unwrap();
        store
            .transition_step("acme", run.id, "a", StepStatus::Pending, StepStatus::Skipped, |_| {})
            .await
            .unwrap();

        let summary = store.aggregate("acme", run.id).await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.pending, 1);
    }

    #[tokio::test]
    async fn reopening_the_store_rebuilds_runs_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = {
            let store = RunStore::open(dir.path()).await.unwrap();
            let run = store
                .create_run("acme", "campaign.build", "1.0.0", TriggerType::Initial, serde_json::json!({}), None)
                .await
                .unwrap();
            run.id
        };

        let reopened = RunStore::open(dir.path()).await.unwrap();
        let fetched = reopened.get_run("acme", run_id).await.unwrap();
        assert_eq!(fetched.id, run_id);
    }
}
