// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-step execution context: staged workspace, scoped logger, secrets
//! accessor, policy, and cancellation signal.
//!
//! A context is acquired immediately before invoking a handler and released
//! on every exit path — success, error, or panic — via `Drop`.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use sf_policy::PolicyEngine;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::Span;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// A cloneable, cheaply-shareable signal used to trigger cancellation.
///
/// All clones share the same underlying state; firing one immediately makes
/// every clone observe `is_cancelled() == true`.
#[derive(Clone)]
pub struct CancellationSignal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationSignal {
    /// Create a signal that has not fired.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Fire the signal. Idempotent.
    pub fn fire(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// `true` once [`fire`](Self::fire) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves when the signal fires; resolves immediately if already fired.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            self.inner.notify.notified().await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Why a step's signal was fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationReason {
    /// An explicit `CancelRun` request reached the step.
    ExplicitCancel,
    /// The step's timeout budget was exhausted.
    Timeout,
    /// The orchestrator is shutting down.
    OrchestratorShutdown,
}

impl CancellationReason {
    /// Human-readable description.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::ExplicitCancel => "cancelled by explicit request",
            Self::Timeout => "cancelled due to timeout",
            Self::OrchestratorShutdown => "cancelled because the orchestrator is shutting down",
        }
    }
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// Read-only accessor over whitelisted environment-backed secrets (spec.md
/// §6.3). A prefix override `SKILL_SECRET_<KEY>` takes precedence over the
/// bare env var of the same name.
#[derive(Debug, Clone)]
pub struct SecretsAccessor {
    whitelist: sf_policy::SecretPolicy,
}

impl SecretsAccessor {
    /// Wrap a compiled secret whitelist.
    #[must_use]
    pub fn new(whitelist: sf_policy::SecretPolicy) -> Self {
        Self { whitelist }
    }

    /// Read a secret value, or `None` if unauthorized or unset.
    ///
    /// An unauthorized read is logged as a denial and never surfaces the
    /// reason to the caller, matching spec.md §6.3's "returns absent".
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        if !self.whitelist.can_access(key).allowed {
            tracing::warn!(secret = key, "denied: secret not in whitelist");
            return None;
        }
        let override_key = format!("SKILL_SECRET_{key}");
        std::env::var(&override_key)
            .ok()
            .or_else(|| std::env::var(key).ok())
    }

    /// `true` if `key` is whitelisted and currently set.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// All whitelisted key names, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.whitelist.keys()
    }
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// Identity and coordinates of the step an [`ExecutionContext`] was built
/// for.
#[derive(Debug, Clone)]
pub struct StepIdentity {
    /// Owning tenant.
    pub tenant_id: String,
    /// Owning run.
    pub run_id: String,
    /// Step within the run's plan.
    pub step_id: String,
    /// Unique id of this particular attempt.
    pub execution_id: uuid::Uuid,
    /// Skill being invoked.
    pub skill_id: String,
}

/// A per-step value passed to a handler (spec.md §4.E).
///
/// Acquired by [`ContextFactory::create`] immediately before invoking a
/// handler. Dropping it releases the workspace directory; callers that need
/// the cleanup to happen before proceeding should call
/// [`ExecutionContext::dispose`] explicitly rather than relying on `Drop`.
#[derive(Debug)]
pub struct ExecutionContext {
    /// Identity fields (tenant, run, step, execution, skill).
    pub identity: StepIdentity,
    workspace_dir: PathBuf,
    /// Base URI under which artifacts produced by this step are persisted.
    pub artifact_base_uri: String,
    /// Scoped logging span, prefixed `skill:run:step`.
    pub logger: Span,
    /// Secrets accessor backed by the whitelist.
    pub secrets: SecretsAccessor,
    /// Composed host/path/secret policy for this step.
    pub policy: PolicyEngine,
    /// Cancellation handle triggered on timeout, explicit cancel, or
    /// orchestrator shutdown.
    pub signal: CancellationSignal,
    disposed: bool,
}

impl ExecutionContext {
    /// The freshly created, step-scoped workspace directory.
    #[must_use]
    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    /// Release the workspace directory now rather than waiting for `Drop`.
    ///
    /// Safe to call multiple times; subsequent calls are a no-op. Best
    /// effort: removal failures are logged, not propagated, since the
    /// handler has already completed by the time this runs.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Err(err) = std::fs::remove_dir_all(&self.workspace_dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.workspace_dir.display(),
                    error = %err,
                    "failed to remove step workspace"
                );
            }
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Builds [`ExecutionContext`] values for the orchestrator.
#[derive(Debug, Clone)]
pub struct ContextFactory {
    /// Root directory under which `<tenant>/<run>/<step>/<attempt>/`
    /// workspaces are created (spec.md §6.3).
    workspace_root: PathBuf,
    /// Base URI prefix artifacts are addressed under.
    artifact_base_uri_root: String,
}

impl ContextFactory {
    /// Build a factory rooted at `workspace_root`, with artifacts addressed
    /// under `artifact_base_uri_root`.
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>, artifact_base_uri_root: impl Into<String>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            artifact_base_uri_root: artifact_base_uri_root.into(),
        }
    }

    /// Create a fresh [`ExecutionContext`] for one step attempt.
    ///
    /// Creates `<ROOT>/<tenant>/<run>/<step>/<attempt>/` on disk, compiles
    /// the step's [`PolicyEngine`], and wires up a new, unfired
    /// [`CancellationSignal`].
    ///
    /// # Errors
    ///
    /// Returns an error if the workspace directory cannot be created or the
    /// skill's policy fails to compile (e.g. an invalid host glob).
    pub async fn create(
        &self,
        tenant_id: impl Into<String>,
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        attempt: u32,
        skill_id: impl Into<String>,
        skill_policy: &sf_envelope::SkillPolicy,
        secret_keys: impl IntoIterator<Item = String>,
    ) -> anyhow::Result<ExecutionContext> {
        let tenant_id = tenant_id.into();
        let run_id = run_id.into();
        let step_id = step_id.into();
        let skill_id = skill_id.into();
        let execution_id = uuid::Uuid::new_v4();

        let workspace_dir = self
            .workspace_root
            .join(&tenant_id)
            .join(&run_id)
            .join(&step_id)
            .join(attempt.to_string());
        tokio::fs::create_dir_all(&workspace_dir).await?;

        let secret_keys: Vec<String> = secret_keys.into_iter().collect();
        let policy = PolicyEngine::new(skill_policy, &workspace_dir, secret_keys.clone())?;

        let logger = tracing::info_span!(
            "skill:run:step",
            tenant_id = %tenant_id,
            run_id = %run_id,
            step_id = %step_id,
            execution_id = %execution_id,
            skill_id = %skill_id,
        );

        let artifact_base_uri = format!("{}/{tenant_id}/{run_id}/{step_id}", self.artifact_base_uri_root);

        Ok(ExecutionContext {
            identity: StepIdentity {
                tenant_id,
                run_id,
                step_id,
                execution_id,
                skill_id,
            },
            workspace_dir,
            artifact_base_uri,
            logger,
            secrets: SecretsAccessor::new(sf_policy::SecretPolicy::new(secret_keys)),
            policy,
            signal: CancellationSignal::new(),
            disposed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_envelope::{NetworkAccess, SkillPolicy};

    fn none_policy() -> SkillPolicy {
        SkillPolicy {
            max_runtime_sec: 30,
            network: NetworkAccess::None,
            allowed_hosts: vec![],
        }
    }

    #[test]
    fn signal_starts_not_cancelled() {
        let signal = CancellationSignal::new();
        assert!(!signal.is_cancelled());
    }

    #[test]
    fn signal_fire_is_idempotent() {
        let signal = CancellationSignal::new();
        signal.fire();
        signal.fire();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn signal_clone_shares_state() {
        let a = CancellationSignal::new();
        let b = a.clone();
        a.fire();
        assert!(b.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_immediately_if_already_fired() {
        let signal = CancellationSignal::new();
        signal.fire();
        signal.cancelled().await;
    }

    #[test]
    fn all_reasons_have_descriptions() {
        for r in [
            CancellationReason::ExplicitCancel,
            CancellationReason::Timeout,
            CancellationReason::OrchestratorShutdown,
        ] {
            assert!(!r.description().is_empty());
        }
    }

    #[test]
    fn secrets_accessor_denies_non_whitelisted_key() {
        let accessor = SecretsAccessor::new(sf_policy::SecretPolicy::new(vec!["OPENAI_API_KEY".to_string()]));
        assert!(!accessor.has("AWS_SECRET_ACCESS_KEY"));
    }

    #[test]
    fn secrets_accessor_prefers_override_prefix() {
        let accessor = SecretsAccessor::new(sf_policy::SecretPolicy::new(vec!["OPENAI_API_KEY".to_string()]));
        std::env::set_var("SKILL_SECRET_OPENAI_API_KEY", "override-value");
        std::env::set_var("OPENAI_API_KEY", "base-value");
        assert_eq!(accessor.get("OPENAI_API_KEY").as_deref(), Some("override-value"));
        std::env::remove_var("SKILL_SECRET_OPENAI_API_KEY");
        std::env::remove_var("OPENAI_API_KEY");
    }

    #[tokio::test]
    async fn create_builds_nested_workspace_directory() {
        let root = tempfile::tempdir().unwrap();
        let factory = ContextFactory::new(root.path(), "artifact://store");
        let ctx = factory
            .create("acme", "run-1", "step-1", 1, "plan_campaign", &none_policy(), vec![])
            .await
            .unwrap();
        assert!(ctx.workspace_dir().is_dir());
        assert!(ctx
            .workspace_dir()
            .ends_with("acme/run-1/step-1/1"));
    }

    #[tokio::test]
    async fn drop_removes_workspace_directory() {
        let root = tempfile::tempdir().unwrap();
        let factory = ContextFactory::new(root.path(), "artifact://store");
        let ctx = factory
            .create("acme", "run-1", "step-1", 1, "plan_campaign", &none_policy(), vec![])
            .await
            .unwrap();
        let path = ctx.workspace_dir().to_path_buf();
        drop(ctx);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let factory = ContextFactory::new(root.path(), "artifact://store");
        let mut ctx = factory
            .create("acme", "run-1", "step-1", 1, "plan_campaign", &none_policy(), vec![])
            .await
            .unwrap();
        ctx.dispose();
        ctx.dispose();
    }

    #[tokio::test]
    async fn policy_scopes_path_access_to_step_workspace() {
        let root = tempfile::tempdir().unwrap();
        let factory = ContextFactory::new(root.path(), "artifact://store");
        let ctx = factory
            .create("acme", "run-1", "step-1", 1, "plan_campaign", &none_policy(), vec![])
            .await
            .unwrap();
        assert!(ctx.policy.path.can_access(Path::new("out.png")).allowed);
        assert!(!ctx.policy.path.can_access(Path::new("../../etc/passwd")).allowed);
    }
}
