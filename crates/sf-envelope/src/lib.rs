// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Run/Step/Artifact data model and the uniform skill result envelope.
//!
//! These types travel together because the orchestrator translates directly
//! between the envelope a handler returns and the persisted step/artifact
//! rows on every transition.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sf_error::ErrorRecord;
use std::collections::BTreeMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// How a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// A fresh invocation of the workflow.
    Initial,
    /// Continuing a previously paused run.
    Resume,
    /// Re-executing a prior run's workflow against a new base.
    Replay,
}

/// Lifecycle status of a [`Run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted by the API, waiting for an orchestrator worker.
    Queued,
    /// An orchestrator worker owns this run and is driving its steps.
    Running,
    /// A cancellation was requested; steps are being wound down.
    Cancelling,
    /// Every step reached a terminal state with no fatal failure.
    Succeeded,
    /// At least one step failed along a non-optional edge.
    Failed,
    /// Cancellation completed.
    Cancelled,
}

impl RunStatus {
    /// Returns `true` if this status is terminal (spec.md §3 Run invariants).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns the set of statuses that are valid successors of `self`.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [RunStatus] {
        match self {
            Self::Queued => &[Self::Running, Self::Cancelling],
            Self::Running => &[Self::Cancelling, Self::Succeeded, Self::Failed],
            Self::Cancelling => &[Self::Cancelled, Self::Succeeded, Self::Failed],
            Self::Succeeded | Self::Failed | Self::Cancelled => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    #[must_use]
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// A single workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Stable identity.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Name of the workflow executed.
    pub workflow_name: String,
    /// Resolved workflow version.
    pub workflow_version: String,
    /// How the run was started.
    pub trigger_type: TriggerType,
    /// Opaque trigger payload supplied by the caller.
    pub trigger_payload: serde_json::Value,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// The run this one replays or resumes from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_run_id: Option<Uuid>,
    /// Error recorded from the first fatal step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    /// When the run was accepted.
    pub created_at: DateTime<Utc>,
    /// When an orchestrator worker began driving the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Run-level error, naming the step that caused the failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunError {
    /// The error record itself.
    #[serde(flatten)]
    pub record: ErrorRecord,
    /// The step whose failure made the run fatal, if applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step_id: Option<String>,
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Per-status step counts for a run, recomputed from its step set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepsSummary {
    /// Total steps planned for the run.
    pub total: u32,
    /// Steps not yet started.
    pub pending: u32,
    /// Steps currently executing.
    pub running: u32,
    /// Steps that completed successfully.
    pub completed: u32,
    /// Steps skipped because an upstream dependency failed.
    pub skipped: u32,
    /// Steps that failed.
    pub failed: u32,
}

impl StepsSummary {
    /// Recompute a summary from a run's current step set (§4.G
    /// `UpdateRunAggregates`).
    #[must_use]
    pub fn from_steps<'a>(steps: impl IntoIterator<Item = &'a RunStep>) -> Self {
        let mut summary = StepsSummary::default();
        for step in steps {
            summary.total += 1;
            match step.status {
                StepStatus::Pending => summary.pending += 1,
                StepStatus::Running => summary.running += 1,
                StepStatus::Completed => summary.completed += 1,
                StepStatus::Skipped => summary.skipped += 1,
                StepStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

// ---------------------------------------------------------------------------
// RunStep
// ---------------------------------------------------------------------------

/// Lifecycle status of a [`RunStep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Planned but not yet dispatched.
    Pending,
    /// A worker is currently executing the step (or its cache lookup).
    Running,
    /// The step's handler returned a success envelope.
    Completed,
    /// The step exhausted its retries or failed non-retryably.
    Failed,
    /// A declared predecessor failed or was itself skipped.
    Skipped,
}

impl StepStatus {
    /// Returns `true` if this status is terminal (spec.md §3 RunStep
    /// invariants).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Returns the set of statuses that are valid successors of `self`.
    ///
    /// `Running -> Pending` models the explicit retry reset (spec.md §4.I),
    /// which bumps `attempt` rather than moving forward. `Pending ->
    /// Completed` models a step cache hit, which skips the handler (and
    /// therefore `Running`) entirely.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [StepStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Skipped, Self::Completed],
            Self::Running => &[Self::Completed, Self::Failed, Self::Pending],
            Self::Completed | Self::Failed | Self::Skipped => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    #[must_use]
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// One node in a run's dependency graph: a single invocation of one skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    /// Stable identity.
    pub id: Uuid,
    /// Owning run.
    pub run_id: Uuid,
    /// Owning tenant (always equal to the run's tenant).
    pub tenant_id: String,
    /// Planner-assigned local name; unique within the run.
    pub step_id: String,
    /// Skill invoked by this step.
    pub skill_id: String,
    /// Resolved skill version.
    pub skill_version: String,
    /// Hash of the step's resolved input, set once and never mutated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_fingerprint: Option<String>,
    /// 1-based attempt counter; bumped on each retry.
    pub attempt: u32,
    /// Current lifecycle status.
    pub status: StepStatus,
    /// Ids of artifacts produced by this step, in emission order.
    #[serde(default)]
    pub output_artifact_ids: Vec<Uuid>,
    /// The handler's `data` payload, kept so downstream resolvers can
    /// reference `steps.<id>.output` (spec.md §4.H).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<serde_json::Value>,
    /// Error recorded on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// Whether this step's result came from the step cache.
    pub cache_hit: bool,
    /// When this attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When this attempt ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Duration of this attempt in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// A typed, content-addressed output produced by a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Stable identity.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Owning run.
    pub run_id: Uuid,
    /// The step (by local step id) that produced this artifact.
    pub creator_step_id: String,
    /// Type tag, e.g. `image/intro-frame`, `json/campaign-manifest`.
    pub type_tag: String,
    /// Where the bytes live.
    pub uri: String,
    /// Hex-encoded SHA-256 of the bytes.
    pub content_hash: String,
    /// Size of the bytes, filled by the store.
    pub size_bytes: u64,
    /// Original filename, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Free-form metadata; reserved keys are filled by the store.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// When the artifact row was created.
    pub created_at: DateTime<Utc>,
}

/// Metadata keys the artifact store fills itself; callers must not set them.
pub const RESERVED_ARTIFACT_METADATA_KEYS: &[&str] =
    &["size_bytes", "content_type", "created_at", "creator_step_id"];

// ---------------------------------------------------------------------------
// SkillDescriptor
// ---------------------------------------------------------------------------

/// Publication status of a [`SkillDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SkillStatus {
    /// Loadable and dispatchable.
    Active,
    /// Still dispatchable but slated for removal.
    Deprecated,
    /// Not yet promoted to active.
    Experimental,
}

/// How a skill's handler is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ImplementationType {
    /// An in-process function registered by name.
    Function,
    /// An HTTP endpoint.
    Http,
    /// A spawned CLI process.
    Cli,
}

/// How to reach a skill's handler.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Implementation {
    /// Dispatch mechanism.
    #[serde(rename = "type")]
    pub kind: ImplementationType,
    /// Handler identifier (function name, URL, or command), meaningful to
    /// `kind`.
    pub handler: String,
}

/// Outbound network access allowed for a skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NetworkAccess {
    /// No outbound network access.
    None,
    /// Outbound access restricted to `allowed_hosts`.
    Outbound,
}

/// Execution policy declared by a skill descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SkillPolicy {
    /// Maximum wall-clock runtime for one attempt.
    pub max_runtime_sec: u64,
    /// Outbound network access mode.
    pub network: NetworkAccess,
    /// Hosts reachable when `network == Outbound`.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

/// The versioned contract of a skill (spec.md §3, loaded from YAML per §6.2).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SkillDescriptor {
    /// Lowercase-snake identifier, stable across versions.
    pub skill_id: String,
    /// Semver version of this descriptor.
    pub version: semver::Version,
    /// Human-readable title.
    pub title: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Free-form classification tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Publication status.
    pub status: SkillStatus,
    /// JSON Schema the resolved input must satisfy.
    pub input_schema: serde_json::Value,
    /// JSON Schema the success `data` payload must satisfy.
    pub output_schema: serde_json::Value,
    /// Dispatch mechanism.
    pub implementation: Implementation,
    /// Execution policy.
    pub policy: SkillPolicy,
    /// Input field names excluded from fingerprinting (spec.md §4.A).
    #[serde(default)]
    pub volatile_fields: Vec<String>,
}

/// A single descriptor validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorError {
    /// Offending skill id, if determinable.
    pub skill_id: String,
    /// Human-readable problem description.
    pub message: String,
}

impl std::fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.skill_id, self.message)
    }
}

impl SkillDescriptor {
    /// Validate the descriptor against spec.md §4.D's structural invariants.
    ///
    /// Returns every problem found rather than stopping at the first one, so
    /// callers can report a complete diagnostic.
    #[must_use]
    pub fn validate(&self) -> Vec<DescriptorError> {
        let mut errors = Vec::new();
        let err = |msg: &str| DescriptorError {
            skill_id: self.skill_id.clone(),
            message: msg.to_string(),
        };

        if !is_valid_skill_id(&self.skill_id) {
            errors.push(err("skill_id must match ^[a-z][a-z0-9_]*$"));
        }
        if self.title.trim().is_empty() {
            errors.push(err("title must not be empty"));
        }
        if !self.input_schema.is_object() {
            errors.push(err("input_schema must be a JSON Schema object"));
        }
        if !self.output_schema.is_object() {
            errors.push(err("output_schema must be a JSON Schema object"));
        }
        if self.implementation.handler.trim().is_empty() {
            errors.push(err("implementation.handler must not be empty"));
        }
        if self.policy.max_runtime_sec == 0 {
            errors.push(err("policy.max_runtime_sec must be > 0"));
        }
        if self.policy.network == NetworkAccess::Outbound && self.policy.allowed_hosts.is_empty() {
            errors.push(err(
                "policy.network = outbound requires at least one allowed_host",
            ));
        }

        errors
    }
}

fn is_valid_skill_id(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

// ---------------------------------------------------------------------------
// SkillResult envelope
// ---------------------------------------------------------------------------

/// One provider call a handler made, purely observational (spec.md §4.C).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderCall {
    /// Provider name (e.g. `"stability"`, `"openai"`).
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Wall-clock duration of the call.
    pub duration_ms: u64,
    /// Token usage, if the provider reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    /// Provider-assigned request id, for support correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Diagnostic information attached to every [`SkillResult`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DebugInfo {
    /// Phase name → milliseconds; `"total"` is mandatory.
    pub timings_ms: BTreeMap<String, u64>,
    /// Provider calls made during this invocation, in order.
    #[serde(default)]
    pub provider_calls: Vec<ProviderCall>,
}

impl DebugInfo {
    /// Build a [`DebugInfo`] whose only timing is the mandatory `total`.
    #[must_use]
    pub fn with_total(total_ms: u64) -> Self {
        let mut timings_ms = BTreeMap::new();
        timings_ms.insert("total".to_string(), total_ms);
        Self {
            timings_ms,
            provider_calls: Vec::new(),
        }
    }

    /// Returns `true` if the mandatory `total` timing is present.
    #[must_use]
    pub fn has_total(&self) -> bool {
        self.timings_ms.contains_key("total")
    }
}

/// A byte-bearing output a handler emits before it is persisted by the
/// Artifact Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillArtifact {
    /// Type tag, e.g. `image/intro-frame`.
    pub type_tag: String,
    /// Raw bytes to persist.
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    /// Suggested filename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Caller-supplied metadata (reserved keys are overwritten by the store).
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use base64::Engine as _;
        use base64::engine::general_purpose::STANDARD;

        #[test]
        fn round_trips_arbitrary_bytes() {
            for input in [&b""[..], b"a", b"ab", b"abc", b"abcd", b"hello world!"] {
                let encoded = STANDARD.encode(input);
                let decoded = STANDARD.decode(&encoded).unwrap();
                assert_eq!(decoded, input);
            }
        }
    }
}

/// Uniform envelope returned by every skill handler (spec.md §3, §4.C).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SkillResult {
    /// The handler produced usable output.
    Success {
        /// Typed output payload (validated against the descriptor's
        /// `output_schema` by the orchestrator, not this type).
        data: serde_json::Value,
        /// Artifacts to persist.
        #[serde(default)]
        artifacts: Vec<SkillArtifact>,
        /// Diagnostic information.
        debug: DebugInfo,
    },
    /// The handler could not produce output for an *expected* reason.
    Failure {
        /// Human-readable error message.
        error: String,
        /// Machine-readable error code.
        error_code: sf_error::ErrorCode,
        /// Diagnostic information.
        debug: DebugInfo,
    },
}

impl SkillResult {
    /// Returns `true` for [`SkillResult::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Returns the error code of a failure result, if any.
    #[must_use]
    pub fn error_code(&self) -> Option<sf_error::ErrorCode> {
        match self {
            Self::Failure { error_code, .. } => Some(*error_code),
            Self::Success { .. } => None,
        }
    }
}
