// SPDX-License-Identifier: MIT OR Apache-2.0
//! Network host, filesystem scope, and secret-key policy evaluation.
//!
//! Each `PolicyEngine` is compiled once per step from the skill's
//! [`SkillPolicy`](sf_envelope::SkillPolicy) and a secret whitelist, then
//! consulted by the handler's execution context on every outbound call,
//! path access, and secret read.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sf_envelope::{NetworkAccess, SkillPolicy};
use sf_glob::{IncludeExcludeGlobs, MatchDecision};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

/// Outcome of a single policy check.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Decision {
    /// Whether the action is permitted.
    pub allowed: bool,
    /// Human-readable reason when denied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Decision {
    /// Build an allowing decision.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// Build a denying decision with a reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Host policy
// ---------------------------------------------------------------------------

/// Evaluates outbound network access against a skill's declared
/// `allowed_hosts` (spec.md §4.E, §6.4 SSRF prevention).
#[derive(Debug, Clone)]
pub struct HostPolicy {
    mode: NetworkAccess,
    hosts: IncludeExcludeGlobs,
}

impl HostPolicy {
    /// Compile a host policy from a skill's execution policy block.
    ///
    /// # Errors
    ///
    /// Returns an error if `allowed_hosts` contains an invalid glob pattern.
    pub fn from_skill_policy(policy: &SkillPolicy) -> anyhow::Result<Self> {
        let no_exclude: &[String] = &[];
        let hosts = match policy.network {
            NetworkAccess::None => IncludeExcludeGlobs::new(&[], no_exclude)?,
            NetworkAccess::Outbound => {
                IncludeExcludeGlobs::new(&policy.allowed_hosts, no_exclude)?
            }
        };
        Ok(Self {
            mode: policy.network,
            hosts,
        })
    }

    /// Decide whether a host may be contacted.
    #[must_use]
    pub fn can_access_host(&self, host: &str) -> Decision {
        if self.mode == NetworkAccess::None {
            return Decision::deny("skill has no outbound network access");
        }
        match self.hosts.decide_str(host) {
            MatchDecision::Allowed => Decision::allow(),
            MatchDecision::DeniedByMissingInclude | MatchDecision::DeniedByExclude => {
                Decision::deny(format!("host '{host}' is not in allowed_hosts"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Path policy
// ---------------------------------------------------------------------------

/// Restricts filesystem access to a step's workspace directory (spec.md
/// §4.E "filesystem access scope (workspace only)").
#[derive(Debug, Clone)]
pub struct PathPolicy {
    workspace_root: PathBuf,
}

impl PathPolicy {
    /// Scope all access to `workspace_root`.
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    /// Decide whether `path` (absolute, or relative to the workspace root)
    /// may be read or written.
    ///
    /// Denies any path whose normalized form escapes the workspace root,
    /// including via `..` segments, without touching the filesystem.
    #[must_use]
    pub fn can_access(&self, path: &Path) -> Decision {
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        };
        let normalized = normalize(&candidate);
        let root = normalize(&self.workspace_root);
        if normalized.starts_with(&root) {
            Decision::allow()
        } else {
            Decision::deny(format!(
                "path '{}' escapes workspace root",
                path.display()
            ))
        }
    }
}

/// Lexically normalize a path (resolve `.`/`..`) without requiring the path
/// to exist — `Path::canonicalize` would fail for not-yet-created files.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Secret policy
// ---------------------------------------------------------------------------

/// Read-only accessor gate over the process's secret whitelist (spec.md
/// §6.3).
#[derive(Debug, Clone)]
pub struct SecretPolicy {
    whitelist: BTreeSet<String>,
}

impl SecretPolicy {
    /// Build a whitelist from the configured default keys plus any
    /// tenant/skill additions.
    #[must_use]
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            whitelist: keys.into_iter().collect(),
        }
    }

    /// The default whitelist named in spec.md §6.3.
    #[must_use]
    pub fn default_keys() -> Vec<String> {
        vec![
            "OPENAI_API_KEY".to_string(),
            "ANTHROPIC_API_KEY".to_string(),
            "GEMINI_API_KEY".to_string(),
            "LITELLM_MASTER_KEY".to_string(),
            "LITELLM_BASE_URL".to_string(),
        ]
    }

    /// Decide whether `key` may be read.
    #[must_use]
    pub fn can_access(&self, key: &str) -> Decision {
        if self.whitelist.contains(key) {
            Decision::allow()
        } else {
            Decision::deny(format!("secret '{key}' is not in the whitelist"))
        }
    }

    /// All whitelisted key names, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.whitelist.iter().map(String::as_str).collect()
    }
}

// ---------------------------------------------------------------------------
// PolicyEngine
// ---------------------------------------------------------------------------

/// Combines host, path, and secret policy for a single step execution.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    /// Network host policy.
    pub host: HostPolicy,
    /// Filesystem scope policy.
    pub path: PathPolicy,
    /// Secret key policy.
    pub secrets: SecretPolicy,
}

impl PolicyEngine {
    /// Compile a full policy engine for one step.
    ///
    /// # Errors
    ///
    /// Returns an error if the skill's `allowed_hosts` contains an invalid
    /// glob pattern.
    pub fn new(
        skill_policy: &SkillPolicy,
        workspace_root: impl Into<PathBuf>,
        secret_keys: impl IntoIterator<Item = String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            host: HostPolicy::from_skill_policy(skill_policy)?,
            path: PathPolicy::new(workspace_root),
            secrets: SecretPolicy::new(secret_keys),
        })
    }
}
