// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for skillforge.
//!
//! This crate provides [`EngineConfig`] — the top-level runtime settings —
//! together with helpers for loading from TOML files, merging overlays, and
//! producing advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// A tenant's concurrency cap is unusually high relative to the global cap.
    LargeTenantConcurrency {
        /// Tenant id.
        tenant: String,
        /// Configured limit.
        limit: u32,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LargeTenantConcurrency { tenant, limit } => {
                write!(f, "tenant '{tenant}' has a large concurrency cap ({limit})")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the run engine.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EngineConfig {
    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Root directory for staged step workspaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<String>,

    /// Directory scanned for skill descriptor YAML files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_dir: Option<String>,

    /// Directory used for content-addressed artifact storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_store_dir: Option<String>,

    /// Directory used for persisted run/step state JSON files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_store_dir: Option<String>,

    /// Maximum number of steps executing concurrently across all tenants.
    #[serde(default = "default_global_concurrency")]
    pub max_global_concurrency: u32,

    /// Per-tenant overrides.
    #[serde(default)]
    pub tenants: BTreeMap<String, TenantOverride>,
}

fn default_global_concurrency() -> u32 {
    32
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: Some("info".into()),
            workspace_dir: None,
            registry_dir: None,
            artifact_store_dir: None,
            run_store_dir: None,
            max_global_concurrency: default_global_concurrency(),
            tenants: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Resolve the effective per-tenant concurrency cap, falling back to the
    /// default of 8 when the tenant has no override (spec.md §5).
    #[must_use]
    pub fn tenant_concurrency(&self, tenant: &str) -> u32 {
        self.tenants
            .get(tenant)
            .and_then(|t| t.max_concurrency)
            .unwrap_or(DEFAULT_TENANT_CONCURRENCY)
            .min(self.max_global_concurrency)
    }
}

/// Per-tenant configuration overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct TenantOverride {
    /// Maximum concurrent steps for this tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default per-tenant concurrency cap (spec.md §5).
const DEFAULT_TENANT_CONCURRENCY: u32 = 8;

/// Maximum allowed global concurrency.
const MAX_GLOBAL_CONCURRENCY: u32 = 1024;

/// Threshold above which a tenant override generates a warning.
const LARGE_TENANT_CONCURRENCY_THRESHOLD: u32 = 256;

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load an [`EngineConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`EngineConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => EngineConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into an [`EngineConfig`].
pub fn parse_toml(content: &str) -> Result<EngineConfig, ConfigError> {
    toml::from_str::<EngineConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `SKILLFORGE_LOG_LEVEL`
/// - `SKILLFORGE_WORKSPACE_DIR`
/// - `SKILLFORGE_REGISTRY_DIR`
/// - `SKILLFORGE_ARTIFACT_STORE_DIR`
/// - `SKILLFORGE_RUN_STORE_DIR`
pub fn apply_env_overrides(config: &mut EngineConfig) {
    if let Ok(val) = std::env::var("SKILLFORGE_LOG_LEVEL") {
        config.log_level = Some(val);
    }
    if let Ok(val) = std::env::var("SKILLFORGE_WORKSPACE_DIR") {
        config.workspace_dir = Some(val);
    }
    if let Ok(val) = std::env::var("SKILLFORGE_REGISTRY_DIR") {
        config.registry_dir = Some(val);
    }
    if let Ok(val) = std::env::var("SKILLFORGE_ARTIFACT_STORE_DIR") {
        config.artifact_store_dir = Some(val);
    }
    if let Ok(val) = std::env::var("SKILLFORGE_RUN_STORE_DIR") {
        config.run_store_dir = Some(val);
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (invalid log levels, out-of-range concurrency caps) are
/// returned as a [`ConfigError::ValidationError`]; soft issues come back as
/// warnings.
pub fn validate_config(config: &EngineConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(ref level) = config.log_level
        && !VALID_LOG_LEVELS.contains(&level.as_str())
    {
        errors.push(format!("invalid log_level '{level}'"));
    }

    if config.max_global_concurrency == 0 || config.max_global_concurrency > MAX_GLOBAL_CONCURRENCY
    {
        errors.push(format!(
            "max_global_concurrency {} out of range (1..{MAX_GLOBAL_CONCURRENCY})",
            config.max_global_concurrency
        ));
    }

    for (tenant, over) in &config.tenants {
        if tenant.is_empty() {
            errors.push("tenant id must not be empty".into());
        }
        if let Some(limit) = over.max_concurrency {
            if limit == 0 {
                errors.push(format!("tenant '{tenant}': max_concurrency must be > 0"));
            } else if limit > LARGE_TENANT_CONCURRENCY_THRESHOLD {
                warnings.push(ConfigWarning::LargeTenantConcurrency {
                    tenant: tenant.clone(),
                    limit,
                });
            }
        }
    }

    if config.registry_dir.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "registry_dir".into(),
            hint: "no skill descriptors will be loaded at startup".into(),
        });
    }
    if config.artifact_store_dir.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "artifact_store_dir".into(),
            hint: "artifacts will not be persisted to disk".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two configurations. Values in `overlay` take precedence over `base`.
///
/// Tenant maps are combined; on id collisions the overlay entry wins.
pub fn merge_configs(base: EngineConfig, overlay: EngineConfig) -> EngineConfig {
    let mut tenants = base.tenants;
    tenants.extend(overlay.tenants);
    EngineConfig {
        log_level: overlay.log_level.or(base.log_level),
        workspace_dir: overlay.workspace_dir.or(base.workspace_dir),
        registry_dir: overlay.registry_dir.or(base.registry_dir),
        artifact_store_dir: overlay.artifact_store_dir.or(base.artifact_store_dir),
        run_store_dir: overlay.run_store_dir.or(base.run_store_dir),
        max_global_concurrency: if overlay.max_global_concurrency != default_global_concurrency() {
            overlay.max_global_concurrency
        } else {
            base.max_global_concurrency
        },
        tenants,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = EngineConfig::default();
        let warnings = validate_config(&cfg).expect("default config should be valid");
        assert!(!warnings.is_empty(), "should have advisory warnings");
    }

    #[test]
    fn default_config_has_sensible_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.log_level.as_deref(), Some("info"));
        assert_eq!(cfg.max_global_concurrency, 32);
        assert!(cfg.tenants.is_empty());
    }

    #[test]
    fn parse_valid_toml_string() {
        let toml = r#"
            log_level = "debug"
            registry_dir = "/etc/skillforge/skills"
            max_global_concurrency = 64

            [tenants.acme]
            max_concurrency = 16
        "#;
        let cfg = parse_toml(toml).unwrap();
        assert_eq!(cfg.log_level.as_deref(), Some("debug"));
        assert_eq!(cfg.max_global_concurrency, 64);
        assert_eq!(cfg.tenants.len(), 1);
        assert_eq!(cfg.tenant_concurrency("acme"), 16);
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let bad = "this is [not valid toml =";
        let err = parse_toml(bad).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_catches_invalid_log_level() {
        let cfg = EngineConfig {
            log_level: Some("verbose".into()),
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_zero_global_concurrency() {
        let cfg = EngineConfig {
            max_global_concurrency: 0,
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn tenant_without_override_falls_back_to_default() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.tenant_concurrency("anyone"), 8);
    }

    #[test]
    fn tenant_override_is_capped_by_global_concurrency() {
        let mut cfg = EngineConfig {
            max_global_concurrency: 10,
            ..Default::default()
        };
        cfg.tenants.insert(
            "acme".into(),
            TenantOverride {
                max_concurrency: Some(50),
            },
        );
        assert_eq!(cfg.tenant_concurrency("acme"), 10);
    }

    #[test]
    fn merge_overlay_overrides_base() {
        let base = EngineConfig {
            log_level: Some("info".into()),
            registry_dir: Some("/base/skills".into()),
            ..Default::default()
        };
        let overlay = EngineConfig {
            log_level: Some("debug".into()),
            ..Default::default()
        };
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.log_level.as_deref(), Some("debug"));
        assert_eq!(merged.registry_dir.as_deref(), Some("/base/skills"));
    }

    #[test]
    fn merge_combines_tenant_maps_overlay_wins_on_collision() {
        let mut base = EngineConfig::default();
        base.tenants.insert(
            "acme".into(),
            TenantOverride {
                max_concurrency: Some(4),
            },
        );
        base.tenants.insert("globex".into(), TenantOverride::default());

        let mut overlay = EngineConfig::default();
        overlay.tenants.insert(
            "acme".into(),
            TenantOverride {
                max_concurrency: Some(20),
            },
        );

        let merged = merge_configs(base, overlay);
        assert_eq!(merged.tenants.len(), 2);
        assert_eq!(merged.tenant_concurrency("acme"), 20);
    }

    #[test]
    fn large_tenant_concurrency_generates_warning_not_error() {
        let mut cfg = EngineConfig::default();
        cfg.tenants.insert(
            "whale".into(),
            TenantOverride {
                max_concurrency: Some(500),
            },
        );
        let warnings = validate_config(&cfg).expect("should still be valid");
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::LargeTenantConcurrency { tenant, .. } if tenant == "whale")));
    }
}
