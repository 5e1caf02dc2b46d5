// SPDX-License-Identifier: MIT OR Apache-2.0
//! Skill descriptor catalog: discovery, validation, and versioned lookup.
//!
//! Loading follows a scan-and-accumulate discipline: a malformed or invalid
//! descriptor is recorded and skipped rather than aborting the whole catalog
//! load, so one bad skill file never takes down the registry.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::Deserialize;
use sf_envelope::{DescriptorError, SkillDescriptor, SkillStatus};
use std::collections::BTreeMap;
use std::path::Path;

/// Hard failures that prevent the catalog from loading at all.
#[derive(Debug, thiserror::Error)]
pub enum RegistryLoadError {
    /// The catalog directory itself could not be read.
    #[error("failed to read catalog directory '{path}': {reason}")]
    DirectoryUnreadable {
        /// Directory that was requested.
        path: String,
        /// Underlying I/O error text.
        reason: String,
    },

    /// `index.yaml` is missing or not parseable.
    #[error("failed to load catalog index '{path}': {reason}")]
    IndexUnreadable {
        /// Path to the expected index file.
        path: String,
        /// Underlying parse/I/O error text.
        reason: String,
    },
}

/// One row of the catalog's `index.yaml` (spec.md §6.2).
#[derive(Debug, Clone, Deserialize)]
struct IndexEntry {
    skill_id: String,
    version: semver::Version,
    #[allow(dead_code)]
    title: String,
    #[serde(default)]
    #[allow(dead_code)]
    tags: Vec<String>,
    status: SkillStatus,
}

/// In-memory catalog of loaded [`SkillDescriptor`]s, keyed by id and version.
#[derive(Debug, Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, BTreeMap<semver::Version, SkillDescriptor>>,
    errors: Vec<DescriptorError>,
}

impl SkillRegistry {
    /// Load a catalog directory: `index.yaml` plus one `<skill_id>.yaml` per
    /// entry marked `active`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryLoadError`] only for catalog-level failures (the
    /// directory or index file itself). Per-descriptor problems are
    /// accumulated into [`SkillRegistry::errors`] instead.
    pub fn from_catalog_dir(dir: &Path) -> Result<Self, RegistryLoadError> {
        if !dir.is_dir() {
            return Err(RegistryLoadError::DirectoryUnreadable {
                path: dir.display().to_string(),
                reason: "not a directory".into(),
            });
        }

        let index_path = dir.join("index.yaml");
        let index_content =
            std::fs::read_to_string(&index_path).map_err(|e| RegistryLoadError::IndexUnreadable {
                path: index_path.display().to_string(),
                reason: e.to_string(),
            })?;
        let entries: Vec<IndexEntry> =
            serde_yaml::from_str(&index_content).map_err(|e| RegistryLoadError::IndexUnreadable {
                path: index_path.display().to_string(),
                reason: e.to_string(),
            })?;

        let mut registry = SkillRegistry::default();
        for entry in entries {
            if entry.status != SkillStatus::Active {
                tracing::debug!(skill_id = %entry.skill_id, ?entry.status, "skipping non-active catalog entry");
                continue;
            }
            registry.load_one(dir, &entry);
        }
        Ok(registry)
    }

    fn load_one(&mut self, dir: &Path, entry: &IndexEntry) {
        let path = dir.join(format!("{}.yaml", entry.skill_id));
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                self.errors.push(DescriptorError {
                    skill_id: entry.skill_id.clone(),
                    message: format!("failed to read descriptor file: {e}"),
                });
                return;
            }
        };

        let descriptor: SkillDescriptor = match serde_yaml::from_str(&content) {
            Ok(d) => d,
            Err(e) => {
                self.errors.push(DescriptorError {
                    skill_id: entry.skill_id.clone(),
                    message: format!("failed to parse descriptor YAML: {e}"),
                });
                return;
            }
        };

        if descriptor.skill_id != entry.skill_id {
            self.errors.push(DescriptorError {
                skill_id: entry.skill_id.clone(),
                message: format!(
                    "index skill_id '{}' does not match descriptor skill_id '{}'",
                    entry.skill_id, descriptor.skill_id
                ),
            });
            return;
        }
        if descriptor.version != entry.version {
            self.errors.push(DescriptorError {
                skill_id: entry.skill_id.clone(),
                message: format!(
                    "index version {} does not match descriptor version {}",
                    entry.version, descriptor.version
                ),
            });
            return;
        }

        let structural_errors = descriptor.validate();
        if !structural_errors.is_empty() {
            self.errors.extend(structural_errors);
            return;
        }

        self.skills
            .entry(descriptor.skill_id.clone())
            .or_default()
            .insert(descriptor.version.clone(), descriptor);
    }

    /// Validation/load errors accumulated while scanning the catalog.
    #[must_use]
    pub fn errors(&self) -> &[DescriptorError] {
        &self.errors
    }

    /// Look up a descriptor by id, returning the latest version unless one
    /// is specified.
    #[must_use]
    pub fn get(&self, skill_id: &str, version: Option<&semver::Version>) -> Option<&SkillDescriptor> {
        let versions = self.skills.get(skill_id)?;
        match version {
            Some(v) => versions.get(v),
            None => versions.values().next_back(),
        }
    }

    /// All versions registered for a skill, ascending.
    #[must_use]
    pub fn list_versions(&self, skill_id: &str) -> Vec<&semver::Version> {
        self.skills
            .get(skill_id)
            .map(|versions| versions.keys().collect())
            .unwrap_or_default()
    }

    /// The latest descriptor for every registered skill, ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<&SkillDescriptor> {
        self.skills
            .values()
            .filter_map(|versions| versions.values().next_back())
            .collect()
    }

    /// `true` if `skill_id` is registered under at least one version.
    ///
    /// Per spec.md §4.D, "registered" alone is what this crate can promise;
    /// pairing with a bound handler is `sf-handlers`' `HandlerRegistry::has`.
    #[must_use]
    pub fn has(&self, skill_id: &str) -> bool {
        self.skills.contains_key(skill_id)
    }
}
