// SPDX-License-Identifier: MIT OR Apache-2.0
//! Output formatting utilities for the run engine CLI.

use serde::{Deserialize, Serialize};
use sf_envelope::{Artifact, Run, RunStep, StepsSummary};
use std::fmt;
use std::str::FromStr;

/// Supported output formats for CLI display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Compact JSON (single line).
    Json,
    /// Pretty-printed JSON.
    JsonPretty,
    /// Human-readable multi-line text.
    Text,
    /// Key-value aligned table.
    Table,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Json => "json",
            Self::JsonPretty => "json-pretty",
            Self::Text => "text",
            Self::Table => "table",
        };
        f.write_str(s)
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "json-pretty" | "json_pretty" | "jsonpretty" => Ok(Self::JsonPretty),
            "text" => Ok(Self::Text),
            "table" => Ok(Self::Table),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

/// Formats run-engine types for CLI output.
#[derive(Debug, Clone)]
pub struct Formatter {
    format: OutputFormat,
}

impl Formatter {
    /// Create a new formatter with the given output format.
    #[must_use]
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Format a [`Run`] and its [`StepsSummary`] according to the configured format.
    #[must_use]
    pub fn format_run(&self, run: &Run, summary: &StepsSummary) -> String {
        match &self.format {
            OutputFormat::Json => serde_json::to_string(&run_json(run, summary)).unwrap_or_default(),
            OutputFormat::JsonPretty => {
                serde_json::to_string_pretty(&run_json(run, summary)).unwrap_or_default()
            }
            OutputFormat::Text => format_run_text(run, summary),
            OutputFormat::Table => format_run_table(run, summary),
        }
    }

    /// Format a single [`RunStep`] according to the configured format.
    #[must_use]
    pub fn format_step(&self, step: &RunStep) -> String {
        match &self.format {
            OutputFormat::Json => serde_json::to_string(step).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(step).unwrap_or_default(),
            OutputFormat::Text => format_step_text(step),
            OutputFormat::Table => format_step_table(step),
        }
    }

    /// Format an [`Artifact`] according to the configured format.
    #[must_use]
    pub fn format_artifact(&self, artifact: &Artifact) -> String {
        match &self.format {
            OutputFormat::Json => serde_json::to_string(artifact).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(artifact).unwrap_or_default(),
            OutputFormat::Text => format_artifact_text(artifact),
            OutputFormat::Table => format_artifact_table(artifact),
        }
    }

    /// Format an error message according to the configured format.
    #[must_use]
    pub fn format_error(&self, err: &str) -> String {
        match &self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => {
                serde_json::json!({"error": err}).to_string()
            }
            OutputFormat::Text => format!("Error: {err}"),
            OutputFormat::Table => format!("error  {err}"),
        }
    }
}

fn run_json(run: &Run, summary: &StepsSummary) -> serde_json::Value {
    let mut v = serde_json::to_value(run).unwrap_or_default();
    if let serde_json::Value::Object(ref mut map) = v {
        map.insert("stepsSummary".to_string(), serde_json::to_value(summary).unwrap_or_default());
    }
    v
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}…", &s[..max])
    }
}

// ── Run formatters ────────────────────────────────────────────────────

fn format_run_text(r: &Run, s: &StepsSummary) -> String {
    format!(
        "Run:      {}\nWorkflow: {} v{}\nStatus:   {:?}\nSteps:    {} total, {} completed, {} failed, {} skipped, {} pending, {} running",
        r.id, r.workflow_name, r.workflow_version, r.status,
        s.total, s.completed, s.failed, s.skipped, s.pending, s.running,
    )
}

fn format_run_table(r: &Run, s: &StepsSummary) -> String {
    let mut lines = Vec::new();
    lines.push(format!("{:<12} {}", "run_id", r.id));
    lines.push(format!("{:<12} {}", "tenant", r.tenant_id));
    lines.push(format!("{:<12} {} v{}", "workflow", r.workflow_name, r.workflow_version));
    lines.push(format!("{:<12} {:?}", "status", r.status));
    lines.push(format!(
        "{:<12} total={} completed={} failed={} skipped={} pending={} running={}",
        "steps", s.total, s.completed, s.failed, s.skipped, s.pending, s.running,
    ));
    lines.join("\n")
}

// ── Step formatters ───────────────────────────────────────────────────

fn format_step_text(s: &RunStep) -> String {
    let err = s.error.as_ref().map(|e| format!(" ({:?}: {})", e.code, truncate(&e.message, 80)));
    format!(
        "{} [{}] skill={}@{} attempt={} cache_hit={}{}",
        s.step_id, format!("{:?}", s.status).to_lowercase(), s.skill_id, s.skill_version, s.attempt,
        s.cache_hit, err.unwrap_or_default(),
    )
}

fn format_step_table(s: &RunStep) -> String {
    format!(
        "{:<24} {:<10} {:<28} {:<6} {}",
        s.step_id,
        format!("{:?}", s.status).to_lowercase(),
        format!("{}@{}", s.skill_id, s.skill_version),
        s.attempt,
        if s.cache_hit { "cached" } else { "" },
    )
}

// ── Artifact formatters ───────────────────────────────────────────────

fn format_artifact_text(a: &Artifact) -> String {
    format!(
        "{} type={} step={} bytes={} uri={}",
        a.id, a.type_tag, a.creator_step_id, a.size_bytes, a.uri,
    )
}

fn format_artifact_table(a: &Artifact) -> String {
    format!(
        "{:<36} {:<24} {:<16} {:>10}",
        a.id, a.type_tag, a.creator_step_id, a.size_bytes,
    )
}
