// SPDX-License-Identifier: MIT OR Apache-2.0
//! Workflow definitions, trigger-payload validation, and topological step
//! planning (spec.md §4.H).
//!
//! A workflow is a static, named DAG of [`StepDefinition`]s. [`Planner::plan`]
//! validates the trigger payload against the workflow's JSON schema,
//! topologically sorts the declared dependency edges (rejecting cycles),
//! and returns an ordered list of [`PlannedStep`]s whose input resolvers are
//! pure functions of the accumulating [`RunState`].
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Failures that can occur while planning a run.
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    /// The requested workflow name has no registered definition.
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    /// The trigger payload failed the workflow's JSON schema.
    #[error("trigger payload invalid: {0}")]
    ValidationError(String),

    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected among steps: {0:?}")]
    CycleDetected(Vec<String>),

    /// A step's `depends_on` names a step id not declared in the workflow.
    #[error("step '{step_id}' depends on unknown step '{missing}'")]
    UnknownDependency {
        /// The step with the dangling edge.
        step_id: String,
        /// The missing predecessor id.
        missing: String,
    },

    /// A step's input template references something its declared
    /// dependency edges don't cover — resolvers must be total.
    #[error("step '{step_id}' input references '{reference}', which is not `trigger` or a declared dependency")]
    DanglingReference {
        /// The step whose resolver is not total.
        step_id: String,
        /// The offending `$ref` value.
        reference: String,
    },

    /// A resolver's reference could not be resolved against the current run
    /// state (e.g. an upstream step hasn't produced output yet).
    #[error("step '{step_id}' could not resolve reference '{reference}'")]
    InputResolutionError {
        /// The step being resolved.
        step_id: String,
        /// The `$ref` value that failed to resolve.
        reference: String,
    },
}

/// One step in a workflow's declared dependency graph.
#[derive(Debug, Clone)]
pub struct StepDefinition {
    /// Unique id within the workflow.
    pub step_id: String,
    /// Skill this step invokes.
    pub skill_id: String,
    /// Skill version this step pins to.
    pub skill_version: String,
    /// Predecessors, by step id.
    pub depends_on: Vec<String>,
    /// Subset of `depends_on` whose failure/skip does not cascade — a
    /// failed or skipped step on a non-optional edge causes this step to be
    /// marked `skipped` when reached.
    pub optional_depends_on: HashSet<String>,
    /// Template for this step's input. Leaves of the form
    /// `{"$ref": "trigger.<path>"}` or `{"$ref": "steps.<id>.output.<path>"}`
    /// are substituted by [`PlannedStep::resolve_input`].
    pub input_template: serde_json::Value,
}

/// A named, versioned workflow: a JSON schema for its trigger payload plus a
/// declared step DAG.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    /// Workflow name, e.g. `campaign.build`.
    pub name: String,
    /// Workflow version.
    pub version: String,
    /// JSON schema the trigger payload must satisfy.
    pub payload_schema: serde_json::Value,
    /// Declared steps, in any order — the planner sorts them.
    pub steps: Vec<StepDefinition>,
}

/// One step as the orchestrator will dispatch it, in topological order.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    /// Unique id within the run.
    pub step_id: String,
    /// Skill this step invokes.
    pub skill_id: String,
    /// Skill version this step pins to.
    pub skill_version: String,
    /// Predecessors, by step id.
    pub depends_on: Vec<String>,
    /// Subset of `depends_on` whose failure/skip does not cascade.
    pub optional_depends_on: HashSet<String>,
    input_template: serde_json::Value,
}

impl PlannedStep {
    /// `true` if `predecessor` failing or being skipped should cascade into
    /// this step being marked `skipped`.
    #[must_use]
    pub fn cascades_on(&self, predecessor: &str) -> bool {
        self.depends_on.iter().any(|d| d == predecessor) && !self.optional_depends_on.contains(predecessor)
    }

    /// Resolve this step's concrete input value against the accumulated run
    /// state. A pure function: the same `state` always yields the same
    /// result.
    ///
    /// # Errors
    ///
    /// Returns [`PlannerError::InputResolutionError`] if a reference names a
    /// step whose output isn't yet present in `state`.
    pub fn resolve_input(&self, state: &RunState) -> Result<serde_json::Value, PlannerError> {
        resolve_value(&self.step_id, &self.input_template, state)
    }
}

/// Accumulated state a workflow's resolvers read from: the original trigger
/// payload plus each completed step's output and artifact ids so far.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    /// The payload the run was triggered with.
    pub trigger_payload: serde_json::Value,
    /// Output data of steps that have completed, by step id.
    pub step_outputs: HashMap<String, serde_json::Value>,
    /// Artifact ids produced by steps that have completed, by step id.
    pub step_artifact_ids: HashMap<String, Vec<String>>,
}

fn resolve_value(step_id: &str, template: &serde_json::Value, state: &RunState) -> Result<serde_json::Value, PlannerError> {
    match template {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(reference)) = map.get("$ref") {
                if map.len() == 1 {
                    return resolve_reference(step_id, reference, state);
                }
            }
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(step_id, v, state)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        serde_json::Value::Array(items) => Ok(serde_json::Value::Array(
            items
                .iter()
                .map(|v| resolve_value(step_id, v, state))
                .collect::<Result<_, _>>()?,
        )),
        other => Ok(other.clone()),
    }
}

fn resolve_reference(step_id: &str, reference: &str, state: &RunState) -> Result<serde_json::Value, PlannerError> {
    let mut parts = reference.split('.');
    match parts.next() {
        Some("trigger") => {
            let rest: Vec<&str> = parts.collect();
            Ok(dig(&state.trigger_payload, &rest))
        }
        Some("steps") => {
            let dep_step = parts.next().ok_or_else(|| PlannerError::InputResolutionError {
                step_id: step_id.to_string(),
                reference: reference.to_string(),
            })?;
            match parts.next() {
                Some("output") => {
                    let rest: Vec<&str> = parts.collect();
                    let output = state.step_outputs.get(dep_step).ok_or_else(|| PlannerError::InputResolutionError {
                        step_id: step_id.to_string(),
                        reference: reference.to_string(),
                    })?;
                    Ok(dig(output, &rest))
                }
                Some("artifacts") => {
                    let ids = state.step_artifact_ids.get(dep_step).ok_or_else(|| PlannerError::InputResolutionError {
                        step_id: step_id.to_string(),
                        reference: reference.to_string(),
                    })?;
                    Ok(serde_json::json!(ids))
                }
                _ => Err(PlannerError::InputResolutionError {
                    step_id: step_id.to_string(),
                    reference: reference.to_string(),
                }),
            }
        }
        _ => Err(PlannerError::InputResolutionError {
            step_id: step_id.to_string(),
            reference: reference.to_string(),
        }),
    }
}

fn dig(value: &serde_json::Value, path: &[&str]) -> serde_json::Value {
    let mut current = value;
    for segment in path {
        match current.get(segment) {
            Some(next) => current = next,
            None => return serde_json::Value::Null,
        }
    }
    current.clone()
}

/// Every `$ref` string appearing anywhere in `template`.
fn collect_references(template: &serde_json::Value, out: &mut Vec<String>) {
    match template {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(reference)) = map.get("$ref") {
                if map.len() == 1 {
                    out.push(reference.clone());
                    return;
                }
            }
            for v in map.values() {
                collect_references(v, out);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items {
                collect_references(v, out);
            }
        }
        _ => {}
    }
}

/// Validates trigger payloads and plans workflows into topologically ordered
/// step sequences.
#[derive(Debug, Default)]
pub struct Planner {
    workflows: BTreeMap<String, WorkflowDefinition>,
}

impl Planner {
    /// An empty planner with no registered workflows.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a workflow definition, keyed by name.
    pub fn register(&mut self, workflow: WorkflowDefinition) {
        self.workflows.insert(workflow.name.clone(), workflow);
    }

    /// The registered version string for a workflow, if any.
    #[must_use]
    pub fn workflow_version(&self, workflow_name: &str) -> Option<&str> {
        self.workflows.get(workflow_name).map(|w| w.version.as_str())
    }

    /// Plan a run: validate the trigger payload, then topologically sort the
    /// workflow's declared steps.
    ///
    /// # Errors
    ///
    /// - [`PlannerError::UnknownWorkflow`] if `workflow_name` isn't registered.
    /// - [`PlannerError::ValidationError`] if `trigger_payload` fails the
    ///   workflow's schema.
    /// - [`PlannerError::UnknownDependency`] / [`PlannerError::DanglingReference`]
    ///   if the workflow definition itself is malformed.
    /// - [`PlannerError::CycleDetected`] if the dependency graph has a cycle.
    pub fn plan(&self, workflow_name: &str, trigger_payload: &serde_json::Value) -> Result<Vec<PlannedStep>, PlannerError> {
        let workflow = self
            .workflows
            .get(workflow_name)
            .ok_or_else(|| PlannerError::UnknownWorkflow(workflow_name.to_string()))?;

        let validator = jsonschema::validator_for(&workflow.payload_schema)
            .map_err(|e| PlannerError::ValidationError(e.to_string()))?;
        if let Err(first_error) = validator.validate(trigger_payload) {
            return Err(PlannerError::ValidationError(first_error.to_string()));
        }

        let known_ids: HashSet<&str> = workflow.steps.iter().map(|s| s.step_id.as_str()).collect();
        for step in &workflow.steps {
            for dep in &step.depends_on {
                if !known_ids.contains(dep.as_str()) {
                    return Err(PlannerError::UnknownDependency {
                        step_id: step.step_id.clone(),
                        missing: dep.clone(),
                    });
                }
            }
            let mut refs = Vec::new();
            collect_references(&step.input_template, &mut refs);
            for reference in refs {
                let allowed = reference.starts_with("trigger")
                    || step
                        .depends_on
                        .iter()
                        .any(|dep| reference.starts_with(&format!("steps.{dep}.")));
                if !allowed {
                    return Err(PlannerError::DanglingReference {
                        step_id: step.step_id.clone(),
                        reference,
                    });
                }
            }
        }

        let order = topological_sort(&workflow.steps)?;
        let by_id: HashMap<&str, &StepDefinition> = workflow.steps.iter().map(|s| (s.step_id.as_str(), s)).collect();

        Ok(order
            .into_iter()
            .map(|id| {
                let def = by_id[id.as_str()];
                PlannedStep {
                    step_id: def.step_id.clone(),
                    skill_id: def.skill_id.clone(),
                    skill_version: def.skill_version.clone(),
                    depends_on: def.depends_on.clone(),
                    optional_depends_on: def.optional_depends_on.clone(),
                    input_template: def.input_template.clone(),
                }
            })
            .collect())
    }
}

fn topological_sort(steps: &[StepDefinition]) -> Result<Vec<String>, PlannerError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        in_degree.entry(step.step_id.as_str()).or_insert(0);
        for dep in &step.depends_on {
            *in_degree.entry(step.step_id.as_str()).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(step.step_id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    // Deterministic ordering among ready steps.
    let mut ready: Vec<&str> = queue.drain(..).collect();
    ready.sort_unstable();
    queue.extend(ready);

    let mut order = Vec::with_capacity(steps.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        if let Some(succ) = dependents.get(id) {
            let mut newly_ready = Vec::new();
            for next in succ {
                let degree = in_degree.get_mut(next).expect("dependent is tracked");
                *degree -= 1;
                if *degree == 0 {
                    newly_ready.push(*next);
                }
            }
            newly_ready.sort_unstable();
            for next in newly_ready {
                queue.push_back(next);
            }
        }
    }

    if order.len() != steps.len() {
        let remaining: Vec<String> = in_degree
            .into_iter()
            .filter(|(id, degree)| *degree > 0 && !order.contains(&(*id).to_string()))
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(PlannerError::CycleDetected(remaining));
    }

    Ok(order)
}

/// Built-in workflow definitions known to the engine (spec.md §4.H).
pub mod builtin {
    use super::{StepDefinition, WorkflowDefinition};
    use std::collections::HashSet;

    /// `campaign.build`: plan → generate intro image → bundle → validate →
    /// assemble manifest. Requires `brief` in the trigger payload.
    #[must_use]
    pub fn campaign_build() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "campaign.build".to_string(),
            version: "1.0.0".to_string(),
            payload_schema: serde_json::json!({
                "type": "object",
                "required": ["brief"],
                "properties": { "brief": { "type": "string", "minLength": 1 } }
            }),
            steps: vec![
                StepDefinition {
                    step_id: "plan".to_string(),
                    skill_id: "plan_campaign".to_string(),
                    skill_version: "1.0.0".to_string(),
                    depends_on: vec![],
                    optional_depends_on: HashSet::new(),
                    input_template: serde_json::json!({ "brief": { "$ref": "trigger.brief" } }),
                },
                StepDefinition {
                    step_id: "intro_image".to_string(),
                    skill_id: "generate_intro_image".to_string(),
                    skill_version: "1.0.0".to_string(),
                    depends_on: vec!["plan".to_string()],
                    optional_depends_on: HashSet::new(),
                    input_template: serde_json::json!({ "plan": { "$ref": "steps.plan.output" } }),
                },
                StepDefinition {
                    step_id: "bundle".to_string(),
                    skill_id: "bundle_template".to_string(),
                    skill_version: "1.0.0".to_string(),
                    depends_on: vec!["plan".to_string(), "intro_image".to_string()],
                    optional_depends_on: HashSet::new(),
                    input_template: serde_json::json!({
                        "plan": { "$ref": "steps.plan.output" },
                        "intro_image_artifacts": { "$ref": "steps.intro_image.artifacts" }
                    }),
                },
                StepDefinition {
                    step_id: "validate".to_string(),
                    skill_id: "validate_bundle".to_string(),
                    skill_version: "1.0.0".to_string(),
                    depends_on: vec!["bundle".to_string()],
                    optional_depends_on: HashSet::new(),
                    input_template: serde_json::json!({ "bundle": { "$ref": "steps.bundle.output" } }),
                },
                StepDefinition {
                    step_id: "manifest".to_string(),
                    skill_id: "assemble_manifest".to_string(),
                    skill_version: "1.0.0".to_string(),
                    depends_on: vec!["validate".to_string()],
                    optional_depends_on: HashSet::new(),
                    input_template: serde_json::json!({ "validated": { "$ref": "steps.validate.output" } }),
                },
            ],
        }
    }

    /// `campaign.replace_3d_asset`: generate a replacement 3D asset and
    /// reassemble the manifest. Requires `campaign_id`, `asset_prompt`, and
    /// `asset_slot` in the trigger payload.
    #[must_use]
    pub fn campaign_replace_3d_asset() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "campaign.replace_3d_asset".to_string(),
            version: "1.0.0".to_string(),
            payload_schema: serde_json::json!({
                "type": "object",
                "required": ["campaign_id", "asset_prompt", "asset_slot"],
                "properties": {
                    "campaign_id": { "type": "string", "minLength": 1 },
                    "asset_prompt": { "type": "string", "minLength": 1 },
                    "asset_slot": { "type": "string", "minLength": 1 }
                }
            }),
            steps: vec![
                StepDefinition {
                    step_id: "generate_asset".to_string(),
                    skill_id: "generate_3d_asset".to_string(),
                    skill_version: "1.0.0".to_string(),
                    depends_on: vec![],
                    optional_depends_on: HashSet::new(),
                    input_template: serde_json::json!({
                        "campaign_id": { "$ref": "trigger.campaign_id" },
                        "asset_prompt": { "$ref": "trigger.asset_prompt" },
                        "asset_slot": { "$ref": "trigger.asset_slot" }
                    }),
                },
                StepDefinition {
                    step_id: "manifest".to_string(),
                    skill_id: "assemble_manifest".to_string(),
                    skill_version: "1.0.0".to_string(),
                    depends_on: vec!["generate_asset".to_string()],
                    optional_depends_on: HashSet::new(),
                    input_template: serde_json::json!({
                        "campaign_id": { "$ref": "trigger.campaign_id" },
                        "asset_artifacts": { "$ref": "steps.generate_asset.artifacts" }
                    }),
                },
            ],
        }
    }

    /// `campaign.build.minimal`: a single cacheable step, used by the
    /// cache-hit-on-retry scenario (spec.md §8 S1).
    #[must_use]
    pub fn campaign_build_minimal() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "campaign.build.minimal".to_string(),
            version: "1.0.0".to_string(),
            payload_schema: serde_json::json!({
                "type": "object",
                "required": ["template_id", "theme", "difficulty"],
                "properties": {
                    "template_id": { "type": "string" },
                    "theme": { "type": "string" },
                    "difficulty": { "type": "string" }
                }
            }),
            steps: vec![StepDefinition {
                step_id: "game_config_from_template".to_string(),
                skill_id: "game_config_from_template".to_string(),
                skill_version: "1.0.0".to_string(),
                depends_on: vec![],
                optional_depends_on: HashSet::new(),
                input_template: serde_json::json!({
                    "template_id": { "$ref": "trigger.template_id" },
                    "theme": { "$ref": "trigger.theme" },
                    "difficulty": { "$ref": "trigger.difficulty" }
                }),
            }],
        }
    }

    /// All built-in workflows, ready to feed into `Planner::register`.
    #[must_use]
    pub fn all() -> Vec<WorkflowDefinition> {
        vec![campaign_build(), campaign_replace_3d_asset(), campaign_build_minimal()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner_with_builtins() -> Planner {
        let mut planner = Planner::new();
        for wf in builtin::all() {
            planner.register(wf);
        }
        planner
    }

    #[test]
    fn unknown_workflow_is_rejected() {
        let planner = planner_with_builtins();
        let err = planner.plan("campaign.nonexistent", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, PlannerError::UnknownWorkflow(_)));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let planner = planner_with_builtins();
        let err = planner.plan("campaign.build", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, PlannerError::ValidationError(_)));
    }

    #[test]
    fn campaign_build_plans_in_dependency_order() {
        let planner = planner_with_builtins();
        let plan = planner
            .plan("campaign.build", &serde_json::json!({"brief": "spring sale"}))
            .unwrap();
        let order: Vec<&str> = plan.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(order, vec!["plan", "intro_image", "bundle", "validate", "manifest"]);
    }

    #[test]
    fn planned_step_resolves_trigger_reference() {
        let planner = planner_with_builtins();
        let plan = planner
            .plan("campaign.build", &serde_json::json!({"brief": "spring sale"}))
            .unwrap();
        let plan_step = &plan[0];
        let state = RunState {
            trigger_payload: serde_json::json!({"brief": "spring sale"}),
            ..Default::default()
        };
        let input = plan_step.resolve_input(&state).unwrap();
        assert_eq!(input, serde_json::json!({"brief": "spring sale"}));
    }

    #[test]
    fn planned_step_resolves_upstream_output_and_artifacts() {
        let planner = planner_with_builtins();
        let plan = planner
            .plan("campaign.build", &serde_json::json!({"brief": "spring sale"}))
            .unwrap();
        let bundle_step = plan.iter().find(|s| s.step_id == "bundle").unwrap();

        let mut state = RunState {
            trigger_payload: serde_json::json!({"brief": "spring sale"}),
            ..Default::default()
        };
        state.step_outputs.insert("plan".to_string(), serde_json::json!({"theme": "neon"}));
        state
            .step_artifact_ids
            .insert("intro_image".to_string(), vec!["artifact-1".to_string()]);

        let input = bundle_step.resolve_input(&state).unwrap();
        assert_eq!(
            input,
            serde_json::json!({"plan": {"theme": "neon"}, "intro_image_artifacts": ["artifact-1"]})
        );
    }

    #[test]
    fn resolve_input_errors_when_upstream_output_missing() {
        let planner = planner_with_builtins();
        let plan = planner
            .plan("campaign.build", &serde_json::json!({"brief": "spring sale"}))
            .unwrap();
        let intro_step = plan.iter().find(|s| s.step_id == "intro_image").unwrap();
        let state = RunState {
            trigger_payload: serde_json::json!({"brief": "spring sale"}),
            ..Default::default()
        };
        let err = intro_step.resolve_input(&state).unwrap_err();
        assert!(matches!(err, PlannerError::InputResolutionError { .. }));
    }

    #[test]
    fn cycle_is_rejected() {
        let mut planner = Planner::new();
        planner.register(WorkflowDefinition {
            name: "cyclic".to_string(),
            version: "1.0.0".to_string(),
            payload_schema: serde_json::json!({"type": "object"}),
            steps: vec![
                StepDefinition {
                    step_id: "a".to_string(),
                    skill_id: "noop".to_string(),
                    skill_version: "1.0.0".to_string(),
                    depends_on: vec!["b".to_string()],
                    optional_depends_on: HashSet::new(),
                    input_template: serde_json::json!({}),
                },
                StepDefinition {
                    step_id: "b".to_string(),
                    skill_id: "noop".to_string(),
                    skill_version: "1.0.0".to_string(),
                    depends_on: vec!["a".to_string()],
                    optional_depends_on: HashSet::new(),
                    input_template: serde_json::json!({}),
                },
            ],
        });
        let err = planner.plan("cyclic", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, PlannerError::CycleDetected(_)));
    }

    #[test]
    fn dangling_reference_is_rejected_at_plan_time() {
        let mut planner = Planner::new();
        planner.register(WorkflowDefinition {
            name: "broken".to_string(),
            version: "1.0.0".to_string(),
            payload_schema: serde_json::json!({"type": "object"}),
            steps: vec![StepDefinition {
                step_id: "only".to_string(),
                skill_id: "noop".to_string(),
                skill_version: "1.0.0".to_string(),
                depends_on: vec![],
                optional_depends_on: HashSet::new(),
                input_template: serde_json::json!({ "x": { "$ref": "steps.never_declared.output" } }),
            }],
        });
        let err = planner.plan("broken", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, PlannerError::DanglingReference { .. }));
    }

    #[test]
    fn cascades_on_distinguishes_optional_edges() {
        let step = PlannedStep {
            step_id: "bundle".to_string(),
            skill_id: "bundle_template".to_string(),
            skill_version: "1.0.0".to_string(),
            depends_on: vec!["a".to_string(), "b".to_string()],
            optional_depends_on: HashSet::from(["b".to_string()]),
            input_template: serde_json::json!({}),
        };
        assert!(step.cascades_on("a"));
        assert!(!step.cascades_on("b"));
    }
}
