// SPDX-License-Identifier: MIT OR Apache-2.0
//! The skill handler contract and the registry that dispatches to it.
//!
//! Handler *bodies* that call external model providers are out of scope
//! here (spec.md's Non-goals) — this crate only fixes the interface every
//! handler implements and provides a couple of illustrative/test handlers.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use sf_context::ExecutionContext;
use sf_envelope::SkillResult;
use std::collections::HashMap;
use std::sync::Arc;

/// A single skill operation: `Execute(input, ctx) -> Result`.
///
/// Per-skill concrete types are registered by name in a [`HandlerRegistry`]
/// rather than forming any inheritance hierarchy.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Run the handler against validated, schema-checked input.
    ///
    /// Handlers must not raise for *expected* failures (validation,
    /// provider refusal) — those are returned as
    /// [`SkillResult::Failure`]. Panics are caught at the orchestrator
    /// boundary and converted to `EXECUTION_ERROR`, not here.
    async fn execute(&self, input: serde_json::Value, ctx: &ExecutionContext) -> SkillResult;
}

/// Dispatch table from `handler_id` (the descriptor's `implementation.handler`
/// field) to a bound [`Handler`] implementation.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handler_ids", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler_id` to an implementation, replacing any prior binding.
    pub fn register(&mut self, handler_id: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler_id.into(), handler);
    }

    /// Look up a bound handler by id.
    #[must_use]
    pub fn get(&self, handler_id: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(handler_id).cloned()
    }

    /// `true` if a handler is bound under `handler_id`.
    ///
    /// Note this is distinct from `SkillRegistry::has`, which only asks
    /// whether a descriptor is *registered*; a fully dispatchable skill
    /// needs both.
    #[must_use]
    pub fn has(&self, handler_id: &str) -> bool {
        self.handlers.contains_key(handler_id)
    }

    /// Number of bound handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// `true` if no handlers are bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A handler that echoes its input back as output, used in tests and local
/// development in place of a real provider-calling skill.
#[derive(Debug, Clone, Default)]
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn execute(&self, input: serde_json::Value, _ctx: &ExecutionContext) -> SkillResult {
        SkillResult::Success {
            data: input,
            artifacts: vec![],
            debug: sf_envelope::DebugInfo::with_total(0),
        }
    }
}

/// A handler that always fails with a fixed error code, used to exercise
/// retry and failure-propagation paths without a real provider.
#[derive(Debug, Clone)]
pub struct AlwaysFailHandler {
    /// Error code every invocation returns.
    pub code: sf_error::ErrorCode,
    /// Message attached to the error.
    pub message: String,
}

#[async_trait]
impl Handler for AlwaysFailHandler {
    async fn execute(&self, _input: serde_json::Value, _ctx: &ExecutionContext) -> SkillResult {
        SkillResult::Failure {
            error: self.message.clone(),
            error_code: self.code,
            debug: sf_envelope::DebugInfo::with_total(0),
        }
    }
}
