//! Unified error taxonomy with stable error codes for skillforge.
//!
//! Every skillforge error carries an [`ErrorCode`] (a machine-readable,
//! stable tag), a human-readable message, an optional cause chain, and
//! arbitrary key-value context. Use [`SfError::new`] to construct errors
//! fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Broad family an [`ErrorCode`] belongs to, matching spec.md §7's taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Payload/schema rejection at the API boundary.
    Validation,
    /// Planner could not resolve a step's inputs from prior state.
    InputResolution,
    /// Network host, secret key, or filesystem path blocked by policy.
    PolicyDenied,
    /// Retryable provider/network failure.
    Transient,
    /// Uncaught handler failure.
    Execution,
    /// Context signal fired (timeout or explicit cancel).
    Cancellation,
    /// Orchestrator invariant violation.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::InputResolution => "input_resolution",
            Self::PolicyDenied => "policy_denied",
            Self::Transient => "transient",
            Self::Execution => "execution",
            Self::Cancellation => "cancellation",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Machine-readable, stable error code.
///
/// Each variant serializes to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases — the same strings
/// handlers and the orchestrator use in `SkillResult::failure.error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Validation --
    /// Trigger payload failed the workflow's JSON schema.
    ValidationError,
    /// The named workflow has no registered definition.
    UnknownWorkflow,

    // -- InputResolution --
    /// A step's resolver could not produce a concrete input value.
    InputResolutionError,
    /// A dependent step was skipped because an upstream step failed.
    SkippedDueToUpstream,

    // -- PolicyDenied --
    /// The step attempted a network call to a non-allowlisted host.
    PolicyDenied,
    /// The step requested a secret key outside the whitelist.
    SecretDenied,

    // -- Transient --
    /// Provider rejected the request due to rate limiting.
    RateLimited,
    /// Provider call exceeded its timeout.
    ProviderTimeout,
    /// Provider returned a generation failure (expected to be retried).
    GenerationFailed,
    /// Outbound network call failed (DNS, connection reset, etc).
    NetworkError,

    // -- Execution --
    /// Handler raised instead of returning a failure envelope.
    ExecutionError,
    /// Descriptor-level or schema-level bad request.
    BadRequest,

    // -- Cancellation --
    /// Step exceeded its policy timeout.
    Timeout,
    /// Step or run was explicitly cancelled.
    Cancelled,

    // -- Internal --
    /// Cache or store observed a state the invariants forbid.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ValidationError | Self::UnknownWorkflow => ErrorCategory::Validation,
            Self::InputResolutionError | Self::SkippedDueToUpstream => {
                ErrorCategory::InputResolution
            }
            Self::PolicyDenied | Self::SecretDenied => ErrorCategory::PolicyDenied,
            Self::RateLimited | Self::ProviderTimeout | Self::GenerationFailed | Self::NetworkError => {
                ErrorCategory::Transient
            }
            Self::ExecutionError | Self::BadRequest => ErrorCategory::Execution,
            Self::Timeout | Self::Cancelled => ErrorCategory::Cancellation,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Returns `true` if the orchestrator's retry policy may re-attempt a
    /// step failing with this code (spec.md §4.I "Retry policy").
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transient)
    }

    /// Stable `&'static str` representation (e.g. `"RATE_LIMITED"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::UnknownWorkflow => "UNKNOWN_WORKFLOW",
            Self::InputResolutionError => "INPUT_RESOLUTION_ERROR",
            Self::SkippedDueToUpstream => "SKIPPED_DUE_TO_UPSTREAM",
            Self::PolicyDenied => "POLICY_DENIED",
            Self::SecretDenied => "SECRET_DENIED",
            Self::RateLimited => "RATE_LIMITED",
            Self::ProviderTimeout => "PROVIDER_TIMEOUT",
            Self::GenerationFailed => "GENERATION_FAILED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::BadRequest => "BAD_REQUEST",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified skillforge error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Examples
///
/// ```
/// use sf_error::{SfError, ErrorCode};
///
/// let err = SfError::new(ErrorCode::ProviderTimeout, "timed out after 60s")
///     .with_context("provider", "stability")
///     .with_context("timeout_ms", 60_000);
/// assert!(err.code.is_retryable());
/// ```
pub struct SfError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl SfError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialization
    /// fails, the entry is silently skipped.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for SfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("SfError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for SfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for SfError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Serializable snapshot of an [`SfError`] (without the opaque source),
/// suitable for embedding in a `RunStep.error` or `Run.error` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_message: Option<String>,
}

impl From<&SfError> for ErrorRecord {
    fn from(err: &SfError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(std::string::ToString::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::ValidationError,
        ErrorCode::UnknownWorkflow,
        ErrorCode::InputResolutionError,
        ErrorCode::SkippedDueToUpstream,
        ErrorCode::PolicyDenied,
        ErrorCode::SecretDenied,
        ErrorCode::RateLimited,
        ErrorCode::ProviderTimeout,
        ErrorCode::GenerationFailed,
        ErrorCode::NetworkError,
        ErrorCode::ExecutionError,
        ErrorCode::BadRequest,
        ErrorCode::Timeout,
        ErrorCode::Cancelled,
        ErrorCode::Internal,
    ];

    #[test]
    fn basic_construction() {
        let err = SfError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = SfError::new(ErrorCode::RateLimited, "provider said slow down");
        assert_eq!(err.to_string(), "[RATE_LIMITED] provider said slow down");
    }

    #[test]
    fn display_with_context() {
        let err = SfError::new(ErrorCode::ProviderTimeout, "timed out")
            .with_context("timeout_ms", 5000);
        let s = err.to_string();
        assert!(s.starts_with("[PROVIDER_TIMEOUT] timed out"));
        assert!(s.contains("timeout_ms"));
    }

    #[test]
    fn only_transient_codes_are_retryable() {
        let retryable: Vec<_> = ALL_CODES.iter().filter(|c| c.is_retryable()).collect();
        assert_eq!(
            retryable,
            vec![
                &ErrorCode::RateLimited,
                &ErrorCode::ProviderTimeout,
                &ErrorCode::GenerationFailed,
                &ErrorCode::NetworkError,
            ]
        );
    }

    #[test]
    fn validation_and_input_resolution_and_policy_never_retryable() {
        assert!(!ErrorCode::ValidationError.is_retryable());
        assert!(!ErrorCode::InputResolutionError.is_retryable());
        assert!(!ErrorCode::PolicyDenied.is_retryable());
    }

    #[test]
    fn codes_round_trip_through_json() {
        for code in ALL_CODES {
            let json = serde_json::to_string(code).unwrap();
            let back: ErrorCode = serde_json::from_str(&json).unwrap();
            assert_eq!(&back, code);
        }
    }

    #[test]
    fn error_record_captures_context_not_source() {
        let err = SfError::new(ErrorCode::ExecutionError, "panic caught")
            .with_source(std::io::Error::other("disk full"));
        let record = ErrorRecord::from(&err);
        assert_eq!(record.code, ErrorCode::ExecutionError);
        assert_eq!(record.source_message.as_deref(), Some("disk full"));
    }

    #[test]
    fn category_display_is_snake_case() {
        assert_eq!(ErrorCategory::InputResolution.to_string(), "input_resolution");
        assert_eq!(ErrorCategory::PolicyDenied.to_string(), "policy_denied");
    }
}
