//! Error types for the automation engine

use std::time::Duration;
use thiserror::Error;

/// Errors returned by the [`AutomationEngine`](crate::AutomationEngine) facade
#[derive(Error, Debug)]
pub enum AutomationError {
    /// Automation not found
    #[error("Automation not found: {0}")]
    NotFound(String),

    /// Automation is inactive and the trigger source requires an active one
    #[error("Automation is inactive: {0}")]
    Inactive(String),

    /// A triggered run of this automation is still in flight
    #[error("Automation is already running: {0}")]
    AlreadyRunning(String),

    /// Trigger payload did not name an automation
    #[error("Trigger payload is missing an automation id")]
    MissingAutomationId,

    /// Invalid automation definition
    #[error("Invalid automation: {0}")]
    Invalid(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures surfaced by an effect adapter call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EffectError {
    /// The capability was not supplied to the engine
    #[error("{0} capability is not available")]
    Unavailable(String),

    /// The call did not finish within its timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The adapter reported a failure (network error, permission denied, ...)
    #[error("{0}")]
    Failed(String),

    /// The adapter observed the run's cancellation token and aborted
    #[error("cancelled")]
    Cancelled,
}

/// Errors produced while executing a single step
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    /// No handler registered for the step type
    #[error("Unknown step type: {0}")]
    UnknownStepType(String),

    /// Step config failed shape validation
    #[error("Invalid step config: {0}")]
    Validation(String),

    /// A `{{name}}` reference could not be resolved
    #[error("Unresolved variable reference: {0}")]
    UnresolvedVariable(String),

    /// `get_variable` read a name that was never set
    #[error("Undefined variable: {0}")]
    UndefinedVariable(String),

    /// A value could not be coerced to the type the step needs
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: String },

    /// A loop hit its iteration ceiling
    #[error("Loop exceeded {limit} iterations")]
    LoopBoundExceeded { limit: u32 },

    /// An effect adapter call failed
    #[error("Effect adapter error: {0}")]
    Effect(#[from] EffectError),

    /// The step observed cancellation
    #[error("Cancelled")]
    Cancelled,

    /// The handler panicked or broke an engine invariant
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StepError {
    /// Stable kind tag recorded in run reports
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownStepType(_) => "UnknownStepType",
            Self::Validation(_) => "ValidationError",
            Self::UnresolvedVariable(_) => "UnresolvedVariable",
            Self::UndefinedVariable(_) => "UndefinedVariable",
            Self::TypeMismatch { .. } => "TypeMismatch",
            Self::LoopBoundExceeded { .. } => "LoopBoundExceeded",
            Self::Effect(EffectError::Cancelled) | Self::Cancelled => "Cancelled",
            Self::Effect(_) => "EffectAdapterError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Whether this error means the step stopped because the run was cancelled
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Effect(EffectError::Cancelled))
    }

    /// Errors that stop the run regardless of step policy or `continueOnError`
    #[must_use]
    pub fn is_always_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownStepType(_) | Self::Validation(_) | Self::Internal(_)
        )
    }

    pub(crate) fn type_mismatch(expected: &'static str, found: &serde_json::Value) -> Self {
        Self::TypeMismatch {
            expected,
            found: describe(found),
        }
    }
}

/// Short rendering of a value for error messages
fn describe(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(b) => format!("boolean {b}"),
        serde_json::Value::Number(n) => format!("number {n}"),
        serde_json::Value::String(s) => format!("string {s:?}"),
        serde_json::Value::Array(_) => "array".to_string(),
        serde_json::Value::Object(_) => "object".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effect_cancellation_reports_as_cancelled() {
        let err = StepError::from(EffectError::Cancelled);
        assert!(err.is_cancellation());
        assert_eq!(err.kind(), "Cancelled");
    }

    #[test]
    fn test_effect_timeout_kind() {
        let err = StepError::from(EffectError::Timeout(Duration::from_secs(15)));
        assert_eq!(err.kind(), "EffectAdapterError");
        assert!(!err.is_always_fatal());
    }
}
