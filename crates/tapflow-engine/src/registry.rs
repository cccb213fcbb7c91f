//! Step registry: maps step type tags to handlers

use crate::config::EngineConfig;
use crate::effects::Effects;
use crate::error::StepError;
use crate::handlers;
use crate::variables::VariableStore;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a step failure does to the run when the step does not override it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop the run and mark it failed
    Halt,
    /// Log the failure and move on to the next sibling
    Continue,
}

/// Everything a handler may touch while it runs
pub struct StepContext<'a> {
    pub step_id: &'a str,
    pub variables: &'a mut VariableStore,
    pub cancel: &'a CancellationToken,
    pub effects: &'a Effects,
    pub config: &'a EngineConfig,
}

/// A step implementation
///
/// `config` has already had its `{{name}}` references resolved against the
/// variable store when `validate` and `execute` see it.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Default behaviour when this step fails
    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Halt
    }

    /// Check the config shape before execution
    fn validate(&self, _config: &Map<String, Value>) -> Result<(), StepError> {
        Ok(())
    }

    /// Run the step, returning its output value if it has one
    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<Value>, StepError>;
}

/// Registry of step handlers keyed by type tag
pub struct StepRegistry {
    handlers: DashMap<String, Arc<dyn StepHandler>>,
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StepRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Create a registry holding every built-in handler
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        handlers::register_builtins(&registry);
        registry
    }

    /// Add or replace the handler for a step type
    pub fn register(&self, step_type: impl Into<String>, handler: impl StepHandler + 'static) {
        self.register_arc(step_type, Arc::new(handler));
    }

    /// Add or replace a shared handler
    pub fn register_arc(&self, step_type: impl Into<String>, handler: Arc<dyn StepHandler>) {
        let step_type = step_type.into();
        if self.handlers.insert(step_type.clone(), handler).is_some() {
            tracing::debug!("Replaced handler for step type '{}'", step_type);
        }
    }

    pub fn unregister(&self, step_type: &str) -> bool {
        self.handlers.remove(step_type).is_some()
    }

    #[must_use]
    pub fn contains(&self, step_type: &str) -> bool {
        self.handlers.contains_key(step_type)
    }

    /// Registered type tags, sorted
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    /// Default failure policy of a registered type
    #[must_use]
    pub fn failure_policy(&self, step_type: &str) -> Option<FailurePolicy> {
        self.handlers.get(step_type).map(|h| h.failure_policy())
    }

    fn handler(&self, step_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_type).map(|h| Arc::clone(h.value()))
    }

    /// Validate and execute a step
    ///
    /// A panicking handler is reported as [`StepError::Internal`].
    pub async fn dispatch(
        &self,
        step_type: &str,
        config: &Map<String, Value>,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<Value>, StepError> {
        let handler = self
            .handler(step_type)
            .ok_or_else(|| StepError::UnknownStepType(step_type.to_string()))?;

        handler.validate(config)?;

        AssertUnwindSafe(handler.execute(config, ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                Err(StepError::Internal(message))
            })
    }
}
