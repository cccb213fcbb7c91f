//! Automation engine for Tapflow
//!
//! Runs user-defined automations (ordered step lists with branching, loops
//! and random choice) triggered manually, by NFC tag, QR code or schedule.
//! Side effects go through capability traits so hosts plug in their own
//! notification, messaging, HTTP, device and app-launch adapters.

pub mod config;
pub mod effects;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod expression;
pub mod handlers;
pub mod model;
pub mod registry;
pub mod report;
pub mod variables;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EngineConfig;
pub use effects::Effects;
pub use engine::AutomationEngine;
pub use error::{AutomationError, EffectError, StepError};
pub use executor::{ExecutionController, RunEvent};
pub use model::*;
pub use registry::{FailurePolicy, StepContext, StepHandler, StepRegistry};
pub use report::{RunReport, RunStatus, StepRecord, StepStatus};
pub use variables::VariableStore;
