//! Execution controller: drives one automation run to a terminal state
//!
//! A controller is built idle, enters the running state when [`start`] is
//! called and consumes itself, so one controller can never run twice. Steps
//! execute one at a time, depth-first, in document order.
//!
//! [`start`]: ExecutionController::start

use crate::config::EngineConfig;
use crate::effects::Effects;
use crate::error::StepError;
use crate::evaluator::{ControlFlow, ControlFlowEvaluator};
use crate::model::{Automation, Step, TriggerSource};
use crate::registry::{FailurePolicy, StepContext, StepRegistry};
use crate::report::{ErrorInfo, ReportBuilder, RunReport, RunStatus, StepStatus};
use crate::variables::VariableStore;
use futures::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Progress events emitted while a run executes
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// A run entered the running state
    RunStarted {
        run_id: String,
        automation_id: String,
        source: TriggerSource,
    },
    /// A step was dispatched
    StepStarted {
        run_id: String,
        step_id: String,
        path: String,
    },
    /// A step reached its final status (including skipped)
    StepFinished {
        run_id: String,
        step_id: String,
        path: String,
        status: StepStatus,
    },
    /// A run reached a terminal state
    RunFinished {
        run_id: String,
        automation_id: String,
        status: RunStatus,
    },
}

/// Why a step sequence stopped early
#[derive(Debug, Clone)]
enum Flow {
    Continue,
    Failed { step_id: String, error: ErrorInfo },
    Cancelled,
}

/// Per-run state threaded through every step
struct ExecutionContext {
    run_id: String,
    variables: VariableStore,
    cancel: CancellationToken,
    path: Vec<String>,
    report: ReportBuilder,
    evaluator: ControlFlowEvaluator,
}

/// Drives a single run
pub struct ExecutionController {
    registry: Arc<StepRegistry>,
    effects: Effects,
    config: EngineConfig,
    source: TriggerSource,
    events: Option<broadcast::Sender<RunEvent>>,
}

impl ExecutionController {
    /// Create an idle controller
    #[must_use]
    pub fn new(registry: Arc<StepRegistry>, effects: Effects, config: EngineConfig) -> Self {
        Self {
            registry,
            effects,
            config,
            source: TriggerSource::Manual,
            events: None,
        }
    }

    /// Record the trigger source in the report
    #[must_use]
    pub fn with_source(mut self, source: TriggerSource) -> Self {
        self.source = source;
        self
    }

    /// Publish progress events on a broadcast channel
    #[must_use]
    pub fn with_events(mut self, events: broadcast::Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run an automation to completion, failure or cancellation
    ///
    /// Always returns a report; step errors never escape as `Err`.
    pub async fn start(
        self,
        automation: &Automation,
        initial_variables: VariableStore,
        cancel: CancellationToken,
    ) -> RunReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut ctx = ExecutionContext {
            run_id: run_id.clone(),
            variables: initial_variables,
            cancel,
            path: Vec::new(),
            report: ReportBuilder::new(run_id.clone(), automation.id.clone(), self.source),
            evaluator: ControlFlowEvaluator::new(&self.config),
        };

        tracing::info!(
            "Starting run {} of automation '{}' ({}), trigger: {}",
            run_id,
            automation.name,
            automation.id,
            self.source.as_str()
        );
        self.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
            automation_id: automation.id.clone(),
            source: self.source,
        });

        let flow = match automation.duplicate_step_id() {
            Some(duplicate) => Flow::Failed {
                step_id: duplicate.to_string(),
                error: ErrorInfo::from(&StepError::Validation(format!(
                    "duplicate step id `{duplicate}`"
                ))),
            },
            None => self.run_steps(&mut ctx, None, &automation.steps).await,
        };

        let (status, error) = match flow {
            Flow::Continue if ctx.cancel.is_cancelled() => (RunStatus::Cancelled, None),
            Flow::Continue => (RunStatus::Succeeded, None),
            Flow::Cancelled => (RunStatus::Cancelled, None),
            Flow::Failed { step_id, error } => {
                tracing::error!(
                    "Run {} of automation '{}' failed at step {}: {}",
                    run_id,
                    automation.name,
                    step_id,
                    error.message
                );
                (RunStatus::Failed, Some(wrap_child_error(&step_id, &error)))
            }
        };

        let report = ctx.report.build(status, error);
        tracing::info!(
            "Run {} of automation '{}' finished: {:?} ({} steps recorded)",
            run_id,
            automation.name,
            status,
            report.steps.len()
        );
        self.emit(RunEvent::RunFinished {
            run_id,
            automation_id: automation.id.clone(),
            status,
        });
        report
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Run a step list, stopping at the first halt
    fn run_steps<'s>(
        &'s self,
        ctx: &'s mut ExecutionContext,
        label: Option<String>,
        steps: &'s [Step],
    ) -> BoxFuture<'s, Flow> {
        Box::pin(async move {
            if let Some(label) = &label {
                ctx.path.push(label.clone());
            }
            let mut flow = Flow::Continue;
            for (index, step) in steps.iter().enumerate() {
                ctx.path.push(index.to_string());
                flow = self.execute_step(ctx, step).await;
                ctx.path.pop();
                if !matches!(flow, Flow::Continue) {
                    break;
                }
            }
            if label.is_some() {
                ctx.path.pop();
            }
            flow
        })
    }

    /// Execute one step and record its outcome
    async fn execute_step(&self, ctx: &mut ExecutionContext, step: &Step) -> Flow {
        if ctx.cancel.is_cancelled() {
            tracing::debug!("Run {} cancelled before step {}", ctx.run_id, step.id);
            return Flow::Cancelled;
        }

        let path = ctx.path.join("/");
        if !step.enabled {
            tracing::debug!("Skipping disabled step {} at {}", step.id, path);
            ctx.report.skipped(step, path.clone());
            self.finished(ctx, step, path, StepStatus::Skipped);
            return Flow::Continue;
        }

        let slot = ctx.report.begin(step, path.clone());
        self.emit(RunEvent::StepStarted {
            run_id: ctx.run_id.clone(),
            step_id: step.id.clone(),
            path: path.clone(),
        });
        tracing::debug!("Dispatching step {} ({}) at {}", step.id, step.step_type, path);

        let outcome = match ControlFlow::parse(step, &ctx.variables, &self.config) {
            // Children that finished after the token was set still leave the parent cancelled
            Ok(Some(flow)) => self
                .run_control_flow(ctx, slot, flow)
                .await
                .map(|flow| match flow {
                    Flow::Continue if ctx.cancel.is_cancelled() => Flow::Cancelled,
                    other => other,
                }),
            Ok(None) => self.run_leaf(ctx, slot, step).await.map(|()| Flow::Continue),
            Err(e) => Err(e),
        };

        let (status, error, flow) = match outcome {
            Ok(Flow::Continue) => (StepStatus::Succeeded, None, Flow::Continue),
            Ok(Flow::Cancelled) => (StepStatus::Cancelled, None, Flow::Cancelled),
            Ok(Flow::Failed { step_id, error }) => {
                let wrapped = wrap_child_error(&step_id, &error);
                (StepStatus::Failed, Some(wrapped), Flow::Failed { step_id, error })
            }
            Err(e) if e.is_cancellation() => {
                (StepStatus::Cancelled, Some(ErrorInfo::from(&e)), Flow::Cancelled)
            }
            Err(e) => {
                let info = ErrorInfo::from(&e);
                let flow = if self.is_fatal(step, &e) {
                    Flow::Failed {
                        step_id: step.id.clone(),
                        error: info.clone(),
                    }
                } else {
                    tracing::warn!("Step {} ({}) failed, continuing: {}", step.id, step.step_type, e);
                    Flow::Continue
                };
                (StepStatus::Failed, Some(info), flow)
            }
        };

        ctx.report.finish(slot, status, error);
        self.finished(ctx, step, path, status);
        flow
    }

    fn finished(&self, ctx: &ExecutionContext, step: &Step, path: String, status: StepStatus) {
        self.emit(RunEvent::StepFinished {
            run_id: ctx.run_id.clone(),
            step_id: step.id.clone(),
            path,
            status,
        });
    }

    /// Whether a step error stops the run
    fn is_fatal(&self, step: &Step, error: &StepError) -> bool {
        if error.is_always_fatal() {
            return true;
        }
        let policy = if ControlFlow::handles(&step.step_type) {
            FailurePolicy::Halt
        } else {
            self.registry
                .failure_policy(&step.step_type)
                .unwrap_or(FailurePolicy::Halt)
        };
        match step.continue_on_error() {
            Some(continue_on_error) => !continue_on_error,
            None => policy == FailurePolicy::Halt,
        }
    }

    /// Resolve, validate and dispatch a leaf step, storing its output
    async fn run_leaf(
        &self,
        ctx: &mut ExecutionContext,
        slot: usize,
        step: &Step,
    ) -> Result<(), StepError> {
        if !self.registry.contains(&step.step_type) {
            return Err(StepError::UnknownStepType(step.step_type.clone()));
        }
        let config = ctx.variables.resolve_map(&step.config)?;

        let mut step_ctx = StepContext {
            step_id: &step.id,
            variables: &mut ctx.variables,
            cancel: &ctx.cancel,
            effects: &self.effects,
            config: &self.config,
        };
        let output = self
            .registry
            .dispatch(&step.step_type, &config, &mut step_ctx)
            .await?;

        if let Some(value) = output {
            if let Some(name) = step.output_variable() {
                ctx.variables.set(name, value.clone());
            }
            ctx.report.set_output(slot, value);
        }
        Ok(())
    }

    /// Decide and run the children of a control-flow step
    async fn run_control_flow(
        &self,
        ctx: &mut ExecutionContext,
        slot: usize,
        flow: ControlFlow<'_>,
    ) -> Result<Flow, StepError> {
        match flow {
            ControlFlow::Condition {
                expr,
                then_steps,
                else_steps,
            } => {
                let taken = ctx.evaluator.evaluate_condition(&expr, &ctx.variables)?;
                let (label, steps) = if taken {
                    ("then", then_steps)
                } else {
                    ("else", else_steps)
                };
                tracing::debug!("Condition took '{}' branch ({} steps)", label, steps.len());
                ctx.report.set_detail(slot, json!({ "branch": label }));
                Ok(self.run_steps(ctx, Some(label.to_string()), steps).await)
            }
            ControlFlow::Loop {
                bound,
                limit,
                index_variable,
                body,
            } => {
                ctx.evaluator.check_bound(&bound, limit)?;
                let mut iteration: u32 = 0;
                let flow = loop {
                    if ctx.cancel.is_cancelled() {
                        break Flow::Cancelled;
                    }
                    match ctx
                        .evaluator
                        .next_iteration(&bound, iteration, limit, &ctx.variables)
                    {
                        Ok(true) => {}
                        Ok(false) => break Flow::Continue,
                        Err(e) => {
                            ctx.report.set_detail(slot, json!({ "iterations": iteration }));
                            return Err(e);
                        }
                    }
                    ctx.variables.set(index_variable.as_str(), iteration);
                    let flow = self
                        .run_steps(ctx, Some(format!("body[{iteration}]")), body)
                        .await;
                    iteration += 1;
                    if !matches!(flow, Flow::Continue) {
                        break flow;
                    }
                };
                tracing::debug!("Loop ran {} iterations", iteration);
                ctx.report.set_detail(slot, json!({ "iterations": iteration }));
                Ok(flow)
            }
            ControlFlow::Group { steps } => {
                Ok(self.run_steps(ctx, Some("steps".to_string()), steps).await)
            }
            ControlFlow::Random { branches } => {
                let index = ctx.evaluator.select_branch(branches)?;
                tracing::debug!("Random step picked branch {} of {}", index, branches.len());
                ctx.report.set_detail(slot, json!({ "branch": index }));
                Ok(self
                    .run_steps(ctx, Some(format!("branches[{index}]")), &branches[index].steps)
                    .await)
            }
        }
    }
}

/// Error recorded on a parent (or the run) when a nested step halted it
fn wrap_child_error(step_id: &str, error: &ErrorInfo) -> ErrorInfo {
    ErrorInfo {
        kind: error.kind.clone(),
        message: format!("step `{step_id}` failed: {}", error.message),
    }
}
