//! Run reports: the ordered record of what a run did

use crate::error::StepError;
use crate::model::{Step, TriggerSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Error attached to a failed step or run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Taxonomy tag (`EffectAdapterError`, `LoopBoundExceeded`, ...)
    pub kind: String,
    pub message: String,
}

impl From<&StepError> for ErrorInfo {
    fn from(err: &StepError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// One entry in the report
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step_id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    /// Position in the step tree, e.g. `2/then/0` or `3/body[1]/0`
    pub path: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Value produced by the step (read variable, HTTP response, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Control-flow decision (branch taken, iterations run)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// Final, read-only record of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub automation_id: String,
    pub trigger: TriggerSource,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Run-level diagnostic (invalid automation, fatal step error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub steps: Vec<StepRecord>,
}

impl RunReport {
    /// Record for a step id (the first one, for steps inside loops)
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.step_id == step_id)
    }

    /// Records of a given step type, in order
    pub fn steps_of_type<'a>(&'a self, step_type: &'a str) -> impl Iterator<Item = &'a StepRecord> {
        self.steps.iter().filter(move |r| r.step_type == step_type)
    }

    /// Number of steps that were actually dispatched (not skipped)
    #[must_use]
    pub fn executed_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|r| r.status != StepStatus::Skipped)
            .count()
    }

    /// Wall-clock duration of the run
    #[must_use]
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Append-only builder owned by the execution context
#[derive(Debug)]
pub(crate) struct ReportBuilder {
    run_id: String,
    automation_id: String,
    trigger: TriggerSource,
    started_at: DateTime<Utc>,
    steps: Vec<StepRecord>,
}

impl ReportBuilder {
    pub(crate) fn new(run_id: String, automation_id: String, trigger: TriggerSource) -> Self {
        Self {
            run_id,
            automation_id,
            trigger,
            started_at: Utc::now(),
            steps: Vec::new(),
        }
    }

    /// Open an entry for a dispatched step and return its slot
    ///
    /// Entries start out cancelled so that a step cut off mid-flight never
    /// reads as succeeded.
    pub(crate) fn begin(&mut self, step: &Step, path: String) -> usize {
        let now = Utc::now();
        self.steps.push(StepRecord {
            step_id: step.id.clone(),
            step_type: step.step_type.clone(),
            path,
            status: StepStatus::Cancelled,
            started_at: now,
            finished_at: now,
            error: None,
            output: None,
            detail: None,
        });
        self.steps.len() - 1
    }

    pub(crate) fn finish(&mut self, slot: usize, status: StepStatus, error: Option<ErrorInfo>) {
        if let Some(record) = self.steps.get_mut(slot) {
            record.status = status;
            record.error = error;
            record.finished_at = Utc::now();
        }
    }

    pub(crate) fn set_output(&mut self, slot: usize, output: Value) {
        if let Some(record) = self.steps.get_mut(slot) {
            record.output = Some(output);
        }
    }

    pub(crate) fn set_detail(&mut self, slot: usize, detail: Value) {
        if let Some(record) = self.steps.get_mut(slot) {
            record.detail = Some(detail);
        }
    }

    /// Record a disabled step
    pub(crate) fn skipped(&mut self, step: &Step, path: String) {
        let slot = self.begin(step, path);
        self.finish(slot, StepStatus::Skipped, None);
    }

    pub(crate) fn build(self, status: RunStatus, error: Option<ErrorInfo>) -> RunReport {
        RunReport {
            run_id: self.run_id,
            automation_id: self.automation_id,
            trigger: self.trigger,
            status,
            started_at: self.started_at,
            finished_at: Utc::now(),
            error,
            steps: self.steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_report_serializes_camel_case() {
        let mut builder = ReportBuilder::new("r1".into(), "a1".into(), TriggerSource::Nfc);
        let step = Step::new("s1", "notify", json!({"message": "hi"}));
        let slot = builder.begin(&step, "0".into());
        builder.set_output(slot, json!("hi"));
        builder.finish(slot, StepStatus::Succeeded, None);
        let report = builder.build(RunStatus::Succeeded, None);

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["automationId"], "a1");
        assert_eq!(value["trigger"], "nfc");
        assert_eq!(value["steps"][0]["stepId"], "s1");
        assert_eq!(value["steps"][0]["status"], "succeeded");
        assert!(value["steps"][0].get("error").is_none());
    }

    #[test]
    fn test_unfinished_entry_reads_cancelled() {
        let mut builder = ReportBuilder::new("r1".into(), "a1".into(), TriggerSource::Manual);
        builder.begin(&Step::new("s1", "delay", json!({"seconds": 5})), "0".into());
        let report = builder.build(RunStatus::Cancelled, None);
        assert_eq!(report.steps[0].status, StepStatus::Cancelled);
        assert_eq!(report.executed_count(), 1);
    }
}
