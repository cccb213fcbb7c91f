//! Data models for the automation engine

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// A user-authored automation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    /// Unique identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Optional description
    #[serde(default)]
    pub description: String,
    /// Whether NFC/QR/scheduled triggers may launch it
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Top-level steps in document order
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A single unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Stable identifier, unaffected by reordering
    pub id: String,
    /// Handler tag (`sms`, `webhook`, `delay`, `condition`, ...)
    #[serde(rename = "type")]
    pub step_type: String,
    /// Type-specific configuration
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Disabled steps are recorded as skipped
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Nested step lists for control-flow steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<StepChildren>,
}

/// Child step lists carried by control-flow steps
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepChildren {
    /// `condition`: steps run when the expression is true
    #[serde(default, rename = "then", skip_serializing_if = "Vec::is_empty")]
    pub then_steps: Vec<Step>,
    /// `condition`: steps run when the expression is false
    #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
    pub else_steps: Vec<Step>,
    /// `loop`: body repeated each iteration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<Step>,
    /// `group`: ordered sub-sequence
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    /// `random`: weighted alternatives, one chosen per run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Branch>,
}

/// One weighted alternative of a `random` step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// Relative weight; missing means uniform
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_true() -> bool {
    true
}

impl Step {
    /// Create an enabled leaf step
    pub fn new(id: impl Into<String>, step_type: impl Into<String>, config: Value) -> Self {
        let config = match config {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            id: id.into(),
            step_type: step_type.into(),
            config,
            enabled: true,
            children: None,
        }
    }

    /// Builder: attach child lists
    #[must_use]
    pub fn with_children(mut self, children: StepChildren) -> Self {
        self.children = Some(children);
        self
    }

    /// Builder: set the enabled flag
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// All directly nested steps, in document order
    pub fn child_steps(&self) -> impl Iterator<Item = &Step> {
        self.children.iter().flat_map(|c| {
            c.then_steps
                .iter()
                .chain(&c.else_steps)
                .chain(&c.body)
                .chain(&c.steps)
                .chain(c.branches.iter().flat_map(|b| b.steps.iter()))
        })
    }

    /// `continueOnError` override from the config, if present
    #[must_use]
    pub fn continue_on_error(&self) -> Option<bool> {
        self.config
            .get("continueOnError")
            .or_else(|| self.config.get("continue_on_error"))
            .and_then(Value::as_bool)
    }

    /// Name of the variable that receives this step's output, if declared
    #[must_use]
    pub fn output_variable(&self) -> Option<&str> {
        self.config
            .get("output")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
    }
}

impl Automation {
    /// Parse an automation record from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Find the first duplicated step id anywhere in the tree
    #[must_use]
    pub fn duplicate_step_id(&self) -> Option<&str> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&Step> = self.steps.iter().rev().collect();
        while let Some(step) = stack.pop() {
            if !seen.insert(step.id.as_str()) {
                return Some(step.id.as_str());
            }
            let children: Vec<&Step> = step.child_steps().collect();
            stack.extend(children.into_iter().rev());
        }
        None
    }

    #[must_use]
    pub fn step_ids_unique(&self) -> bool {
        self.duplicate_step_id().is_none()
    }

    /// Find a step by id anywhere in the tree
    #[must_use]
    pub fn find_step(&self, id: &str) -> Option<&Step> {
        fn search<'a>(steps: Vec<&'a Step>, id: &str) -> Option<&'a Step> {
            for step in steps {
                if step.id == id {
                    return Some(step);
                }
                if let Some(found) = search(step.child_steps().collect(), id) {
                    return Some(found);
                }
            }
            None
        }
        search(self.steps.iter().collect(), id)
    }

    /// Move a top-level step to a new position, addressed by id
    ///
    /// Returns `false` when no top-level step has that id. Positions past the
    /// end are clamped.
    pub fn move_step(&mut self, id: &str, to: usize) -> bool {
        let Some(from) = self.steps.iter().position(|s| s.id == id) else {
            return false;
        };
        let step = self.steps.remove(from);
        let to = to.min(self.steps.len());
        self.steps.insert(to, step);
        true
    }

    /// Remove a top-level step by id
    pub fn remove_step(&mut self, id: &str) -> Option<Step> {
        let index = self.steps.iter().position(|s| s.id == id)?;
        Some(self.steps.remove(index))
    }
}

/// Where a run request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Test run or launch from the app
    Manual,
    /// NFC tag tap
    Nfc,
    /// QR code scan
    Qr,
    /// Time-based launch by the host
    Scheduled,
}

impl TriggerSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Nfc => "nfc",
            Self::Qr => "qr",
            Self::Scheduled => "scheduled",
        }
    }
}

/// Decoded trigger payload (NFC/QR decoding happens upstream)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerPayload {
    #[serde(default)]
    pub automation_id: Option<String>,
    /// Seed variables for the run
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// A run request from the UI or trigger layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub source: TriggerSource,
    #[serde(default)]
    pub payload: Option<TriggerPayload>,
}

impl Trigger {
    /// Manual trigger without payload
    #[must_use]
    pub fn manual() -> Self {
        Self {
            source: TriggerSource::Manual,
            payload: None,
        }
    }

    /// Trigger for a specific automation with seed variables
    #[must_use]
    pub fn for_automation(
        source: TriggerSource,
        automation_id: impl Into<String>,
        variables: Map<String, Value>,
    ) -> Self {
        Self {
            source,
            payload: Some(TriggerPayload {
                automation_id: Some(automation_id.into()),
                variables,
            }),
        }
    }

    /// Automation id named by the payload
    #[must_use]
    pub fn automation_id(&self) -> Option<&str> {
        self.payload.as_ref()?.automation_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_step_record() {
        let automation = Automation::from_json(
            r#"{
                "id": "a1",
                "name": "Morning",
                "description": "",
                "is_active": true,
                "steps": [
                    {"id": "s1", "type": "condition", "config": {"expression": "x > 5"},
                     "enabled": true,
                     "children": {"then": [{"id": "s2", "type": "notify", "config": {"message": "big"}}]}}
                ]
            }"#,
        )
        .unwrap();

        let step = &automation.steps[0];
        assert_eq!(step.step_type, "condition");
        let children = step.children.as_ref().unwrap();
        assert_eq!(children.then_steps.len(), 1);
        assert!(children.else_steps.is_empty());
        assert!(children.then_steps[0].enabled);
    }

    #[test]
    fn test_duplicate_step_id_in_nested_list() {
        let automation = Automation {
            id: "a".into(),
            name: "dup".into(),
            description: String::new(),
            is_active: true,
            steps: vec![
                Step::new("s1", "group", json!({})).with_children(StepChildren {
                    steps: vec![Step::new("s2", "log", json!({}))],
                    ..Default::default()
                }),
                Step::new("s2", "log", json!({})),
            ],
        };
        assert_eq!(automation.duplicate_step_id(), Some("s2"));
        assert!(!automation.step_ids_unique());
        assert!(automation.find_step("s2").is_some());
    }

    #[test]
    fn test_move_step_by_id() {
        let mut automation = Automation {
            id: "a".into(),
            name: "reorder".into(),
            description: String::new(),
            is_active: true,
            steps: vec![
                Step::new("a", "log", json!({})),
                Step::new("b", "log", json!({})),
                Step::new("c", "log", json!({})),
            ],
        };
        assert!(automation.move_step("c", 0));
        let ids: Vec<&str> = automation.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["c", "a", "b"]);
        assert!(!automation.move_step("missing", 1));
        assert_eq!(automation.remove_step("a").map(|s| s.id), Some("a".into()));
    }

    #[test]
    fn test_continue_on_error_aliases() {
        let step = Step::new("s", "webhook", json!({"continueOnError": true}));
        assert_eq!(step.continue_on_error(), Some(true));
        let step = Step::new("s", "webhook", json!({"continue_on_error": false}));
        assert_eq!(step.continue_on_error(), Some(false));
    }
}
