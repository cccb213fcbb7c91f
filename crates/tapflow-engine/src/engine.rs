//! Core automation engine

use crate::config::EngineConfig;
use crate::effects::Effects;
use crate::error::AutomationError;
use crate::executor::{ExecutionController, RunEvent};
use crate::model::{Automation, Trigger, TriggerSource};
use crate::registry::StepRegistry;
use crate::report::RunReport;
use crate::variables::VariableStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Variable seeded with the trigger source name at the start of every run
///
/// The name is reserved: a payload variable of the same name is replaced.
pub const TRIGGER_SOURCE_VARIABLE: &str = "trigger_source";

/// The main automation engine
pub struct AutomationEngine {
    /// All registered automations
    automations: Arc<DashMap<String, Automation>>,
    /// Cancellation tokens of triggered runs still in flight
    active_runs: Arc<DashMap<String, CancellationToken>>,
    /// Step handlers available to runs
    registry: Arc<StepRegistry>,
    /// Side-effect capabilities handed to handlers
    effects: Effects,
    config: EngineConfig,
    /// Event broadcaster
    event_tx: broadcast::Sender<RunEvent>,
}

/// Removes an active run entry when the run ends or its future is dropped
struct ActiveRun {
    runs: Arc<DashMap<String, CancellationToken>>,
    automation_id: String,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.runs.remove(&self.automation_id);
    }
}

impl AutomationEngine {
    /// Create an engine with the built-in step handlers
    #[must_use]
    pub fn new(effects: Effects, config: EngineConfig) -> Self {
        Self::with_registry(Arc::new(StepRegistry::with_builtins()), effects, config)
    }

    /// Create an engine with a caller-supplied registry
    #[must_use]
    pub fn with_registry(
        registry: Arc<StepRegistry>,
        effects: Effects,
        config: EngineConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            automations: Arc::new(DashMap::new()),
            active_runs: Arc::new(DashMap::new()),
            registry,
            effects,
            config,
            event_tx,
        }
    }

    /// Step registry, for registering extra handlers
    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to run progress events
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.event_tx.subscribe()
    }

    /// Register or replace an automation, returning the previous definition
    pub fn register(&self, automation: Automation) -> Result<Option<Automation>, AutomationError> {
        if let Some(duplicate) = automation.duplicate_step_id() {
            return Err(AutomationError::Invalid(format!(
                "duplicate step id `{duplicate}` in automation {}",
                automation.id
            )));
        }
        tracing::info!(
            "Registered automation: {} ({}, {} steps)",
            automation.name,
            automation.id,
            automation.steps.len()
        );
        Ok(self.automations.insert(automation.id.clone(), automation))
    }

    /// Parse an automation record and register it
    pub fn register_json(&self, json: &str) -> Result<Automation, AutomationError> {
        let automation = Automation::from_json(json)?;
        self.register(automation.clone())?;
        Ok(automation)
    }

    /// Get all automations
    pub fn list(&self) -> Vec<Automation> {
        self.automations.iter().map(|r| r.value().clone()).collect()
    }

    /// Get automation by ID
    pub fn get(&self, id: &str) -> Option<Automation> {
        self.automations.get(id).map(|r| r.value().clone())
    }

    /// Remove an automation, cancelling its run if one is in flight
    pub fn remove(&self, id: &str) -> Result<Automation, AutomationError> {
        let (_, automation) = self
            .automations
            .remove(id)
            .ok_or_else(|| AutomationError::NotFound(id.to_string()))?;
        self.cancel(id);
        tracing::info!("Removed automation: {} ({})", automation.name, id);
        Ok(automation)
    }

    /// Flip the `is_active` flag
    pub fn set_active(&self, id: &str, active: bool) -> Result<Automation, AutomationError> {
        let mut automation = self
            .automations
            .get_mut(id)
            .ok_or_else(|| AutomationError::NotFound(id.to_string()))?;
        automation.is_active = active;
        tracing::info!("Automation {} is now {}", id, if active { "active" } else { "inactive" });
        Ok(automation.clone())
    }

    /// Whether a triggered run of the automation is in flight
    pub fn is_running(&self, id: &str) -> bool {
        self.active_runs.contains_key(id)
    }

    /// Cancel the in-flight run of an automation
    ///
    /// Returns `false` when nothing was running. Cancelling twice is harmless.
    pub fn cancel(&self, id: &str) -> bool {
        match self.active_runs.get(id) {
            Some(token) => {
                tracing::info!("Cancelling run of automation {}", id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight run
    pub fn cancel_all(&self) {
        for entry in self.active_runs.iter() {
            entry.value().cancel();
        }
    }

    /// Run an automation with a caller-owned cancellation token
    ///
    /// The automation does not need to be registered and the run is not
    /// tracked, so [`cancel`](Self::cancel) does not reach it. Payload
    /// variables seed the run, except [`TRIGGER_SOURCE_VARIABLE`] which always
    /// holds the trigger source.
    pub async fn run_automation(
        &self,
        automation: &Automation,
        trigger: &Trigger,
        cancel: CancellationToken,
    ) -> RunReport {
        let mut variables = VariableStore::from_map(
            trigger
                .payload
                .as_ref()
                .map(|p| p.variables.clone())
                .unwrap_or_default(),
        );
        if variables.get(TRIGGER_SOURCE_VARIABLE).is_some() {
            tracing::warn!(
                "Payload for {} sets reserved variable {}, replacing it",
                automation.id,
                TRIGGER_SOURCE_VARIABLE
            );
        }
        variables.set(TRIGGER_SOURCE_VARIABLE, trigger.source.as_str());

        ExecutionController::new(Arc::clone(&self.registry), self.effects.clone(), self.config.clone())
            .with_source(trigger.source)
            .with_events(self.event_tx.clone())
            .start(automation, variables, cancel)
            .await
    }

    /// Resolve a trigger payload to a registered automation and run it
    ///
    /// Only manual triggers may run inactive automations. A second trigger
    /// for an automation that is still running is refused.
    pub async fn handle_trigger(&self, trigger: Trigger) -> Result<RunReport, AutomationError> {
        let id = trigger
            .automation_id()
            .ok_or(AutomationError::MissingAutomationId)?
            .to_string();
        let automation = self
            .get(&id)
            .ok_or_else(|| AutomationError::NotFound(id.clone()))?;

        if !automation.is_active && trigger.source != TriggerSource::Manual {
            tracing::debug!(
                "Ignoring {} trigger for inactive automation '{}'",
                trigger.source.as_str(),
                automation.name
            );
            return Err(AutomationError::Inactive(id));
        }

        let cancel = CancellationToken::new();
        let _active = match self.active_runs.entry(id.clone()) {
            Entry::Occupied(_) => return Err(AutomationError::AlreadyRunning(id)),
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
                ActiveRun {
                    runs: Arc::clone(&self.active_runs),
                    automation_id: id,
                }
            }
        };

        Ok(self.run_automation(&automation, &trigger, cancel).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Step;
    use crate::report::{RunStatus, StepStatus};
    use crate::testing::FakeEffects;
    use serde_json::{json, Map, Value};

    fn engine() -> (AutomationEngine, Arc<FakeEffects>) {
        let fake = Arc::new(FakeEffects::default());
        let engine = AutomationEngine::new(fake.effects(), EngineConfig::default());
        (engine, fake)
    }

    fn automation(id: &str, active: bool, steps: Vec<Step>) -> Automation {
        Automation {
            id: id.into(),
            name: format!("Automation {id}"),
            description: String::new(),
            is_active: active,
            steps,
        }
    }

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_register_rejects_duplicate_ids() {
        let (engine, _) = engine();
        let log = Step::new("a", "log", json!({"message": "x"}));
        let result = engine.register(automation("dup", true, vec![log.clone(), log]));
        assert!(matches!(result, Err(AutomationError::Invalid(_))));
        assert!(engine.list().is_empty());
    }

    #[test]
    fn test_register_json_and_manage() {
        let (engine, _) = engine();
        let automation = engine
            .register_json(
                r#"{"id": "a1", "name": "Tap", "is_active": true,
                    "steps": [{"id": "s1", "type": "log", "config": {"message": "hi"}}]}"#,
            )
            .unwrap();
        assert_eq!(automation.steps.len(), 1);
        assert_eq!(engine.get("a1").unwrap().name, "Tap");

        assert!(!engine.set_active("a1", false).unwrap().is_active);
        assert!(!engine.get("a1").unwrap().is_active);

        assert_eq!(engine.remove("a1").unwrap().id, "a1");
        assert!(matches!(engine.remove("a1"), Err(AutomationError::NotFound(_))));
        assert!(matches!(
            engine.register_json("{not json"),
            Err(AutomationError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_trigger_seeds_variables() {
        let (engine, fake) = engine();
        engine
            .register(automation(
                "door",
                true,
                vec![Step::new("n", "notify", json!({"message": "{{trigger_source}} {{tag}}"}))],
            ))
            .unwrap();

        let report = engine
            .handle_trigger(Trigger::for_automation(
                TriggerSource::Nfc,
                "door",
                vars(json!({"tag": "kitchen"})),
            ))
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.trigger, TriggerSource::Nfc);
        assert_eq!(fake.calls(), ["notify nfc kitchen"]);
        assert!(!engine.is_running("door"));
    }

    #[tokio::test]
    async fn test_payload_cannot_override_trigger_source() {
        let (engine, fake) = engine();
        engine
            .register(automation(
                "door",
                true,
                vec![Step::new("n", "notify", json!({"message": "{{trigger_source}}"}))],
            ))
            .unwrap();

        let report = engine
            .handle_trigger(Trigger::for_automation(
                TriggerSource::Qr,
                "door",
                vars(json!({"trigger_source": "manual"})),
            ))
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(fake.calls(), ["notify qr"]);
    }

    #[tokio::test]
    async fn test_trigger_resolution_errors() {
        let (engine, _) = engine();
        engine.register(automation("off", false, vec![])).unwrap();

        assert!(matches!(
            engine.handle_trigger(Trigger::manual()).await,
            Err(AutomationError::MissingAutomationId)
        ));
        assert!(matches!(
            engine
                .handle_trigger(Trigger::for_automation(TriggerSource::Qr, "ghost", Map::new()))
                .await,
            Err(AutomationError::NotFound(_))
        ));
        assert!(matches!(
            engine
                .handle_trigger(Trigger::for_automation(TriggerSource::Scheduled, "off", Map::new()))
                .await,
            Err(AutomationError::Inactive(_))
        ));

        let report = engine
            .handle_trigger(Trigger::for_automation(TriggerSource::Manual, "off", Map::new()))
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_second_trigger_refused_and_cancel() {
        let (engine, _) = engine();
        let engine = Arc::new(engine);
        engine
            .register(automation(
                "slow",
                true,
                vec![
                    Step::new("wait", "delay", json!({"seconds": 60})),
                    Step::new("after", "log", json!({"message": "done"})),
                ],
            ))
            .unwrap();
        let mut events = engine.subscribe();

        let runner = Arc::clone(&engine);
        let handle = tokio::spawn(async move {
            runner
                .handle_trigger(Trigger::for_automation(TriggerSource::Qr, "slow", Map::new()))
                .await
        });

        loop {
            if let RunEvent::StepStarted { step_id, .. } = events.recv().await.unwrap() {
                if step_id == "wait" {
                    break;
                }
            }
        }
        assert!(engine.is_running("slow"));
        assert!(matches!(
            engine
                .handle_trigger(Trigger::for_automation(TriggerSource::Nfc, "slow", Map::new()))
                .await,
            Err(AutomationError::AlreadyRunning(_))
        ));

        assert!(engine.cancel("slow"));
        assert!(engine.cancel("slow"));
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].status, StepStatus::Cancelled);

        assert!(!engine.is_running("slow"));
        assert!(!engine.cancel("slow"));
    }

    #[tokio::test]
    async fn test_run_automation_with_external_token() {
        let (engine, _) = engine();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = engine
            .run_automation(
                &automation("adhoc", false, vec![Step::new("a", "log", json!({"message": "x"}))]),
                &Trigger::manual(),
                cancel,
            )
            .await;
        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(report.steps.is_empty());
    }
}
