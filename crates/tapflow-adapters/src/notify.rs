//! Notifier that writes notifications to the tracing pipeline

use async_trait::async_trait;
use tapflow_engine::effects::Notifier;
use tapflow_engine::EffectError;
use tokio_util::sync::CancellationToken;

/// Emits each notification as an `info` event on the `notification` target
///
/// Useful for headless hosts and for development before a real push
/// channel is wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send_notification(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EffectError> {
        if cancel.is_cancelled() {
            return Err(EffectError::Cancelled);
        }
        tracing::info!(target: "notification", "{}", message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tapflow_engine::{
        Automation, AutomationEngine, Effects, EngineConfig, RunStatus, Step, Trigger,
    };

    #[tokio::test]
    async fn test_send_and_cancelled() {
        let notifier = TracingNotifier;
        let cancel = CancellationToken::new();
        assert_eq!(notifier.send_notification("hello", &cancel).await, Ok(()));
        cancel.cancel();
        assert_eq!(
            notifier.send_notification("hello", &cancel).await,
            Err(EffectError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_notify_step_uses_notifier() {
        let engine = AutomationEngine::new(
            Effects::none().with_notifier(Arc::new(TracingNotifier)),
            EngineConfig::default(),
        );
        let automation = Automation {
            id: "n".into(),
            name: "Notify".into(),
            description: String::new(),
            is_active: true,
            steps: vec![
                Step::new("a", "notification", json!({"message": "door opened"})),
                Step::new("b", "sms", json!({"to": "+100", "message": "door opened"})),
            ],
        };
        let report = engine
            .run_automation(&automation, &Trigger::manual(), CancellationToken::new())
            .await;

        assert_eq!(report.step("a").unwrap().output, Some(json!("door opened")));
        // No messenger configured
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(
            report.error.as_ref().unwrap().kind,
            "EffectAdapterError"
        );
    }
}
