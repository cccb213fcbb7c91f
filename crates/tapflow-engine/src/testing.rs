//! Recording effect adapters for tests

use crate::effects::{
    AppLauncher, DeviceControl, DeviceKind, Effects, HttpClient, MessageKind, Messenger, Notifier,
    WebhookRequest, WebhookResponse,
};
use crate::error::EffectError;
use crate::variables::as_text;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Implements every capability and records each call as a short string
pub(crate) struct FakeEffects {
    calls: Mutex<Vec<String>>,
    http_requests: Mutex<Vec<WebhookRequest>>,
    http_response: Mutex<(u16, String)>,
    http_delay: Mutex<Option<Duration>>,
    device_failure: Mutex<Option<String>>,
}

impl Default for FakeEffects {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            http_requests: Mutex::new(Vec::new()),
            http_response: Mutex::new((200, String::new())),
            http_delay: Mutex::new(None),
            device_failure: Mutex::new(None),
        }
    }
}

impl FakeEffects {
    pub(crate) fn effects(self: &Arc<Self>) -> Effects {
        Effects::none()
            .with_notifier(self.clone())
            .with_messenger(self.clone())
            .with_http(self.clone())
            .with_device(self.clone())
            .with_launcher(self.clone())
    }

    pub(crate) fn set_http_response(&self, status: u16, body: &str) {
        *self.http_response.lock().unwrap() = (status, body.to_string());
    }

    /// Make webhook calls hang for `delay` (cancellable)
    pub(crate) fn set_http_delay(&self, delay: Duration) {
        *self.http_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn fail_device(&self, message: &str) {
        *self.device_failure.lock().unwrap() = Some(message.to_string());
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn http_requests(&self) -> Vec<WebhookRequest> {
        self.http_requests.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Notifier for FakeEffects {
    async fn send_notification(
        &self,
        message: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), EffectError> {
        self.record(format!("notify {message}"));
        Ok(())
    }
}

#[async_trait]
impl Messenger for FakeEffects {
    async fn send_message(
        &self,
        kind: MessageKind,
        target: &str,
        body: &str,
        _subject: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<(), EffectError> {
        let kind = match kind {
            MessageKind::Sms => "sms",
            MessageKind::Email => "email",
        };
        self.record(format!("{kind} {target} {body}"));
        Ok(())
    }
}

#[async_trait]
impl HttpClient for FakeEffects {
    async fn call_webhook(
        &self,
        request: WebhookRequest,
        cancel: &CancellationToken,
    ) -> Result<WebhookResponse, EffectError> {
        self.record(format!("{} {}", request.method, request.url));
        self.http_requests.lock().unwrap().push(request);
        let delay = *self.http_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::select! {
                () = cancel.cancelled() => return Err(EffectError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
        let (status, body) = self.http_response.lock().unwrap().clone();
        Ok(WebhookResponse { status, body })
    }
}

#[async_trait]
impl DeviceControl for FakeEffects {
    async fn device_action(
        &self,
        kind: DeviceKind,
        params: &Value,
        _cancel: &CancellationToken,
    ) -> Result<(), EffectError> {
        let failure = self.device_failure.lock().unwrap().clone();
        if let Some(message) = failure {
            return Err(EffectError::Failed(message));
        }
        let (name, key) = match kind {
            DeviceKind::Wifi => ("wifi", "state"),
            DeviceKind::Bluetooth => ("bluetooth", "state"),
            DeviceKind::Brightness => ("brightness", "level"),
            DeviceKind::Volume => ("volume", "level"),
        };
        let value = params.get(key).map(as_text).unwrap_or_default();
        self.record(format!("{name} {key}={value}"));
        Ok(())
    }
}

#[async_trait]
impl AppLauncher for FakeEffects {
    async fn launch_app(&self, app_id: &str, _cancel: &CancellationToken) -> Result<(), EffectError> {
        self.record(format!("launch {app_id}"));
        Ok(())
    }
}
