//! Effect adapter capability interfaces
//!
//! The engine never talks to the network or the device directly. Hosts supply
//! implementations of these traits, bundled in [`Effects`]; a capability left
//! out makes the steps that need it fail with [`EffectError::Unavailable`].
//!
//! Every call receives the run's cancellation token. Adapters that can abort
//! mid-call should watch it and return [`EffectError::Cancelled`].

use crate::error::EffectError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Kind of outgoing message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Sms,
    Email,
}

/// Device capability targeted by a device action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Wifi,
    Bluetooth,
    Brightness,
    Volume,
}

/// Outgoing HTTP call made by `webhook` and `http_request` steps
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub url: String,
    /// Upper-case HTTP method
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
}

/// Response captured from a webhook call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_notification(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EffectError>;
}

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_message(
        &self,
        kind: MessageKind,
        target: &str,
        body: &str,
        subject: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), EffectError>;
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn call_webhook(
        &self,
        request: WebhookRequest,
        cancel: &CancellationToken,
    ) -> Result<WebhookResponse, EffectError>;
}

#[async_trait]
pub trait DeviceControl: Send + Sync {
    async fn device_action(
        &self,
        kind: DeviceKind,
        params: &Value,
        cancel: &CancellationToken,
    ) -> Result<(), EffectError>;
}

#[async_trait]
pub trait AppLauncher: Send + Sync {
    async fn launch_app(&self, app_id: &str, cancel: &CancellationToken)
        -> Result<(), EffectError>;
}

/// Bundle of capabilities injected into a run
#[derive(Clone, Default)]
pub struct Effects {
    notifier: Option<Arc<dyn Notifier>>,
    messenger: Option<Arc<dyn Messenger>>,
    http: Option<Arc<dyn HttpClient>>,
    device: Option<Arc<dyn DeviceControl>>,
    launcher: Option<Arc<dyn AppLauncher>>,
}

impl std::fmt::Debug for Effects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effects")
            .field("notifier", &self.notifier.is_some())
            .field("messenger", &self.messenger.is_some())
            .field("http", &self.http.is_some())
            .field("device", &self.device.is_some())
            .field("launcher", &self.launcher.is_some())
            .finish()
    }
}

impl Effects {
    /// No capabilities; only pure built-in steps can succeed
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn with_messenger(mut self, messenger: Arc<dyn Messenger>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    #[must_use]
    pub fn with_http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    #[must_use]
    pub fn with_device(mut self, device: Arc<dyn DeviceControl>) -> Self {
        self.device = Some(device);
        self
    }

    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn AppLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn notifier(&self) -> Result<&dyn Notifier, EffectError> {
        self.notifier
            .as_deref()
            .ok_or_else(|| EffectError::Unavailable("notification".to_string()))
    }

    pub fn messenger(&self) -> Result<&dyn Messenger, EffectError> {
        self.messenger
            .as_deref()
            .ok_or_else(|| EffectError::Unavailable("messaging".to_string()))
    }

    pub fn http(&self) -> Result<&dyn HttpClient, EffectError> {
        self.http
            .as_deref()
            .ok_or_else(|| EffectError::Unavailable("http".to_string()))
    }

    pub fn device(&self) -> Result<&dyn DeviceControl, EffectError> {
        self.device
            .as_deref()
            .ok_or_else(|| EffectError::Unavailable("device control".to_string()))
    }

    pub fn launcher(&self) -> Result<&dyn AppLauncher, EffectError> {
        self.launcher
            .as_deref()
            .ok_or_else(|| EffectError::Unavailable("app launch".to_string()))
    }
}
