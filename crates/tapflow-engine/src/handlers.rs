//! Built-in step handlers
//!
//! Pure handlers (`variable`, `get_variable`, `math`, `text`, `delay`, `log`)
//! touch only the variable store. The rest forward to an effect adapter.

use crate::effects::{DeviceKind, MessageKind, WebhookRequest};
use crate::error::{EffectError, StepError};
use crate::registry::{FailurePolicy, StepContext, StepHandler, StepRegistry};
use crate::variables::{as_number, as_text, number_value};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

/// Install every built-in handler into a registry
pub fn register_builtins(registry: &StepRegistry) {
    registry.register("variable", SetVariable);
    registry.register("get_variable", GetVariable);
    registry.register("math", Math);
    registry.register("text", Text);
    registry.register("delay", Delay);
    registry.register("log", Log);
    registry.register("notification", Notify);
    registry.register("notify", Notify);
    registry.register("sms", SendMessage(MessageKind::Sms));
    registry.register("email", SendMessage(MessageKind::Email));
    registry.register("webhook", Webhook { default_method: "POST" });
    registry.register("http_request", Webhook { default_method: "GET" });
    registry.register("wifi", Device(DeviceKind::Wifi));
    registry.register("bluetooth", Device(DeviceKind::Bluetooth));
    registry.register("brightness", Device(DeviceKind::Brightness));
    registry.register("volume", Device(DeviceKind::Volume));
    registry.register("launch_app", LaunchApp);
}

fn field<'a>(config: &'a Map<String, Value>, key: &str) -> Result<&'a Value, StepError> {
    config
        .get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| StepError::Validation(format!("missing `{key}`")))
}

fn str_field<'a>(config: &'a Map<String, Value>, key: &str) -> Result<&'a str, StepError> {
    field(config, key)?
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| StepError::Validation(format!("`{key}` must be a non-empty string")))
}

/// First present key among aliases, as text
fn text_field(config: &Map<String, Value>, keys: &[&str]) -> Result<String, StepError> {
    keys.iter()
        .find_map(|key| config.get(*key).filter(|v| !v.is_null()))
        .map(as_text)
        .ok_or_else(|| StepError::Validation(format!("missing `{}`", keys[0])))
}

/// Run an adapter call under a timeout
async fn within<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, EffectError>>,
) -> Result<T, StepError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(StepError::from),
        Err(_) => Err(EffectError::Timeout(timeout).into()),
    }
}

/// Per-step `timeout_secs` override, else the engine default
fn network_timeout(config: &Map<String, Value>, ctx: &StepContext<'_>) -> Result<Duration, StepError> {
    match config.get("timeout_secs") {
        None | Some(Value::Null) => Ok(ctx.config.network_timeout()),
        Some(value) => {
            let secs = as_number(value)?;
            Duration::try_from_secs_f64(secs)
                .ok()
                .filter(|d| !d.is_zero())
                .ok_or_else(|| StepError::Validation(format!("invalid timeout_secs {secs}")))
        }
    }
}

/// `variable`: write to the store
struct SetVariable;

#[async_trait]
impl StepHandler for SetVariable {
    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Continue
    }

    fn validate(&self, config: &Map<String, Value>) -> Result<(), StepError> {
        str_field(config, "name")?;
        match config.get("operation").and_then(Value::as_str).unwrap_or("set") {
            "set" | "increment" | "decrement" | "delete" => Ok(()),
            other => Err(StepError::Validation(format!(
                "unknown variable operation `{other}`"
            ))),
        }
    }

    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<Value>, StepError> {
        let name = str_field(config, "name")?;
        let operation = config.get("operation").and_then(Value::as_str).unwrap_or("set");
        let value = match operation {
            "increment" | "decrement" => {
                let current = ctx.variables.get(name).map_or(Ok(0.0), as_number)?;
                let amount = config.get("amount").map_or(Ok(1.0), as_number)?;
                let next = if operation == "increment" {
                    current + amount
                } else {
                    current - amount
                };
                number_value(next)
            }
            "delete" => {
                return Ok(Some(ctx.variables.remove(name).unwrap_or(Value::Null)));
            }
            _ => config.get("value").cloned().unwrap_or(Value::Null),
        };
        tracing::debug!("Set variable '{}' = {}", name, value);
        ctx.variables.set(name, value.clone());
        Ok(Some(value))
    }
}

/// `get_variable`: read from the store, with an optional default
struct GetVariable;

#[async_trait]
impl StepHandler for GetVariable {
    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Continue
    }

    fn validate(&self, config: &Map<String, Value>) -> Result<(), StepError> {
        str_field(config, "name").map(|_| ())
    }

    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<Value>, StepError> {
        let name = str_field(config, "name")?;
        match ctx.variables.lookup(name) {
            Some(value) => Ok(Some(value.clone())),
            None => config
                .get("default")
                .cloned()
                .map(Some)
                .ok_or_else(|| StepError::UndefinedVariable(name.to_string())),
        }
    }
}

/// `math`: numeric transforms over operands
struct Math;

impl Math {
    fn arity(operation: &str) -> Option<(usize, Option<usize>)> {
        match operation {
            "add" | "subtract" | "multiply" | "divide" | "modulo" => Some((2, None)),
            "power" => Some((2, Some(2))),
            "min" | "max" => Some((1, None)),
            "abs" | "round" | "floor" | "ceil" | "negate" => Some((1, Some(1))),
            _ => None,
        }
    }

    fn operands(config: &Map<String, Value>) -> Result<&Vec<Value>, StepError> {
        field(config, "operands")?
            .as_array()
            .ok_or_else(|| StepError::Validation("`operands` must be an array".into()))
    }
}

#[async_trait]
impl StepHandler for Math {
    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Continue
    }

    fn validate(&self, config: &Map<String, Value>) -> Result<(), StepError> {
        let operation = str_field(config, "operation")?;
        let (min, max) = Self::arity(operation)
            .ok_or_else(|| StepError::Validation(format!("unknown math operation `{operation}`")))?;
        let count = Self::operands(config)?.len();
        if count < min || max.is_some_and(|max| count > max) {
            return Err(StepError::Validation(format!(
                "`{operation}` got {count} operands"
            )));
        }
        Ok(())
    }

    async fn execute(
        &self,
        config: &Map<String, Value>,
        _ctx: &mut StepContext<'_>,
    ) -> Result<Option<Value>, StepError> {
        let operation = str_field(config, "operation")?;
        let numbers = Self::operands(config)?
            .iter()
            .map(as_number)
            .collect::<Result<Vec<f64>, _>>()?;
        let (first, rest) = numbers
            .split_first()
            .ok_or_else(|| StepError::Validation("no operands".into()))?;

        let fold = |f: fn(f64, f64) -> f64| rest.iter().fold(*first, |acc, n| f(acc, *n));
        let result = match operation {
            "add" => fold(|a, b| a + b),
            "subtract" => fold(|a, b| a - b),
            "multiply" => fold(|a, b| a * b),
            "divide" | "modulo" => {
                if rest.iter().any(|n| *n == 0.0) {
                    return Err(StepError::TypeMismatch {
                        expected: "non-zero divisor",
                        found: "number 0".into(),
                    });
                }
                if operation == "divide" {
                    fold(|a, b| a / b)
                } else {
                    fold(|a, b| a % b)
                }
            }
            "power" => fold(f64::powf),
            "min" => fold(f64::min),
            "max" => fold(f64::max),
            "abs" => first.abs(),
            "round" => first.round(),
            "floor" => first.floor(),
            "ceil" => first.ceil(),
            "negate" => -first,
            other => {
                return Err(StepError::Validation(format!(
                    "unknown math operation `{other}`"
                )))
            }
        };
        if !result.is_finite() {
            return Err(StepError::TypeMismatch {
                expected: "finite number",
                found: result.to_string(),
            });
        }
        Ok(Some(number_value(result)))
    }
}

/// `text`: string transforms
struct Text;

#[async_trait]
impl StepHandler for Text {
    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Continue
    }

    fn validate(&self, config: &Map<String, Value>) -> Result<(), StepError> {
        match str_field(config, "operation")? {
            "concat" => field(config, "parts")?
                .as_array()
                .map(|_| ())
                .ok_or_else(|| StepError::Validation("`parts` must be an array".into())),
            "uppercase" | "lowercase" | "trim" | "length" => field(config, "input").map(|_| ()),
            "replace" => {
                field(config, "input")?;
                str_field(config, "from").map(|_| ())
            }
            "contains" => {
                field(config, "input")?;
                field(config, "pattern").map(|_| ())
            }
            "split" => {
                field(config, "input")?;
                field(config, "separator").map(|_| ())
            }
            other => Err(StepError::Validation(format!(
                "unknown text operation `{other}`"
            ))),
        }
    }

    async fn execute(
        &self,
        config: &Map<String, Value>,
        _ctx: &mut StepContext<'_>,
    ) -> Result<Option<Value>, StepError> {
        let operation = str_field(config, "operation")?;
        if operation == "concat" {
            let parts = field(config, "parts")?
                .as_array()
                .ok_or_else(|| StepError::Validation("`parts` must be an array".into()))?;
            let separator = config.get("separator").map(as_text).unwrap_or_default();
            let joined = parts.iter().map(as_text).collect::<Vec<_>>().join(&separator);
            return Ok(Some(Value::String(joined)));
        }

        let input = as_text(field(config, "input")?);
        let result = match operation {
            "uppercase" => Value::String(input.to_uppercase()),
            "lowercase" => Value::String(input.to_lowercase()),
            "trim" => Value::String(input.trim().to_string()),
            "length" => json!(input.chars().count()),
            "replace" => {
                let from = str_field(config, "from")?;
                let to = config.get("to").map(as_text).unwrap_or_default();
                Value::String(input.replace(from, &to))
            }
            "contains" => Value::Bool(input.contains(&as_text(field(config, "pattern")?))),
            "split" => {
                let separator = as_text(field(config, "separator")?);
                if separator.is_empty() {
                    return Err(StepError::Validation("`separator` must not be empty".into()));
                }
                Value::Array(
                    input
                        .split(separator.as_str())
                        .map(|part| Value::String(part.to_string()))
                        .collect(),
                )
            }
            other => {
                return Err(StepError::Validation(format!(
                    "unknown text operation `{other}`"
                )))
            }
        };
        Ok(Some(result))
    }
}

/// `delay`: cancellable wait
struct Delay;

impl Delay {
    fn duration(config: &Map<String, Value>) -> Result<Duration, StepError> {
        let units: [(&str, f64); 3] = [("milliseconds", 0.001), ("seconds", 1.0), ("minutes", 60.0)];
        let mut found = units
            .iter()
            .filter_map(|(key, scale)| config.get(*key).map(|v| (v, *scale)));
        let (value, scale) = found.next().ok_or_else(|| {
            StepError::Validation("delay needs one of `seconds`, `milliseconds`, `minutes`".into())
        })?;
        if found.next().is_some() {
            return Err(StepError::Validation("delay takes exactly one duration field".into()));
        }
        let secs = as_number(value)? * scale;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| StepError::Validation(format!("invalid delay of {secs} seconds")))
    }
}

#[async_trait]
impl StepHandler for Delay {
    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Continue
    }

    fn validate(&self, config: &Map<String, Value>) -> Result<(), StepError> {
        Self::duration(config).map(|_| ())
    }

    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<Value>, StepError> {
        let duration = Self::duration(config)?;
        tracing::debug!("Delaying for {:?}", duration);
        tokio::select! {
            () = ctx.cancel.cancelled() => Err(StepError::Cancelled),
            () = tokio::time::sleep(duration) => Ok(None),
        }
    }
}

/// `log`: write a message through tracing
struct Log;

#[async_trait]
impl StepHandler for Log {
    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Continue
    }

    fn validate(&self, config: &Map<String, Value>) -> Result<(), StepError> {
        field(config, "message")?;
        match config.get("level").and_then(Value::as_str).unwrap_or("info") {
            "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(StepError::Validation(format!("unknown log level `{other}`"))),
        }
    }

    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<Value>, StepError> {
        let message = as_text(field(config, "message")?);
        let step = ctx.step_id;
        match config.get("level").and_then(Value::as_str).unwrap_or("info") {
            "debug" => tracing::debug!(target: "automation", step, "{}", message),
            "warn" => tracing::warn!(target: "automation", step, "{}", message),
            "error" => tracing::error!(target: "automation", step, "{}", message),
            _ => tracing::info!(target: "automation", step, "{}", message),
        }
        Ok(Some(Value::String(message)))
    }
}

/// `notification` / `notify`
struct Notify;

#[async_trait]
impl StepHandler for Notify {
    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Continue
    }

    fn validate(&self, config: &Map<String, Value>) -> Result<(), StepError> {
        text_field(config, &["message", "body"]).map(|_| ())
    }

    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<Value>, StepError> {
        let message = text_field(config, &["message", "body"])?;
        ctx.effects
            .notifier()?
            .send_notification(&message, ctx.cancel)
            .await?;
        Ok(Some(Value::String(message)))
    }
}

/// `sms` / `email`
struct SendMessage(MessageKind);

#[async_trait]
impl StepHandler for SendMessage {
    fn validate(&self, config: &Map<String, Value>) -> Result<(), StepError> {
        text_field(config, &["to", "target"])?;
        text_field(config, &["message", "body"]).map(|_| ())
    }

    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<Value>, StepError> {
        let target = text_field(config, &["to", "target"])?;
        let body = text_field(config, &["message", "body"])?;
        let subject = config.get("subject").map(as_text);
        let timeout = network_timeout(config, ctx)?;
        let messenger = ctx.effects.messenger()?;
        within(
            timeout,
            messenger.send_message(self.0, &target, &body, subject.as_deref(), ctx.cancel),
        )
        .await?;
        Ok(None)
    }
}

/// `webhook` / `http_request`
struct Webhook {
    default_method: &'static str,
}

const HTTP_METHODS: [&str; 6] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];

impl Webhook {
    fn request(
        &self,
        config: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<WebhookRequest, StepError> {
        let url = str_field(config, "url")?;
        let parsed = url::Url::parse(url)
            .map_err(|e| StepError::Validation(format!("invalid url {url:?}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(StepError::Validation(format!(
                "unsupported url scheme `{}`",
                parsed.scheme()
            )));
        }

        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or(self.default_method)
            .to_ascii_uppercase();
        if !HTTP_METHODS.contains(&method.as_str()) {
            return Err(StepError::Validation(format!("unsupported method `{method}`")));
        }

        let mut headers = BTreeMap::new();
        match config.get("headers") {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => {
                for (name, value) in map {
                    headers.insert(name.clone(), as_text(value));
                }
            }
            Some(_) => return Err(StepError::Validation("`headers` must be an object".into())),
        }

        let body = match config.get("body") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(structured) => {
                if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                    headers.insert("Content-Type".to_string(), "application/json".to_string());
                }
                Some(structured.to_string())
            }
        };

        Ok(WebhookRequest {
            url: url.to_string(),
            method,
            headers,
            body,
            timeout,
        })
    }
}

#[async_trait]
impl StepHandler for Webhook {
    fn validate(&self, config: &Map<String, Value>) -> Result<(), StepError> {
        self.request(config, Duration::from_secs(1)).map(|_| ())
    }

    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<Value>, StepError> {
        let timeout = network_timeout(config, ctx)?;
        let request = self.request(config, timeout)?;
        tracing::debug!("{} {}", request.method, request.url);

        let http = ctx.effects.http()?;
        let response = within(timeout, http.call_webhook(request, ctx.cancel)).await?;
        if response.status >= 400 {
            return Err(EffectError::Failed(format!("HTTP status {}", response.status)).into());
        }

        let body = serde_json::from_str::<Value>(&response.body)
            .unwrap_or_else(|_| Value::String(response.body.clone()));
        Ok(Some(json!({ "status": response.status, "body": body })))
    }
}

/// `wifi`, `bluetooth`, `brightness`, `volume`
struct Device(DeviceKind);

#[async_trait]
impl StepHandler for Device {
    fn validate(&self, config: &Map<String, Value>) -> Result<(), StepError> {
        match self.0 {
            DeviceKind::Wifi | DeviceKind::Bluetooth => match field(config, "state")? {
                Value::Bool(_) => Ok(()),
                Value::String(s) if matches!(s.as_str(), "on" | "off" | "toggle") => Ok(()),
                other => Err(StepError::Validation(format!(
                    "`state` must be on, off or toggle, got {other}"
                ))),
            },
            DeviceKind::Brightness | DeviceKind::Volume => {
                let level = as_number(field(config, "level")?)?;
                if (0.0..=100.0).contains(&level) {
                    Ok(())
                } else {
                    Err(StepError::Validation(format!(
                        "`level` must be between 0 and 100, got {level}"
                    )))
                }
            }
        }
    }

    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<Value>, StepError> {
        let params = Value::Object(config.clone());
        ctx.effects
            .device()?
            .device_action(self.0, &params, ctx.cancel)
            .await?;
        Ok(None)
    }
}

/// `launch_app`
struct LaunchApp;

#[async_trait]
impl StepHandler for LaunchApp {
    fn validate(&self, config: &Map<String, Value>) -> Result<(), StepError> {
        str_field(config, "app_id").map(|_| ())
    }

    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<Value>, StepError> {
        let app_id = str_field(config, "app_id")?;
        ctx.effects.launcher()?.launch_app(app_id, ctx.cancel).await?;
        Ok(None)
    }
}
