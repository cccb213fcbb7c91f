//! Engine configuration

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Hard ceiling on loop iterations unless configured otherwise
pub const DEFAULT_MAX_LOOP_ITERATIONS: u32 = 1000;

/// Timeout applied to network-bound steps, matching the app's API convention
pub const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 15;

/// Tunables shared by every run an engine starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Safety cap for `loop` steps; per-step bounds may only lower it
    pub max_loop_iterations: u32,
    /// Default timeout for `sms`, `email`, `webhook` and `http_request` steps
    pub network_timeout_secs: u64,
    /// Seed for `random` branch selection; `None` draws from OS entropy
    pub random_seed: Option<u64>,
    /// Capacity of the progress event channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: DEFAULT_MAX_LOOP_ITERATIONS,
            network_timeout_secs: DEFAULT_NETWORK_TIMEOUT_SECS,
            random_seed: None,
            event_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// Build a config from `TAPFLOW_*` environment variables
    ///
    /// Unset variables keep their defaults; unparsable ones are logged and
    /// ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_loop_iterations: env_or("TAPFLOW_MAX_LOOP_ITERATIONS", defaults.max_loop_iterations),
            network_timeout_secs: env_or(
                "TAPFLOW_NETWORK_TIMEOUT_SECS",
                defaults.network_timeout_secs,
            ),
            random_seed: std::env::var("TAPFLOW_RANDOM_SEED")
                .ok()
                .and_then(|raw| parse_logged("TAPFLOW_RANDOM_SEED", &raw)),
            event_capacity: defaults.event_capacity,
        }
    }

    #[must_use]
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| parse_logged(key, &raw))
        .unwrap_or(default)
}

fn parse_logged<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value {:?} for {}", raw, key);
            None
        }
    }
}
