//! Reference effect adapters for the Tapflow automation engine
//!
//! Hosts combine these with their own device and messaging adapters:
//!
//! ```no_run
//! use std::sync::Arc;
//! use tapflow_adapters::{ReqwestHttpClient, TracingNotifier};
//! use tapflow_engine::{AutomationEngine, EngineConfig, Effects};
//!
//! # fn main() -> Result<(), reqwest::Error> {
//! let effects = Effects::none()
//!     .with_http(Arc::new(ReqwestHttpClient::new()?))
//!     .with_notifier(Arc::new(TracingNotifier));
//! let _engine = AutomationEngine::new(effects, EngineConfig::from_env());
//! # Ok(())
//! # }
//! ```

pub mod http;
pub mod notify;

pub use http::ReqwestHttpClient;
pub use notify::TracingNotifier;
