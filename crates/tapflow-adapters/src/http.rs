//! `reqwest`-backed webhook client

use async_trait::async_trait;
use reqwest::{Client, Method};
use std::time::Duration;
use tapflow_engine::effects::{HttpClient, WebhookRequest, WebhookResponse};
use tapflow_engine::EffectError;
use tokio_util::sync::CancellationToken;

const USER_AGENT: &str = concat!("tapflow/", env!("CARGO_PKG_VERSION"));

/// Sends webhook and `http_request` calls over a shared connection pool
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    http: Client,
}

impl ReqwestHttpClient {
    /// Build a client with the default user agent
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { http })
    }

    /// Wrap an already configured client
    #[must_use]
    pub fn with_client(http: Client) -> Self {
        Self { http }
    }
}

fn request_error(err: &reqwest::Error, timeout: Duration) -> EffectError {
    if err.is_timeout() {
        EffectError::Timeout(timeout)
    } else {
        EffectError::Failed(err.to_string())
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn call_webhook(
        &self,
        request: WebhookRequest,
        cancel: &CancellationToken,
    ) -> Result<WebhookResponse, EffectError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| EffectError::Failed(format!("invalid method {}: {e}", request.method)))?;
        let timeout = request.timeout;

        let mut builder = self
            .http
            .request(method, request.url.as_str())
            .timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        tracing::debug!("Sending {} {}", request.method, request.url);
        let call = async {
            let response = builder
                .send()
                .await
                .map_err(|e| request_error(&e, timeout))?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| request_error(&e, timeout))?;
            Ok(WebhookResponse { status, body })
        };

        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Cancelled {} {}", request.method, request.url);
                Err(EffectError::Cancelled)
            }
            result = call => result,
        }
    }
}
