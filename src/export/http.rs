//! HTTP telemetry backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;
use url::Url;

use super::backend::{EventExport, RunExport, RunPatchExport, TelemetryBackend};
use crate::config::ExporterConfig;
use crate::error::ExportError;

const PUBLIC_KEY_HEADER: &str = "x-public-key";
const SECRET_KEY_HEADER: &str = "x-secret-key";

/// Sends export payloads as JSON to a remote telemetry API.
///
/// - `POST {base}/history` for new run records
/// - `POST {base}/history-events` for timeline events
/// - `PATCH {base}/history/{run_id}` for record patches
#[derive(Debug, Clone)]
pub struct HttpTelemetryBackend {
    client: reqwest::Client,
    base_url: Url,
    public_key: Option<String>,
    secret_key: Option<String>,
}

impl HttpTelemetryBackend {
    pub fn new(base_url: &str, config: &ExporterConfig) -> Result<Self, ExportError> {
        // Url::join drops the last path segment unless it ends with '/'.
        let mut base = base_url.trim_end_matches('/').to_string();
        base.push('/');

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: Url::parse(&base)?,
            public_key: config.public_key.clone(),
            secret_key: config.secret_key.clone(),
        })
    }

    async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<(), ExportError> {
        let url = self.base_url.join(path)?;
        let mut request = self.client.request(method, url.clone()).json(body);
        if let Some(key) = &self.public_key {
            request = request.header(PUBLIC_KEY_HEADER, key);
        }
        if let Some(key) = &self.secret_key {
            request = request.header(SECRET_KEY_HEADER, key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::debug!(url = %url, status = status.as_u16(), "Telemetry backend rejected payload");
            return Err(ExportError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetryBackend for HttpTelemetryBackend {
    async fn export_run(&self, payload: &RunExport) -> Result<(), ExportError> {
        self.send(Method::POST, "history", payload).await
    }

    async fn export_event(&self, payload: &EventExport) -> Result<(), ExportError> {
        self.send(Method::POST, "history-events", payload).await
    }

    async fn export_run_patch(&self, payload: &RunPatchExport) -> Result<(), ExportError> {
        self.send(
            Method::PATCH,
            &format!("history/{}", payload.run_id),
            &payload.patch,
        )
        .await
    }
}
