// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! [`LogSink`] backed by the CloudWatch Logs JSON 1.1 API.
//!
//! Every operation is a `POST /` with an `X-Amz-Target` header naming the
//! action. Requests are signed with SigV4 when credentials are configured
//! and sent unsigned otherwise, which is what local emulators and signing
//! proxies expect.

use async_trait::async_trait;
use core::time::Duration;
use serde_json::json;
use std::error::Error;
use tracing::{debug, error};

use crate::config::{Credentials, TransportConfig};
use crate::error::{ConfigError, SinkError};
use crate::record::LogRecord;
use crate::signing::{self, SignableRequest};
use crate::sink::LogSink;

const TARGET_PREFIX: &str = "Logs_20140328";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const SERVICE: &str = "logs";
const FALLBACK_REGION: &str = "us-east-1";

pub struct CloudWatchClient {
    client: reqwest::Client,
    endpoint: String,
    host: String,
    region: String,
    credentials: Option<Credentials>,
}

impl CloudWatchClient {
    pub fn from_config(config: &TransportConfig) -> Result<Self, ConfigError> {
        let endpoint = match (&config.endpoint, &config.aws_region) {
            (Some(endpoint), _) => endpoint.trim_end_matches('/').to_string(),
            (None, Some(region)) => format!("https://logs.{region}.amazonaws.com"),
            (None, None) => return Err(ConfigError::Missing("AWS_REGION")),
        };

        let url = reqwest::Url::parse(&endpoint).map_err(|e| ConfigError::Invalid {
            name: "CW_ENDPOINT",
            reason: format!("'{endpoint}' is not a valid URL: {e}"),
        })?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ConfigError::Invalid {
                    name: "CW_ENDPOINT",
                    reason: format!("'{endpoint}' has no host"),
                })
            }
        };

        Ok(Self {
            client: get_client(config),
            endpoint,
            host,
            region: config
                .aws_region
                .clone()
                .unwrap_or_else(|| FALLBACK_REGION.to_string()),
            credentials: config.credentials.clone(),
        })
    }

    async fn call(&self, operation: &str, body: &serde_json::Value) -> Result<(), SinkError> {
        let payload = serde_json::to_vec(body).map_err(|e| SinkError::Payload(e.to_string()))?;
        let target = format!("{TARGET_PREFIX}.{operation}");

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-target", &target);

        if let Some(credentials) = &self.credentials {
            let signable = SignableRequest {
                host: &self.host,
                content_type: CONTENT_TYPE,
                target: &target,
                body: &payload,
            };
            let headers = signing::sign(
                &signable,
                credentials,
                &self.region,
                SERVICE,
                chrono::Utc::now(),
            );
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }

        let response = request
            .body(payload)
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!("SINK | {operation} succeeded with status {status}");
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        Err(classify_error(status, &text))
    }
}

#[async_trait]
impl LogSink for CloudWatchClient {
    async fn create_log_group(&self, group: &str) -> Result<(), SinkError> {
        self.call("CreateLogGroup", &json!({ "logGroupName": group }))
            .await
    }

    async fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), SinkError> {
        self.call(
            "CreateLogStream",
            &json!({ "logGroupName": group, "logStreamName": stream }),
        )
        .await
    }

    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        events: &[LogRecord],
    ) -> Result<(), SinkError> {
        self.call(
            "PutLogEvents",
            &json!({
                "logGroupName": group,
                "logStreamName": stream,
                "logEvents": events,
            }),
        )
        .await
    }
}

/// Maps an error response to a [`SinkError`] using its `__type` field.
///
/// The type may carry a namespace prefix
/// (`com.amazonaws.logs#ResourceNotFoundException`) which is ignored.
fn classify_error(status: reqwest::StatusCode, body: &str) -> SinkError {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let kind = parsed
        .as_ref()
        .and_then(|v| v.get("__type"))
        .and_then(serde_json::Value::as_str)
        .map(|t| t.rsplit('#').next().unwrap_or(t).to_string());
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message").or_else(|| v.get("Message")))
        .and_then(serde_json::Value::as_str)
        .map_or_else(|| body.to_string(), ToString::to_string);

    match kind.as_deref() {
        Some("ResourceAlreadyExistsException") => SinkError::ResourceAlreadyExists(message),
        Some("ResourceNotFoundException") => SinkError::ResourceNotFound(message),
        Some(kind) => SinkError::Service {
            kind: kind.to_string(),
            message,
        },
        None => SinkError::Service {
            kind: format!("HTTP {status}"),
            message,
        },
    }
}

/// Creates the HTTP client used for CloudWatch requests.
///
/// An unusable proxy setting is logged and the client falls back to a
/// direct connection.
#[must_use]
pub fn get_client(config: &TransportConfig) -> reqwest::Client {
    match build_client(config, true) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client(config, false) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(
    config: &TransportConfig,
    allow_proxy: bool,
) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if allow_proxy {
        if let Some(https_uri) = &config.https_proxy {
            let proxy = reqwest::Proxy::https(https_uri.clone())?;
            client = client.proxy(proxy);
        }
    }

    Ok(client.build()?)
}
