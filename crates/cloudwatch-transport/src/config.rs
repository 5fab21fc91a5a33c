// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt;
use std::time::Duration;

use crate::constants::{
    DEFAULT_DEBOUNCE, DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_WAIT, DEFAULT_ROTATION_INTERVAL,
};
use crate::error::ConfigError;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// AWS credentials used to sign requests.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Configuration for the CloudWatch transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Destination log group
    pub log_group_name: String,
    /// Base name of the destination log stream
    pub log_stream_name: String,
    /// How often the stream name rotates; `None` keeps a static stream
    pub rotation_interval: Option<Duration>,
    /// Periodic flush interval
    pub flush_interval: Duration,
    /// Quiet time before a requested flush runs
    pub debounce: Duration,
    /// Longest a requested flush may be postponed
    pub max_wait: Duration,
    pub aws_region: Option<String>,
    pub credentials: Option<Credentials>,
    /// Overrides the regional CloudWatch Logs endpoint
    pub endpoint: Option<String>,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
    pub request_timeout: Duration,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            log_group_name: String::new(),
            log_stream_name: String::new(),
            rotation_interval: Some(DEFAULT_ROTATION_INTERVAL),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
            max_wait: DEFAULT_MAX_WAIT,
            aws_region: None,
            credentials: None,
            endpoint: None,
            https_proxy: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            log_level: "info".to_string(),
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub fn new(log_group_name: impl Into<String>, log_stream_name: impl Into<String>) -> Self {
        Self {
            log_group_name: log_group_name.into(),
            log_stream_name: log_stream_name.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let log_group_name =
            lookup("CW_LOG_GROUP_NAME").ok_or(ConfigError::Missing("CW_LOG_GROUP_NAME"))?;
        let log_stream_name =
            lookup("CW_LOG_STREAM_NAME").ok_or(ConfigError::Missing("CW_LOG_STREAM_NAME"))?;

        let rotation_interval = match lookup("CW_LOG_STREAM_ROTATION_INTERVAL") {
            Some(value) => match parse_millis("CW_LOG_STREAM_ROTATION_INTERVAL", &value)? {
                Duration::ZERO => None,
                interval => Some(interval),
            },
            // Unset means the default interval; only an explicit 0 turns rotation off
            None => defaults.rotation_interval,
        };
        let flush_interval = lookup("CW_FLUSH_INTERVAL")
            .map(|value| parse_millis("CW_FLUSH_INTERVAL", &value))
            .transpose()?
            .unwrap_or(defaults.flush_interval);
        let debounce = lookup("CW_FLUSH_DEBOUNCE")
            .map(|value| parse_millis("CW_FLUSH_DEBOUNCE", &value))
            .transpose()?
            .unwrap_or(defaults.debounce);
        let max_wait = lookup("CW_FLUSH_MAX_WAIT")
            .map(|value| parse_millis("CW_FLUSH_MAX_WAIT", &value))
            .transpose()?
            .unwrap_or(defaults.max_wait);

        let aws_region = lookup("AWS_REGION").or_else(|| lookup("AWS_DEFAULT_REGION"));
        let credentials = match (lookup("AWS_ACCESS_KEY_ID"), lookup("AWS_SECRET_ACCESS_KEY")) {
            (Some(access_key_id), Some(secret_access_key)) => Some(Credentials {
                access_key_id,
                secret_access_key,
                session_token: lookup("AWS_SESSION_TOKEN"),
            }),
            _ => None,
        };
        let endpoint = lookup("CW_ENDPOINT");
        let https_proxy = lookup("CW_HTTPS_PROXY").or_else(|| lookup("HTTPS_PROXY"));
        let log_level = lookup("CW_LOG_LEVEL")
            .map(|value| value.to_lowercase())
            .unwrap_or(defaults.log_level);

        let config = Self {
            log_group_name,
            log_stream_name,
            rotation_interval,
            flush_interval,
            debounce,
            max_wait,
            aws_region,
            credentials,
            endpoint,
            https_proxy,
            request_timeout: defaults.request_timeout,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_group_name.trim().is_empty() {
            return Err(ConfigError::Missing("CW_LOG_GROUP_NAME"));
        }

        if self.log_stream_name.trim().is_empty() {
            return Err(ConfigError::Missing("CW_LOG_STREAM_NAME"));
        }

        if self.debounce.is_zero() {
            return Err(ConfigError::Invalid {
                name: "CW_FLUSH_DEBOUNCE",
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.max_wait < self.debounce {
            return Err(ConfigError::Invalid {
                name: "CW_FLUSH_MAX_WAIT",
                reason: format!(
                    "must be at least the debounce interval ({} ms)",
                    self.debounce.as_millis()
                ),
            });
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid {
                name: "CW_LOG_LEVEL",
                reason: format!(
                    "'{}' is not one of: trace, debug, info, warn, error",
                    self.log_level
                ),
            });
        }

        Ok(())
    }
}

fn parse_millis(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| ConfigError::Invalid {
            name,
            reason: format!("'{value}' is not a number of milliseconds: {e}"),
        })
}
