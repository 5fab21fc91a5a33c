// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Boundary to the remote log ingestion service.
//!
//! [`LogSink`] is the raw contract of the service. [`SinkAdapter`] layers the
//! transport's delivery rules on top of it:
//! - group and stream creation are idempotent ("already exists" is success)
//! - a put against a missing stream creates the stream and retries once
//! - every other put failure is logged and the batch dropped

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::error::SinkError;
use crate::record::LogRecord;

/// Raw operations of the log ingestion service.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn create_log_group(&self, group: &str) -> Result<(), SinkError>;

    async fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), SinkError>;

    /// Sends one batch. `events` must be ordered by timestamp.
    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        events: &[LogRecord],
    ) -> Result<(), SinkError>;
}

#[derive(Clone)]
pub struct SinkAdapter {
    sink: Arc<dyn LogSink>,
}

impl SinkAdapter {
    #[must_use]
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    pub async fn create_group(&self, group: &str) -> Result<(), SinkError> {
        match self.sink.create_log_group(group).await {
            Err(e) if e.is_already_exists() => {
                debug!("SINK | Log group {group} already exists");
                Ok(())
            }
            result => result,
        }
    }

    pub async fn create_stream(&self, group: &str, stream: &str) -> Result<(), SinkError> {
        match self.sink.create_log_stream(group, stream).await {
            Err(e) if e.is_already_exists() => {
                debug!("SINK | Log stream {group}/{stream} already exists");
                Ok(())
            }
            result => result,
        }
    }

    /// Ships a batch on a best-effort basis. Never fails.
    pub async fn put(&self, group: &str, stream: &str, records: &[LogRecord]) {
        if records.is_empty() {
            return;
        }

        let err = match self.sink.put_log_events(group, stream, records).await {
            Ok(()) => {
                debug!("SINK | Shipped {} records to {group}/{stream}", records.len());
                return;
            }
            Err(e) => e,
        };

        if !err.is_not_found() {
            error!(
                "SINK | Failed to ship {} records to {group}/{stream}, dropping them: {err}",
                records.len()
            );
            return;
        }

        warn!("SINK | Log stream {group}/{stream} is missing, recreating it: {err}");
        if let Err(e) = self.create_stream(group, stream).await {
            error!(
                "SINK | Failed to recreate {group}/{stream}, dropping {} records: {e}",
                records.len()
            );
            return;
        }

        match self.sink.put_log_events(group, stream, records).await {
            Ok(()) => debug!(
                "SINK | Shipped {} records to {group}/{stream} after recreating it",
                records.len()
            ),
            Err(e) => error!(
                "SINK | Retry to {group}/{stream} failed, dropping {} records: {e}",
                records.len()
            ),
        }
    }
}
