// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ownership of the destination log stream name.
//!
//! With rotation enabled the name is `<base>-YYYY-MM-DD-HH-mm` in local time,
//! recomputed on every rotation. Without rotation it is the base name.
//!
//! Resolution and rotation share one async mutex. The mutex is held across
//! the remote create-stream call, so a reader arriving mid-rotation waits and
//! then sees the new name, never a half-updated one. The record buffer lives
//! behind a separate lock and is unaffected.

use chrono::{Local, NaiveDateTime, Timelike};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::SinkError;
use crate::sink::SinkAdapter;

type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamIdentity {
    pub active_name: String,
    /// Local time the name was computed for, truncated to the minute.
    pub rotation_epoch: NaiveDateTime,
}

/// Formats the time-bucketed stream name for `at`.
///
/// An empty base yields the bare timestamp.
#[must_use]
pub fn stream_name_at(base: &str, at: NaiveDateTime) -> String {
    let stamp = at.format("%Y-%m-%d-%H-%M");
    if base.is_empty() {
        stamp.to_string()
    } else {
        format!("{base}-{stamp}")
    }
}

pub struct StreamManager {
    group: String,
    base: String,
    rotating: bool,
    sink: SinkAdapter,
    identity: Mutex<Option<StreamIdentity>>,
    clock: Clock,
}

impl StreamManager {
    #[must_use]
    pub fn new(group: String, base: String, rotating: bool, sink: SinkAdapter) -> Self {
        Self {
            group,
            base,
            rotating,
            sink,
            identity: Mutex::new(None),
            clock: Arc::new(|| Local::now().naive_local()),
        }
    }

    /// Replaces the local-time source. Used by tests.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    #[must_use]
    pub fn is_rotating(&self) -> bool {
        self.rotating
    }

    /// Returns the active stream name, creating the stream on first use.
    ///
    /// Later calls return the cached name without contacting the service
    /// until the next rotation. A failed creation leaves nothing cached, so
    /// the next call tries again.
    pub async fn resolve_active_name(&self) -> Result<String, SinkError> {
        let mut identity = self.identity.lock().await;
        if let Some(current) = identity.as_ref() {
            return Ok(current.active_name.clone());
        }

        let next = self.next_identity();
        self.sink.create_stream(&self.group, &next.active_name).await?;
        debug!("STREAM | Resolved log stream {}", next.active_name);

        let name = next.active_name.clone();
        *identity = Some(next);
        Ok(name)
    }

    /// Switches to a freshly computed stream name and creates it.
    ///
    /// Callers flush pending records under the old name first.
    pub async fn rotate(&self) -> Result<String, SinkError> {
        let mut identity = self.identity.lock().await;
        let previous = identity.take();

        let next = self.next_identity();
        self.sink.create_stream(&self.group, &next.active_name).await?;
        info!(
            "STREAM | Rotated log stream {} -> {}",
            previous.map_or_else(|| "<none>".to_string(), |p| p.active_name),
            next.active_name
        );

        let name = next.active_name.clone();
        *identity = Some(next);
        Ok(name)
    }

    /// Currently cached identity, if any. Waits for an in-flight rotation.
    pub async fn current(&self) -> Option<StreamIdentity> {
        self.identity.lock().await.clone()
    }

    fn next_identity(&self) -> StreamIdentity {
        let now = (self.clock)();
        let rotation_epoch = now
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        let active_name = if self.rotating {
            stream_name_at(&self.base, rotation_epoch)
        } else {
            self.base.clone()
        };

        StreamIdentity {
            active_name,
            rotation_epoch,
        }
    }
}
