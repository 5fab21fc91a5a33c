// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! CloudWatch Logs quota limits and transport defaults.
//!
//! Limits come from the `PutLogEvents` API constraints:
//! - **Event size**: a single message must stay under 256 KiB
//! - **Batch size**: the sum of `message + 26 bytes` per event stays under 1 MiB
//! - **Batch count**: at most 10,000 events per request

use std::time::Duration;

/// Maximum size in bytes of a single log message.
///
/// Records whose message is this size or larger are dropped on ingestion.
pub const MAX_EVENT_SIZE: usize = 256 * 1_024;

/// Maximum aggregate batch size in bytes, counting [`EVENT_OVERHEAD_BYTES`]
/// per record.
pub const MAX_BUFFER_SIZE: usize = 1_048_576;

/// Maximum number of records per batch.
pub const MAX_BUFFER_LENGTH: usize = 10_000;

/// Fixed per-event overhead CloudWatch adds when sizing a batch.
pub const EVENT_OVERHEAD_BYTES: usize = 26;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1_000);

pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Quiet time the scheduler waits for before executing a flush.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1_000);

/// Upper bound on how long a pending flush can be postponed by new triggers.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(5_000);
