// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # CloudWatch Transport
//!
//! Buffers a continuous stream of log records and ships them in batches to
//! CloudWatch Logs.
//!
//! - [`buffer`]: quota-aware record buffer with an overflow queue
//! - [`scheduler`]: debounce-with-max-wait flush scheduling
//! - [`stream`]: time-bucketed log stream names and rotation
//! - [`sink`]: the ingestion service contract and its delivery rules
//! - [`cloudwatch`]: the CloudWatch Logs HTTP client
//! - [`transport`]: startup, ingestion, background timers and shutdown
//!
//! ```rust,ignore
//! use cloudwatch_transport::{CloudWatchClient, Transport, TransportConfig};
//!
//! let config = TransportConfig::from_env()?;
//! let client = Arc::new(CloudWatchClient::from_config(&config)?);
//! let transport = Transport::start(&config, client).await?;
//! transport.ingest(cloudwatch_transport::record::parse_line(line)).await?;
//! transport.close().await?;
//! ```

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]

pub mod buffer;
pub mod cloudwatch;
pub mod config;
pub mod constants;
pub mod error;
pub mod logger;
pub mod record;
pub mod scheduler;
pub mod signing;
pub mod sink;
pub mod stream;
pub mod transport;

pub use cloudwatch::CloudWatchClient;
pub use config::TransportConfig;
pub use record::LogRecord;
pub use sink::LogSink;
pub use transport::{FlushEvent, Transport};
