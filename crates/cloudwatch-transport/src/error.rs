// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::record::LogRecord;

/// Errors returned by the remote log ingestion service.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Resource already exists: {0}")]
    ResourceAlreadyExists(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// The service answered with an error of any other class.
    #[error("{kind}: {message}")]
    Service { kind: String, message: String },

    /// The request never got an answer (connection, timeout, TLS...).
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to build payload: {0}")]
    Payload(String),
}

impl SinkError {
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, SinkError::ResourceAlreadyExists(_))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, SinkError::ResourceNotFound(_))
    }
}

/// Errors raised while loading or validating the transport configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Errors surfaced by a running transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Flush scheduler is not running")]
    SchedulerStopped,
}

/// Neither the buffer nor its overflow queue had room for the record.
///
/// The record is handed back so the caller can retry after a flush.
#[derive(Debug, thiserror::Error)]
#[error("Record buffer is full")]
pub struct BufferFull(pub LogRecord);
