// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::constants::EVENT_OVERHEAD_BYTES;

/// A single log event as shipped to CloudWatch.
///
/// Serializes to the `InputLogEvent` shape of the `PutLogEvents` API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub message: String,
}

impl LogRecord {
    #[must_use]
    pub fn new(timestamp: i64, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            message: message.into(),
        }
    }

    /// Size of this record when counted against the batch quota.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.message.len() + EVENT_OVERHEAD_BYTES
    }

    /// Builds a meta record describing a transport failure.
    ///
    /// These are shipped with the application's own logs so delivery problems
    /// stay visible without ever failing the producer.
    #[must_use]
    pub fn error(context: &str, error: &str) -> Self {
        let message = serde_json::json!({ "message": context, "error": error }).to_string();
        Self::new(now_millis(), message)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Turns one line of newline-delimited JSON logs into a record.
///
/// The whole line is kept as the message. The timestamp is taken from a
/// numeric `time` field when the line is a JSON object carrying one, and is
/// the current time otherwise (including lines that are not JSON at all).
#[must_use]
pub fn parse_line(line: &str) -> LogRecord {
    let timestamp = serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|value| value.get("time").and_then(serde_json::Value::as_i64))
        .unwrap_or_else(now_millis);

    LogRecord::new(timestamp, line)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_uses_time_field() {
        let line = r#"{"level":30,"time":1714568820000,"msg":"hello"}"#;
        let record = parse_line(line);

        assert_eq!(record.timestamp, 1_714_568_820_000);
        assert_eq!(record.message, line);
    }

    #[test]
    fn test_parse_line_without_time_field() {
        let before = now_millis();
        let record = parse_line(r#"{"msg":"no time here"}"#);

        assert!(record.timestamp >= before);
    }

    #[test]
    fn test_parse_line_not_json() {
        let before = now_millis();
        let record = parse_line("plain text line");

        assert!(record.timestamp >= before);
        assert_eq!(record.message, "plain text line");
    }

    #[test]
    fn test_error_record_is_json() {
        let record = LogRecord::error("flushing error", "stream gone");
        let value: serde_json::Value = serde_json::from_str(&record.message).unwrap();

        assert_eq!(value["message"], "flushing error");
        assert_eq!(value["error"], "stream gone");
    }

    #[test]
    fn test_serializes_as_input_log_event() {
        let record = LogRecord::new(42, "m");
        let json = serde_json::to_string(&record).unwrap();

        assert_eq!(json, r#"{"timestamp":42,"message":"m"}"#);
    }

    #[test]
    fn test_batch_size_includes_overhead() {
        assert_eq!(LogRecord::new(0, "abcd").batch_size(), 4 + 26);
    }
}
