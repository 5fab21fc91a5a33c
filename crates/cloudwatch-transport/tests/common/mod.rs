// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Common test utilities for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;

use cloudwatch_transport::error::SinkError;
use cloudwatch_transport::{LogRecord, LogSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateGroup(String),
    CreateStream(String),
    Put { stream: String, messages: Vec<String> },
}

/// In-memory sink recording every call, answering from scripted results
/// and `Ok` once they run dry.
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<Call>>,
    group_results: Mutex<VecDeque<Result<(), SinkError>>>,
    stream_results: Mutex<VecDeque<Result<(), SinkError>>>,
    put_results: Mutex<VecDeque<Result<(), SinkError>>>,
}

impl RecordingSink {
    pub fn fail_group(&self, err: SinkError) {
        self.group_results.lock().unwrap().push_back(Err(err));
    }

    pub fn fail_stream(&self, err: SinkError) {
        self.stream_results.lock().unwrap().push_back(Err(err));
    }

    pub fn succeed_stream(&self) {
        self.stream_results.lock().unwrap().push_back(Ok(()));
    }

    pub fn fail_put(&self, err: SinkError) {
        self.put_results.lock().unwrap().push_back(Err(err));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Messages of every put, in call order.
    pub fn shipped(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Put { messages, .. } => Some(messages),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn put_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Put { .. }))
            .count()
    }

    pub fn streams_created(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::CreateStream(stream) => Some(stream),
                _ => None,
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl LogSink for RecordingSink {
    async fn create_log_group(&self, group: &str) -> Result<(), SinkError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::CreateGroup(group.to_string()));
        self.group_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn create_log_stream(&self, _group: &str, stream: &str) -> Result<(), SinkError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::CreateStream(stream.to_string()));
        self.stream_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn put_log_events(
        &self,
        _group: &str,
        stream: &str,
        events: &[LogRecord],
    ) -> Result<(), SinkError> {
        self.calls.lock().unwrap().push(Call::Put {
            stream: stream.to_string(),
            messages: events.iter().map(|e| e.message.clone()).collect(),
        });
        self.put_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}
