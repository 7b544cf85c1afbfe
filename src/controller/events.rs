//! Phase-change event emission
//!
//! Every persisted transition produces an `ExperimentEvent` with type
//! `dev.pipewise.experiment.<phase>`. Emission is best effort: the state
//! machine logs failures and moves on.

use crate::model::Phase;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event emission failed: {0}")]
    Generic(String),
}

/// Phase-change notification
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExperimentEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub time: DateTime<Utc>,
    #[serde(rename = "experimentId")]
    pub experiment_id: String,
    pub from: Phase,
    pub to: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExperimentEvent {
    pub fn transition(
        experiment_id: &str,
        from: Phase,
        to: Phase,
        message: Option<String>,
        time: DateTime<Utc>,
    ) -> Self {
        ExperimentEvent {
            id: Uuid::new_v4(),
            event_type: event_type(to),
            source: "/pipewise/controller".to_string(),
            time,
            experiment_id: experiment_id.to_string(),
            from,
            to,
            message,
        }
    }
}

pub fn event_type(phase: Phase) -> String {
    format!("dev.pipewise.experiment.{}", phase)
}

/// Trait for sending phase-change events
///
/// Production code uses `HttpEventSink` which sends events via HTTP POST.
/// Tests use `MockEventSink` which stores events in memory for assertions.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: &ExperimentEvent) -> Result<(), EventError>;
}

/// Production event sink that POSTs events as JSON
pub struct HttpEventSink {
    enabled: bool,
    sink_url: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpEventSink {
    pub fn new(enabled: bool, sink_url: Option<String>, timeout: Duration) -> Self {
        HttpEventSink {
            enabled,
            sink_url,
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Sink that drops every event
    pub fn disabled() -> Self {
        Self::new(false, None, Duration::from_secs(1))
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn send(&self, event: &ExperimentEvent) -> Result<(), EventError> {
        if !self.enabled {
            return Ok(());
        }

        let Some(url) = &self.sink_url else {
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(event)
            .send()
            .await
            .map_err(|e| EventError::Generic(format!("HTTP POST failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(EventError::Generic(format!(
                "sink returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Mock event sink for testing - stores events in memory
#[cfg(test)]
#[derive(Default)]
pub struct MockEventSink {
    events: std::sync::Mutex<Vec<ExperimentEvent>>,
    fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MockEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send fail after recording the event
    pub fn fail_sends(&self) {
        self.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    #[allow(clippy::unwrap_used)]
    pub fn events(&self) -> Vec<ExperimentEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl EventSink for MockEventSink {
    async fn send(&self, event: &ExperimentEvent) -> Result<(), EventError> {
        #[allow(clippy::unwrap_used)]
        self.events.lock().unwrap().push(event.clone());
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(EventError::Generic("sink unreachable".to_string()));
        }
        Ok(())
    }
}
