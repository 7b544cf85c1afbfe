//! Metrics backend integration
//!
//! Both the analysis phase (per-variant sample series) and the deployment
//! status aggregator (deployment-level rates) read from a `MetricsSource`.
//! The production implementation issues Prometheus range queries.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MetricsError {
    #[error("Prometheus HTTP error: {0}")]
    HttpError(String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("No data returned from Prometheus")]
    NoData,

    #[error("Metrics query timed out after {0:?}")]
    Timeout(Duration),
}

/// Sample series for one metric of one subject (deployment or experiment)
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Return every sample of `metric` for `subject` over the trailing `window`
    async fn query_metric(
        &self,
        subject: &str,
        metric: &str,
        window: Duration,
    ) -> Result<Vec<f64>, MetricsError>;
}

/// Smallest resolution requested from Prometheus
const MIN_STEP_SECS: u64 = 15;

/// Prometheus refuses range queries with more points than this
const MAX_POINTS: u64 = 11_000;

/// `MetricsSource` backed by the Prometheus HTTP API
pub struct PrometheusClient {
    address: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl PrometheusClient {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        PrometheusClient {
            address: address.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl MetricsSource for PrometheusClient {
    async fn query_metric(
        &self,
        subject: &str,
        metric: &str,
        window: Duration,
    ) -> Result<Vec<f64>, MetricsError> {
        let query = build_query(metric, subject);
        let end = chrono::Utc::now();
        let window_secs = window.as_secs().max(1);
        let start = end - chrono::Duration::seconds(window_secs as i64);
        let step = query_step(window_secs);

        debug!(subject = %subject, query = %query, step = step, "Querying Prometheus range");

        let url = format!("{}/api/v1/query_range", self.address);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("query", query.as_str()),
                ("start", &start.timestamp().to_string()),
                ("end", &end.timestamp().to_string()),
                ("step", &step.to_string()),
            ])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MetricsError::Timeout(self.timeout)
                } else {
                    MetricsError::HttpError(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(MetricsError::HttpError(format!(
                "Prometheus returned HTTP {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| MetricsError::HttpError(e.to_string()))?;
        parse_range_query(&body)
    }
}

/// Build the PromQL expression for a metric scoped to one subject
///
/// A metric containing `$deployment` is treated as a template and the
/// subject is substituted in place; a bare metric name gets a
/// `deployment` label matcher.
pub fn build_query(metric: &str, subject: &str) -> String {
    if metric.contains("$deployment") {
        metric.replace("$deployment", subject)
    } else {
        format!(r#"{}{{deployment="{}"}}"#, metric, subject)
    }
}

fn query_step(window_secs: u64) -> u64 {
    MIN_STEP_SECS.max(window_secs.div_ceil(MAX_POINTS))
}

/// Prometheus range query response format
#[derive(Debug, Deserialize)]
struct RangeResponse {
    status: String,
    data: Option<RangeData>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RangeData {
    result: Vec<RangeSeries>,
}

#[derive(Debug, Deserialize)]
struct RangeSeries {
    values: Vec<(f64, String)>, // [timestamp, value_as_string]
}

/// Flatten all series of a `/api/v1/query_range` matrix response into samples
fn parse_range_query(json_response: &str) -> Result<Vec<f64>, MetricsError> {
    let response: RangeResponse = serde_json::from_str(json_response)
        .map_err(|e| MetricsError::ParseError(format!("Invalid JSON: {}", e)))?;

    if response.status != "success" {
        return Err(MetricsError::HttpError(format!(
            "Prometheus query failed with status {}: {}",
            response.status,
            response.error.unwrap_or_default()
        )));
    }

    let series = response.data.map(|d| d.result).unwrap_or_default();
    let mut samples = Vec::new();
    for s in series {
        for (_, raw) in s.values {
            let value = raw
                .parse::<f64>()
                .map_err(|e| MetricsError::ParseError(format!("Invalid value {}: {}", raw, e)))?;
            // NaN and +Inf show up for empty rate() windows
            if value.is_finite() {
                samples.push(value);
            }
        }
    }

    if samples.is_empty() {
        return Err(MetricsError::NoData);
    }
    Ok(samples)
}

/// In-memory metrics source keyed by (subject, metric)
#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub struct MockMetricsSource {
    series: std::sync::Mutex<std::collections::HashMap<(String, String), Vec<f64>>>,
    failure: std::sync::Mutex<Option<MetricsError>>,
    calls: std::sync::Mutex<Vec<(String, String, Duration)>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockMetricsSource {
    pub fn new() -> Self {
        MockMetricsSource {
            series: std::sync::Mutex::new(std::collections::HashMap::new()),
            failure: std::sync::Mutex::new(None),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn set_series(&self, subject: &str, metric: &str, samples: Vec<f64>) {
        self.series
            .lock()
            .unwrap()
            .insert((subject.to_string(), metric.to_string()), samples);
    }

    /// Make every subsequent query fail with `error`
    pub fn fail_with(&self, error: MetricsError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn calls(&self) -> Vec<(String, String, Duration)> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl MetricsSource for MockMetricsSource {
    async fn query_metric(
        &self,
        subject: &str,
        metric: &str,
        window: Duration,
    ) -> Result<Vec<f64>, MetricsError> {
        self.calls
            .lock()
            .unwrap()
            .push((subject.to_string(), metric.to_string(), window));
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        self.series
            .lock()
            .unwrap()
            .get(&(subject.to_string(), metric.to_string()))
            .cloned()
            .ok_or(MetricsError::NoData)
    }
}
