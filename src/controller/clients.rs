//! Deployment collaborators: template service, execution layer, collector health
//!
//! The state machine and the aggregator only see the traits below. The HTTP
//! implementations talk JSON to the respective services; the mocks back the
//! unit tests.

use crate::model::{CollectorStatus, DeploymentSpec, InstanceStatus, Variant};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

/// Validates and renders pipeline configuration templates
#[async_trait]
pub trait TemplateClient: Send + Sync {
    async fn validate_template(
        &self,
        name: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<(), ClientError>;

    /// Render the collector configuration for one variant
    async fn generate_config(
        &self,
        name: &str,
        variant: Variant,
        parameters: &BTreeMap<String, String>,
    ) -> Result<String, ClientError>;
}

/// Rolls pipeline variants out to target nodes and reports on them
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    async fn deploy_pipeline(&self, spec: &DeploymentSpec) -> Result<(), ClientError>;

    async fn wait_for_ready(
        &self,
        experiment_id: &str,
        variant: Variant,
        namespace: &str,
        timeout: Duration,
    ) -> Result<(), ClientError>;

    async fn list_instances(&self, deployment_id: &str) -> Result<Vec<InstanceStatus>, ClientError>;
}

/// Coarse per-collector health signal
#[async_trait]
pub trait CollectorHealthSource: Send + Sync {
    async fn collector_statuses(&self, deployment_id: &str)
        -> Result<Vec<CollectorStatus>, ClientError>;
}

/// Thin JSON-over-HTTP helper shared by the service clients
struct JsonService {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl JsonService {
    fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        JsonService {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Base URL plus `segments`, each percent-encoded as a single path segment
    fn url(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<reqwest::Url, ClientError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| ClientError::Http(format!("invalid base URL {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Http(format!("base URL {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<T, ClientError> {
        let request = self.client.get(self.url(segments, query)?);
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<reqwest::Response, ClientError> {
        let request = self.client.post(self.url(segments, &[])?).json(body);
        self.send(request).await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ClientError> {
        let response = request.timeout(self.timeout).send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout(self.timeout)
            } else {
                ClientError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[derive(Serialize)]
struct TemplateRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    variant: Option<Variant>,
    parameters: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct GeneratedConfig {
    config: String,
}

/// `TemplateClient` for the configuration-template service
pub struct HttpTemplateClient {
    service: JsonService,
}

impl HttpTemplateClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        HttpTemplateClient {
            service: JsonService::new(base_url, timeout),
        }
    }
}

#[async_trait]
impl TemplateClient for HttpTemplateClient {
    async fn validate_template(
        &self,
        name: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<(), ClientError> {
        let body = TemplateRequest {
            variant: None,
            parameters,
        };
        self.service
            .post(&["api", "v1", "templates", name, "validate"], &body)
            .await?;
        Ok(())
    }

    async fn generate_config(
        &self,
        name: &str,
        variant: Variant,
        parameters: &BTreeMap<String, String>,
    ) -> Result<String, ClientError> {
        let body = TemplateRequest {
            variant: Some(variant),
            parameters,
        };
        let generated: GeneratedConfig = self
            .service
            .post(&["api", "v1", "templates", name, "generate"], &body)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        Ok(generated.config)
    }
}

/// `ExecutionClient` for the deployment execution layer
pub struct HttpExecutionClient {
    service: JsonService,
    poll_interval: Duration,
}

impl HttpExecutionClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration, poll_interval: Duration) -> Self {
        HttpExecutionClient {
            service: JsonService::new(base_url, timeout),
            poll_interval,
        }
    }
}

#[async_trait]
impl ExecutionClient for HttpExecutionClient {
    async fn deploy_pipeline(&self, spec: &DeploymentSpec) -> Result<(), ClientError> {
        self.service.post(&["api", "v1", "deployments"], spec).await?;
        Ok(())
    }

    async fn wait_for_ready(
        &self,
        experiment_id: &str,
        variant: Variant,
        namespace: &str,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let deployment = crate::model::deployment_id(experiment_id, variant);
        debug!(deployment = %deployment, namespace = %namespace, "Waiting for pipeline instances");
        poll_until_ready(&deployment, self.poll_interval, timeout, || {
            self.list_instances(&deployment)
        })
        .await
    }

    async fn list_instances(&self, deployment_id: &str) -> Result<Vec<InstanceStatus>, ClientError> {
        self.service
            .get(&["api", "v1", "deployments", deployment_id, "instances"], &[])
            .await
    }
}

/// Poll `list` until every reported instance is healthy or `timeout` passes
///
/// Listing errors are logged and polled through; a rollout routinely
/// answers 503 for a while.
async fn poll_until_ready<F, Fut>(
    deployment: &str,
    poll_interval: Duration,
    timeout: Duration,
    mut list: F,
) -> Result<(), ClientError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Vec<InstanceStatus>, ClientError>>,
{
    let poll = async {
        loop {
            match list().await {
                Ok(instances)
                    if !instances.is_empty() && instances.iter().all(InstanceStatus::is_healthy) =>
                {
                    return;
                }
                Ok(instances) => {
                    debug!(deployment = %deployment, instances = instances.len(), "Instances not ready yet")
                }
                Err(e) => {
                    warn!(deployment = %deployment, error = %e, "Failed to list instances, polling again")
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| ClientError::Timeout(timeout))
}

/// `CollectorHealthSource` for the pipeline-health backend
pub struct HttpCollectorHealth {
    service: JsonService,
}

impl HttpCollectorHealth {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        HttpCollectorHealth {
            service: JsonService::new(base_url, timeout),
        }
    }
}

#[async_trait]
impl CollectorHealthSource for HttpCollectorHealth {
    async fn collector_statuses(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<CollectorStatus>, ClientError> {
        self.service
            .get(&["api", "v1", "collectors"], &[("deployment", deployment_id)])
            .await
    }
}

#[cfg(test)]
pub use mocks::{MockCollectorHealth, MockExecutionClient, MockTemplateClient};


#[cfg(test)]
pub(crate) use mocks::instance;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstanceState;

    #[test]
    fn test_json_service_trims_trailing_slash() {
        let service = JsonService::new("http://templates:8080/", Duration::from_secs(1));
        assert_eq!(
            service
                .url(&["api", "v1", "templates", "x", "validate"], &[])
                .unwrap()
                .as_str(),
            "http://templates:8080/api/v1/templates/x/validate"
        );
    }

    #[test]
    fn test_ids_cannot_escape_their_path_segment_or_query_value() {
        let service = JsonService::new("http://exec:8080/base", Duration::from_secs(1));
        let url = service
            .url(&["api", "v1", "deployments", "a/../b?x#y", "instances"], &[])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://exec:8080/base/api/v1/deployments/a%2F..%2Fb%3Fx%23y/instances"
        );

        let url = service
            .url(&["api", "v1", "collectors"], &[("deployment", "a&deployment=b")])
            .unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![("deployment".to_string(), "a&deployment=b".to_string())]
        );
    }

    #[test]
    fn test_invalid_base_url_is_an_error() {
        let service = JsonService::new("not a url", Duration::from_secs(1));
        assert!(matches!(
            service.url(&["api"], &[]),
            Err(ClientError::Http(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_poll_survives_listing_errors() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result = poll_until_ready(
            "exp-1-baseline",
            Duration::from_secs(5),
            Duration::from_secs(60),
            || {
                let call = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    match call {
                        0 => Err(ClientError::Status {
                            status: 503,
                            body: "rolling out".to_string(),
                        }),
                        1 => Ok(vec![instance("a", InstanceState::Pending, false, 0)]),
                        _ => Ok(vec![instance("a", InstanceState::Running, true, 0)]),
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(()));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_poll_times_out_when_listing_keeps_failing() {
        let result = poll_until_ready(
            "exp-1-baseline",
            Duration::from_secs(5),
            Duration::from_secs(30),
            || async { Err(ClientError::Http("connection refused".to_string())) },
        )
        .await;
        assert_eq!(result, Err(ClientError::Timeout(Duration::from_secs(30))));
    }

    #[test]
    fn test_template_request_omits_variant_for_validation() {
        let parameters = BTreeMap::from([("sampling".to_string(), "0.1".to_string())]);
        let body = TemplateRequest {
            variant: None,
            parameters: &parameters,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({"parameters": {"sampling": "0.1"}}));

        let body = TemplateRequest {
            variant: Some(Variant::Candidate),
            parameters: &parameters,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["variant"], "candidate");
    }

    #[tokio::test]
    async fn test_mock_execution_deploys_healthy_instances() {
        let execution = MockExecutionClient::new();
        let spec = DeploymentSpec {
            deployment_id: "exp-1-baseline".to_string(),
            experiment_id: "exp-1".to_string(),
            variant: Variant::Baseline,
            pipeline: "process-baseline-v1".to_string(),
            namespace: "pipewise-experiments".to_string(),
            node_selector: BTreeMap::new(),
            config: String::new(),
        };
        execution.deploy_pipeline(&spec).await.unwrap();

        let instances = execution.list_instances("exp-1-baseline").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].state, InstanceState::Running);
        assert!(instances[0].is_healthy());
        assert!(execution.list_instances("other").await.unwrap().is_empty());
    }
}
