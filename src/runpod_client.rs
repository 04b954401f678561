//! `RunPod` API gateway.
//!
//! Unique responsibility: talk to the `RunPod` APIs. Pure adapter, no
//! business rules.
//!
//! Endpoints:
//! - REST <https://rest.runpod.io/v1> for pod lifecycle and resource listings
//! - GraphQL <https://api.runpod.io/graphql> for pod telemetry
//!
//! Failure policy (the rest of the crate relies on it):
//! - Read and list operations swallow transport errors and return
//!   `None`/empty, logging at `warn`. Guardrail checks then degrade toward
//!   permissiveness instead of blocking on a flaky provider.
//! - Write operations surface `None`/`false`; the caller decides whether
//!   that is fatal.
//! - [`ComputeProvider::public_url`] never fails; it falls back to the
//!   deterministic proxy URL pattern.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::warn;

use crate::runpod_config::{ConfigError, RunpodConfig};

/// Provider status string for a running pod. Counting "running" pods is an
/// exact match on this value.
pub const RUNNING_STATUS: &str = "RUNNING";

/// Container port assumed HTTP-capable when a pod advertises none.
pub const DEFAULT_HTTP_PORT: u16 = 8000;

/// Abstraction over the compute provider consumed by the lifecycle manager
/// and the guardrails.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Create a pod. `None` means the create call failed.
    async fn create_pod(&self, input: &CreatePodInput) -> Option<PodDescriptor>;

    /// Fetch a pod by ID. `None` means not found or transport failure.
    async fn get_pod(&self, pod_id: &str) -> Option<PodDescriptor>;

    /// Stop a pod. Returns whether the provider acknowledged the stop.
    async fn stop_pod(&self, pod_id: &str) -> bool;

    /// Terminate (delete) a pod. Returns whether the provider acknowledged.
    async fn terminate_pod(&self, pod_id: &str) -> bool;

    /// List all pods. Empty on failure.
    async fn list_pods(&self) -> Vec<PodDescriptor>;

    /// List all serverless endpoints. Empty on failure.
    async fn list_endpoints(&self) -> Vec<EndpointDescriptor>;

    /// List all network volumes. Empty on failure.
    async fn list_network_volumes(&self) -> Vec<NetworkVolumeDescriptor>;

    /// Latest telemetry for a pod. `None` when the pod is missing, not
    /// running, or the call fails.
    async fn pod_telemetry(&self, pod_id: &str) -> Option<TelemetryDescriptor>;

    /// Public proxy URL for a pod's HTTP port. Never fails; without a
    /// descriptor or an advertised HTTP port it falls back to
    /// `https://{id}-{port}.proxy.runpod.net` with the preferred port.
    async fn public_url(&self, pod_id: &str, preferred_port: u16) -> String {
        proxy_url(self.get_pod(pod_id).await.as_ref(), pod_id, preferred_port)
    }
}

/// Build the deterministic proxy URL for a pod, preferring the first
/// advertised `/http` port over `preferred_port`.
#[must_use]
pub fn proxy_url(pod: Option<&PodDescriptor>, pod_id: &str, preferred_port: u16) -> String {
    let advertised = pod.and_then(|p| {
        p.ports
            .as_ref()
            .or_else(|| p.runtime.as_ref().and_then(|r| r.ports.as_ref()))
    });

    if let Some(specs) = advertised {
        for spec in specs {
            if let Some(port_str) = spec.strip_suffix("/http") {
                let port = match port_str.parse::<u16>() {
                    Ok(0) | Err(_) => preferred_port,
                    Ok(p) => p,
                };
                return format!("https://{pod_id}-{port}.proxy.runpod.net");
            }
        }
    }

    format!("https://{pod_id}-{preferred_port}.proxy.runpod.net")
}

/// Error type for gateway construction.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration problem (missing API key).
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The HTTP client could not be built.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Connection settings for [`RunpodClient`].
#[derive(Clone, Debug)]
pub struct RunpodClientConfig {
    /// API key for bearer authentication.
    pub api_key: String,
    /// REST API URL.
    pub rest_url: String,
    /// GraphQL API URL.
    pub graphql_url: String,
    /// HTTP request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum retry attempts for retryable failures.
    pub retry_max: u32,
    /// Initial backoff between retries in milliseconds.
    pub retry_backoff_ms: u64,
}

impl RunpodClientConfig {
    /// Extract connection settings from the top-level config.
    ///
    /// # Errors
    ///
    /// Returns an error if no API key is configured.
    pub fn from_config(cfg: &RunpodConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: cfg.require_api_key()?.to_string(),
            rest_url: cfg.rest_url.clone(),
            graphql_url: cfg.graphql_url.clone(),
            timeout_ms: cfg.http_timeout_ms,
            retry_max: cfg.retry_max,
            retry_backoff_ms: cfg.retry_backoff_ms,
        })
    }
}

/// HTTP gateway to the `RunPod` APIs.
pub struct RunpodClient {
    cfg: RunpodClientConfig,
    http: reqwest::Client,
}

impl RunpodClient {
    /// Create a new gateway.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(cfg: RunpodClientConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()?;

        Ok(Self { cfg, http })
    }

    fn rest_path(&self, path: &str) -> String {
        format!("{}{path}", self.cfg.rest_url.trim_end_matches('/'))
    }

    /// Send a request with retry on transient failures.
    async fn send_with_retry(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, RequestFailure> {
        let mut attempt: u32 = 0;
        let mut backoff = Duration::from_millis(self.cfg.retry_backoff_ms);

        loop {
            attempt = attempt.saturating_add(1);

            let mut req = self
                .http
                .request(method.clone(), url)
                .bearer_auth(&self.cfg.api_key);
            if let Some(b) = body {
                req = req.json(b);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }

                    let body_text = resp.text().await.unwrap_or_default();
                    if attempt <= self.cfg.retry_max && is_retryable_status(status) {
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff);
                        continue;
                    }

                    return Err(RequestFailure::Api {
                        status,
                        body: body_text,
                    });
                }
                Err(e) => {
                    if attempt <= self.cfg.retry_max && is_retryable_reqwest(&e) {
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff);
                        continue;
                    }

                    return Err(RequestFailure::Http(e));
                }
            }
        }
    }

    async fn rest_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, RequestFailure> {
        let url = self.rest_path(path);
        let resp = self.send_with_retry(method, &url, body).await?;
        resp.json::<T>()
            .await
            .map_err(|e| RequestFailure::Json(e.to_string()))
    }

    /// Execute a GraphQL query with the same retry policy.
    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<GraphQLResponse<T>, RequestFailure> {
        let body = serde_json::json!({
            "query": query,
            "variables": variables
        });

        let url = self.cfg.graphql_url.clone();
        let resp = self
            .send_with_retry(reqwest::Method::POST, &url, Some(&body))
            .await?;

        let gql: GraphQLResponse<T> = resp
            .json()
            .await
            .map_err(|e| RequestFailure::Json(e.to_string()))?;

        if let Some(errors) = &gql.errors
            && !errors.is_empty()
        {
            let msg = errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(RequestFailure::GraphQL(msg));
        }

        Ok(gql)
    }
}

#[async_trait]
impl ComputeProvider for RunpodClient {
    async fn create_pod(&self, input: &CreatePodInput) -> Option<PodDescriptor> {
        let body = match serde_json::to_value(input) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to serialize pod create input");
                return None;
            }
        };

        match self
            .rest_json::<PodDescriptor>(reqwest::Method::POST, "/pods", Some(&body))
            .await
        {
            Ok(pod) => Some(pod),
            Err(e) => {
                warn!(error = %e, "pod create call failed");
                None
            }
        }
    }

    async fn get_pod(&self, pod_id: &str) -> Option<PodDescriptor> {
        match self
            .rest_json::<PodDescriptor>(reqwest::Method::GET, &format!("/pods/{pod_id}"), None)
            .await
        {
            Ok(pod) => Some(pod),
            Err(RequestFailure::Api { status, .. }) if status.as_u16() == 404 => None,
            Err(e) => {
                warn!(pod_id, error = %e, "pod fetch failed");
                None
            }
        }
    }

    async fn stop_pod(&self, pod_id: &str) -> bool {
        let url = self.rest_path(&format!("/pods/{pod_id}/stop"));
        match self.send_with_retry(reqwest::Method::POST, &url, None).await {
            Ok(_) => true,
            Err(e) => {
                warn!(pod_id, error = %e, "pod stop failed");
                false
            }
        }
    }

    async fn terminate_pod(&self, pod_id: &str) -> bool {
        let url = self.rest_path(&format!("/pods/{pod_id}"));
        match self
            .send_with_retry(reqwest::Method::DELETE, &url, None)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(pod_id, error = %e, "pod terminate failed");
                false
            }
        }
    }

    async fn list_pods(&self) -> Vec<PodDescriptor> {
        match self
            .rest_json::<Vec<PodDescriptor>>(reqwest::Method::GET, "/pods", None)
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "pod listing failed, treating as empty");
                Vec::new()
            }
        }
    }

    async fn list_endpoints(&self) -> Vec<EndpointDescriptor> {
        match self
            .rest_json::<Vec<EndpointDescriptor>>(reqwest::Method::GET, "/endpoints", None)
            .await
        {
            Ok(eps) => eps,
            Err(e) => {
                warn!(error = %e, "endpoint listing failed, treating as empty");
                Vec::new()
            }
        }
    }

    async fn list_network_volumes(&self) -> Vec<NetworkVolumeDescriptor> {
        match self
            .rest_json::<Vec<NetworkVolumeDescriptor>>(
                reqwest::Method::GET,
                "/networkvolumes",
                None,
            )
            .await
        {
            Ok(vols) => vols,
            Err(e) => {
                warn!(error = %e, "network volume listing failed, treating as empty");
                Vec::new()
            }
        }
    }

    async fn pod_telemetry(&self, pod_id: &str) -> Option<TelemetryDescriptor> {
        let query = r"
            query pod($input: PodFilter) {
                pod(input: $input) {
                    id
                    desiredStatus
                    latestTelemetry {
                        time
                        state
                        cpuUtilization
                        memoryUtilization
                        averageGpuMetrics {
                            percentUtilization
                            memoryUtilization
                            temperatureCelcius
                            powerWatts
                        }
                        individualGpuMetrics {
                            id
                            percentUtilization
                            memoryUtilization
                            temperatureCelcius
                            powerWatts
                        }
                    }
                }
            }
        ";

        let variables = serde_json::json!({
            "input": { "podId": pod_id }
        });

        match self.graphql::<TelemetryQueryData>(query, variables).await {
            Ok(resp) => resp
                .data
                .and_then(|d| d.pod)
                .and_then(|p| p.latestTelemetry),
            Err(e) => {
                warn!(pod_id, error = %e, "telemetry fetch failed");
                None
            }
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// Pod creation request body for `POST /pods`.
#[derive(Debug, Clone, Serialize)]
#[allow(non_snake_case)]
pub struct CreatePodInput {
    /// Pod name.
    pub name: String,
    /// Container image name.
    pub imageName: String,
    /// Cloud type ("SECURE" or "COMMUNITY").
    pub cloudType: String,
    /// Persistent volume size in GB.
    pub volumeInGb: u32,
    /// Container disk size in GB.
    pub containerDiskInGb: u32,
    /// Volume mount path.
    pub volumeMountPath: String,
    /// Exposed ports ("8000/http" form).
    pub ports: Vec<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// "CPU" for CPU-class pods; omitted for GPU pods.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computeType: Option<String>,
    /// vCPU count (CPU pods only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcpuCount: Option<u32>,
    /// Acceptable CPU flavors (CPU pods only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpuFlavorIds: Option<Vec<String>>,
    /// GPU count (GPU pods only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpuCount: Option<u32>,
    /// GPU type IDs (GPU pods only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpuTypeIds: Option<Vec<String>>,
    /// Minimum RAM per GPU in GB (GPU pods only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minRAMPerGPU: Option<u32>,
    /// Minimum vCPUs per GPU (GPU pods only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minVCPUPerGPU: Option<u32>,
    /// Network volume to attach.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networkVolumeId: Option<String>,
    /// Data-center allow-list. Omitted entirely when no configured value
    /// survives validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataCenterIds: Option<Vec<String>>,
}

/// Pod descriptor as returned by the REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct PodDescriptor {
    /// Pod ID.
    pub id: String,
    /// Pod name.
    pub name: Option<String>,
    /// Desired status ("RUNNING", "EXITED", ...).
    pub desiredStatus: Option<String>,
    /// Container image name.
    pub imageName: Option<String>,
    /// Exposed port specs.
    pub ports: Option<Vec<String>>,
    /// Runtime details, present while the pod is live.
    pub runtime: Option<PodRuntime>,
    /// Machine ID.
    pub machineId: Option<String>,
    /// Attached network volume ID.
    pub networkVolumeId: Option<String>,
    /// Hourly cost in USD.
    pub costPerHr: Option<f64>,
}

impl PodDescriptor {
    /// Whether the provider reports this pod as running. Exact status match.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.desiredStatus.as_deref() == Some(RUNNING_STATUS)
    }
}

/// Runtime details for a live pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct PodRuntime {
    /// Uptime in seconds.
    pub uptimeInSeconds: Option<u64>,
    /// Exposed port specs, mirrored here on some API versions.
    pub ports: Option<Vec<String>>,
}

/// Serverless endpoint descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct EndpointDescriptor {
    /// Endpoint ID.
    pub id: String,
    /// Endpoint name.
    pub name: Option<String>,
    /// Maximum worker count for this endpoint.
    pub workersMax: Option<u64>,
}

/// Network volume descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct NetworkVolumeDescriptor {
    /// Volume ID.
    pub id: String,
    /// Volume name.
    pub name: Option<String>,
    /// Size in GB.
    pub size: Option<f64>,
    /// Data center hosting the volume.
    pub dataCenterId: Option<String>,
}

/// Point-in-time utilization metrics for a running pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct TelemetryDescriptor {
    /// Observation timestamp.
    pub time: Option<String>,
    /// Telemetry state string.
    pub state: Option<String>,
    /// CPU utilization percent.
    pub cpuUtilization: Option<f64>,
    /// Memory utilization percent.
    pub memoryUtilization: Option<f64>,
    /// Metrics averaged across GPUs.
    pub averageGpuMetrics: Option<GpuMetrics>,
    /// Per-GPU metrics.
    pub individualGpuMetrics: Option<Vec<GpuMetrics>>,
}

/// GPU utilization metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct GpuMetrics {
    /// GPU ID (absent for averages).
    pub id: Option<String>,
    /// Utilization percent.
    pub percentUtilization: Option<f64>,
    /// Memory utilization percent.
    pub memoryUtilization: Option<f64>,
    /// Temperature in Celsius (provider spells it "Celcius").
    pub temperatureCelcius: Option<f64>,
    /// Power draw in watts.
    pub powerWatts: Option<f64>,
}

// ============================================================================
// GraphQL plumbing (internal)
// ============================================================================

#[derive(Debug, Deserialize)]
struct GraphQLResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQLError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQLError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct TelemetryQueryData {
    pod: Option<TelemetryPod>,
}

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct TelemetryPod {
    latestTelemetry: Option<TelemetryDescriptor>,
}

// ============================================================================
// Failure plumbing (internal)
// ============================================================================

#[derive(Debug, Error)]
enum RequestFailure {
    #[error("http error: {0}")]
    Http(reqwest::Error),
    #[error("api error: status={status}, body={body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("json decode error: {0}")]
    Json(String),
    #[error("graphql error: {0}")]
    GraphQL(String),
}

#[inline]
const fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    matches!(
        status.as_u16(),
        408 | 409 | 425 | 429 | 500 | 502 | 503 | 504
    )
}

#[inline]
fn is_retryable_reqwest(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request()
}

#[inline]
fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(Duration::from_secs(10))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_with_ports(ports: Option<Vec<&str>>) -> PodDescriptor {
        PodDescriptor {
            id: "p1".to_string(),
            name: None,
            desiredStatus: Some(RUNNING_STATUS.to_string()),
            imageName: None,
            ports: ports.map(|v| v.into_iter().map(str::to_string).collect()),
            runtime: None,
            machineId: None,
            networkVolumeId: None,
            costPerHr: None,
        }
    }

    #[test]
    fn proxy_url_uses_first_http_port() {
        let pod = pod_with_ports(Some(vec!["22/tcp", "8888/http", "9000/http"]));
        assert_eq!(
            proxy_url(Some(&pod), "p1", DEFAULT_HTTP_PORT),
            "https://p1-8888.proxy.runpod.net"
        );
    }

    #[test]
    fn proxy_url_falls_back_without_descriptor_or_http_port() {
        assert_eq!(
            proxy_url(None, "p1", 8000),
            "https://p1-8000.proxy.runpod.net"
        );

        let tcp_only = pod_with_ports(Some(vec!["22/tcp"]));
        assert_eq!(
            proxy_url(Some(&tcp_only), "p1", 8000),
            "https://p1-8000.proxy.runpod.net"
        );
    }

    #[test]
    fn proxy_url_reads_runtime_ports_when_top_level_missing() {
        let mut pod = pod_with_ports(None);
        pod.runtime = Some(PodRuntime {
            uptimeInSeconds: Some(10),
            ports: Some(vec!["8000/http".to_string()]),
        });
        assert_eq!(
            proxy_url(Some(&pod), "p1", 1234),
            "https://p1-8000.proxy.runpod.net"
        );
    }

    #[test]
    fn running_is_an_exact_status_match() {
        let mut pod = pod_with_ports(None);
        assert!(pod.is_running());
        pod.desiredStatus = Some("Running".to_string());
        assert!(!pod.is_running());
        pod.desiredStatus = None;
        assert!(!pod.is_running());
    }

    #[test]
    fn create_input_omits_unset_compute_fields() {
        let input = CreatePodInput {
            name: "p".to_string(),
            imageName: "img".to_string(),
            cloudType: "SECURE".to_string(),
            volumeInGb: 50,
            containerDiskInGb: 20,
            volumeMountPath: "/workspace".to_string(),
            ports: vec!["8000/http".to_string()],
            env: HashMap::new(),
            computeType: Some("CPU".to_string()),
            vcpuCount: Some(2),
            cpuFlavorIds: None,
            gpuCount: None,
            gpuTypeIds: None,
            minRAMPerGPU: None,
            minVCPUPerGPU: None,
            networkVolumeId: None,
            dataCenterIds: None,
        };

        let value = serde_json::to_value(&input).unwrap();
        let obj = value.as_object().unwrap();
        assert!(obj.contains_key("computeType"));
        assert!(!obj.contains_key("gpuCount"));
        assert!(!obj.contains_key("dataCenterIds"));
    }
}
