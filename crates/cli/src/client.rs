//! API client for communicating with the pinning agent

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pinning_lib::{
    devicemanager::Device, topologymanager::PodAdmitResult, HealthResponse, NodeSnapshot, Pod,
};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

/// API client for the agent's HTTP API
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

/// Body of `GET /v1/state`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub generated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub snapshot: NodeSnapshot,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid agent URL")?;

        Ok(Self { client, base_url })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Agent URL cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send the request and decode the body of a success response, or of one
    /// of the `accepted` error statuses.
    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        accepted: &[StatusCode],
    ) -> Result<T> {
        let response = request.send().await.context("Failed to send request")?;

        let status = response.status();
        if !status.is_success() && !accepted.contains(&status) {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }

    async fn execute_empty(&self, request: RequestBuilder) -> Result<()> {
        let response = request.send().await.context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }
        Ok(())
    }

    pub async fn state(&self) -> Result<NodeState> {
        let url = self.url(&["v1", "state"])?;
        self.execute(self.client.get(url), &[]).await
    }

    /// Rejections come back as a result with `admit == false`, not an error.
    pub async fn admit(&self, pod: &Pod) -> Result<PodAdmitResult> {
        let url = self.url(&["v1", "admit"])?;
        self.execute(self.client.post(url).json(pod), &[StatusCode::FORBIDDEN])
            .await
    }

    pub async fn remove_pod(&self, pod_uid: &str) -> Result<()> {
        let url = self.url(&["v1", "pods", pod_uid])?;
        self.execute_empty(self.client.delete(url)).await
    }

    pub async fn register_devices(&self, resource: &str, devices: &[Device]) -> Result<()> {
        let url = self.url(&["v1", "devices", resource])?;
        self.execute_empty(self.client.post(url).json(devices)).await
    }

    /// Unhealthy agents answer 503 with the same body.
    pub async fn health(&self) -> Result<HealthResponse> {
        let url = self.url(&["healthz"])?;
        self.execute(self.client.get(url), &[StatusCode::SERVICE_UNAVAILABLE])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinning_lib::health::ComponentStatus;
    use serde_json::json;

    fn pod() -> Pod {
        serde_json::from_value(json!({
            "uid": "p1",
            "name": "web",
            "containers": [{"name": "app"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_admit_accepts_rejection_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/admit")
            .with_status(403)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "admit": false,
                    "reason": "TopologyAffinityError",
                    "message": "Resources cannot be allocated with Topology locality"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let result = client.admit(&pod()).await.unwrap();

        mock.assert_async().await;
        assert!(!result.admit);
        assert_eq!(result.reason.as_deref(), Some("TopologyAffinityError"));
    }

    #[tokio::test]
    async fn test_resource_names_are_escaped() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/devices/vendor.com%2Fgpu")
            .with_status(204)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        client
            .register_devices("vendor.com/gpu", &[Device::new("gpu0", &[0])])
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_remove_pod_surfaces_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/v1/pods/p1")
            .with_status(500)
            .with_body(r#"{"error":"failed to persist cpu assignments"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client.remove_pod("p1").await.unwrap_err();

        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_health_accepts_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/healthz")
            .with_status(503)
            .with_body(
                json!({
                    "status": "unhealthy",
                    "components": {
                        "cpu_manager": {
                            "status": "unhealthy",
                            "message": "invalid state",
                            "last_check_timestamp": 1700000000
                        }
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let health = client.health().await.unwrap();

        assert_eq!(health.status, ComponentStatus::Unhealthy);
        assert_eq!(health.components.len(), 1);
    }
}
