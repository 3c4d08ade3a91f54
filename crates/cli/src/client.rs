//! API client for the fleet manager HTTP API

use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Failures talking to the manager
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Status { status: StatusCode, message: String },
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

/// API client for the fleet manager
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let base_url = Url::parse(base_url)?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.get_with_query(path, &[]).await
    }

    /// Make a GET request with query parameters
    pub async fn get_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = self.base_url.join(path)?;
        let response = self.client.get(url).query(query).send().await?;
        Self::decode(response).await
    }

    /// GET returning the status code alongside the body, for endpoints that
    /// answer with a JSON body on failure too
    pub async fn probe<T: DeserializeOwned>(&self, path: &str) -> Result<(StatusCode, T), ApiError> {
        let url = self.base_url.join(path)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        Ok((status, response.json().await?))
    }

    /// Make a POST request with JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.base_url.join(path)?;
        let response = self.client.post(url).json(body).send().await?;
        Self::decode(response).await
    }

    /// Make a DELETE request
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.base_url.join(path)?;
        let response = self.client.delete(url).send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(ApiError::Status { status, message });
        }
        Ok(response.json().await?)
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetric {
    pub cpu: f64,
    pub memory: f64,
    pub usage_cpu: f64,
    pub usage_memory: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceKey {
    pub instance_id: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub agent_ip: String,
    #[serde(default)]
    pub metric: AgentMetric,
    #[serde(default)]
    pub running_instances: Vec<InstanceKey>,
    pub last_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRuntime {
    pub instance_id: String,
    pub version: String,
    pub status: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub agent_ip: String,
    pub last_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancePeak {
    pub instance_id: String,
    pub version: String,
    pub cpu: f64,
    pub cpu_time: i64,
    pub memory: f64,
    pub memory_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub instance_id: String,
    pub version: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub instance_id: String,
    pub version: String,
    pub action: String,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub components: std::collections::BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_get_agents() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/agents")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"agent_id":"a1","agent_ip":"10.0.0.1","registered_at":1,"last_timestamp":2}]"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let agents: Vec<Agent> = client.get("api/v1/agents").await.unwrap();

        mock.assert_async().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].agent_ip, "10.0.0.1");
        assert!(agents[0].running_instances.is_empty());
    }

    #[tokio::test]
    async fn test_query_parameters_are_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/runtimes")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("status".into(), "running".into()),
                Matcher::UrlEncoded("agent".into(), "a1".into()),
            ]))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let runtimes: Vec<PluginRuntime> = client
            .get_with_query(
                "api/v1/runtimes",
                &[("status", "running".to_string()), ("agent", "a1".to_string())],
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert!(runtimes.is_empty());
    }

    #[tokio::test]
    async fn test_error_body_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/api/v1/agents/ghost")
            .with_status(404)
            .with_body(r#"{"error":"agent ghost not found"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client
            .delete::<Agent>("api/v1/agents/ghost")
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "API error (404 Not Found): agent ghost not found");
    }

    #[tokio::test]
    async fn test_probe_reads_body_on_503() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/readyz")
            .with_status(503)
            .with_body(r#"{"ready":false,"reason":"Unhealthy components: store"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let (status, readiness): (_, ReadinessResponse) = client.probe("readyz").await.unwrap();

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Unhealthy components: store"));
    }

    #[tokio::test]
    async fn test_post_task() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/tasks")
            .match_body(Matcher::Json(serde_json::json!({
                "instance_id": "p1",
                "version": "2",
                "action": "stop"
            })))
            .with_status(202)
            .with_body(r#"{"instance_id":"p1","version":"2","action":"stop","retry_count":0}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let task: ScheduledTask = client
            .post(
                "api/v1/tasks",
                &TaskRequest {
                    instance_id: "p1".into(),
                    version: "2".into(),
                    action: "stop".into(),
                },
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(task.action, "stop");
    }
}
