//! slurmrestd HTTP client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Job, Node, NodeUpdate, SlurmClient, SlurmError, SlurmResult};

const API_VERSION: &str = "v0.0.43";
const TOKEN_HEADER: &str = "X-SLURM-USER-TOKEN";

/// How long a node listing is served from cache.
const NODE_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    description: String,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct NodesResponse {
    #[serde(default)]
    nodes: Vec<Node>,
}

#[derive(Debug, Deserialize)]
struct JobsResponse {
    #[serde(default)]
    jobs: Vec<Job>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorsResponse {
    #[serde(default)]
    errors: Vec<ApiError>,
}

/// Client for one slurmrestd endpoint.
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    node_cache: Mutex<Option<(Instant, Vec<Node>)>>,
}

impl RestClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> SlurmResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SlurmError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            node_cache: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/slurm/{}/{}", self.base_url, API_VERSION, path)
    }

    async fn check(&self, response: reqwest::Response, what: &str) -> SlurmResult<reqwest::Response> {
        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => return Err(SlurmError::NotFound(what.to_string())),
            StatusCode::NO_CONTENT => return Err(SlurmError::NoContent),
            s if s.is_success() => return Ok(response),
            _ => {}
        }
        let body: ErrorsResponse = response.json().await.unwrap_or_default();
        let message = body
            .errors
            .iter()
            .map(|e| {
                if e.description.is_empty() {
                    e.error.clone()
                } else {
                    e.description.clone()
                }
            })
            .collect::<Vec<_>>()
            .join("; ");
        Err(SlurmError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, what: &str) -> SlurmResult<T> {
        let response = self
            .client
            .get(self.url(path))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(|e| SlurmError::Transport(e.to_string()))?;
        self.check(response, what)
            .await?
            .json()
            .await
            .map_err(|e| SlurmError::Decode(e.to_string()))
    }
}

#[async_trait]
impl SlurmClient for RestClient {
    async fn list_nodes(&self, refresh: bool) -> SlurmResult<Vec<Node>> {
        let mut cache = self.node_cache.lock().await;
        if !refresh {
            if let Some((fetched, nodes)) = cache.as_ref() {
                if fetched.elapsed() < NODE_CACHE_TTL {
                    return Ok(nodes.clone());
                }
            }
        }

        let response: NodesResponse = self.get_json("nodes", "nodes").await?;
        debug!(count = response.nodes.len(), "Fetched slurm nodes");
        *cache = Some((Instant::now(), response.nodes.clone()));
        Ok(response.nodes)
    }

    async fn get_node(&self, name: &str) -> SlurmResult<Node> {
        let response: NodesResponse = self.get_json(&format!("node/{name}"), name).await?;
        response
            .nodes
            .into_iter()
            .next()
            .ok_or_else(|| SlurmError::NotFound(name.to_string()))
    }

    async fn update_node(&self, name: &str, update: &NodeUpdate) -> SlurmResult<()> {
        let response = self
            .client
            .post(self.url(&format!("node/{name}")))
            .header(TOKEN_HEADER, &self.token)
            .json(update)
            .send()
            .await
            .map_err(|e| SlurmError::Transport(e.to_string()))?;
        self.check(response, name).await?;
        // later reads must see the change
        *self.node_cache.lock().await = None;
        Ok(())
    }

    async fn list_jobs(&self) -> SlurmResult<Vec<Job>> {
        let response: JobsResponse = self.get_json("jobs", "jobs").await?;
        Ok(response.jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slurm::{NodeState, UpdateState};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_list_nodes_uses_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slurm/v0.0.43/nodes"))
            .and(header(TOKEN_HEADER, "jwt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "nodes": [{"name": "compute-0", "state": ["IDLE"]}]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client = RestClient::new(&server.uri(), "jwt").unwrap();
        let nodes = client.list_nodes(false).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].state, vec![NodeState::Idle]);

        client.list_nodes(false).await.unwrap();
        client.list_nodes(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_node_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slurm/v0.0.43/node/compute-9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = RestClient::new(&server.uri(), "jwt").unwrap();
        let err = client.get_node("compute-9").await.unwrap_err();
        assert_eq!(err, SlurmError::NotFound("compute-9".into()));
        assert!(err.is_tolerated());
    }

    #[tokio::test]
    async fn test_update_node_posts_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/slurm/v0.0.43/node/compute-0"))
            .and(body_json(serde_json::json!({
                "state": ["DRAIN"],
                "reason": "slurm-operator: scale in"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = RestClient::new(&server.uri(), "jwt").unwrap();
        client
            .update_node(
                "compute-0",
                &NodeUpdate {
                    state: vec![UpdateState::Drain],
                    reason: Some("slurm-operator: scale in".into()),
                    comment: None,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_api_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slurm/v0.0.43/jobs"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "errors": [{"description": "slurmctld unreachable", "error": "x"}]
            })))
            .mount(&server)
            .await;

        let client = RestClient::new(&server.uri(), "jwt").unwrap();
        let err = client.list_jobs().await.unwrap_err();
        assert_eq!(
            err,
            SlurmError::Api {
                status: 500,
                message: "slurmctld unreachable".into()
            }
        );
    }
}
