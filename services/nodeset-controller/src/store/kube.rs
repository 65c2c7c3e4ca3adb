//! Kubernetes REST backend.
//!
//! Plain JSON over HTTPS against the API server. Watches are emulated by
//! periodically listing each kind and diffing resource versions, which is
//! enough for a controller that also resyncs on a timer.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Api, ObjectStore, StoreError, StoreResult, WatchEvent};
use crate::api::{
    ControllerRevision, Node, NodeSet, ObjectKey, PersistentVolumeClaim, Pod, Resource, Service,
};

const WATCH_CAPACITY: usize = 1024;
const MERGE_PATCH: &str = "application/merge-patch+json";

/// Authenticated HTTP access to the API server.
#[derive(Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl KubeClient {
    pub fn new(base_url: &str, token: Option<String>, ca_pem: Option<&[u8]>) -> StoreResult<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Some(pem) = ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| StoreError::Transport(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// Failure body returned by the API server.
#[derive(Debug, Default, Deserialize)]
struct Status {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: StatusDetails,
}

#[derive(Debug, Default, Deserialize)]
struct StatusDetails {
    #[serde(default)]
    causes: Vec<StatusCause>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusCause {
    #[serde(default, rename = "reason")]
    cause_type: String,
}

impl Status {
    fn has_cause(&self, cause: &str) -> bool {
        self.details.causes.iter().any(|c| c.cause_type == cause)
    }
}

/// One kind over REST.
pub struct KubeApi<T: Resource> {
    client: KubeClient,
    events: broadcast::Sender<WatchEvent<T>>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Resource> KubeApi<T> {
    pub fn new(client: KubeClient) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            client,
            events,
            _kind: PhantomData,
        }
    }

    fn collection_url(&self, namespace: &str) -> String {
        let group = if T::API_VERSION.contains('/') {
            format!("apis/{}", T::API_VERSION)
        } else {
            format!("api/{}", T::API_VERSION)
        };
        if T::NAMESPACED && !namespace.is_empty() {
            format!(
                "{}/{}/namespaces/{}/{}",
                self.client.base_url, group, namespace, T::PLURAL
            )
        } else {
            format!("{}/{}/{}", self.client.base_url, group, T::PLURAL)
        }
    }

    fn object_url(&self, key: &ObjectKey) -> String {
        format!("{}/{}", self.collection_url(&key.namespace), key.name)
    }

    fn body(obj: &T) -> StoreResult<Value> {
        let mut value = serde_json::to_value(obj).map_err(|e| StoreError::Invalid {
            kind: T::KIND,
            key: obj.key().to_string(),
            reason: e.to_string(),
        })?;
        if let Value::Object(map) = &mut value {
            map.insert("apiVersion".into(), T::API_VERSION.into());
            map.insert("kind".into(), T::KIND.into());
        }
        Ok(value)
    }

    async fn send(&self, request: RequestBuilder, key: &ObjectKey) -> StoreResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body: Status = response.json().await.unwrap_or_default();
        let key = key.to_string();
        let err = match status {
            StatusCode::NOT_FOUND => StoreError::NotFound { kind: T::KIND, key },
            StatusCode::CONFLICT if body.reason == "AlreadyExists" => {
                StoreError::AlreadyExists { kind: T::KIND, key }
            }
            StatusCode::CONFLICT => StoreError::Conflict {
                kind: T::KIND,
                key,
                reason: body.message,
            },
            StatusCode::FORBIDDEN if body.has_cause("NamespaceTerminating") => {
                StoreError::NamespaceTerminating { kind: T::KIND, key }
            }
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => StoreError::Invalid {
                kind: T::KIND,
                key,
                reason: body.message,
            },
            other => StoreError::Transport(format!("{other}: {}", body.message)),
        };
        Err(err)
    }

    async fn decode(response: reqwest::Response) -> StoreResult<Arc<T>> {
        response
            .json::<T>()
            .await
            .map(Arc::new)
            .map_err(|e| StoreError::Transport(format!("decode {}: {e}", T::KIND)))
    }

    /// Poll the collection and broadcast differences until shutdown.
    pub async fn run_watch(
        self: Arc<Self>,
        namespace: String,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut seen: HashMap<ObjectKey, Arc<T>> = HashMap::new();
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(&namespace, &mut seen).await {
                        warn!(kind = T::KIND, error = %e, "Watch poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(kind = T::KIND, "Watch poller shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn poll_once(
        &self,
        namespace: &str,
        seen: &mut HashMap<ObjectKey, Arc<T>>,
    ) -> StoreResult<()> {
        let items = self.list(namespace).await?;
        let mut current = HashMap::with_capacity(items.len());

        for item in items {
            let key = item.key();
            match seen.remove(&key) {
                None => {
                    let _ = self.events.send(WatchEvent::Added(Arc::clone(&item)));
                }
                Some(old) if old.meta().resource_version != item.meta().resource_version => {
                    let _ = self.events.send(WatchEvent::Modified {
                        old,
                        new: Arc::clone(&item),
                    });
                }
                Some(_) => {}
            }
            current.insert(key, item);
        }
        for (_, gone) in seen.drain() {
            let _ = self.events.send(WatchEvent::Deleted(gone));
        }
        *seen = current;
        Ok(())
    }
}

#[async_trait]
impl<T: Resource> Api<T> for KubeApi<T> {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Arc<T>> {
        let request = self.client.request(Method::GET, &self.object_url(key));
        Self::decode(self.send(request, key).await?).await
    }

    async fn list(&self, namespace: &str) -> StoreResult<Vec<Arc<T>>> {
        let key = ObjectKey::new(namespace, "");
        let request = self
            .client
            .request(Method::GET, &self.collection_url(namespace));
        let list: ObjectList<T> = self
            .send(request, &key)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Transport(format!("decode {} list: {e}", T::KIND)))?;
        Ok(list.items.into_iter().map(Arc::new).collect())
    }

    async fn create(&self, obj: &T) -> StoreResult<Arc<T>> {
        let key = obj.key();
        let request = self
            .client
            .request(Method::POST, &self.collection_url(&key.namespace))
            .json(&Self::body(obj)?);
        Self::decode(self.send(request, &key).await?).await
    }

    async fn update(&self, obj: &T) -> StoreResult<Arc<T>> {
        let key = obj.key();
        let request = self
            .client
            .request(Method::PUT, &self.object_url(&key))
            .json(&Self::body(obj)?);
        Self::decode(self.send(request, &key).await?).await
    }

    async fn update_status(&self, obj: &T) -> StoreResult<Arc<T>> {
        let key = obj.key();
        let url = format!("{}/status", self.object_url(&key));
        let request = self
            .client
            .request(Method::PUT, &url)
            .json(&Self::body(obj)?);
        Self::decode(self.send(request, &key).await?).await
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> StoreResult<Arc<T>> {
        let body = serde_json::to_vec(patch).map_err(|e| StoreError::Invalid {
            kind: T::KIND,
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let request = self
            .client
            .request(Method::PATCH, &self.object_url(key))
            .header(reqwest::header::CONTENT_TYPE, MERGE_PATCH)
            .body(body);
        Self::decode(self.send(request, key).await?).await
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let request = self.client.request(Method::DELETE, &self.object_url(key));
        self.send(request, key).await?;
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.events.subscribe()
    }
}

/// All kinds over REST.
pub struct KubeStore {
    nodesets: Arc<KubeApi<NodeSet>>,
    pods: Arc<KubeApi<Pod>>,
    claims: Arc<KubeApi<PersistentVolumeClaim>>,
    services: Arc<KubeApi<Service>>,
    revisions: Arc<KubeApi<ControllerRevision>>,
    nodes: Arc<KubeApi<Node>>,
}

impl KubeStore {
    pub fn new(client: KubeClient) -> Self {
        Self {
            nodesets: Arc::new(KubeApi::new(client.clone())),
            pods: Arc::new(KubeApi::new(client.clone())),
            claims: Arc::new(KubeApi::new(client.clone())),
            services: Arc::new(KubeApi::new(client.clone())),
            revisions: Arc::new(KubeApi::new(client.clone())),
            nodes: Arc::new(KubeApi::new(client)),
        }
    }

    /// Start one poller per kind. Claims and services are only written, so
    /// they are not watched.
    pub fn spawn_watchers(
        &self,
        namespace: &str,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let ns = namespace.to_string();
        vec![
            tokio::spawn(Arc::clone(&self.nodesets).run_watch(ns.clone(), interval, shutdown.clone())),
            tokio::spawn(Arc::clone(&self.pods).run_watch(ns.clone(), interval, shutdown.clone())),
            tokio::spawn(Arc::clone(&self.revisions).run_watch(ns, interval, shutdown.clone())),
            tokio::spawn(Arc::clone(&self.nodes).run_watch(String::new(), interval, shutdown)),
        ]
    }
}

impl ObjectStore for KubeStore {
    fn nodesets(&self) -> &dyn Api<NodeSet> {
        self.nodesets.as_ref()
    }

    fn pods(&self) -> &dyn Api<Pod> {
        self.pods.as_ref()
    }

    fn claims(&self) -> &dyn Api<PersistentVolumeClaim> {
        self.claims.as_ref()
    }

    fn services(&self) -> &dyn Api<Service> {
        self.services.as_ref()
    }

    fn revisions(&self) -> &dyn Api<ControllerRevision> {
        self.revisions.as_ref()
    }

    fn nodes(&self) -> &dyn Api<Node> {
        self.nodes.as_ref()
    }
}
