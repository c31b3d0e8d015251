//! Cluster API server client.
//!
//! Plain REST over reqwest for nodes, pods, logs and deletions; the exec
//! subresource upgrades to a WebSocket using the `channel.k8s.io`
//! subprotocol, where every frame is prefixed with a channel byte
//! (1 = stdout, 2 = stderr, 3 = error).

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use crate::config::ClusterConfig;

use super::{
    cpu_quantity_millis, ClusterApi, ClusterError, ListParams, NodeInfo, PodInfo, PodPhase,
    PodSpec,
};

/// reqwest-backed [`ClusterApi`] implementation.
#[derive(Clone)]
pub struct HttpClusterApi {
    endpoint: String,
    namespace: String,
    bearer_token: Option<String>,
    client: reqwest::Client,
}

impl HttpClusterApi {
    pub fn new(config: &ClusterConfig) -> Result<Self, ClusterError> {
        let client = reqwest::Client::builder()
            // Cluster API endpoints routinely present self-signed chains
            // inside the trust boundary the daemon operates in.
            .danger_accept_invalid_certs(true)
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| ClusterError::Http(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            bearer_token: config.bearer_token.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ClusterError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        if status.as_u16() == 404 {
            return Err(ClusterError::NotFound(message));
        }
        Err(ClusterError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, ClusterError> {
        let resp = self
            .authorize(self.client.get(self.url(path)))
            .send()
            .await
            .map_err(|e| ClusterError::Http(e.to_string()))?;
        let resp = Self::check(resp).await?;
        resp.json()
            .await
            .map_err(|e| ClusterError::Http(format!("failed to read response: {}", e)))
    }

    fn pod_manifest(&self, spec: &PodSpec) -> serde_json::Value {
        let env: Vec<serde_json::Value> = spec
            .env
            .iter()
            .map(|(k, v)| serde_json::json!({ "name": k, "value": v }))
            .collect();

        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        if let Some(claim) = &spec.volume_claim {
            volumes.push(serde_json::json!({
                "name": "outputs-shared",
                "persistentVolumeClaim": { "claimName": claim },
            }));
            mounts.push(serde_json::json!({
                "name": "outputs-shared",
                "mountPath": spec.mount_path,
                "mountPropagation": "HostToContainer",
            }));
        }

        let mut resources = serde_json::Map::new();
        let mut limits = serde_json::Map::new();
        if let Some(cpu) = &spec.cpu_limit {
            limits.insert("cpu".to_string(), serde_json::json!(cpu));
        }
        if let Some(memory) = &spec.memory_limit {
            limits.insert("memory".to_string(), serde_json::json!(memory));
        }
        if !limits.is_empty() {
            resources.insert("limits".to_string(), serde_json::Value::Object(limits));
        }

        let mut container = serde_json::json!({
            "name": spec.name,
            "image": spec.image,
            "env": env,
            "volumeMounts": mounts,
            "resources": serde_json::Value::Object(resources),
        });
        if !spec.command.is_empty() {
            container["command"] = serde_json::json!(spec.command);
        }
        if !spec.args.is_empty() {
            container["args"] = serde_json::json!(spec.args);
        }

        let init_containers: Vec<serde_json::Value> = match &spec.init_mkdir_path {
            Some(path) => vec![serde_json::json!({
                "name": "mkdir-outputs",
                "image": "busybox",
                "command": ["sh"],
                "args": ["-c", format!("mkdir -p {}", path)],
                "volumeMounts": [{
                    "name": "outputs-shared",
                    "mountPath": spec.mount_path,
                    "mountPropagation": "HostToContainer",
                }],
            })],
            None => vec![],
        };

        let sysctls: Vec<serde_json::Value> = spec
            .sysctls
            .iter()
            .map(|(k, v)| serde_json::json!({ "name": k, "value": v }))
            .collect();

        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": spec.name,
                "labels": spec.labels,
                "annotations": spec.annotations,
            },
            "spec": {
                "restartPolicy": "Never",
                "securityContext": { "sysctls": sysctls },
                "nodeSelector": spec.node_selector,
                "volumes": volumes,
                "initContainers": init_containers,
                "containers": [container],
            },
        })
    }
}

#[derive(Deserialize)]
struct KubeList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct KubeMeta {
    name: String,
}

#[derive(Deserialize)]
struct NodeStatus {
    #[serde(default)]
    allocatable: std::collections::BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct NodeItem {
    metadata: KubeMeta,
    status: NodeStatus,
}

#[derive(Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: String,
}

#[derive(Deserialize)]
struct PodItem {
    metadata: KubeMeta,
    status: PodStatus,
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() * 3);
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

#[async_trait]
impl ClusterApi for HttpClusterApi {
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<NodeInfo>, ClusterError> {
        let path = format!("/api/v1/nodes?labelSelector={}", urlencode(label_selector));
        let list: KubeList<NodeItem> = self.get_json(&path).await?;
        Ok(list
            .items
            .into_iter()
            .map(|n| NodeInfo {
                allocatable_cpu_millis: n
                    .status
                    .allocatable
                    .get("cpu")
                    .and_then(|q| cpu_quantity_millis(q))
                    .unwrap_or(0),
                name: n.metadata.name,
            })
            .collect())
    }

    async fn create_pod(&self, spec: &PodSpec) -> Result<(), ClusterError> {
        let path = format!("/api/v1/namespaces/{}/pods", self.namespace);
        let resp = self
            .authorize(self.client.post(self.url(&path)))
            .json(&self.pod_manifest(spec))
            .send()
            .await
            .map_err(|e| ClusterError::Http(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn list_pods(&self, params: &ListParams) -> Result<Vec<PodInfo>, ClusterError> {
        let mut path = format!("/api/v1/namespaces/{}/pods?", self.namespace);
        if let Some(sel) = &params.label_selector {
            path.push_str(&format!("labelSelector={}&", urlencode(sel)));
        }
        if let Some(sel) = &params.field_selector {
            path.push_str(&format!("fieldSelector={}&", urlencode(sel)));
        }
        let list: KubeList<PodItem> = self.get_json(&path).await?;
        Ok(list
            .items
            .into_iter()
            .map(|p| PodInfo {
                name: p.metadata.name,
                phase: PodPhase::parse(&p.status.phase),
            })
            .collect())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        let path = format!("/api/v1/namespaces/{}/pods/{}", self.namespace, name);
        let resp = self
            .authorize(self.client.delete(self.url(&path)))
            .send()
            .await
            .map_err(|e| ClusterError::Http(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn delete_pods_by_label(&self, label_selector: &str) -> Result<(), ClusterError> {
        let path = format!(
            "/api/v1/namespaces/{}/pods?labelSelector={}",
            self.namespace,
            urlencode(label_selector)
        );
        let resp = self
            .authorize(self.client.delete(self.url(&path)))
            .send()
            .await
            .map_err(|e| ClusterError::Http(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn pod_logs(
        &self,
        name: &str,
        follow: bool,
        tail_lines: Option<i64>,
    ) -> Result<mpsc::Receiver<String>, ClusterError> {
        let mut path = format!(
            "/api/v1/namespaces/{}/pods/{}/log?follow={}",
            self.namespace, name, follow
        );
        if let Some(tail) = tail_lines {
            path.push_str(&format!("&tailLines={}", tail));
        }
        let resp = self
            .authorize(self.client.get(self.url(&path)))
            .send()
            .await
            .map_err(|e| ClusterError::Http(e.to_string()))?;
        let resp = Self::check(resp).await?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buf = String::new();
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else {
                    warn!("pod log stream error; closing");
                    break;
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].to_string();
                    buf.drain(..=pos);
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            }
            if !buf.is_empty() {
                let _ = tx.send(buf).await;
            }
        });
        Ok(rx)
    }

    async fn exec_pod(
        &self,
        name: &str,
        container: &str,
        command: &[String],
    ) -> Result<mpsc::Receiver<Bytes>, ClusterError> {
        let mut query = format!("container={}&stdout=true&stderr=false", container);
        for arg in command {
            query.push_str(&format!("&command={}", urlencode(arg)));
        }

        let ws_endpoint = self
            .endpoint
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}/exec?{}",
            ws_endpoint, self.namespace, name, query
        );

        let mut request = url
            .into_client_request()
            .map_err(|e| ClusterError::Exec(e.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            "v4.channel.k8s.io"
                .parse()
                .map_err(|_| ClusterError::Exec("invalid subprotocol header".to_string()))?,
        );
        if let Some(token) = &self.bearer_token {
            request.headers_mut().insert(
                "Authorization",
                format!("Bearer {}", token)
                    .parse()
                    .map_err(|_| ClusterError::Exec("invalid bearer token".to_string()))?,
            );
        }

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ClusterError::Exec(format!("exec upgrade failed: {}", e)))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let (_, mut read) = futures::StreamExt::split(ws);
            while let Some(frame) = read.next().await {
                let data = match frame {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                // First byte selects the channel; 1 is stdout.
                if data.first() == Some(&1) && data.len() > 1 {
                    if tx.send(Bytes::copy_from_slice(&data[1..])).await.is_err() {
                        return;
                    }
                } else if data.first() == Some(&3) && data.len() > 1 {
                    warn!(
                        error = %String::from_utf8_lossy(&data[1..]),
                        "exec channel reported an error"
                    );
                }
            }
        });
        Ok(rx)
    }
}
