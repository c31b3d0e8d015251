//! Engine REST API client.
//!
//! Speaks the container daemon's HTTP API over TCP (`DOCKER_HOST`).
//! Responses are decoded into the narrow structs the platform needs;
//! anything else the daemon returns is ignored.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::warn;

use super::{
    ContainerApi, ContainerFilters, ContainerInfo, ContainerNetwork, ContainerSpec,
    ContainerSummary, DockerError, LogLine, LogStream, NetworkSpec, NetworkSummary,
};

/// reqwest-backed [`ContainerApi`] implementation.
#[derive(Clone)]
pub struct HttpContainerApi {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpContainerApi {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, DockerError> {
        let client = reqwest::Client::builder()
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| DockerError::Http(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, DockerError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        if status.as_u16() == 404 {
            return Err(DockerError::NotFound(message));
        }
        Err(DockerError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, DockerError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| DockerError::Http(e.to_string()))?;
        let resp = Self::check(resp).await?;
        resp.json()
            .await
            .map_err(|e| DockerError::Http(format!("failed to read response: {}", e)))
    }

    async fn post_empty(&self, path: &str, body: serde_json::Value) -> Result<(), DockerError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| DockerError::Http(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct IdResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct ContainerRow {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "Labels", default)]
    labels: BTreeMap<String, String>,
    #[serde(rename = "State", default)]
    state: String,
}

#[derive(Deserialize)]
struct NetworkRow {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Labels", default)]
    labels: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct InspectState {
    #[serde(rename = "Running", default)]
    running: bool,
    #[serde(rename = "Pid", default)]
    pid: i64,
}

#[derive(Deserialize)]
struct InspectConfig {
    #[serde(rename = "Env", default)]
    env: Vec<String>,
    #[serde(rename = "Labels", default)]
    labels: BTreeMap<String, String>,
    #[serde(rename = "Hostname", default)]
    hostname: String,
}

#[derive(Deserialize, Default)]
struct InspectNetwork {
    #[serde(rename = "NetworkID", default)]
    network_id: String,
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

#[derive(Deserialize, Default)]
struct InspectNetworkSettings {
    #[serde(rename = "Networks", default)]
    networks: BTreeMap<String, InspectNetwork>,
}

#[derive(Deserialize)]
struct InspectResponse {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "Config")]
    config: InspectConfig,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: InspectNetworkSettings,
}

fn filters_json(filters: &ContainerFilters) -> String {
    let mut map = serde_json::Map::new();
    if !filters.labels.is_empty() {
        map.insert("label".to_string(), serde_json::json!(filters.labels));
    }
    if !filters.names.is_empty() {
        map.insert("name".to_string(), serde_json::json!(filters.names));
    }
    serde_json::Value::Object(map).to_string()
}

/// Demultiplexes the engine log framing: 8-byte headers
/// `[stream, 0, 0, 0, len_be32]` in front of each payload.
struct LogDemux {
    buf: BytesMut,
    stdout_line: String,
    stderr_line: String,
}

impl LogDemux {
    fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            stdout_line: String::new(),
            stderr_line: String::new(),
        }
    }

    fn push(&mut self, data: &[u8], out: &mut Vec<LogLine>) {
        self.buf.extend_from_slice(data);
        loop {
            if self.buf.len() < 8 {
                return;
            }
            let stream = match self.buf[0] {
                2 => LogStream::Stderr,
                _ => LogStream::Stdout,
            };
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                as usize;
            if self.buf.len() < 8 + len {
                return;
            }
            self.buf.advance(8);
            let payload = self.buf.split_to(len);
            let text = String::from_utf8_lossy(&payload);

            let line_buf = match stream {
                LogStream::Stdout => &mut self.stdout_line,
                LogStream::Stderr => &mut self.stderr_line,
            };
            for ch in text.chars() {
                if ch == '\n' {
                    out.push(LogLine {
                        stream,
                        line: std::mem::take(line_buf),
                    });
                } else {
                    line_buf.push(ch);
                }
            }
        }
    }

    fn finish(&mut self, out: &mut Vec<LogLine>) {
        if !self.stdout_line.is_empty() {
            out.push(LogLine {
                stream: LogStream::Stdout,
                line: std::mem::take(&mut self.stdout_line),
            });
        }
        if !self.stderr_line.is_empty() {
            out.push(LogLine {
                stream: LogStream::Stderr,
                line: std::mem::take(&mut self.stderr_line),
            });
        }
    }
}

#[async_trait]
impl ContainerApi for HttpContainerApi {
    async fn ping(&self) -> Result<(), DockerError> {
        let resp = self
            .client
            .get(self.url("/_ping"))
            .send()
            .await
            .map_err(|e| DockerError::Http(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let mut host_config = serde_json::Map::new();
        if let Some(mode) = &spec.network_mode {
            host_config.insert("NetworkMode".to_string(), serde_json::json!(mode));
        }
        if !spec.binds.is_empty() {
            host_config.insert("Binds".to_string(), serde_json::json!(spec.binds));
        }
        if spec.publish_all_ports {
            host_config.insert("PublishAllPorts".to_string(), serde_json::json!(true));
        }
        if !spec.cap_add.is_empty() {
            host_config.insert("CapAdd".to_string(), serde_json::json!(spec.cap_add));
        }
        if let Some(pid) = &spec.pid_mode {
            host_config.insert("PidMode".to_string(), serde_json::json!(pid));
        }
        if let Some(policy) = &spec.restart_policy {
            host_config.insert(
                "RestartPolicy".to_string(),
                serde_json::json!({ "Name": policy }),
            );
        }
        if !spec.sysctls.is_empty() {
            host_config.insert("Sysctls".to_string(), serde_json::json!(spec.sysctls));
        }
        if !spec.ulimits.is_empty() {
            let ulimits: Vec<serde_json::Value> = spec
                .ulimits
                .iter()
                .map(|u| {
                    serde_json::json!({
                        "Name": u.name,
                        "Soft": u.soft,
                        "Hard": u.hard,
                    })
                })
                .collect();
            host_config.insert("Ulimits".to_string(), serde_json::json!(ulimits));
        }

        let mut body = serde_json::Map::new();
        body.insert("Image".to_string(), serde_json::json!(spec.image));
        if !spec.env.is_empty() {
            body.insert("Env".to_string(), serde_json::json!(spec.env));
        }
        if !spec.labels.is_empty() {
            body.insert("Labels".to_string(), serde_json::json!(spec.labels));
        }
        if !spec.entrypoint.is_empty() {
            body.insert("Entrypoint".to_string(), serde_json::json!(spec.entrypoint));
        }
        if !spec.cmd.is_empty() {
            body.insert("Cmd".to_string(), serde_json::json!(spec.cmd));
        }
        body.insert(
            "HostConfig".to_string(),
            serde_json::Value::Object(host_config),
        );

        let path = format!("/containers/create?name={}", spec.name);
        let resp: IdResponse = self
            .post_json(&path, serde_json::Value::Object(body))
            .await?;
        Ok(resp.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.post_empty(&format!("/containers/{}/start", id), serde_json::json!({}))
            .await
    }

    async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        #[derive(Deserialize)]
        struct WaitResponse {
            #[serde(rename = "StatusCode")]
            status_code: i64,
        }
        let resp: WaitResponse = self
            .post_json(&format!("/containers/{}/wait", id), serde_json::json!({}))
            .await?;
        Ok(resp.status_code)
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError> {
        let resp = self
            .client
            .delete(self.url(&format!("/containers/{}?force={}", id, force)))
            .send()
            .await
            .map_err(|e| DockerError::Http(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn list_containers(
        &self,
        filters: &ContainerFilters,
        all: bool,
    ) -> Result<Vec<ContainerSummary>, DockerError> {
        let path = format!(
            "/containers/json?all={}&filters={}",
            all,
            urlencode(&filters_json(filters))
        );
        let resp = self
            .client
            .get(self.url(&path))
            .send()
            .await
            .map_err(|e| DockerError::Http(e.to_string()))?;
        let resp = Self::check(resp).await?;
        let rows: Vec<ContainerRow> = resp
            .json()
            .await
            .map_err(|e| DockerError::Http(format!("failed to read response: {}", e)))?;
        Ok(rows
            .into_iter()
            .map(|r| ContainerSummary {
                id: r.id,
                names: r.names,
                labels: r.labels,
                state: r.state,
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, DockerError> {
        let resp = self
            .client
            .get(self.url(&format!("/containers/{}/json", id)))
            .send()
            .await
            .map_err(|e| DockerError::Http(e.to_string()))?;
        let resp = Self::check(resp).await?;
        let raw: InspectResponse = resp
            .json()
            .await
            .map_err(|e| DockerError::Http(format!("failed to read response: {}", e)))?;
        Ok(ContainerInfo {
            id: raw.id,
            running: raw.state.running,
            pid: raw.state.pid,
            env: raw.config.env,
            labels: raw.config.labels,
            hostname: raw.config.hostname,
            networks: raw
                .network_settings
                .networks
                .into_iter()
                .map(|(name, n)| {
                    (
                        name,
                        ContainerNetwork {
                            network_id: n.network_id,
                            ip_address: n.ip_address,
                        },
                    )
                })
                .collect(),
        })
    }

    async fn container_logs(
        &self,
        id: &str,
        follow: bool,
    ) -> Result<mpsc::Receiver<LogLine>, DockerError> {
        let path = format!(
            "/containers/{}/logs?stdout=true&stderr=true&follow={}",
            id, follow
        );
        let resp = self
            .client
            .get(self.url(&path))
            .send()
            .await
            .map_err(|e| DockerError::Http(e.to_string()))?;
        let resp = Self::check(resp).await?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut demux = LogDemux::new();
            let mut lines = Vec::new();
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else {
                    warn!("container log stream error; closing");
                    break;
                };
                demux.push(&chunk, &mut lines);
                for line in lines.drain(..) {
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            }
            demux.finish(&mut lines);
            for line in lines {
                if tx.send(line).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, DockerError> {
        let body = serde_json::json!({
            "Name": spec.name,
            "Driver": "bridge",
            "Internal": spec.internal,
            "Labels": spec.labels,
            "IPAM": {
                "Config": [{ "Subnet": spec.subnet, "Gateway": spec.gateway }],
            },
        });
        let resp: IdResponse = self.post_json("/networks/create", body).await?;
        Ok(resp.id)
    }

    async fn remove_network(&self, id: &str) -> Result<(), DockerError> {
        let resp = self
            .client
            .delete(self.url(&format!("/networks/{}", id)))
            .send()
            .await
            .map_err(|e| DockerError::Http(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), DockerError> {
        self.post_empty(
            &format!("/networks/{}/connect", network),
            serde_json::json!({ "Container": container }),
        )
        .await
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<(), DockerError> {
        self.post_empty(
            &format!("/networks/{}/disconnect", network),
            serde_json::json!({ "Container": container, "Force": force }),
        )
        .await
    }

    async fn list_networks(
        &self,
        label_filter: Option<&str>,
    ) -> Result<Vec<NetworkSummary>, DockerError> {
        let path = match label_filter {
            Some(label) => format!(
                "/networks?filters={}",
                urlencode(&serde_json::json!({ "label": [label] }).to_string())
            ),
            None => "/networks".to_string(),
        };
        let resp = self
            .client
            .get(self.url(&path))
            .send()
            .await
            .map_err(|e| DockerError::Http(e.to_string()))?;
        let resp = Self::check(resp).await?;
        let rows: Vec<NetworkRow> = resp
            .json()
            .await
            .map_err(|e| DockerError::Http(format!("failed to read response: {}", e)))?;
        Ok(rows
            .into_iter()
            .map(|r| NetworkSummary {
                id: r.id,
                name: r.name,
                labels: r.labels,
            })
            .collect())
    }
}

/// Percent-encodes the characters that matter inside a filters query
/// value.
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
