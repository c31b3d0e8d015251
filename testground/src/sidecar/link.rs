//! Network namespace and traffic-control plumbing.
//!
//! The sidecar manipulates instance networking by entering the
//! container's network namespace (by pid, via `nsenter`) and driving
//! `ip`/`tc`. Bandwidth caps map to a token-bucket qdisc; latency,
//! jitter, loss, corruption and duplication map to netem. Everything
//! shells through the [`CommandRunner`] trait so tests can intercept the
//! exact invocations.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::sync::LinkShape;

use super::SidecarError;

/// Executes host commands. Production uses [`HostCommandRunner`]; tests
/// record invocations instead.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a command and returns its stdout. Non-zero exit is an error.
    async fn run(&self, program: &str, args: &[String]) -> Result<String, SidecarError>;

    /// Runs a command with extra environment and bytes on stdin.
    async fn run_with_stdin(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
        stdin: &[u8],
    ) -> Result<String, SidecarError>;
}

/// Real command runner using the host toolchain.
pub struct HostCommandRunner;

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, SidecarError> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| SidecarError::Command(format!("{}: {}", program, e)))?;
        if !output.status.success() {
            return Err(SidecarError::Command(format!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run_with_stdin(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
        stdin: &[u8],
    ) -> Result<String, SidecarError> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| SidecarError::Command(format!("{}: {}", program, e)))?;
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin)
                .await
                .map_err(|e| SidecarError::Command(format!("{} stdin: {}", program, e)))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SidecarError::Command(format!("{}: {}", program, e)))?;
        if !output.status.success() {
            return Err(SidecarError::Command(format!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// One link inside a namespace: device name plus its addresses in CIDR
/// form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    pub addrs: Vec<String>,
}

#[derive(Deserialize)]
struct IpAddrInfo {
    #[serde(default)]
    local: String,
    #[serde(default)]
    prefixlen: u8,
}

#[derive(Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Deserialize)]
struct IpRoute {
    #[serde(default)]
    dst: String,
    #[serde(default)]
    dev: Option<String>,
    #[serde(default)]
    gateway: Option<String>,
}

/// A handle on one container's network namespace.
pub struct NetnsExec {
    runner: Arc<dyn CommandRunner>,
    pid: i64,
}

impl NetnsExec {
    pub fn new(runner: Arc<dyn CommandRunner>, pid: i64) -> Self {
        Self { runner, pid }
    }

    fn nsargs(&self, tail: &[&str]) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.pid.to_string(),
            "-n".to_string(),
            "--".to_string(),
        ];
        args.extend(tail.iter().map(|s| s.to_string()));
        args
    }

    async fn ip_json<T: serde::de::DeserializeOwned>(
        &self,
        tail: &[&str],
    ) -> Result<T, SidecarError> {
        let mut args = vec!["ip", "-j"];
        args.extend_from_slice(tail);
        let out = self.runner.run("nsenter", &self.nsargs(&args)).await?;
        serde_json::from_str(&out).map_err(|e| SidecarError::Parse(e.to_string()))
    }

    /// Enumerates links (except loopback) with their IPv4 addresses.
    pub async fn list_links(&self) -> Result<Vec<LinkInfo>, SidecarError> {
        let links: Vec<IpLink> = self.ip_json(&["addr", "show"]).await?;
        Ok(links
            .into_iter()
            .filter(|l| l.ifname != "lo")
            .map(|l| LinkInfo {
                name: l.ifname,
                addrs: l
                    .addr_info
                    .into_iter()
                    .filter(|a| !a.local.is_empty())
                    .map(|a| format!("{}/{}", a.local, a.prefixlen))
                    .collect(),
            })
            .collect())
    }

    /// Resolves which device and gateway a destination routes through.
    pub async fn route_get(&self, dst: &str) -> Result<(String, Option<String>), SidecarError> {
        let routes: Vec<IpRoute> = self.ip_json(&["route", "get", dst]).await?;
        let route = routes
            .first()
            .ok_or_else(|| SidecarError::Parse(format!("no route to {}", dst)))?;
        let dev = route
            .dev
            .clone()
            .ok_or_else(|| SidecarError::Parse(format!("route to {} has no device", dst)))?;
        Ok((dev, route.gateway.clone()))
    }

    /// Pins a host route to `dst` onto `dev`.
    pub async fn route_add(
        &self,
        dst: &str,
        dev: &str,
        gateway: Option<&str>,
    ) -> Result<(), SidecarError> {
        let mut tail = vec!["ip", "route", "replace", dst, "dev", dev];
        if let Some(gw) = gateway {
            tail.push("via");
            tail.push(gw);
        }
        self.runner.run("nsenter", &self.nsargs(&tail)).await?;
        Ok(())
    }

    /// Deletes the default route on a device, if any.
    pub async fn route_del_default(&self, dev: &str) -> Result<(), SidecarError> {
        let routes: Vec<IpRoute> = self.ip_json(&["route", "show", "dev", dev]).await?;
        for route in routes {
            if route.dst == "default" || route.dst.is_empty() {
                self.runner
                    .run(
                        "nsenter",
                        &self.nsargs(&["ip", "route", "del", "default", "dev", dev]),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Applies a traffic shape to a device. The token bucket caps
    /// bandwidth; netem layers delay/jitter/loss/corruption/duplication
    /// under it. A no-op shape clears existing qdiscs instead.
    pub async fn shape(&self, dev: &str, shape: &LinkShape) -> Result<(), SidecarError> {
        if shape.is_noop() {
            return self.clear_shape(dev).await;
        }

        debug!(dev, ?shape, "applying link shape");

        if shape.bandwidth_bps > 0 {
            let rate = format!("{}bit", shape.bandwidth_bps);
            self.runner
                .run(
                    "nsenter",
                    &self.nsargs(&[
                        "tc", "qdisc", "replace", "dev", dev, "root", "handle", "1:", "tbf",
                        "rate", &rate, "burst", "32kbit", "latency", "400ms",
                    ]),
                )
                .await?;
        } else {
            // No bandwidth cap: make netem the root discipline.
            self.runner
                .run(
                    "nsenter",
                    &self.nsargs(&["tc", "qdisc", "replace", "dev", dev, "root", "handle", "1:", "prio"]),
                )
                .await?;
        }

        let mut netem: Vec<String> = vec![
            "tc".into(),
            "qdisc".into(),
            "replace".into(),
            "dev".into(),
            dev.into(),
            "parent".into(),
            "1:1".into(),
            "handle".into(),
            "10:".into(),
            "netem".into(),
        ];
        if shape.latency_ms > 0 || shape.jitter_ms > 0 {
            netem.push("delay".into());
            netem.push(format!("{}ms", shape.latency_ms));
            if shape.jitter_ms > 0 {
                netem.push(format!("{}ms", shape.jitter_ms));
            }
        }
        if shape.loss_pct > 0.0 {
            netem.push("loss".into());
            netem.push(format!("{}%", shape.loss_pct));
        }
        if shape.corrupt_pct > 0.0 {
            netem.push("corrupt".into());
            netem.push(format!("{}%", shape.corrupt_pct));
        }
        if shape.duplicate_pct > 0.0 {
            netem.push("duplicate".into());
            netem.push(format!("{}%", shape.duplicate_pct));
        }

        if netem.len() > 10 {
            let args: Vec<&str> = netem.iter().map(|s| s.as_str()).collect();
            self.runner.run("nsenter", &self.nsargs(&args)).await?;
        }
        Ok(())
    }

    /// Removes any root qdisc, returning the device to defaults.
    pub async fn clear_shape(&self, dev: &str) -> Result<(), SidecarError> {
        // Deleting a non-existent qdisc is fine; ignore that failure.
        let _ = self
            .runner
            .run(
                "nsenter",
                &self.nsargs(&["tc", "qdisc", "del", "dev", dev, "root"]),
            )
            .await;
        Ok(())
    }
}

/// Invokes a CNI plugin to attach or detach a secondary interface.
/// CNI is an exec protocol: the plugin binary reads the network config
/// from stdin and the operation from environment variables.
pub struct CniInvoker {
    runner: Arc<dyn CommandRunner>,
    plugin_path: String,
    plugin: String,
}

impl CniInvoker {
    pub fn new(runner: Arc<dyn CommandRunner>, plugin_path: impl Into<String>) -> Self {
        Self {
            runner,
            plugin_path: plugin_path.into(),
            plugin: "weave-net".to_string(),
        }
    }

    fn netconf(&self, subnet_or_ip: &str, by_ip: bool) -> String {
        let ipam = if by_ip {
            serde_json::json!({ "ips": [{ "version": "4", "address": subnet_or_ip }] })
        } else {
            serde_json::json!({ "subnet": subnet_or_ip })
        };
        serde_json::json!({
            "cniVersion": "0.3.0",
            "name": "weave",
            "type": self.plugin,
            "ipam": ipam,
            "hairpinMode": true,
        })
        .to_string()
    }

    async fn invoke(
        &self,
        command: &str,
        container_id: &str,
        pid: i64,
        ifname: &str,
        netconf: &str,
    ) -> Result<(), SidecarError> {
        let env = vec![
            ("CNI_COMMAND".to_string(), command.to_string()),
            ("CNI_CONTAINERID".to_string(), container_id.to_string()),
            ("CNI_NETNS".to_string(), format!("/proc/{}/ns/net", pid)),
            ("CNI_IFNAME".to_string(), ifname.to_string()),
            ("CNI_PATH".to_string(), self.plugin_path.clone()),
        ];
        let program = format!("{}/{}", self.plugin_path, self.plugin);
        self.runner
            .run_with_stdin(&program, &[], &env, netconf.as_bytes())
            .await?;
        Ok(())
    }

    /// Attaches `ifname` with an address from `subnet` (or the exact
    /// `ip` when given).
    pub async fn attach(
        &self,
        container_id: &str,
        pid: i64,
        ifname: &str,
        subnet: &str,
        ip: Option<&str>,
    ) -> Result<(), SidecarError> {
        let conf = match ip {
            Some(ip) => self.netconf(ip, true),
            None => self.netconf(subnet, false),
        };
        self.invoke("ADD", container_id, pid, ifname, &conf).await
    }

    /// Detaches `ifname`.
    pub async fn detach(
        &self,
        container_id: &str,
        pid: i64,
        ifname: &str,
        subnet: &str,
    ) -> Result<(), SidecarError> {
        let conf = self.netconf(subnet, false);
        self.invoke("DEL", container_id, pid, ifname, &conf).await
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use parking_lot::Mutex;

    /// Records every invocation; replies from a programmable table.
    pub struct RecordingRunner {
        pub calls: Mutex<Vec<String>>,
        /// Responses keyed by substring match on the full command line.
        pub responses: Mutex<Vec<(String, String)>>,
    }

    impl RecordingRunner {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
            }
        }

        pub fn respond(&self, needle: &str, body: &str) {
            self.responses
                .lock()
                .push((needle.to_string(), body.to_string()));
        }

        pub fn calls_matching(&self, needle: &str) -> Vec<String> {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.contains(needle))
                .cloned()
                .collect()
        }

        fn lookup(&self, line: &str) -> String {
            for (needle, body) in self.responses.lock().iter() {
                if line.contains(needle.as_str()) {
                    return body.clone();
                }
            }
            "[]".to_string()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, program: &str, args: &[String]) -> Result<String, SidecarError> {
            let line = format!("{} {}", program, args.join(" "));
            self.calls.lock().push(line.clone());
            Ok(self.lookup(&line))
        }

        async fn run_with_stdin(
            &self,
            program: &str,
            args: &[String],
            env: &[(String, String)],
            _stdin: &[u8],
        ) -> Result<String, SidecarError> {
            let envs = env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(" ");
            let line = format!("{} {} {}", envs, program, args.join(" "));
            self.calls.lock().push(line.clone());
            Ok(self.lookup(&line))
        }
    }
}
