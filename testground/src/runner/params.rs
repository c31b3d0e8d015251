//! Instance environment contract.
//!
//! The variables a runner injects into every test-plan instance, and the
//! parser the sidecar uses to recover them from a container's
//! environment. This is the only interface between the platform and the
//! test-plan binary: exit code 0 means success, and anything written
//! under `TEST_OUTPUTS_PATH` is the collectible surface.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_PLAN: &str = "TEST_PLAN";
pub const ENV_CASE: &str = "TEST_CASE";
pub const ENV_RUN: &str = "TEST_RUN";
pub const ENV_INSTANCE_COUNT: &str = "TEST_INSTANCE_COUNT";
pub const ENV_GROUP_ID: &str = "TEST_GROUP_ID";
pub const ENV_GROUP_INSTANCE_COUNT: &str = "TEST_GROUP_INSTANCE_COUNT";
pub const ENV_INSTANCE_PARAMS: &str = "TEST_INSTANCE_PARAMS";
pub const ENV_OUTPUTS_PATH: &str = "TEST_OUTPUTS_PATH";
pub const ENV_SUBNET: &str = "TEST_SUBNET";
pub const ENV_SIDECAR: &str = "TEST_SIDECAR";
pub const ENV_START_TIME: &str = "TEST_START_TIME";
pub const ENV_SYNC_ENDPOINT: &str = "SYNC_SERVICE_ENDPOINT";

/// Failures parsing an instance environment.
#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),

    #[error("malformed value for {0}: {1}")]
    Malformed(&'static str, String),
}

/// The run parameters one instance sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    pub plan: String,
    pub case: String,
    pub run_id: String,
    pub total_instances: u32,
    pub group_id: String,
    pub group_instance_count: u32,
    pub params: BTreeMap<String, String>,
    pub outputs_path: String,
    /// CIDR of the data subnet the instance sees for peer traffic.
    pub subnet: String,
    /// Whether a sidecar manages this instance's data plane.
    pub sidecar: bool,
    pub start_time: DateTime<Utc>,
    pub sync_endpoint: String,
}

impl RunParams {
    /// Serializes the contract as environment variables.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let params = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("|");

        vec![
            (ENV_PLAN.to_string(), self.plan.clone()),
            (ENV_CASE.to_string(), self.case.clone()),
            (ENV_RUN.to_string(), self.run_id.clone()),
            (
                ENV_INSTANCE_COUNT.to_string(),
                self.total_instances.to_string(),
            ),
            (ENV_GROUP_ID.to_string(), self.group_id.clone()),
            (
                ENV_GROUP_INSTANCE_COUNT.to_string(),
                self.group_instance_count.to_string(),
            ),
            (ENV_INSTANCE_PARAMS.to_string(), params),
            (ENV_OUTPUTS_PATH.to_string(), self.outputs_path.clone()),
            (ENV_SUBNET.to_string(), self.subnet.clone()),
            (ENV_SIDECAR.to_string(), self.sidecar.to_string()),
            (ENV_START_TIME.to_string(), self.start_time.to_rfc3339()),
            (ENV_SYNC_ENDPOINT.to_string(), self.sync_endpoint.clone()),
        ]
    }

    /// Parses the contract back from `KEY=VALUE` environment entries.
    /// Unknown variables are ignored.
    pub fn from_env<'a>(env: impl IntoIterator<Item = &'a str>) -> Result<Self, ParamsError> {
        let mut vars = BTreeMap::new();
        for entry in env {
            if let Some((k, v)) = entry.split_once('=') {
                vars.insert(k.to_string(), v.to_string());
            }
        }

        let take = |key: &'static str| -> Result<String, ParamsError> {
            vars.get(key).cloned().ok_or(ParamsError::Missing(key))
        };

        let parse_u32 = |key: &'static str, value: &str| -> Result<u32, ParamsError> {
            value
                .parse()
                .map_err(|_| ParamsError::Malformed(key, value.to_string()))
        };

        let total = take(ENV_INSTANCE_COUNT)?;
        let group_count = take(ENV_GROUP_INSTANCE_COUNT)?;

        let mut params = BTreeMap::new();
        if let Some(raw) = vars.get(ENV_INSTANCE_PARAMS) {
            for pair in raw.split('|').filter(|p| !p.is_empty()) {
                if let Some((k, v)) = pair.split_once('=') {
                    params.insert(k.to_string(), v.to_string());
                }
            }
        }

        let sidecar = vars
            .get(ENV_SIDECAR)
            .map(|v| v == "true")
            .unwrap_or(false);

        let start_raw = take(ENV_START_TIME)?;
        let start_time = DateTime::parse_from_rfc3339(&start_raw)
            .map_err(|_| ParamsError::Malformed(ENV_START_TIME, start_raw.clone()))?
            .with_timezone(&Utc);

        Ok(Self {
            plan: take(ENV_PLAN)?,
            case: take(ENV_CASE)?,
            run_id: take(ENV_RUN)?,
            total_instances: parse_u32(ENV_INSTANCE_COUNT, &total)?,
            group_id: take(ENV_GROUP_ID)?,
            group_instance_count: parse_u32(ENV_GROUP_INSTANCE_COUNT, &group_count)?,
            params,
            outputs_path: vars.get(ENV_OUTPUTS_PATH).cloned().unwrap_or_default(),
            subnet: take(ENV_SUBNET)?,
            sidecar,
            start_time,
            sync_endpoint: vars.get(ENV_SYNC_ENDPOINT).cloned().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RunParams {
        let mut map = BTreeMap::new();
        map.insert("latency".to_string(), "100ms".to_string());
        map.insert("peers".to_string(), "5".to_string());
        RunParams {
            plan: "network/ping-pong".to_string(),
            case: "ping-pong".to_string(),
            run_id: "r-123".to_string(),
            total_instances: 10,
            group_id: "clients".to_string(),
            group_instance_count: 4,
            params: map,
            outputs_path: "/outputs".to_string(),
            subnet: "16.0.0.0/16".to_string(),
            sidecar: true,
            start_time: Utc::now(),
            sync_endpoint: "http://10.32.0.1:5050".to_string(),
        }
    }

    #[test]
    fn test_env_round_trip() {
        let p = params();
        let env: Vec<String> = p.to_env().iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let parsed = RunParams::from_env(env.iter().map(|s| s.as_str())).unwrap();

        assert_eq!(parsed.plan, p.plan);
        assert_eq!(parsed.total_instances, 10);
        assert_eq!(parsed.group_instance_count, 4);
        assert_eq!(parsed.params.get("latency").unwrap(), "100ms");
        assert_eq!(parsed.params.get("peers").unwrap(), "5");
        assert!(parsed.sidecar);
        assert_eq!(parsed.sync_endpoint, p.sync_endpoint);
        // RFC3339 round-trips to the same instant.
        assert_eq!(
            parsed.start_time.timestamp_millis(),
            p.start_time.timestamp_millis()
        );
    }

    #[test]
    fn test_unknown_vars_ignored_and_missing_rejected() {
        let p = params();
        let mut env: Vec<String> =
            p.to_env().iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        env.push("PATH=/usr/bin".to_string());
        env.push("HOME=/root".to_string());
        assert!(RunParams::from_env(env.iter().map(|s| s.as_str())).is_ok());

        let sparse = vec!["TEST_PLAN=p".to_string()];
        let err = RunParams::from_env(sparse.iter().map(|s| s.as_str())).unwrap_err();
        assert!(matches!(err, ParamsError::Missing(_)));
    }

    #[test]
    fn test_empty_params_serialize_as_empty_string() {
        let mut p = params();
        p.params.clear();
        let env = p.to_env();
        let raw = env
            .iter()
            .find(|(k, _)| k == ENV_INSTANCE_PARAMS)
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(raw.is_empty());

        let entries: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let parsed = RunParams::from_env(entries.iter().map(|s| s.as_str())).unwrap();
        assert!(parsed.params.is_empty());
    }
}
