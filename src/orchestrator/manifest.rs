//! Run manifest: the YAML config an operator hands the orchestrator,
//! plus its resolved/snapshotted form written into the bundle.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CipdipError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRef {
    pub path: String,
    #[serde(default)]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPlane {
    pub target_ip: String,
    pub target_port: u16,
    #[serde(default)]
    pub server_listen_ip: Option<String>,
    #[serde(default)]
    pub client_bind_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRole {
    pub agent: String,
    pub personality: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRole {
    pub agent: String,
    pub scenario: String,
    pub duration_seconds: u64,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessMethod {
    TcpConnect,
    LogRegex,
    ManifestBeacon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Readiness {
    pub method: ReadinessMethod,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PostRun {
    #[serde(default)]
    pub analyze: bool,
    #[serde(default)]
    pub diff_baseline: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roles {
    pub server: ServerRole,
    pub client: ClientRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub data_plane: DataPlane,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub version: u32,
    #[serde(default)]
    pub run_id: Option<String>,
    pub profile: ProfileRef,
    pub network: NetworkConfig,
    pub roles: Roles,
    pub readiness: Readiness,
    #[serde(default)]
    pub post_run: PostRun,
}

impl RunManifest {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| CipdipError::Config(format!("manifest parse error: {e}")))
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(CipdipError::Io)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| CipdipError::Config(format!("manifest serialize error: {e}")))
    }

    /// Resolves `run_id` (generating one if absent) and fills in the
    /// profile checksum, producing the immutable snapshot written as
    /// `manifest_resolved.yaml`.
    pub fn resolve(mut self, profile_checksum: String) -> Self {
        if self.run_id.is_none() {
            self.run_id = Some(uuid::Uuid::new_v4().to_string());
        }
        self.profile.checksum = Some(profile_checksum);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
version: 1
profile:
  path: profiles/strict_odva.yaml
network:
  data_plane:
    target_ip: 10.0.0.5
    target_port: 44818
roles:
  server:
    agent: local
    personality: adapter
  client:
    agent: local
    scenario: baseline
    duration_seconds: 30
readiness:
  method: tcp_connect
  timeout_seconds: 10
"#
    }

    #[test]
    fn parses_minimal_manifest() {
        let manifest = RunManifest::from_yaml_str(sample_yaml()).unwrap();
        assert_eq!(manifest.version, 1);
        assert_eq!(manifest.network.data_plane.target_port, 44818);
        assert_eq!(manifest.readiness.method, ReadinessMethod::TcpConnect);
    }

    #[test]
    fn resolve_assigns_run_id_when_absent() {
        let manifest = RunManifest::from_yaml_str(sample_yaml()).unwrap();
        assert!(manifest.run_id.is_none());
        let resolved = manifest.resolve("deadbeef".to_string());
        assert!(resolved.run_id.is_some());
        assert_eq!(resolved.profile.checksum.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn round_trips_through_yaml_serialization() {
        let manifest = RunManifest::from_yaml_str(sample_yaml()).unwrap();
        let text = manifest.to_yaml_string().unwrap();
        let reparsed = RunManifest::from_yaml_str(&text).unwrap();
        assert_eq!(reparsed.network.data_plane.target_ip, manifest.network.data_plane.target_ip);
    }
}
