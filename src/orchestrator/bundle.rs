//! Run bundle: the content-hashed filesystem artifact produced by a
//! completed (or failed) orchestrated run.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{CipdipError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_seconds: Option<f64>,
    pub phases_completed: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionsInfo {
    pub cipdip_version: String,
    pub git_commit: Option<String>,
    pub controller_os: String,
    pub controller_arch: String,
}

impl VersionsInfo {
    pub fn current() -> Self {
        VersionsInfo {
            cipdip_version: crate::VERSION.to_string(),
            git_commit: option_env!("CIPDIP_GIT_COMMIT").map(str::to_string),
            controller_os: std::env::consts::OS.to_string(),
            controller_arch: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleMeta {
    pub agent_id: String,
    pub exit_code: Option<i32>,
    pub pcap_files: Vec<String>,
    pub target_ip: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

pub struct BundleWriter {
    root: PathBuf,
}

impl BundleWriter {
    pub fn create(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(CipdipError::Io)?;
        std::fs::create_dir_all(root.join("roles")).map_err(CipdipError::Io)?;
        std::fs::create_dir_all(root.join("analysis")).map_err(CipdipError::Io)?;
        Ok(BundleWriter { root: root.to_path_buf() })
    }

    pub fn write_json<T: Serialize>(&self, relative_path: &str, value: &T) -> Result<()> {
        let path = self.root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(CipdipError::Io)?;
        }
        let content = serde_json::to_vec_pretty(value)
            .map_err(|e| CipdipError::Integrity(format!("failed to serialize {relative_path}: {e}")))?;
        std::fs::write(path, content).map_err(CipdipError::Io)
    }

    pub fn write_yaml_string(&self, relative_path: &str, content: &str) -> Result<()> {
        let path = self.root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(CipdipError::Io)?;
        }
        std::fs::write(path, content).map_err(CipdipError::Io)
    }

    pub fn role_dir(&self, role: &str) -> PathBuf {
        self.root.join("roles").join(role)
    }

    /// Walks the bundle and writes `hashes.txt`: one `sha256  relative/path`
    /// line per file, excluding `hashes.txt` itself.
    pub fn finalize_hashes(&self) -> Result<()> {
        let mut lines = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| CipdipError::Integrity(format!("bundle walk failed: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| CipdipError::Integrity(format!("bundle path outside root: {e}")))?;
            if relative == Path::new("hashes.txt") {
                continue;
            }
            let content = std::fs::read(entry.path()).map_err(CipdipError::Io)?;
            let digest = Sha256::digest(&content);
            lines.push(format!("{} {}", hex::encode(digest), relative.display()));
        }
        lines.sort();
        std::fs::write(self.root.join("hashes.txt"), lines.join("\n") + "\n").map_err(CipdipError::Io)
    }
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub ok: bool,
    pub missing_files: Vec<String>,
    pub hash_mismatches: Vec<String>,
    pub empty_pcaps: Vec<String>,
    pub malformed_json: Vec<String>,
}

/// Verifies a bundle against its own `hashes.txt`: every listed file
/// exists and matches; every PCAP referenced by a `role_meta.json` exists
/// and is non-empty; every `.json` file parses.
pub fn verify(root: &Path) -> Result<VerifyReport> {
    let hashes_path = root.join("hashes.txt");
    let hashes_content = std::fs::read_to_string(&hashes_path).map_err(CipdipError::Io)?;
    let mut expected: BTreeMap<String, String> = BTreeMap::new();
    for line in hashes_content.lines() {
        if let Some((hash, path)) = line.split_once(' ') {
            expected.insert(path.to_string(), hash.to_string());
        }
    }

    let mut missing_files = Vec::new();
    let mut hash_mismatches = Vec::new();
    for (relative, expected_hash) in &expected {
        let path = root.join(relative);
        match std::fs::read(&path) {
            Ok(content) => {
                let actual = hex::encode(Sha256::digest(&content));
                if &actual != expected_hash {
                    hash_mismatches.push(relative.clone());
                }
            }
            Err(_) => missing_files.push(relative.clone()),
        }
    }

    let mut empty_pcaps = Vec::new();
    let mut malformed_json = Vec::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|e| CipdipError::Integrity(format!("bundle walk failed: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            let content = std::fs::read_to_string(path).map_err(CipdipError::Io)?;
            if serde_json::from_str::<serde_json::Value>(&content).is_err() {
                malformed_json.push(path.display().to_string());
            }
        }
        if path.file_name().and_then(|n| n.to_str()) == Some("role_meta.json") {
            let content = std::fs::read_to_string(path).map_err(CipdipError::Io)?;
            if let Ok(meta) = serde_json::from_str::<RoleMeta>(&content) {
                let role_dir = path.parent().unwrap();
                for pcap in &meta.pcap_files {
                    let pcap_path = role_dir.join(pcap);
                    match std::fs::metadata(&pcap_path) {
                        Ok(m) if m.len() > 0 => {}
                        _ => empty_pcaps.push(pcap_path.display().to_string()),
                    }
                }
            }
        }
    }

    let ok = missing_files.is_empty()
        && hash_mismatches.is_empty()
        && empty_pcaps.is_empty()
        && malformed_json.is_empty();

    Ok(VerifyReport {
        ok,
        missing_files,
        hash_mismatches,
        empty_pcaps,
        malformed_json,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_then_verify_round_trips_clean() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BundleWriter::create(dir.path()).unwrap();
        writer
            .write_json(
                "run_meta.json",
                &RunMeta {
                    run_id: "abc".into(),
                    status: "success".into(),
                    started_at: "2026-01-01T00:00:00Z".into(),
                    finished_at: Some("2026-01-01T00:01:00Z".into()),
                    duration_seconds: Some(60.0),
                    phases_completed: vec!["resolve".into(), "plan".into()],
                    error: None,
                },
            )
            .unwrap();
        writer.finalize_hashes().unwrap();
        let report = verify(dir.path()).unwrap();
        assert!(report.ok, "{report:?}");
    }

    #[test]
    fn tampered_file_is_detected_as_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BundleWriter::create(dir.path()).unwrap();
        writer
            .write_json(
                "run_meta.json",
                &RunMeta {
                    run_id: "abc".into(),
                    status: "success".into(),
                    started_at: "now".into(),
                    finished_at: None,
                    duration_seconds: None,
                    phases_completed: vec![],
                    error: None,
                },
            )
            .unwrap();
        writer.finalize_hashes().unwrap();
        std::fs::write(dir.path().join("run_meta.json"), b"{tampered}").unwrap();
        let report = verify(dir.path()).unwrap();
        assert!(!report.ok);
        assert!(!report.hash_mismatches.is_empty());
    }
}
