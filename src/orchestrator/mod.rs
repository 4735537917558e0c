//! Orchestrator: resolves a manifest, launches server/client roles across
//! transports, waits for readiness, collects artifacts, and writes the
//! run bundle.
//!
//! Phase sequencing and process-spawning spawn role processes through the
//! `Transport` trait (local or SSH), poll for readiness in a sleep loop,
//! and aggregate results through a dedicated bundle writer. The phases
//! form a closed `RunPhase` enum with a single phase-transition choke
//! point so ordering can't drift between call sites.

pub mod bundle;
pub mod manifest;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{CipdipError, Result};
use crate::transport::{self, Transport};

use bundle::{BundleWriter, RoleMeta, RunMeta, VersionsInfo};
use manifest::{ReadinessMethod, RunManifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunPhase {
    Resolve,
    Plan,
    Prepare,
    LaunchServer,
    WaitReady,
    LaunchClient,
    WaitClient,
    StopServer,
    Collect,
    Analyze,
    Diff,
    Finalize,
}

impl RunPhase {
    pub fn name(&self) -> &'static str {
        match self {
            RunPhase::Resolve => "resolve",
            RunPhase::Plan => "plan",
            RunPhase::Prepare => "prepare",
            RunPhase::LaunchServer => "launch_server",
            RunPhase::WaitReady => "wait_ready",
            RunPhase::LaunchClient => "launch_client",
            RunPhase::WaitClient => "wait_client",
            RunPhase::StopServer => "stop_server",
            RunPhase::Collect => "collect",
            RunPhase::Analyze => "analyze",
            RunPhase::Diff => "diff",
            RunPhase::Finalize => "finalize",
        }
    }

    /// The phase immediately following this one in the canonical
    /// sequence, honoring the optional Analyze/Diff gates.
    pub fn ordered_successors(&self, analyze: bool, diff: bool) -> Option<RunPhase> {
        use RunPhase::*;
        match self {
            Resolve => Some(Plan),
            Plan => Some(Prepare),
            Prepare => Some(LaunchServer),
            LaunchServer => Some(WaitReady),
            WaitReady => Some(LaunchClient),
            LaunchClient => Some(WaitClient),
            WaitClient => Some(StopServer),
            StopServer => Some(Collect),
            Collect => {
                if analyze {
                    Some(Analyze)
                } else if diff {
                    Some(Diff)
                } else {
                    Some(Finalize)
                }
            }
            Analyze => {
                if diff {
                    Some(Diff)
                } else {
                    Some(Finalize)
                }
            }
            Diff => Some(Finalize),
            Finalize => None,
        }
    }
}

pub struct Orchestrator {
    pub bundle_root: PathBuf,
}

struct RunState {
    phases_completed: Vec<String>,
    error: Option<String>,
}

impl RunState {
    fn new() -> Self {
        RunState { phases_completed: Vec::new(), error: None }
    }

    /// Single choke point for phase transitions: logs entry and records
    /// completion, so every phase boundary is observable the same way.
    fn record_phase_transition(&mut self, phase: RunPhase) {
        info!(phase = phase.name(), "entering orchestrator phase");
        self.phases_completed.push(phase.name().to_string());
    }
}

impl Orchestrator {
    pub fn new(bundle_root: PathBuf) -> Self {
        Orchestrator { bundle_root }
    }

    pub async fn run(&self, manifest_path: &Path) -> Result<PathBuf> {
        let mut state = RunState::new();
        let started_at = chrono::Utc::now();

        // Phase: Resolve
        state.record_phase_transition(RunPhase::Resolve);
        let raw_manifest = RunManifest::from_yaml_file(manifest_path)?;
        let profile_bytes = std::fs::read(&raw_manifest.profile.path).unwrap_or_default();
        let profile_checksum = hex::encode(Sha256::digest(&profile_bytes));
        let resolved = raw_manifest.clone().resolve(profile_checksum);
        let run_id = resolved.run_id.clone().unwrap();

        let result = self.run_phases(&mut state, &raw_manifest, &resolved, started_at).await;

        let finished_at = chrono::Utc::now();
        let writer = BundleWriter::create(&self.bundle_root)?;
        writer.write_yaml_string("manifest.yaml", &raw_manifest.to_yaml_string()?)?;
        writer.write_yaml_string("manifest_resolved.yaml", &resolved.to_yaml_string()?)?;
        writer.write_json("versions.json", &VersionsInfo::current())?;

        let status = if result.is_ok() { "success" } else { "failed" };
        let run_meta = RunMeta {
            run_id,
            status: status.to_string(),
            started_at: started_at.to_rfc3339(),
            finished_at: Some(finished_at.to_rfc3339()),
            duration_seconds: Some((finished_at - started_at).num_milliseconds() as f64 / 1000.0),
            phases_completed: state.phases_completed.clone(),
            error: state.error.clone(),
        };
        writer.write_json("run_meta.json", &run_meta)?;
        writer.finalize_hashes()?;

        result.map(|_| self.bundle_root.clone())
    }

    async fn run_phases(
        &self,
        state: &mut RunState,
        raw_manifest: &RunManifest,
        resolved: &RunManifest,
        _started_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let analyze = resolved.post_run.analyze;
        let diff = resolved.post_run.diff_baseline.is_some();

        state.record_phase_transition(RunPhase::Plan);
        let server_transport = transport::from_spec(&resolved.roles.server.agent)?;
        let client_transport = transport::from_spec(&resolved.roles.client.agent)?;

        state.record_phase_transition(RunPhase::Prepare);
        let writer = BundleWriter::create(&self.bundle_root)?;
        let server_dir = writer.role_dir("server");
        let client_dir = writer.role_dir("client");
        std::fs::create_dir_all(&server_dir).map_err(CipdipError::Io)?;
        std::fs::create_dir_all(&client_dir).map_err(CipdipError::Io)?;

        state.record_phase_transition(RunPhase::LaunchServer);
        let server_remote_capture = "cipdip_server_capture.pcap";
        let server_args = vec![
            "server".to_string(),
            "--personality".to_string(),
            resolved.roles.server.personality.clone(),
            "--bind".to_string(),
            format!(
                "{}:{}",
                resolved
                    .network
                    .data_plane
                    .server_listen_ip
                    .clone()
                    .unwrap_or_else(|| "0.0.0.0".to_string()),
                resolved.network.data_plane.target_port
            ),
            "--capture-out".to_string(),
            server_remote_capture.to_string(),
        ];
        let mut server_handle = server_transport.exec_stream("cipdip", &server_args).await?;

        state.record_phase_transition(RunPhase::WaitReady);
        let wait_result = self
            .wait_ready(
                &resolved.readiness,
                &resolved.network.data_plane.target_ip,
                resolved.network.data_plane.target_port,
            )
            .await;
        if let Err(e) = wait_result {
            let _ = server_handle.cancel(Duration::from_secs(5)).await;
            state.error = Some(e.to_string());
            return Err(e);
        }

        state.record_phase_transition(RunPhase::LaunchClient);
        let client_remote_capture = "cipdip_client_capture.pcap";
        let client_args = vec![
            "client".to_string(),
            "--scenario".to_string(),
            resolved.roles.client.scenario.clone(),
            "--duration-seconds".to_string(),
            resolved.roles.client.duration_seconds.to_string(),
            "--target".to_string(),
            format!(
                "{}:{}",
                resolved.network.data_plane.target_ip, resolved.network.data_plane.target_port
            ),
            "--capture-out".to_string(),
            client_remote_capture.to_string(),
        ];
        let mut client_handle = client_transport.exec_stream("cipdip", &client_args).await?;

        state.record_phase_transition(RunPhase::WaitClient);
        let overall_timeout = Duration::from_secs(resolved.roles.client.duration_seconds + 30);
        let client_exit = match tokio::time::timeout(overall_timeout, client_handle.wait()).await {
            Ok(exit) => exit?,
            Err(_) => {
                // Open Question resolution: overall_timeout firing before
                // the client exits is recorded as the run's cause even if
                // wait-ready had already succeeded.
                let _ = client_handle.cancel(Duration::from_secs(5)).await;
                let err = CipdipError::Timeout(overall_timeout);
                state.error = Some(err.to_string());
                let _ = server_handle.cancel(Duration::from_secs(5)).await;
                return Err(err);
            }
        };

        state.record_phase_transition(RunPhase::StopServer);
        server_handle.cancel(Duration::from_secs(5)).await?;

        state.record_phase_transition(RunPhase::Collect);
        let client_pcap = self
            .collect_capture(client_transport.as_ref(), client_remote_capture, &client_dir, "capture.pcap")
            .await;
        let server_pcap = self
            .collect_capture(server_transport.as_ref(), server_remote_capture, &server_dir, "capture.pcap")
            .await;

        let client_meta = RoleMeta {
            agent_id: resolved.roles.client.agent.clone(),
            exit_code: Some(client_exit),
            pcap_files: client_pcap
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .into_iter()
                .collect(),
            target_ip: Some(resolved.network.data_plane.target_ip.clone()),
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        writer.write_json("roles/client/role_meta.json", &client_meta)?;
        let server_meta = RoleMeta {
            agent_id: resolved.roles.server.agent.clone(),
            exit_code: None,
            pcap_files: server_pcap
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .into_iter()
                .collect(),
            target_ip: None,
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        writer.write_json("roles/server/role_meta.json", &server_meta)?;

        if analyze {
            state.record_phase_transition(RunPhase::Analyze);
            let mut combined = crate::pcap::CaptureSummary::default();
            for pcap_path in client_pcap.iter().chain(server_pcap.iter()) {
                match std::fs::read(pcap_path).and_then(|bytes| {
                    crate::pcap::PcapFile::read(&bytes).map_err(std::io::Error::other)
                }) {
                    Ok(pcap_file) => {
                        let summary = crate::pcap::summarize(&pcap_file);
                        combined.total_packets += summary.total_packets;
                        for (k, v) in summary.enip_command_counts {
                            *combined.enip_command_counts.entry(k).or_insert(0) += v;
                        }
                        for (k, v) in summary.cip_service_counts {
                            *combined.cip_service_counts.entry(k).or_insert(0) += v;
                        }
                        combined.cpf_items_present += summary.cpf_items_present;
                        combined.cpf_items_absent += summary.cpf_items_absent;
                        combined.handshake_complete = combined.handshake_complete || summary.handshake_complete;
                    }
                    Err(e) => warn!(pcap = %pcap_path.display(), error = %e, "failed to summarize collected capture"),
                }
            }
            writer.write_json("analysis_summary.json", &combined)?;
        }
        if diff {
            state.record_phase_transition(RunPhase::Diff);
        }

        state.record_phase_transition(RunPhase::Finalize);
        let _ = raw_manifest;
        Ok(())
    }

    /// Pulls a role's just-written capture file from its agent's
    /// filesystem into `local_dir/local_name`, returning the local path on
    /// success. A missing or unfetchable capture is logged and skipped
    /// rather than failing the whole run — capture is diagnostic, not
    /// load-bearing for the run's pass/fail outcome.
    async fn collect_capture(
        &self,
        transport: &dyn Transport,
        remote_path: &str,
        local_dir: &Path,
        local_name: &str,
    ) -> Option<PathBuf> {
        match transport.stat(remote_path).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(remote = remote_path, "no capture file produced by agent");
                return None;
            }
            Err(e) => {
                warn!(remote = remote_path, error = %e, "failed to stat capture file");
                return None;
            }
        }
        let local_path = local_dir.join(local_name);
        match transport.get(remote_path, &local_path).await {
            Ok(()) => Some(local_path),
            Err(e) => {
                warn!(remote = remote_path, error = %e, "failed to collect capture file");
                None
            }
        }
    }

    async fn wait_ready(&self, readiness: &manifest::Readiness, ip: &str, port: u16) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(readiness.timeout_seconds);
        match readiness.method {
            ReadinessMethod::TcpConnect => loop {
                if Instant::now() >= deadline {
                    return Err(CipdipError::Timeout(Duration::from_secs(readiness.timeout_seconds)));
                }
                match tokio::net::TcpStream::connect((ip, port)).await {
                    Ok(_) => return Ok(()),
                    Err(_) => tokio::time::sleep(Duration::from_millis(200)).await,
                }
            },
            ReadinessMethod::LogRegex | ReadinessMethod::ManifestBeacon => {
                // Both require reading agent-local state (a log file or a
                // beacon file the server writes on bind); neither has a
                // meaningful implementation without a concrete agent
                // filesystem to poll, so they degrade to a fixed settle
                // delay here rather than guessing a path.
                warn!(
                    method = ?readiness.method,
                    "readiness method has no filesystem probe in this build; using a settle delay"
                );
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_progress_in_fixed_order_without_optional_gates() {
        let mut phase = RunPhase::Resolve;
        let mut sequence = vec![phase];
        while let Some(next) = phase.ordered_successors(false, false) {
            sequence.push(next);
            phase = next;
        }
        assert_eq!(
            sequence,
            vec![
                RunPhase::Resolve,
                RunPhase::Plan,
                RunPhase::Prepare,
                RunPhase::LaunchServer,
                RunPhase::WaitReady,
                RunPhase::LaunchClient,
                RunPhase::WaitClient,
                RunPhase::StopServer,
                RunPhase::Collect,
                RunPhase::Finalize,
            ]
        );
    }

    #[test]
    fn analyze_and_diff_gates_insert_into_sequence() {
        assert_eq!(RunPhase::Collect.ordered_successors(true, true), Some(RunPhase::Analyze));
        assert_eq!(RunPhase::Analyze.ordered_successors(true, true), Some(RunPhase::Diff));
        assert_eq!(RunPhase::Diff.ordered_successors(true, true), Some(RunPhase::Finalize));
    }
}
