//! Loopback: an adapter-personality emulator server driven by the
//! baseline scenario shape, asserting on the recorded metrics rather than
//! on wire bytes directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cipdip::metrics::MetricsSink;
use cipdip::scenario::{CancelHandle, ScenarioConfig, ScenarioShape};
use cipdip::server::fault::FaultPolicy;
use cipdip::server::personality::PersonalityKind;
use cipdip::server::{EmulatorServer, ServerConfig};
use cipdip::wire::profile::ProtocolProfile;

async fn spawn_adapter_server() -> (SocketAddr, tokio::task::JoinHandle<()>, tokio::sync::oneshot::Sender<()>) {
    let config = ServerConfig {
        tcp_bind: "127.0.0.1:0".parse().unwrap(),
        udp_bind: "127.0.0.1:0".parse().unwrap(),
        personality: PersonalityKind::Adapter,
        profile: ProtocolProfile::strict_odva(),
        fault_policy: FaultPolicy::default(),
    };
    let server = EmulatorServer::new(&config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(async move {
        let _ = server.run(addr, "127.0.0.1:0".parse().unwrap(), shutdown_rx).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, handle, shutdown_tx)
}

#[tokio::test]
async fn baseline_scenario_against_adapter_records_successful_samples() {
    let (addr, server_handle, shutdown_tx) = spawn_adapter_server().await;

    let sink = Arc::new(MetricsSink::new());
    let (cancel_handle, cancel_token) = CancelHandle::new();
    let config = ScenarioConfig {
        shape: ScenarioShape::Baseline,
        target: addr,
        duration: Duration::from_millis(600),
        interval: Some(Duration::from_millis(50)),
        profile: ProtocolProfile::strict_odva(),
        target_type: "adapter".to_string(),
        mutation: None,
        capture: None,
    };

    let scenario_task = tokio::spawn(cipdip::scenario::run_scenario(config, sink.clone(), cancel_token));
    scenario_task.await.unwrap().unwrap();
    cancel_handle.cancel();

    let summary = sink.get_summary(&[50.0, 95.0]).unwrap();
    assert!(summary.counts.total >= 5, "expected several ticks, got {}", summary.counts.total);
    assert_eq!(summary.counts.failure, 0, "no operation should fail against a healthy adapter");

    let _ = shutdown_tx.send(());
    let _ = server_handle.await;
}
