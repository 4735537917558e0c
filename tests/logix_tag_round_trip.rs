//! Logix-like personality: explicit Read_Tag/Write_Tag over a symbolic
//! EPATH segment.

use std::time::Duration;

use cipdip::client::ClientSession;
use cipdip::server::fault::FaultPolicy;
use cipdip::server::personality::PersonalityKind;
use cipdip::server::{EmulatorServer, ServerConfig};
use cipdip::wire::path::CipPath;
use cipdip::wire::payload::{PayloadKind, PayloadParam, PayloadSpec};
use cipdip::wire::profile::ProtocolProfile;

#[tokio::test]
async fn write_tag_then_read_tag_round_trips_through_logix_like_server() {
    let config = ServerConfig {
        tcp_bind: "127.0.0.1:0".parse().unwrap(),
        udp_bind: "127.0.0.1:0".parse().unwrap(),
        personality: PersonalityKind::LogixLike,
        profile: ProtocolProfile::strict_odva(),
        fault_policy: FaultPolicy::default(),
    };
    let server = EmulatorServer::new(&config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let server_task = tokio::spawn(async move {
        let _ = server.run(addr, "127.0.0.1:0".parse().unwrap(), shutdown_rx).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut session = ClientSession::connect(addr, ProtocolProfile::strict_odva()).await.unwrap();

    let path = CipPath::Symbolic { name: "Tag1".into(), trailing: vec![] };
    let write_spec = PayloadSpec::new(PayloadKind::RockwellTag)
        .with("datatype", PayloadParam::U16(0x00C3))
        .with("write_value", PayloadParam::Bytes(vec![0x2A, 0x00]));
    let write_resp = session.invoke_service(0x4D, path.clone(), Some(&write_spec)).await.unwrap();
    assert_eq!(write_resp.general_status, 0x00);

    let read_resp = session.invoke_service(0x4C, path, None).await.unwrap();
    assert_eq!(read_resp.general_status, 0x00);
    assert_eq!(u16::from_le_bytes([read_resp.payload[0], read_resp.payload[1]]), 0x00C3);
    assert_eq!(&read_resp.payload[2..], &[0x2A, 0x00]);

    session.disconnect().await.unwrap();
    let _ = shutdown_tx.send(());
    let _ = server_task.await;
}
