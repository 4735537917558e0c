//! Explicit-then-implicit lifecycle: register, ForwardOpen, exchange one
//! I/O datagram over UDP, ForwardClose, disconnect.

use std::time::Duration;

use cipdip::client::ClientSession;
use cipdip::server::fault::FaultPolicy;
use cipdip::server::personality::PersonalityKind;
use cipdip::server::{EmulatorServer, ServerConfig};
use cipdip::wire::payload::{PayloadKind, PayloadParam, PayloadSpec};
use cipdip::wire::profile::ProtocolProfile;

#[tokio::test]
async fn forward_open_send_io_forward_close_lifecycle_succeeds() {
    let config = ServerConfig {
        tcp_bind: "127.0.0.1:0".parse().unwrap(),
        udp_bind: "127.0.0.1:0".parse().unwrap(),
        personality: PersonalityKind::Adapter,
        profile: ProtocolProfile::strict_odva(),
        fault_policy: FaultPolicy::default(),
    };
    let server = EmulatorServer::new(&config);
    let tcp_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tcp_addr = tcp_listener.local_addr().unwrap();
    drop(tcp_listener);
    let udp_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let udp_addr = udp_socket.local_addr().unwrap();
    drop(udp_socket);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let server_task = tokio::spawn(async move {
        let _ = server.run(tcp_addr, udp_addr, shutdown_rx).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut session = ClientSession::connect(tcp_addr, ProtocolProfile::strict_odva()).await.unwrap();

    let open_spec = PayloadSpec::new(PayloadKind::ForwardOpen)
        .with("connection_serial", PayloadParam::U16(42))
        .with("originator_vendor_id", PayloadParam::U16(0x1337))
        .with("originator_serial", PayloadParam::U32(1))
        .with("rpi_us", PayloadParam::U32(10_000));
    session.forward_open(open_spec, 0).await.unwrap();

    session.send_io_data(udp_addr, &[1, 2, 3, 4]).await.unwrap();
    let reply = session.receive_io_data(Duration::from_secs(1)).await.unwrap();
    assert_eq!(reply, vec![1, 2, 3, 4]);

    session.forward_close().await.unwrap();
    session.disconnect().await.unwrap();

    let _ = shutdown_tx.send(());
    let _ = server_task.await;
}
