//! Emulator server: TCP listener, per-connection session machine, UDP I/O
//! loop, personalities, and fault injection.
//!
//! The accept loop and connection table use an `Arc<Mutex<HashMap<
//! ConnectionId, _>>>` connection table, an `AtomicU64` id counter, one
//! spawned task per accepted connection, plus a dedicated ticker task for
//! the connection reaper.

pub mod fault;
pub mod personality;
pub mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::capture::CaptureHandle;
use crate::error::{CipdipError, Result};
use crate::wire::cip::CipRequest;
use crate::wire::cpf::{CpfEnvelope, CpfItem, CpfItemType};
use crate::wire::enip::{EnipCommand, EnipFrame, HEADER_LEN};
use crate::wire::profile::ProtocolProfile;

use fault::{FaultDecision, FaultPolicy, FaultState};
use personality::{DeviceState, PersonalityKind};
use session::{ImplicitConnection, ServerSession, SessionState};

pub type ConnectionId = u64;

pub struct ServerConfig {
    pub tcp_bind: SocketAddr,
    pub udp_bind: SocketAddr,
    pub personality: PersonalityKind,
    pub profile: ProtocolProfile,
    pub fault_policy: FaultPolicy,
}

struct SharedState {
    device: DeviceState,
    personality: PersonalityKind,
    profile: ProtocolProfile,
    fault_policy: FaultPolicy,
    sessions: Mutex<HashMap<ConnectionId, ServerSession>>,
    next_session_handle: AtomicU32,
    capture: Option<Arc<dyn CaptureHandle>>,
}

pub struct EmulatorServer {
    shared: Arc<SharedState>,
    next_connection_id: Arc<AtomicU64>,
}

impl EmulatorServer {
    pub fn new(config: &ServerConfig) -> Self {
        let device = match config.personality {
            PersonalityKind::Adapter => DeviceState::new_adapter(),
            PersonalityKind::LogixLike => DeviceState::new_logix_like(),
        };
        EmulatorServer {
            shared: Arc::new(SharedState {
                device,
                personality: config.personality,
                profile: config.profile,
                fault_policy: config.fault_policy,
                sessions: Mutex::new(HashMap::new()),
                next_session_handle: AtomicU32::new(1),
                capture: None,
            }),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Taps every TCP/UDP frame every connection this server accepts
    /// from here on sends or receives, recording it into `capture`.
    /// Must be called before `run` since connections clone the shared
    /// state once accepted.
    pub fn attach_capture(&mut self, capture: Arc<dyn CaptureHandle>) {
        Arc::get_mut(&mut self.shared)
            .expect("attach_capture must be called before run spawns any connection tasks")
            .capture = Some(capture);
    }

    /// Runs the TCP accept loop, the UDP I/O loop, and the connection
    /// reaper concurrently until `shutdown` resolves.
    pub async fn run(
        &self,
        tcp_bind: SocketAddr,
        udp_bind: SocketAddr,
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let listener = TcpListener::bind(tcp_bind).await.map_err(CipdipError::Io)?;
        let udp = Arc::new(UdpSocket::bind(udp_bind).await.map_err(CipdipError::Io)?);
        info!(%tcp_bind, %udp_bind, "emulator server listening");

        let reaper_shared = self.shared.clone();
        let reaper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(500));
            loop {
                ticker.tick().await;
                let mut sessions = reaper_shared.sessions.lock().await;
                let multiplier = reaper_shared.profile.reaper_idle_rpi_multiplier;
                let expired: Vec<ConnectionId> = sessions
                    .iter()
                    .filter(|(_, s)| s.connection_idle_expired(multiplier))
                    .map(|(id, _)| *id)
                    .collect();
                for id in expired {
                    if let Some(session) = sessions.get_mut(&id) {
                        debug!(connection_id = id, "reaping idle implicit connection");
                        session.close_connection();
                    }
                }
            }
        });

        let io_shared = self.shared.clone();
        let io_udp = udp.clone();
        let io_loop = tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                match io_udp.recv_from(&mut buf).await {
                    Ok((n, peer)) => {
                        if let Err(e) = handle_io_datagram(&io_shared, &io_udp, &buf[..n], peer).await {
                            warn!(error = %e, "io datagram handling failed");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "udp recv_from failed");
                    }
                }
            }
        });

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
                            let shared = self.shared.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(shared, connection_id, stream, peer).await {
                                    debug!(connection_id, peer = %peer, error = %e, "connection closed with error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "tcp accept failed"),
                    }
                }
                _ = &mut shutdown => {
                    info!("emulator server shutting down");
                    break;
                }
            }
        }

        reaper.abort();
        io_loop.abort();
        Ok(())
    }
}

async fn handle_connection(
    shared: Arc<SharedState>,
    connection_id: ConnectionId,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    let session_handle = shared.next_session_handle.fetch_add(1, Ordering::SeqCst);
    {
        let mut sessions = shared.sessions.lock().await;
        sessions.insert(connection_id, ServerSession::new(session_handle));
    }
    let mut fault_state = FaultState::new(shared.fault_policy);
    let local_addr = stream.local_addr().map_err(CipdipError::Io)?;
    if let Some(capture) = &shared.capture {
        capture.record_tcp(peer, local_addr, &[], true, false, false);
        capture.record_tcp(local_addr, peer, &[], true, true, false);
        capture.record_tcp(peer, local_addr, &[], false, true, false);
    }

    let result = async {
        loop {
            let mut header = [0u8; HEADER_LEN];
            stream.read_exact(&mut header).await.map_err(CipdipError::Io)?;
            let data_length = u16::from_le_bytes([header[2], header[3]]) as usize;
            let mut full = header.to_vec();
            if data_length > 0 {
                let mut body = vec![0u8; data_length];
                stream.read_exact(&mut body).await.map_err(CipdipError::Io)?;
                full.extend_from_slice(&body);
            }
            if let Some(capture) = &shared.capture {
                capture.record_tcp(peer, local_addr, &full, false, true, false);
            }
            let (frame, _) = EnipFrame::decode(&full)?;

            let (decision, delay) = fault_state.next_decision();
            if delay > std::time::Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            match decision {
                FaultDecision::CloseConnection => break,
                FaultDecision::Drop => continue,
                FaultDecision::Respond => {}
            }

            let response = process_frame(&shared, connection_id, frame).await?;
            let encoded = response.encode();
            stream.write_all(&encoded).await.map_err(CipdipError::Io)?;
            if let Some(capture) = &shared.capture {
                capture.record_tcp(local_addr, peer, &encoded, false, true, false);
            }
        }
        Ok::<(), CipdipError>(())
    }
    .await;

    let mut sessions = shared.sessions.lock().await;
    if let Some(session) = sessions.get_mut(&connection_id) {
        session.close();
    }
    sessions.remove(&connection_id);
    result
}

async fn process_frame(
    shared: &Arc<SharedState>,
    connection_id: ConnectionId,
    frame: EnipFrame,
) -> Result<EnipFrame> {
    let mut sessions = shared.sessions.lock().await;
    let session = sessions
        .get_mut(&connection_id)
        .ok_or_else(|| CipdipError::Invariant("session vanished mid-frame".into()))?;
    session.check_command_allowed(frame.command)?;
    session.touch();

    match EnipCommand::from_u16(frame.command) {
        Some(EnipCommand::RegisterSession) => {
            session.register();
            let mut response = frame.clone();
            response.session_handle = session.session_handle;
            Ok(response)
        }
        Some(EnipCommand::UnregisterSession) => {
            session.close();
            Ok(EnipFrame::new(frame.command, session.session_handle, Vec::new()))
        }
        Some(EnipCommand::SendRRData) => {
            let envelope = CpfEnvelope::decode(&frame.body)?;
            let data_item = envelope
                .items
                .iter()
                .find(|i| i.item_type == CpfItemType::UnconnectedData)
                .ok_or_else(|| CipdipError::ProtocolFraming("SendRRData missing data item".into()))?;
            let request = CipRequest::decode(&data_item.data)?;

            if request.service == 0x54 {
                return handle_forward_open(shared, session, &request, frame.session_handle).await;
            }
            if request.service == 0x4E {
                session.close_connection();
                let response = crate::wire::cip::CipResponse::success(request.service, Vec::new());
                return wrap_rrdata_response(frame.session_handle, response, shared.profile);
            }

            let response = personality::handle_request(shared.personality, &shared.device, &request)?;
            wrap_rrdata_response(frame.session_handle, response, shared.profile)
        }
        Some(EnipCommand::SendUnitData) => {
            let envelope = CpfEnvelope::decode(&frame.body)?;
            let data_item = envelope
                .items
                .iter()
                .find(|i| i.item_type == CpfItemType::ConnectedData)
                .ok_or_else(|| CipdipError::ProtocolFraming("SendUnitData missing connected data item".into()))?;
            if data_item.data.len() < 2 {
                return Err(CipdipError::ProtocolFraming("SendUnitData connected data item too short".into()));
            }
            let request = CipRequest::decode(&data_item.data[2..])?;
            let response = personality::handle_request(shared.personality, &shared.device, &request)?;
            let reply_sequence = u16::from_le_bytes([data_item.data[0], data_item.data[1]]);
            let reply_envelope = CpfEnvelope::new(vec![
                CpfItem::connected_address(
                    session.connection.as_ref().map(|c| c.t_to_o_connection_id).unwrap_or(0),
                ),
                CpfItem::connected_data(reply_sequence, response.encode(shared.profile)),
            ]);
            Ok(EnipFrame::new(
                EnipCommand::SendUnitData as u16,
                frame.session_handle,
                reply_envelope.encode(),
            ))
        }
        Some(EnipCommand::ListServices) => Ok(list_services_reply(&frame)),
        Some(EnipCommand::ListIdentity) => Ok(list_identity_reply(&frame)),
        _ => Err(CipdipError::ProtocolFraming(format!(
            "unsupported command 0x{:04x}",
            frame.command
        ))),
    }
}

/// Minimal well-formed ListServices reply: zero services offered. Real
/// devices advertise their supported encapsulation services here; the
/// emulator has nothing to advertise beyond what `RegisterSession` and
/// `SendRRData` already imply.
fn list_services_reply(frame: &EnipFrame) -> EnipFrame {
    let body = 0u16.to_le_bytes().to_vec(); // item count = 0
    EnipFrame::new(frame.command, frame.session_handle, body)
}

/// Minimal well-formed ListIdentity reply: a single CPF-style item count
/// of zero. Callers that want device identity details get an empty but
/// protocol-valid response rather than a connection-terminating error.
fn list_identity_reply(frame: &EnipFrame) -> EnipFrame {
    let body = 0u16.to_le_bytes().to_vec();
    EnipFrame::new(frame.command, frame.session_handle, body)
}

async fn handle_forward_open(
    shared: &Arc<SharedState>,
    session: &mut ServerSession,
    request: &CipRequest,
    session_handle: u32,
) -> Result<EnipFrame> {
    // Layout matches `wire::payload::PayloadSpec::build_forward_open`:
    // timeout_tick(1) timeout_ticks(1) o_to_t_id(4) t_to_o_id(4)
    // connection_serial(2) vendor_id(2) originator_serial(4) ...
    // timeout_multiplier(1) reserved(3) o_to_t_rpi(4) ...
    if request.payload.len() < 26 {
        let response = crate::wire::cip::CipResponse::error(request.service, 0x13);
        return wrap_rrdata_response(session_handle, response, shared.profile);
    }
    let o_to_t_connection_id = session_handle ^ 0xA5A5_0000;
    let t_to_o_connection_id = session_handle ^ 0x5A5A_0001;
    let connection_serial = u16::from_le_bytes([request.payload[10], request.payload[11]]);
    let rpi_us = u32::from_le_bytes([
        request.payload[22],
        request.payload[23],
        request.payload[24],
        request.payload[25],
    ]);

    session.open_connection(ImplicitConnection {
        o_to_t_connection_id,
        t_to_o_connection_id,
        connection_serial,
        rpi_us,
        last_traffic: Instant::now(),
        sequence: 0,
    });

    let mut payload = o_to_t_connection_id.to_le_bytes().to_vec();
    payload.extend_from_slice(&t_to_o_connection_id.to_le_bytes());
    let response = crate::wire::cip::CipResponse::success(request.service, payload);
    wrap_rrdata_response(session_handle, response, shared.profile)
}

fn wrap_rrdata_response(
    session_handle: u32,
    response: crate::wire::cip::CipResponse,
    profile: ProtocolProfile,
) -> Result<EnipFrame> {
    let envelope = CpfEnvelope::new(vec![
        CpfItem::null_address(),
        CpfItem::unconnected_data(response.encode(profile)),
    ]);
    Ok(EnipFrame::new(
        EnipCommand::SendRRData as u16,
        session_handle,
        envelope.encode(),
    ))
}

async fn handle_io_datagram(
    shared: &Arc<SharedState>,
    socket: &UdpSocket,
    buf: &[u8],
    peer: SocketAddr,
) -> Result<()> {
    if let Some(capture) = &shared.capture {
        let local_addr = socket.local_addr().map_err(CipdipError::Io)?;
        capture.record_udp(peer, local_addr, buf);
    }
    let envelope = CpfEnvelope::decode(buf)?;
    let address_item = envelope
        .items
        .iter()
        .find(|i| i.item_type == CpfItemType::ConnectedAddress)
        .ok_or_else(|| CipdipError::ProtocolFraming("I/O datagram missing connected address item".into()))?;
    if address_item.data.len() < 4 {
        return Err(CipdipError::ProtocolFraming("connected address item too short".into()));
    }
    let connection_id = u32::from_le_bytes([
        address_item.data[0],
        address_item.data[1],
        address_item.data[2],
        address_item.data[3],
    ]);
    let data_item = envelope
        .items
        .iter()
        .find(|i| i.item_type == CpfItemType::ConnectedData)
        .ok_or_else(|| CipdipError::ProtocolFraming("I/O datagram missing connected data item".into()))?;
    let mut sessions = shared.sessions.lock().await;
    let session = sessions.values_mut().find(|s| {
        s.connection
            .as_ref()
            .is_some_and(|c| c.o_to_t_connection_id == connection_id)
    });
    let session = match session {
        Some(s) => s,
        None => {
            warn!(connection_id, %peer, "I/O datagram for unknown connection id");
            return Ok(());
        }
    };
    let conn = session
        .connection
        .as_mut()
        .expect("session matched by connection id always has a connection");
    conn.last_traffic = Instant::now();
    let reply_sequence = conn.sequence;
    conn.sequence = conn.sequence.wrapping_add(1);
    let reply_item = CpfItem::connected_data(reply_sequence, data_item.data[2..].to_vec());
    let reply = CpfEnvelope::new(vec![
        CpfItem::connected_address(conn.t_to_o_connection_id),
        reply_item,
    ]);
    let reply_encoded = reply.encode();
    socket.send_to(&reply_encoded, peer).await.map_err(CipdipError::Io)?;
    if let Some(capture) = &shared.capture {
        let local_addr = socket.local_addr().map_err(CipdipError::Io)?;
        capture.record_udp(local_addr, peer, &reply_encoded);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::profile::ProtocolProfile;

    #[tokio::test]
    async fn server_registers_a_session_end_to_end() {
        let config = ServerConfig {
            tcp_bind: "127.0.0.1:0".parse().unwrap(),
            udp_bind: "127.0.0.1:0".parse().unwrap(),
            personality: PersonalityKind::Adapter,
            profile: ProtocolProfile::strict_odva(),
            fault_policy: FaultPolicy::default(),
        };
        let server = EmulatorServer::new(&config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server_task = tokio::spawn(async move {
            server.run(addr, "127.0.0.1:0".parse().unwrap(), shutdown_rx).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let body = {
            let mut b = Vec::new();
            b.extend_from_slice(&1u16.to_le_bytes());
            b.extend_from_slice(&0u16.to_le_bytes());
            b
        };
        let frame = EnipFrame::new(EnipCommand::RegisterSession as u16, 0, body);
        stream.write_all(&frame.encode()).await.unwrap();

        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).await.unwrap();
        let data_length = u16::from_le_bytes([header[2], header[3]]) as usize;
        let mut rest = vec![0u8; data_length];
        if data_length > 0 {
            stream.read_exact(&mut rest).await.unwrap();
        }
        let session_handle = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        assert_ne!(session_handle, 0);

        let _ = shutdown_tx.send(());
        let _ = server_task.await;
    }
}
