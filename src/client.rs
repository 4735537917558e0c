//! Client session: explicit (TCP) and implicit (UDP) CIP traffic over a
//! single registered ENIP session.
//!
//! A length-prefixed stream wrapped in connect/send/receive/close,
//! carrying framed ENIP/CIP exchanges over the TCP side and a
//! ForwardOpen/Close-driven UDP side channel for implicit I/O.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;

use crate::capture::CaptureHandle;
use crate::error::{CipdipError, Result};
use crate::wire::cip::{CipRequest, CipResponse};
use crate::wire::cpf::{CpfEnvelope, CpfItem};
use crate::wire::enip::{EnipCommand, EnipFrame};
use crate::wire::path::CipPath;
use crate::wire::payload::PayloadSpec;
use crate::wire::profile::ProtocolProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Unregistered,
    Registered,
    ConnOpen,
    Closed,
}

pub struct ForwardOpenHandle {
    pub connection_serial: u16,
    pub o_to_t_connection_id: u32,
    pub t_to_o_connection_id: u32,
    pub rpi_us: u32,
    sequence: u16,
}

pub struct ClientSession {
    profile: ProtocolProfile,
    stream: Mutex<TcpStream>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    session_handle: u32,
    state: SessionState,
    udp: Option<UdpSocket>,
    forward_open: Option<ForwardOpenHandle>,
    capture: Option<Arc<dyn CaptureHandle>>,
}

impl ClientSession {
    /// Connects a TCP stream and completes RegisterSession, moving the
    /// session to `REGISTERED`.
    pub async fn connect(addr: SocketAddr, profile: ProtocolProfile) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(CipdipError::Io)?;
        stream.set_nodelay(true).ok();
        let local_addr = stream.local_addr().map_err(CipdipError::Io)?;
        let peer_addr = stream.peer_addr().map_err(CipdipError::Io)?;
        let mut session = ClientSession {
            profile,
            stream: Mutex::new(stream),
            local_addr,
            peer_addr,
            session_handle: 0,
            state: SessionState::Unregistered,
            udp: None,
            forward_open: None,
            capture: None,
        };
        session.register().await?;
        Ok(session)
    }

    /// Taps every TCP/UDP frame this session sends or receives from here
    /// on, recording it into `capture`. The connection is already
    /// established by the time a capture is attached, so a synthetic
    /// three-way handshake is recorded up front to keep capture summaries
    /// consistent.
    pub fn attach_capture(&mut self, capture: Arc<dyn CaptureHandle>) {
        capture.record_tcp(self.local_addr, self.peer_addr, &[], true, false, false);
        capture.record_tcp(self.peer_addr, self.local_addr, &[], true, true, false);
        capture.record_tcp(self.local_addr, self.peer_addr, &[], false, true, false);
        self.capture = Some(capture);
    }

    async fn register(&mut self) -> Result<()> {
        let body = {
            let mut b = Vec::new();
            b.extend_from_slice(&1u16.to_le_bytes()); // protocol version
            b.extend_from_slice(&0u16.to_le_bytes()); // options
            b
        };
        let frame = EnipFrame::new(EnipCommand::RegisterSession as u16, 0, body);
        let response = self.round_trip_frame(frame).await?;
        if response.status != 0 {
            return Err(CipdipError::ProtocolFraming(format!(
                "RegisterSession failed with status 0x{:08x}",
                response.status
            )));
        }
        self.session_handle = response.session_handle;
        self.state = SessionState::Registered;
        Ok(())
    }

    fn require_registered(&self) -> Result<()> {
        if self.state == SessionState::Unregistered || self.state == SessionState::Closed {
            return Err(CipdipError::Invariant(
                "operation requires a registered session".into(),
            ));
        }
        Ok(())
    }

    /// Sends one CIP request wrapped in SendRRData/UCMM and returns the
    /// decoded response. One in flight at a time per session.
    pub async fn invoke_service(
        &mut self,
        service: u8,
        path: CipPath,
        spec: Option<&PayloadSpec>,
    ) -> Result<CipResponse> {
        self.invoke_service_with_mutation(service, path, spec, None).await
    }

    /// As [`ClientSession::invoke_service`], but applies a deterministic
    /// [`crate::wire::payload::Mutation`] to the built payload before
    /// framing, for fault-injection scenarios that exercise malformed
    /// traffic on purpose.
    pub async fn invoke_service_with_mutation(
        &mut self,
        service: u8,
        path: CipPath,
        spec: Option<&PayloadSpec>,
        mutation: Option<(crate::wire::payload::Mutation, u64)>,
    ) -> Result<CipResponse> {
        self.require_registered()?;
        let mut payload = match spec {
            Some(s) => s.build().map_err(|e| CipdipError::Invariant(e.to_string()))?,
            None => Vec::new(),
        };
        if let Some((kind, seed)) = mutation {
            payload = crate::wire::payload::apply_mutation(&payload, kind, seed);
        }
        let request = CipRequest::new(service, path, payload);
        let envelope = CpfEnvelope::new(vec![
            CpfItem::null_address(),
            CpfItem::unconnected_data(request.encode()),
        ]);
        let frame = EnipFrame::new(
            EnipCommand::SendRRData as u16,
            self.session_handle,
            envelope.encode(),
        );
        let response_frame = self.round_trip_frame(frame).await?;
        let response_envelope = CpfEnvelope::decode(&response_frame.body)?;
        let data_item = response_envelope
            .items
            .iter()
            .find(|i| matches!(i.item_type, crate::wire::cpf::CpfItemType::UnconnectedData))
            .ok_or_else(|| CipdipError::ProtocolFraming("no unconnected data item in response".into()))?;
        let cip_response = CipResponse::decode(&data_item.data, self.profile)?;
        if !cip_response.mirrors(service) {
            return Err(CipdipError::Invariant(format!(
                "response service 0x{:02x} does not mirror request 0x{:02x}",
                cip_response.service, service
            )));
        }
        Ok(cip_response)
    }

    /// Opens a Class-1 implicit connection and binds the UDP socket used
    /// for I/O traffic. Moves the session to `CONN_OPEN`.
    pub async fn forward_open(&mut self, spec: PayloadSpec, local_udp_port: u16) -> Result<()> {
        self.require_registered()?;
        let connection_serial = match spec.params.get("connection_serial") {
            Some(crate::wire::payload::PayloadParam::U16(v)) => *v,
            _ => return Err(CipdipError::Invariant("forward_open requires connection_serial".into())),
        };
        let rpi_us = match spec.params.get("rpi_us") {
            Some(crate::wire::payload::PayloadParam::U32(v)) => *v,
            _ => return Err(CipdipError::Invariant("forward_open requires rpi_us".into())),
        };
        let path = CipPath::class_instance_attribute(0x06, 1, None);
        let response = self
            .invoke_service(0x54, path, Some(&spec))
            .await?;
        if response.general_status != 0 {
            return Err(CipdipError::ProtocolService {
                service: 0x54,
                status: response.general_status,
                detail: "ForwardOpen rejected".to_string(),
            });
        }
        if response.payload.len() < 8 {
            return Err(CipdipError::ProtocolFraming("ForwardOpen response too short".into()));
        }
        let o_to_t = u32::from_le_bytes(response.payload[0..4].try_into().unwrap());
        let t_to_o = u32::from_le_bytes(response.payload[4..8].try_into().unwrap());

        let udp = UdpSocket::bind(("0.0.0.0", local_udp_port)).await.map_err(CipdipError::Io)?;
        self.udp = Some(udp);
        self.forward_open = Some(ForwardOpenHandle {
            connection_serial,
            o_to_t_connection_id: o_to_t,
            t_to_o_connection_id: t_to_o,
            rpi_us,
            sequence: 0,
        });
        self.state = SessionState::ConnOpen;
        Ok(())
    }

    pub async fn send_io_data(&mut self, target: SocketAddr, data: &[u8]) -> Result<()> {
        let udp = self.udp.as_ref().ok_or_else(|| {
            CipdipError::Invariant("send_io_data called without an open connection".into())
        })?;
        let handle = self.forward_open.as_mut().ok_or_else(|| {
            CipdipError::Invariant("send_io_data called without an open connection".into())
        })?;
        let item = CpfItem::connected_data(handle.sequence, data.to_vec());
        handle.sequence = handle.sequence.wrapping_add(1);
        let envelope = CpfEnvelope::new(vec![
            CpfItem::connected_address(handle.o_to_t_connection_id),
            item,
        ]);
        let encoded = envelope.encode();
        let local_udp_addr = udp.local_addr().map_err(CipdipError::Io)?;
        udp.send_to(&encoded, target).await.map_err(CipdipError::Io)?;
        if let Some(capture) = &self.capture {
            capture.record_udp(local_udp_addr, target, &encoded);
        }
        Ok(())
    }

    pub async fn receive_io_data(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let udp = self.udp.as_ref().ok_or_else(|| {
            CipdipError::Invariant("receive_io_data called without an open connection".into())
        })?;
        let mut buf = [0u8; 1500];
        let (n, peer) = tokio::time::timeout(timeout, udp.recv_from(&mut buf))
            .await
            .map_err(|_| CipdipError::Timeout(timeout))?
            .map_err(CipdipError::Io)?;
        if let Some(capture) = &self.capture {
            let local_udp_addr = udp.local_addr().map_err(CipdipError::Io)?;
            capture.record_udp(peer, local_udp_addr, &buf[..n]);
        }
        let envelope = CpfEnvelope::decode(&buf[..n])?;
        let data_item = envelope
            .items
            .iter()
            .find(|i| matches!(i.item_type, crate::wire::cpf::CpfItemType::ConnectedData))
            .ok_or_else(|| CipdipError::ProtocolFraming("no connected data item in I/O datagram".into()))?;
        Ok(data_item.data[2..].to_vec())
    }

    pub async fn forward_close(&mut self) -> Result<()> {
        let handle = self.forward_open.take().ok_or_else(|| {
            CipdipError::Invariant("forward_close called without an open connection".into())
        })?;
        let spec = PayloadSpec::new(crate::wire::payload::PayloadKind::ForwardClose)
            .with("connection_serial", crate::wire::payload::PayloadParam::U16(handle.connection_serial))
            .with("originator_vendor_id", crate::wire::payload::PayloadParam::U16(0x1337))
            .with("originator_serial", crate::wire::payload::PayloadParam::U32(0));
        let path = CipPath::class_instance_attribute(0x06, 1, None);
        let response = self.invoke_service(0x4E, path, Some(&spec)).await?;
        self.udp = None;
        self.state = SessionState::Registered;
        if response.general_status != 0 {
            return Err(CipdipError::ProtocolService {
                service: 0x4E,
                status: response.general_status,
                detail: "ForwardClose rejected".to_string(),
            });
        }
        Ok(())
    }

    pub async fn disconnect(mut self) -> Result<()> {
        if self.state == SessionState::ConnOpen {
            let _ = self.forward_close().await;
        }
        let body = Vec::new();
        let frame = EnipFrame::new(EnipCommand::UnregisterSession as u16, self.session_handle, body);
        let mut stream = self.stream.lock().await;
        let encoded = frame.encode();
        tokio::io::AsyncWriteExt::write_all(&mut *stream, &encoded)
            .await
            .map_err(CipdipError::Io)?;
        self.state = SessionState::Closed;
        Ok(())
    }

    async fn round_trip_frame(&self, frame: EnipFrame) -> Result<EnipFrame> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = self.stream.lock().await;
        let encoded = frame.encode();
        stream.write_all(&encoded).await.map_err(CipdipError::Io)?;
        if let Some(capture) = &self.capture {
            capture.record_tcp(self.local_addr, self.peer_addr, &encoded, false, true, false);
        }

        let mut header = [0u8; crate::wire::enip::HEADER_LEN];
        stream.read_exact(&mut header).await.map_err(CipdipError::Io)?;
        let data_length = u16::from_le_bytes([header[2], header[3]]) as usize;
        let mut full = header.to_vec();
        if data_length > 0 {
            let mut body = vec![0u8; data_length];
            stream.read_exact(&mut body).await.map_err(CipdipError::Io)?;
            full.extend_from_slice(&body);
        }
        if let Some(capture) = &self.capture {
            capture.record_tcp(self.peer_addr, self.local_addr, &full, false, true, false);
        }
        let (decoded, _) = EnipFrame::decode(&full)?;
        Ok(decoded)
    }
}

/// Measures one request's round-trip wall-clock time in microseconds,
/// used by the scenario engine to build a `MetricSample`.
pub async fn timed<F, Fut, T>(f: F) -> (Result<T>, u64)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let start = Instant::now();
    let result = f().await;
    (result, start.elapsed().as_micros() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_open_handle_sequence_starts_at_zero() {
        let handle = ForwardOpenHandle {
            connection_serial: 1,
            o_to_t_connection_id: 0,
            t_to_o_connection_id: 0,
            rpi_us: 10_000,
            sequence: 0,
        };
        assert_eq!(handle.sequence, 0);
    }
}
