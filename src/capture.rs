//! Software packet capture: a library-only tap that wraps already-encoded
//! ENIP bytes in synthetic Ethernet/IPv4/TCP|UDP headers and appends them
//! to an in-memory [`PcapFile`], so a run has real capture bytes to
//! analyze without binding to a raw socket or vendoring libpcap.
//!
//! `CaptureHandle` is the seam: the client session and emulator server
//! each hold an `Option<Arc<dyn CaptureHandle>>` and call `record_tcp`/
//! `record_udp` next to every frame they already read or write. Nothing
//! downstream cares whether the implementation is `SoftwareCapture` or a
//! future raw-socket one.

use std::net::SocketAddr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CipdipError, Result};
use crate::pcap::format::PcapFile;

pub trait CaptureHandle: Send + Sync {
    /// Records one TCP segment carrying `payload` (an already-encoded
    /// ENIP frame, or empty for a pure control segment).
    fn record_tcp(&self, src: SocketAddr, dst: SocketAddr, payload: &[u8], syn: bool, ack: bool, rst: bool);

    /// Records one UDP datagram carrying `payload`.
    fn record_udp(&self, src: SocketAddr, dst: SocketAddr, payload: &[u8]);
}

/// Synthesizes minimal Ethernet/IPv4/TCP|UDP frames around tapped
/// traffic and accumulates them into a [`PcapFile`] that can be written
/// to disk. MAC addresses are fixed placeholders since nothing in this
/// build has a real link layer to report.
pub struct SoftwareCapture {
    file: parking_lot::Mutex<PcapFile>,
}

const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
const ETHERTYPE_IPV4: [u8; 2] = [0x08, 0x00];

impl SoftwareCapture {
    pub fn new() -> Self {
        SoftwareCapture {
            file: parking_lot::Mutex::new(PcapFile::new()),
        }
    }

    pub fn packet_count(&self) -> usize {
        self.file.lock().packets.len()
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let bytes = self.file.lock().write();
        std::fs::write(path, bytes).map_err(CipdipError::Io)
    }

    fn push(&self, frame: Vec<u8>) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        self.file.lock().push(now.as_secs() as u32, now.subsec_micros(), frame);
    }
}

impl Default for SoftwareCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureHandle for SoftwareCapture {
    fn record_tcp(&self, src: SocketAddr, dst: SocketAddr, payload: &[u8], syn: bool, ack: bool, rst: bool) {
        self.push(build_tcp_frame(src, dst, payload, syn, ack, rst));
    }

    fn record_udp(&self, src: SocketAddr, dst: SocketAddr, payload: &[u8]) {
        self.push(build_udp_frame(src, dst, payload));
    }
}

fn ipv4_octets(addr: SocketAddr) -> [u8; 4] {
    match addr {
        SocketAddr::V4(v4) => v4.ip().octets(),
        SocketAddr::V6(_) => [127, 0, 0, 1], // capture is a diagnostic best-effort tap, not a real sniffer
    }
}

fn build_ipv4_header(total_len: u16, protocol: u8, src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    out.push(0x45); // version 4, IHL 5
    out.push(0x00); // DSCP/ECN
    out.extend_from_slice(&total_len.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // identification
    out.extend_from_slice(&0u16.to_be_bytes()); // flags/fragment offset
    out.push(64); // TTL
    out.push(protocol);
    out.extend_from_slice(&0u16.to_be_bytes()); // checksum, left unvalidated by this build's own reader
    out.extend_from_slice(&ipv4_octets(src));
    out.extend_from_slice(&ipv4_octets(dst));
    out
}

fn build_eth_header() -> Vec<u8> {
    let mut out = Vec::with_capacity(14);
    out.extend_from_slice(&DST_MAC);
    out.extend_from_slice(&SRC_MAC);
    out.extend_from_slice(&ETHERTYPE_IPV4);
    out
}

fn build_tcp_frame(src: SocketAddr, dst: SocketAddr, payload: &[u8], syn: bool, ack: bool, rst: bool) -> Vec<u8> {
    let mut tcp = Vec::with_capacity(20 + payload.len());
    tcp.extend_from_slice(&src.port().to_be_bytes());
    tcp.extend_from_slice(&dst.port().to_be_bytes());
    tcp.extend_from_slice(&0u32.to_be_bytes()); // sequence number
    tcp.extend_from_slice(&0u32.to_be_bytes()); // ack number
    tcp.push(0x50); // data offset 5, reserved bits
    let mut flags = 0u8;
    if syn {
        flags |= 0x02;
    }
    if ack {
        flags |= 0x10;
    }
    if rst {
        flags |= 0x04;
    }
    tcp.push(flags);
    tcp.extend_from_slice(&65535u16.to_be_bytes()); // window
    tcp.extend_from_slice(&0u16.to_be_bytes()); // checksum
    tcp.extend_from_slice(&0u16.to_be_bytes()); // urgent pointer
    tcp.extend_from_slice(payload);

    let total_len = (20 + tcp.len()) as u16;
    let mut out = build_eth_header();
    out.extend_from_slice(&build_ipv4_header(total_len, 6, src, dst));
    out.extend_from_slice(&tcp);
    out
}

fn build_udp_frame(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut udp = Vec::with_capacity(8 + payload.len());
    udp.extend_from_slice(&src.port().to_be_bytes());
    udp.extend_from_slice(&dst.port().to_be_bytes());
    udp.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    udp.extend_from_slice(&0u16.to_be_bytes()); // checksum
    udp.extend_from_slice(payload);

    let total_len = (20 + udp.len()) as u16;
    let mut out = build_eth_header();
    out.extend_from_slice(&build_ipv4_header(total_len, 17, src, dst));
    out.extend_from_slice(&udp);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcap::analyze::{parse_packet, summarize};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn recorded_tcp_frame_round_trips_through_the_pcap_parser() {
        let capture = SoftwareCapture::new();
        capture.record_tcp(addr(51000), addr(44818), &[], true, false, false);
        capture.record_tcp(addr(44818), addr(51000), &[], true, true, false);
        capture.record_tcp(addr(51000), addr(44818), &[], false, true, false);
        capture.record_tcp(addr(51000), addr(44818), &[0x6F, 0x00, 0x00, 0x00], true, true, false);
        assert_eq!(capture.packet_count(), 4);

        let parsed = parse_packet(&capture.file.lock().packets[3].data);
        assert!(parsed.is_tcp);
        assert_eq!(parsed.src, Some((std::net::Ipv4Addr::new(127, 0, 0, 1), 51000)));
    }

    #[test]
    fn summary_of_full_handshake_reports_complete() {
        let capture = SoftwareCapture::new();
        capture.record_tcp(addr(51000), addr(44818), &[], true, false, false);
        capture.record_tcp(addr(44818), addr(51000), &[], true, true, false);
        capture.record_tcp(addr(51000), addr(44818), &[], false, true, false);
        let pcap = capture.file.lock().clone();
        let summary = summarize(&pcap);
        assert!(summary.handshake_complete);
    }

    #[test]
    fn recorded_udp_frame_parses_with_correct_ports() {
        let capture = SoftwareCapture::new();
        capture.record_udp(addr(52000), addr(44818), &[1, 2, 3]);
        let parsed = parse_packet(&capture.file.lock().packets[0].data);
        assert_eq!(parsed.dst, Some((std::net::Ipv4Addr::new(127, 0, 0, 1), 44818)));
    }

    #[test]
    fn write_to_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcap");
        let capture = SoftwareCapture::new();
        capture.record_tcp(addr(51000), addr(44818), &[0x65, 0x00], true, false, false);
        capture.write_to(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let decoded = PcapFile::read(&bytes).unwrap();
        assert_eq!(decoded.packets.len(), 1);
    }
}
