//! Summarize, classify, and diff already-captured ENIP/CIP traffic.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::wire::cip::CipRequest;
use crate::wire::cpf::{CpfEnvelope, CpfItemType};
use crate::wire::enip::EnipFrame;

use super::format::PcapFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub a: (Ipv4Addr, u16),
    pub b: (Ipv4Addr, u16),
}

impl FlowKey {
    /// Orders the endpoint pair canonically so the same TCP flow always
    /// hashes to the same key regardless of which side is "source" in a
    /// given packet.
    pub fn canonical(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16)) -> Self {
        if src <= dst {
            FlowKey { a: src, b: dst }
        } else {
            FlowKey { a: dst, b: src }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedPacket {
    pub src: Option<(Ipv4Addr, u16)>,
    pub dst: Option<(Ipv4Addr, u16)>,
    pub is_tcp: bool,
    pub tcp_syn: bool,
    pub tcp_ack: bool,
    pub tcp_rst: bool,
    pub enip: Option<EnipFrame>,
    pub cip_request: Option<CipRequest>,
}

/// Best-effort Ethernet/IPv4/TCP|UDP parse down to an ENIP frame. Packets
/// that don't parse are returned with all fields empty rather than
/// erroring out the whole capture.
pub fn parse_packet(data: &[u8]) -> ParsedPacket {
    let mut parsed = ParsedPacket::default();
    if data.len() < 14 {
        return parsed;
    }
    let ethertype = u16::from_be_bytes([data[12], data[13]]);
    if ethertype != 0x0800 {
        return parsed;
    }
    let ip = &data[14..];
    if ip.len() < 20 {
        return parsed;
    }
    let version = ip[0] >> 4;
    if version != 4 {
        return parsed;
    }
    let ihl = (ip[0] & 0x0F) as usize * 4;
    if ip.len() < ihl {
        return parsed;
    }
    let protocol = ip[9];
    let src_ip = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    let dst_ip = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
    let transport = &ip[ihl..];

    match protocol {
        6 => {
            if transport.len() < 20 {
                return parsed;
            }
            parsed.is_tcp = true;
            let src_port = u16::from_be_bytes([transport[0], transport[1]]);
            let dst_port = u16::from_be_bytes([transport[2], transport[3]]);
            let flags = transport[13];
            parsed.tcp_syn = flags & 0x02 != 0;
            parsed.tcp_ack = flags & 0x10 != 0;
            parsed.tcp_rst = flags & 0x04 != 0;
            parsed.src = Some((src_ip, src_port));
            parsed.dst = Some((dst_ip, dst_port));
            let data_offset = ((transport[12] >> 4) as usize) * 4;
            if transport.len() > data_offset {
                let payload = &transport[data_offset..];
                if let Ok((frame, _)) = EnipFrame::decode(payload) {
                    parsed.cip_request = extract_cip_request(&frame);
                    parsed.enip = Some(frame);
                }
            }
        }
        17 => {
            if transport.len() < 8 {
                return parsed;
            }
            let src_port = u16::from_be_bytes([transport[0], transport[1]]);
            let dst_port = u16::from_be_bytes([transport[2], transport[3]]);
            parsed.src = Some((src_ip, src_port));
            parsed.dst = Some((dst_ip, dst_port));
        }
        _ => {}
    }
    parsed
}

fn extract_cip_request(frame: &EnipFrame) -> Option<CipRequest> {
    if frame.command != 0x006F && frame.command != 0x0070 {
        return None;
    }
    let envelope = CpfEnvelope::decode(&frame.body).ok()?;
    let data_item = envelope
        .items
        .iter()
        .find(|i| matches!(i.item_type, CpfItemType::UnconnectedData | CpfItemType::ConnectedData))?;
    let bytes = if data_item.item_type == CpfItemType::ConnectedData {
        data_item.data.get(2..)?
    } else {
        &data_item.data[..]
    };
    CipRequest::decode(bytes).ok()
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CaptureSummary {
    pub total_packets: usize,
    pub enip_command_counts: HashMap<u16, u64>,
    pub cip_service_counts: HashMap<u8, u64>,
    pub cpf_items_present: u64,
    pub cpf_items_absent: u64,
    pub handshake_complete: bool,
}

pub fn summarize(pcap: &PcapFile) -> CaptureSummary {
    let mut summary = CaptureSummary {
        total_packets: pcap.packets.len(),
        ..Default::default()
    };
    let mut saw_syn = false;
    let mut saw_syn_ack = false;
    let mut saw_ack = false;
    for packet in &pcap.packets {
        let parsed = parse_packet(&packet.data);
        if parsed.tcp_syn && !parsed.tcp_ack {
            saw_syn = true;
        }
        if parsed.tcp_syn && parsed.tcp_ack {
            saw_syn_ack = true;
        }
        if parsed.tcp_ack && !parsed.tcp_syn {
            saw_ack = true;
        }
        if let Some(frame) = &parsed.enip {
            *summary.enip_command_counts.entry(frame.command).or_insert(0) += 1;
            if frame.command == 0x006F || frame.command == 0x0070 {
                if CpfEnvelope::decode(&frame.body).is_ok() {
                    summary.cpf_items_present += 1;
                } else {
                    summary.cpf_items_absent += 1;
                }
            }
        }
        if let Some(req) = &parsed.cip_request {
            *summary.cip_service_counts.entry(req.service & 0x7F).or_insert(0) += 1;
        }
    }
    summary.handshake_complete = saw_syn && saw_syn_ack && saw_ack;
    summary
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    ProtocolNormal,
    TransportNoisy,
    ProtocolAnomalous,
    NotCipEnip,
}

pub fn classify(summary: &CaptureSummary) -> (Classification, Vec<String>) {
    let mut reasons = Vec::new();
    if summary.enip_command_counts.is_empty() {
        reasons.push("no ENIP frames decoded".to_string());
        return (Classification::NotCipEnip, reasons);
    }
    if summary.cpf_items_absent > 0 {
        reasons.push(format!(
            "{} SendRRData/SendUnitData frames had undecodable CPF bodies",
            summary.cpf_items_absent
        ));
    }
    if !summary.handshake_complete {
        reasons.push("TCP three-way handshake not fully observed".to_string());
        return (Classification::TransportNoisy, reasons);
    }
    if !reasons.is_empty() {
        return (Classification::ProtocolAnomalous, reasons);
    }
    (Classification::ProtocolNormal, reasons)
}

#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub significance_threshold_pct: f64,
}

impl Default for DiffOptions {
    fn default() -> Self {
        DiffOptions { significance_threshold_pct: 10.0 }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureDiff {
    pub added_services: Vec<u8>,
    pub removed_services: Vec<u8>,
    pub score: u8,
    pub significant: bool,
}

/// Compares two summaries: service-code set deltas feed the diff score
/// directly, weighted 60/40 against the relative change in total frame
/// volume as a timing-shape proxy (a true percentile diff requires the
/// metrics sink, not the capture alone).
pub fn diff(baseline: &CaptureSummary, compare: &CaptureSummary, opts: &DiffOptions) -> CaptureDiff {
    let baseline_services: std::collections::HashSet<u8> = baseline.cip_service_counts.keys().copied().collect();
    let compare_services: std::collections::HashSet<u8> = compare.cip_service_counts.keys().copied().collect();
    let mut added: Vec<u8> = compare_services.difference(&baseline_services).copied().collect();
    let mut removed: Vec<u8> = baseline_services.difference(&compare_services).copied().collect();
    added.sort_unstable();
    removed.sort_unstable();

    let volume_delta_pct = if baseline.total_packets > 0 {
        ((compare.total_packets as f64 - baseline.total_packets as f64).abs() / baseline.total_packets as f64) * 100.0
    } else {
        0.0
    };

    let service_delta_score = ((added.len() + removed.len()) as f64 * 20.0).min(60.0);
    let volume_score = (volume_delta_pct / 2.0).min(40.0);
    let score = (service_delta_score + volume_score).round().clamp(0.0, 100.0) as u8;

    let significant = !added.is_empty() || !removed.is_empty() || volume_delta_pct > opts.significance_threshold_pct;

    CaptureDiff {
        added_services: added,
        removed_services: removed,
        score,
        significant,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_key_is_symmetric_regardless_of_direction() {
        let a = (Ipv4Addr::new(10, 0, 0, 1), 44818);
        let b = (Ipv4Addr::new(10, 0, 0, 2), 51000);
        assert_eq!(FlowKey::canonical(a, b), FlowKey::canonical(b, a));
    }

    #[test]
    fn summary_of_empty_capture_is_not_cip_enip() {
        let pcap = PcapFile::new();
        let summary = summarize(&pcap);
        let (classification, _) = classify(&summary);
        assert_eq!(classification, Classification::NotCipEnip);
    }

    #[test]
    fn diff_is_zero_score_for_identical_summaries() {
        let mut summary = CaptureSummary::default();
        summary.total_packets = 10;
        summary.cip_service_counts.insert(0x0E, 5);
        let result = diff(&summary.clone(), &summary, &DiffOptions::default());
        assert_eq!(result.score, 0);
        assert!(!result.significant);
    }
}
