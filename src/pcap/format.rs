//! Minimal classic libpcap file format reader/writer.
//!
//! CIPDIP is not a PCAP player (Non-goal), but `Diff`/`Summarize`/bundle
//! verification genuinely need to read back already-captured files, so a
//! small internal reader lives here rather than binding libpcap.

use crate::error::{CipdipError, Result};

const MAGIC_MICROS: u32 = 0xA1B2C3D4;
const MAGIC_NANOS: u32 = 0xA1B23C4D;

#[derive(Debug, Clone)]
pub struct PcapPacket {
    pub timestamp_secs: u32,
    pub timestamp_frac: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PcapFile {
    pub nanosecond_resolution: bool,
    pub packets: Vec<PcapPacket>,
}

impl PcapFile {
    pub fn new() -> Self {
        PcapFile {
            nanosecond_resolution: false,
            packets: Vec::new(),
        }
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 24 {
            return Err(CipdipError::Integrity("pcap file shorter than global header".into()));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let nanosecond_resolution = match magic {
            MAGIC_MICROS => false,
            MAGIC_NANOS => true,
            other => {
                return Err(CipdipError::Integrity(format!(
                    "unrecognized pcap magic 0x{other:08x}"
                )))
            }
        };
        let mut offset = 24usize;
        let mut packets = Vec::new();
        while offset + 16 <= bytes.len() {
            let ts_sec = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
            let ts_frac = u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap());
            let incl_len = u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().unwrap()) as usize;
            offset += 16;
            if offset + incl_len > bytes.len() {
                return Err(CipdipError::Integrity("pcap record claims more bytes than remain".into()));
            }
            packets.push(PcapPacket {
                timestamp_secs: ts_sec,
                timestamp_frac: ts_frac,
                data: bytes[offset..offset + incl_len].to_vec(),
            });
            offset += incl_len;
        }
        Ok(PcapFile {
            nanosecond_resolution,
            packets,
        })
    }

    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let magic = if self.nanosecond_resolution { MAGIC_NANOS } else { MAGIC_MICROS };
        out.extend_from_slice(&magic.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes()); // version major
        out.extend_from_slice(&4u16.to_le_bytes()); // version minor
        out.extend_from_slice(&0i32.to_le_bytes()); // thiszone
        out.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        out.extend_from_slice(&65535u32.to_le_bytes()); // snaplen
        out.extend_from_slice(&1u32.to_le_bytes()); // linktype: LINKTYPE_ETHERNET
        for packet in &self.packets {
            out.extend_from_slice(&packet.timestamp_secs.to_le_bytes());
            out.extend_from_slice(&packet.timestamp_frac.to_le_bytes());
            out.extend_from_slice(&(packet.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(packet.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&packet.data);
        }
        out
    }

    pub fn push(&mut self, timestamp_secs: u32, timestamp_frac: u32, data: Vec<u8>) {
        self.packets.push(PcapPacket { timestamp_secs, timestamp_frac, data });
    }
}

impl Default for PcapFile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut file = PcapFile::new();
        file.push(1_700_000_000, 0, vec![1, 2, 3, 4]);
        file.push(1_700_000_001, 500_000, vec![5, 6]);
        let bytes = file.write();
        let decoded = PcapFile::read(&bytes).unwrap();
        assert_eq!(decoded.packets.len(), 2);
        assert_eq!(decoded.packets[0].data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = vec![0u8; 24];
        assert!(PcapFile::read(&bytes).is_err());
    }
}
