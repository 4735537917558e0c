//! Common Packet Format: the length-delimited item list carried inside
//! SendRRData and SendUnitData bodies.

use crate::error::{CipdipError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpfItemType {
    NullAddress,
    ConnectedAddress,
    ConnectedData,
    UnconnectedData,
    SockaddrInfoOriginToTarget,
    SockaddrInfoTargetToOrigin,
    Unknown(u16),
}

impl CpfItemType {
    pub fn id(&self) -> u16 {
        match self {
            CpfItemType::NullAddress => 0x0000,
            CpfItemType::ConnectedAddress => 0x00A1,
            CpfItemType::ConnectedData => 0x00B1,
            CpfItemType::UnconnectedData => 0x00B2,
            CpfItemType::SockaddrInfoOriginToTarget => 0x8000,
            CpfItemType::SockaddrInfoTargetToOrigin => 0x8001,
            CpfItemType::Unknown(id) => *id,
        }
    }

    pub fn from_id(id: u16) -> Self {
        match id {
            0x0000 => CpfItemType::NullAddress,
            0x00A1 => CpfItemType::ConnectedAddress,
            0x00B1 => CpfItemType::ConnectedData,
            0x00B2 => CpfItemType::UnconnectedData,
            0x8000 => CpfItemType::SockaddrInfoOriginToTarget,
            0x8001 => CpfItemType::SockaddrInfoTargetToOrigin,
            other => CpfItemType::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpfItem {
    pub item_type: CpfItemType,
    pub data: Vec<u8>,
}

impl CpfItem {
    pub fn null_address() -> Self {
        CpfItem {
            item_type: CpfItemType::NullAddress,
            data: Vec::new(),
        }
    }

    pub fn connected_address(connection_id: u32) -> Self {
        CpfItem {
            item_type: CpfItemType::ConnectedAddress,
            data: connection_id.to_le_bytes().to_vec(),
        }
    }

    pub fn unconnected_data(cip_bytes: Vec<u8>) -> Self {
        CpfItem {
            item_type: CpfItemType::UnconnectedData,
            data: cip_bytes,
        }
    }

    /// Connected data item with the leading 16-bit sequence count CIP
    /// prepends ahead of Class-1 payloads.
    pub fn connected_data(sequence: u16, cip_bytes: Vec<u8>) -> Self {
        let mut data = sequence.to_le_bytes().to_vec();
        data.extend_from_slice(&cip_bytes);
        CpfItem {
            item_type: CpfItemType::ConnectedData,
            data,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.item_type.id().to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.data);
    }
}

/// Encodes a full CPF list: 16-bit item count followed by each item.
pub fn encode_items(items: &[CpfItem]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(items.len() as u16).to_le_bytes());
    for item in items {
        item.encode(&mut out);
    }
    out
}

pub fn decode_items(buf: &[u8]) -> Result<Vec<CpfItem>> {
    if buf.len() < 2 {
        return Err(CipdipError::ProtocolFraming("CPF list missing item count".into()));
    }
    let count = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    let mut items = Vec::with_capacity(count);
    let mut i = 2usize;
    for _ in 0..count {
        if buf.len() < i + 4 {
            return Err(CipdipError::ProtocolFraming("truncated CPF item header".into()));
        }
        let type_id = u16::from_le_bytes([buf[i], buf[i + 1]]);
        let len = u16::from_le_bytes([buf[i + 2], buf[i + 3]]) as usize;
        i += 4;
        if buf.len() < i + len {
            return Err(CipdipError::ProtocolFraming("truncated CPF item data".into()));
        }
        items.push(CpfItem {
            item_type: CpfItemType::from_id(type_id),
            data: buf[i..i + len].to_vec(),
        });
        i += len;
    }
    Ok(items)
}

/// `SendRRData`/`SendUnitData` body wrapper: interface handle, timeout,
/// then the CPF item list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpfEnvelope {
    pub interface_handle: u32,
    pub timeout: u16,
    pub items: Vec<CpfItem>,
}

impl CpfEnvelope {
    pub fn new(items: Vec<CpfItem>) -> Self {
        CpfEnvelope {
            interface_handle: 0,
            timeout: 0,
            items,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.interface_handle.to_le_bytes());
        out.extend_from_slice(&self.timeout.to_le_bytes());
        out.extend_from_slice(&encode_items(&self.items));
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 6 {
            return Err(CipdipError::ProtocolFraming("short CPF envelope".into()));
        }
        let interface_handle = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let timeout = u16::from_le_bytes([buf[4], buf[5]]);
        let items = decode_items(&buf[6..])?;
        Ok(CpfEnvelope {
            interface_handle,
            timeout,
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_with_unconnected_data() {
        let env = CpfEnvelope::new(vec![
            CpfItem::null_address(),
            CpfItem::unconnected_data(vec![0x0E, 0x02, 0x20, 0x04, 0x24, 0x01]),
        ]);
        let encoded = env.encode();
        let decoded = CpfEnvelope::decode(&encoded).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn connected_data_item_carries_sequence_count() {
        let item = CpfItem::connected_data(7, vec![0xAA, 0xBB]);
        assert_eq!(u16::from_le_bytes([item.data[0], item.data[1]]), 7);
        assert_eq!(&item.data[2..], &[0xAA, 0xBB]);
    }

    #[test]
    fn address_item_precedes_data_item_in_standard_ucmm_exchange() {
        let env = CpfEnvelope::new(vec![
            CpfItem::null_address(),
            CpfItem::unconnected_data(vec![0x01]),
        ]);
        assert_eq!(env.items[0].item_type, CpfItemType::NullAddress);
        assert_eq!(env.items[1].item_type, CpfItemType::UnconnectedData);
    }
}
