//! Emulator personalities: `adapter` (CIP Assembly object) and
//! `logix_like` (symbol object with a tag table).

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::{CipdipError, Result};
use crate::wire::cip::CipResponse;
use crate::wire::cip::CipRequest;
use crate::wire::path::{CipPath, LogicalSegment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonalityKind {
    Adapter,
    LogixLike,
}

impl PersonalityKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "adapter" => Some(PersonalityKind::Adapter),
            "logix_like" => Some(PersonalityKind::LogixLike),
            _ => None,
        }
    }
}

/// Shared, lock-protected device state a personality serves requests
/// from. Readers (service handlers) take a read lock; writers
/// (Set_Attribute_Single/Write_Tag, scheduled updates) take a write lock.
pub struct DeviceState {
    pub assemblies: RwLock<HashMap<u32, Vec<u8>>>,
    pub tags: RwLock<HashMap<String, TagValue>>,
}

#[derive(Debug, Clone)]
pub struct TagValue {
    pub datatype: u16,
    pub bytes: Vec<u8>,
}

impl DeviceState {
    pub fn new_adapter() -> Self {
        let mut assemblies = HashMap::new();
        assemblies.insert(100, vec![0u8; 4]); // input assembly
        assemblies.insert(101, vec![0u8; 4]); // output assembly
        DeviceState {
            assemblies: RwLock::new(assemblies),
            tags: RwLock::new(HashMap::new()),
        }
    }

    pub fn new_logix_like() -> Self {
        let mut tags = HashMap::new();
        tags.insert(
            "Tag1".to_string(),
            TagValue {
                datatype: 0x00C3,
                bytes: vec![0, 0],
            },
        );
        DeviceState {
            assemblies: RwLock::new(HashMap::new()),
            tags: RwLock::new(tags),
        }
    }
}

/// Dispatches one decoded CIP request to the appropriate personality
/// handler, returning the response payload to be wrapped in ENIP/CPF by
/// the caller.
pub fn handle_request(
    kind: PersonalityKind,
    state: &DeviceState,
    request: &CipRequest,
) -> Result<CipResponse> {
    match kind {
        PersonalityKind::Adapter => handle_adapter(state, request),
        PersonalityKind::LogixLike => handle_logix_like(state, request),
    }
}

fn instance_of(path: &CipPath) -> Option<u32> {
    if let CipPath::Logical(segs) = path {
        for seg in segs {
            if let LogicalSegment::Instance(i) = seg {
                return Some(*i);
            }
        }
    }
    None
}

fn handle_adapter(state: &DeviceState, request: &CipRequest) -> Result<CipResponse> {
    let instance = instance_of(&request.path)
        .ok_or_else(|| CipdipError::ProtocolFraming("assembly request missing instance segment".into()))?;
    match request.service {
        0x0E => {
            let assemblies = state.assemblies.read();
            match assemblies.get(&instance) {
                Some(data) => Ok(CipResponse::success(request.service, data.clone())),
                None => Ok(CipResponse::error(request.service, 0x05)), // path destination unknown
            }
        }
        0x10 => {
            let mut assemblies = state.assemblies.write();
            match assemblies.get_mut(&instance) {
                Some(slot) => {
                    *slot = request.payload.clone();
                    Ok(CipResponse::success(request.service, Vec::new()))
                }
                None => Ok(CipResponse::error(request.service, 0x05)),
            }
        }
        other => Ok(CipResponse::error(other, 0x08)), // service not supported
    }
}

fn tag_name(path: &CipPath) -> Option<&str> {
    match path {
        CipPath::Symbolic { name, .. } => Some(name.as_str()),
        _ => None,
    }
}

fn handle_logix_like(state: &DeviceState, request: &CipRequest) -> Result<CipResponse> {
    let name = tag_name(&request.path)
        .ok_or_else(|| CipdipError::ProtocolFraming("symbol request missing tag name segment".into()))?;
    match request.service {
        0x4C => {
            let tags = state.tags.read();
            match tags.get(name) {
                Some(tag) => {
                    let mut payload = tag.datatype.to_le_bytes().to_vec();
                    payload.extend_from_slice(&tag.bytes);
                    Ok(CipResponse::success(request.service, payload))
                }
                None => Ok(CipResponse::error(request.service, 0x05)),
            }
        }
        0x4D => {
            if request.payload.len() < 2 {
                return Ok(CipResponse::error(request.service, 0x13)); // not enough data
            }
            let datatype = u16::from_le_bytes([request.payload[0], request.payload[1]]);
            let value = request.payload[4..].to_vec();
            let mut tags = state.tags.write();
            tags.insert(name.to_string(), TagValue { datatype, bytes: value });
            Ok(CipResponse::success(request.service, Vec::new()))
        }
        other => Ok(CipResponse::error(other, 0x08)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::cip::CipRequest;

    #[test]
    fn adapter_read_unknown_instance_returns_path_destination_unknown() {
        let state = DeviceState::new_adapter();
        let req = CipRequest::new(0x0E, CipPath::class_instance_attribute(0x04, 999, None), vec![]);
        let resp = handle_adapter(&state, &req).unwrap();
        assert_eq!(resp.general_status, 0x05);
    }

    #[test]
    fn adapter_write_then_read_round_trips() {
        let state = DeviceState::new_adapter();
        let write = CipRequest::new(
            0x10,
            CipPath::class_instance_attribute(0x04, 100, None),
            vec![1, 2, 3, 4],
        );
        handle_adapter(&state, &write).unwrap();
        let read = CipRequest::new(0x0E, CipPath::class_instance_attribute(0x04, 100, None), vec![]);
        let resp = handle_adapter(&state, &read).unwrap();
        assert_eq!(resp.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn logix_read_tag_returns_datatype_and_value() {
        let state = DeviceState::new_logix_like();
        let req = CipRequest::new(
            0x4C,
            CipPath::Symbolic { name: "Tag1".into(), trailing: vec![] },
            vec![],
        );
        let resp = handle_logix_like(&state, &req).unwrap();
        assert_eq!(resp.general_status, 0x00);
        assert_eq!(u16::from_le_bytes([resp.payload[0], resp.payload[1]]), 0x00C3);
    }
}
