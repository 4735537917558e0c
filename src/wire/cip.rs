//! CIP request/response framing on top of an already-sliced payload.

use crate::error::{CipdipError, Result};
use crate::wire::path::CipPath;
use crate::wire::profile::{PathSizePolicy, ProtocolProfile};

pub const RESPONSE_FLAG: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipRequest {
    pub service: u8,
    pub path: CipPath,
    pub payload: Vec<u8>,
}

impl CipRequest {
    pub fn new(service: u8, path: CipPath, payload: Vec<u8>) -> Self {
        CipRequest { service, path, payload }
    }

    /// `service(1) | path-size-words(1) | path(padded even) | payload`.
    pub fn encode(&self) -> Vec<u8> {
        let path_bytes = self.path.encode(false);
        debug_assert_eq!(path_bytes.len() % 2, 0, "path encoder must pad to even length");
        let word_count = (path_bytes.len() / 2) as u8;
        let mut out = Vec::with_capacity(2 + path_bytes.len() + self.payload.len());
        out.push(self.service);
        out.push(word_count);
        out.extend_from_slice(&path_bytes);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(CipdipError::ProtocolFraming("short CIP request".into()));
        }
        let service = buf[0];
        let word_count = buf[1];
        let (path, consumed) = CipPath::decode(&buf[2..], word_count)?;
        let payload = buf[2 + consumed..].to_vec();
        Ok(CipRequest {
            service,
            path,
            payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipResponse {
    pub service: u8,
    pub general_status: u8,
    pub additional_status: Vec<u16>,
    pub payload: Vec<u8>,
}

impl CipResponse {
    /// Builds a success response mirroring `request.service | 0x80`, the
    /// response-mirror invariant CIP requires of every service reply.
    pub fn success(request_service: u8, payload: Vec<u8>) -> Self {
        CipResponse {
            service: request_service | RESPONSE_FLAG,
            general_status: 0x00,
            additional_status: Vec::new(),
            payload,
        }
    }

    pub fn error(request_service: u8, general_status: u8) -> Self {
        CipResponse {
            service: request_service | RESPONSE_FLAG,
            general_status,
            additional_status: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// `strict_odva` (`NeverOnResponse`) omits the path-size byte entirely:
    /// `service|0x80(1) | status(1) | addl-status-words(1) | addl-status...
    /// | payload`. `legacy_compat` (`AlwaysPresent`) echoes a path-size
    /// placeholder byte ahead of status, widening the header by one byte.
    pub fn encode(&self, profile: ProtocolProfile) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.additional_status.len() * 2 + self.payload.len());
        out.push(self.service);
        if profile.path_size_policy == PathSizePolicy::AlwaysPresent {
            out.push(0);
        }
        out.push(self.general_status);
        out.push(self.additional_status.len() as u8);
        for word in &self.additional_status {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(buf: &[u8], profile: ProtocolProfile) -> Result<Self> {
        let header_len = match profile.path_size_policy {
            PathSizePolicy::AlwaysPresent => 4,
            PathSizePolicy::NeverOnResponse => 3,
        };
        if buf.len() < header_len {
            return Err(CipdipError::ProtocolFraming("short CIP response".into()));
        }
        let service = buf[0];
        let (general_status, addl_words_idx) = match profile.path_size_policy {
            PathSizePolicy::AlwaysPresent => (buf[2], 3),
            PathSizePolicy::NeverOnResponse => (buf[1], 2),
        };
        let addl_words = buf[addl_words_idx] as usize;
        let addl_start = addl_words_idx + 1;
        let addl_end = addl_start + addl_words * 2;
        if buf.len() < addl_end {
            return Err(CipdipError::ProtocolFraming("truncated additional status".into()));
        }
        let mut additional_status = Vec::with_capacity(addl_words);
        for chunk in buf[addl_start..addl_end].chunks_exact(2) {
            additional_status.push(u16::from_le_bytes([chunk[0], chunk[1]]));
        }
        Ok(CipResponse {
            service,
            general_status,
            additional_status,
            payload: buf[addl_end..].to_vec(),
        })
    }

    /// `responseService == requestService | 0x80` — the mirror invariant.
    pub fn mirrors(&self, request_service: u8) -> bool {
        self.service == (request_service | RESPONSE_FLAG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::path::CipPath;

    #[test]
    fn request_round_trips_path_size_in_words() {
        let req = CipRequest::new(
            0x0E,
            CipPath::class_instance_attribute(0x04, 100, Some(3)),
            vec![],
        );
        let encoded = req.encode();
        let word_count = encoded[1] as usize;
        assert_eq!(word_count * 2 + 2, encoded.len());
        let decoded = CipRequest::decode(&encoded).unwrap();
        assert_eq!(decoded.service, req.service);
    }

    #[test]
    fn response_mirrors_request_service() {
        let resp = CipResponse::success(0x0E, vec![1, 2, 3]);
        assert!(resp.mirrors(0x0E));
        assert_eq!(resp.service, 0x8E);
    }

    #[test]
    fn response_round_trips_additional_status() {
        let mut resp = CipResponse::error(0x10, 0x05);
        resp.additional_status = vec![0x2105];
        let encoded = resp.encode(ProtocolProfile::strict_odva());
        let decoded = CipResponse::decode(&encoded, ProtocolProfile::strict_odva()).unwrap();
        assert_eq!(decoded.additional_status, vec![0x2105]);
        assert_eq!(decoded.general_status, 0x05);
    }

    #[test]
    fn legacy_compat_response_is_one_byte_wider_than_strict_odva() {
        let resp = CipResponse::success(0x0E, vec![1, 2, 3]);
        let strict = resp.encode(ProtocolProfile::strict_odva());
        let legacy = resp.encode(ProtocolProfile::legacy_compat());
        assert_eq!(legacy.len(), strict.len() + 1);
    }

    #[test]
    fn legacy_compat_response_round_trips_with_matching_profile() {
        let mut resp = CipResponse::error(0x4C, 0x05);
        resp.additional_status = vec![0xABCD];
        let encoded = resp.encode(ProtocolProfile::legacy_compat());
        let decoded = CipResponse::decode(&encoded, ProtocolProfile::legacy_compat()).unwrap();
        assert_eq!(decoded.general_status, 0x05);
        assert_eq!(decoded.additional_status, vec![0xABCD]);
    }
}
