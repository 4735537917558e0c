//! ENIP encapsulation header and frame.
//!
//! Every ENIP frame is a fixed 24-byte little-endian header followed by a
//! command-specific body. The header's `data_length` must exactly equal
//! the body length on both encode and decode.

use crate::error::{CipdipError, Result};

pub const HEADER_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EnipCommand {
    NopCmd = 0x0000,
    ListServices = 0x0004,
    ListIdentity = 0x0063,
    ListInterfaces = 0x0064,
    RegisterSession = 0x0065,
    UnregisterSession = 0x0066,
    SendRRData = 0x006F,
    SendUnitData = 0x0070,
}

impl EnipCommand {
    pub fn from_u16(v: u16) -> Option<Self> {
        use EnipCommand::*;
        Some(match v {
            0x0000 => NopCmd,
            0x0004 => ListServices,
            0x0063 => ListIdentity,
            0x0064 => ListInterfaces,
            0x0065 => RegisterSession,
            0x0066 => UnregisterSession,
            0x006F => SendRRData,
            0x0070 => SendUnitData,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnipFrame {
    pub command: u16,
    pub session_handle: u32,
    pub status: u32,
    pub sender_context: [u8; 8],
    pub options: u32,
    pub body: Vec<u8>,
}

impl EnipFrame {
    pub fn new(command: u16, session_handle: u32, body: Vec<u8>) -> Self {
        EnipFrame {
            command,
            session_handle,
            status: 0,
            sender_context: [0; 8],
            options: 0,
            body,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.extend_from_slice(&self.command.to_le_bytes());
        out.extend_from_slice(&(self.body.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.session_handle.to_le_bytes());
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&self.sender_context);
        out.extend_from_slice(&self.options.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Decodes exactly one frame from the front of `buf`. Returns the
    /// frame and the total number of bytes consumed, so callers can
    /// decode a stream of concatenated frames.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < HEADER_LEN {
            return Err(CipdipError::ProtocolFraming(format!(
                "short ENIP header: {} bytes, need {HEADER_LEN}",
                buf.len()
            )));
        }
        let command = u16::from_le_bytes([buf[0], buf[1]]);
        let data_length = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        let session_handle = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let status = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let mut sender_context = [0u8; 8];
        sender_context.copy_from_slice(&buf[12..20]);
        let options = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
        let total = HEADER_LEN + data_length;
        if buf.len() < total {
            return Err(CipdipError::ProtocolFraming(format!(
                "ENIP body claims {data_length} bytes but only {} available",
                buf.len() - HEADER_LEN
            )));
        }
        let body = buf[HEADER_LEN..total].to_vec();
        Ok((
            EnipFrame {
                command,
                session_handle,
                status,
                sender_context,
                options,
                body,
            },
            total,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_exact_data_length() {
        let frame = EnipFrame::new(0x006F, 42, vec![1, 2, 3, 4, 5]);
        let encoded = frame.encode();
        assert_eq!(u16::from_le_bytes([encoded[2], encoded[3]]), 5);
        let (decoded, consumed) = EnipFrame::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rejects_truncated_body() {
        let frame = EnipFrame::new(0x0065, 0, vec![1, 2, 3, 4]);
        let mut encoded = frame.encode();
        encoded.truncate(encoded.len() - 1);
        assert!(EnipFrame::decode(&encoded).is_err());
    }

    #[test]
    fn known_commands_resolve() {
        assert_eq!(EnipCommand::from_u16(0x0065), Some(EnipCommand::RegisterSession));
        assert_eq!(EnipCommand::from_u16(0xBEEF), None);
    }
}
