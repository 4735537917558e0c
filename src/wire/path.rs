//! EPATH: binary-encoded CIP paths.
//!
//! A path is a sum type: logical segments (class/instance/attribute/
//! connection-point/member/element), a symbolic (ANSI tag) segment, or a
//! raw override that bypasses the encoder entirely for fuzzing malformed
//! paths on purpose.

use crate::error::{CipdipError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalSegment {
    Class(u32),
    Instance(u32),
    Attribute(u32),
    ConnectionPoint(u32),
    Member(u32),
    Element(u32),
}

impl LogicalSegment {
    fn type_bits(&self) -> u8 {
        match self {
            LogicalSegment::Class(_) => 0x00,
            LogicalSegment::Instance(_) => 0x01,
            LogicalSegment::Member(_) => 0x02,
            LogicalSegment::ConnectionPoint(_) => 0x03,
            LogicalSegment::Attribute(_) => 0x04,
            LogicalSegment::Element(_) => 0x08,
        }
    }

    fn value(&self) -> u32 {
        match *self {
            LogicalSegment::Class(v)
            | LogicalSegment::Instance(v)
            | LogicalSegment::Attribute(v)
            | LogicalSegment::ConnectionPoint(v)
            | LogicalSegment::Member(v)
            | LogicalSegment::Element(v) => v,
        }
    }

    fn encode(&self, out: &mut Vec<u8>, force_32: bool) {
        let v = self.value();
        let segment_type = 0x20 | self.type_bits();
        if !force_32 && v <= 0xFF {
            out.push(segment_type);
            out.push(v as u8);
        } else if !force_32 && v <= 0xFFFF {
            out.push(segment_type | 0x01);
            out.push(0); // pad
            out.extend_from_slice(&(v as u16).to_le_bytes());
        } else {
            out.push(segment_type | 0x02);
            out.push(0);
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipPath {
    /// Ordered logical segments, e.g. `[Class(4), Instance(100), Attribute(3)]`.
    Logical(Vec<LogicalSegment>),
    /// ANSI extended symbolic segment (tag name), optionally with trailing
    /// logical segments (element/member indexing into the tag).
    Symbolic {
        name: String,
        trailing: Vec<LogicalSegment>,
    },
    /// Pre-encoded bytes, used to construct deliberately malformed paths.
    Raw(Vec<u8>),
}

impl CipPath {
    pub fn class_instance_attribute(class: u32, instance: u32, attribute: Option<u32>) -> Self {
        let mut segs = vec![LogicalSegment::Class(class), LogicalSegment::Instance(instance)];
        if let Some(a) = attribute {
            segs.push(LogicalSegment::Attribute(a));
        }
        CipPath::Logical(segs)
    }

    /// Encodes to raw path bytes (unpadded to even length by the caller's
    /// choice; CIP request framing handles the even-byte pad).
    pub fn encode(&self, force_32bit_logical: bool) -> Vec<u8> {
        match self {
            CipPath::Logical(segs) => {
                let mut out = Vec::new();
                for seg in segs {
                    seg.encode(&mut out, force_32bit_logical);
                }
                out
            }
            CipPath::Symbolic { name, trailing } => {
                let mut out = Vec::new();
                out.push(0x91);
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
                if name.len() % 2 != 0 {
                    out.push(0);
                }
                for seg in trailing {
                    seg.encode(&mut out, force_32bit_logical);
                }
                out
            }
            CipPath::Raw(bytes) => bytes.clone(),
        }
    }

    /// Decodes `word_count` 16-bit words worth of path bytes starting at
    /// `buf`. A leading `0x91` extended-symbolic segment reconstructs a
    /// `Symbolic` path (with any following logical segments as
    /// `trailing`); otherwise the whole run decodes as `Logical`. Returns
    /// the decoded path and the number of bytes consumed (always
    /// `word_count * 2`).
    pub fn decode(buf: &[u8], word_count: u8) -> Result<(CipPath, usize)> {
        let total = word_count as usize * 2;
        if buf.len() < total {
            return Err(CipdipError::ProtocolFraming(format!(
                "path claims {total} bytes but only {} available",
                buf.len()
            )));
        }
        if total == 0 {
            return Ok((CipPath::Logical(Vec::new()), 0));
        }
        if buf[0] == 0x91 {
            let name_len = *buf.get(1).ok_or_else(|| {
                CipdipError::ProtocolFraming("truncated symbolic segment length".into())
            })? as usize;
            let name_start = 2;
            let name_end = name_start + name_len;
            if name_end > total {
                return Err(CipdipError::ProtocolFraming(
                    "symbolic segment name overruns path length".into(),
                ));
            }
            let name = String::from_utf8(buf[name_start..name_end].to_vec()).map_err(|_| {
                CipdipError::ProtocolFraming("symbolic segment name is not valid UTF-8".into())
            })?;
            let mut rest_start = name_end;
            if name_len % 2 != 0 {
                rest_start += 1; // odd-length names are padded to an even boundary
            }
            let trailing = decode_logical_segments(&buf[rest_start..total])?;
            return Ok((CipPath::Symbolic { name, trailing }, total));
        }
        let segs = decode_logical_segments(&buf[..total])?;
        Ok((CipPath::Logical(segs), total))
    }
}

fn decode_logical_segments(buf: &[u8]) -> Result<Vec<LogicalSegment>> {
    let mut segs = Vec::new();
    let mut i = 0usize;
    while i < buf.len() {
        let b0 = buf[i];
        if b0 & 0xE0 != 0x20 {
            return Err(CipdipError::ProtocolFraming(format!(
                "unsupported path segment type byte 0x{b0:02x}"
            )));
        }
        let type_bits = b0 & 0x0F;
        let width = b0 & 0x03;
        let (value, consumed) = match width {
            0x00 => {
                let v = *buf.get(i + 1).ok_or_else(|| {
                    CipdipError::ProtocolFraming("truncated 8-bit path segment".into())
                })? as u32;
                (v, 2)
            }
            0x01 => {
                let bytes = buf.get(i + 2..i + 4).ok_or_else(|| {
                    CipdipError::ProtocolFraming("truncated 16-bit path segment".into())
                })?;
                (u16::from_le_bytes([bytes[0], bytes[1]]) as u32, 4)
            }
            0x02 => {
                let bytes = buf.get(i + 2..i + 6).ok_or_else(|| {
                    CipdipError::ProtocolFraming("truncated 32-bit path segment".into())
                })?;
                (u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 6)
            }
            _ => {
                return Err(CipdipError::ProtocolFraming(
                    "reserved path segment width".into(),
                ))
            }
        };
        let seg = match type_bits & 0x0C {
            0x00 => match type_bits & 0x03 {
                0x00 => LogicalSegment::Class(value),
                0x01 => LogicalSegment::Instance(value),
                0x02 => LogicalSegment::Member(value),
                _ => LogicalSegment::ConnectionPoint(value),
            },
            0x04 => LogicalSegment::Attribute(value),
            0x08 => LogicalSegment::Element(value),
            _ => {
                return Err(CipdipError::ProtocolFraming(
                    "unsupported logical segment class".into(),
                ))
            }
        };
        segs.push(seg);
        i += consumed;
    }
    Ok(segs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_path_round_trips() {
        let path = CipPath::class_instance_attribute(0x04, 100, Some(3));
        let encoded = path.encode(false);
        assert_eq!(encoded.len() % 2, 0);
        let word_count = (encoded.len() / 2) as u8;
        let (decoded, consumed) = CipPath::decode(&encoded, word_count).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(
            decoded,
            CipPath::Logical(vec![
                LogicalSegment::Class(0x04),
                LogicalSegment::Instance(100),
                LogicalSegment::Attribute(3),
            ])
        );
    }

    #[test]
    fn symbolic_path_round_trips_through_decode() {
        let path = CipPath::Symbolic {
            name: "Tag1".to_string(),
            trailing: vec![],
        };
        let encoded = path.encode(false);
        let word_count = (encoded.len() / 2) as u8;
        let (decoded, consumed) = CipPath::decode(&encoded, word_count).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, path);
    }

    #[test]
    fn symbolic_path_with_odd_length_name_and_trailing_segment_round_trips() {
        let path = CipPath::Symbolic {
            name: "Tag".to_string(),
            trailing: vec![LogicalSegment::Element(5)],
        };
        let encoded = path.encode(false);
        assert_eq!(encoded.len() % 2, 0);
        let word_count = (encoded.len() / 2) as u8;
        let (decoded, consumed) = CipPath::decode(&encoded, word_count).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, path);
    }

    #[test]
    fn wide_instance_uses_16_bit_segment() {
        let path = CipPath::Logical(vec![LogicalSegment::Instance(1000)]);
        let encoded = path.encode(false);
        assert_eq!(encoded[0] & 0x03, 0x01);
    }

    #[test]
    fn symbolic_segment_pads_odd_length_names() {
        let path = CipPath::Symbolic {
            name: "Tag1".to_string(),
            trailing: vec![],
        };
        let encoded = path.encode(false);
        assert_eq!(encoded.len() % 2, 0);
        assert_eq!(encoded[0], 0x91);
        assert_eq!(encoded[1], 4);
    }
}
