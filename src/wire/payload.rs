//! Service-specific payload builders and the deterministic mutation layer
//! used to synthesize malformed traffic for DPI edge-case testing.

use crate::error::{CipdipError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// A named payload shape plus the parameters needed to build it. Carried
/// in scenario definitions so a scenario step can say "forward_open with
/// these params" without the caller hand-assembling bytes.
#[derive(Debug, Clone)]
pub struct PayloadSpec {
    pub kind: PayloadKind,
    pub params: HashMap<String, PayloadParam>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    ForwardOpen,
    ForwardClose,
    UnconnectedSend,
    RockwellTag,
    RockwellTagFragmented,
    RockwellTemplate,
    RockwellPccc,
    FileObject,
    ModbusObject,
    SafetyReset,
}

#[derive(Debug, Clone)]
pub enum PayloadParam {
    U32(u32),
    U16(u16),
    U8(u8),
    Bytes(Vec<u8>),
    Text(String),
}

impl PayloadParam {
    fn as_u32(&self) -> Option<u32> {
        match self {
            PayloadParam::U32(v) => Some(*v),
            PayloadParam::U16(v) => Some(*v as u32),
            PayloadParam::U8(v) => Some(*v as u32),
            _ => None,
        }
    }
    fn as_u16(&self) -> Option<u16> {
        match self {
            PayloadParam::U16(v) => Some(*v),
            PayloadParam::U8(v) => Some(*v as u16),
            _ => None,
        }
    }
    fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PayloadParam::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

fn require<'a>(
    params: &'a HashMap<String, PayloadParam>,
    key: &str,
) -> Result<&'a PayloadParam> {
    params
        .get(key)
        .ok_or_else(|| CipdipError::Invariant(format!("payload missing required param `{key}`")))
}

impl PayloadSpec {
    pub fn new(kind: PayloadKind) -> Self {
        PayloadSpec {
            kind,
            params: HashMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: PayloadParam) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    /// Validates required params are present for `self.kind` and builds
    /// the service payload bytes. Unknown-but-harmless params are ignored.
    pub fn build(&self) -> Result<Vec<u8>> {
        match self.kind {
            PayloadKind::ForwardOpen => self.build_forward_open(),
            PayloadKind::ForwardClose => self.build_forward_close(),
            PayloadKind::UnconnectedSend => self.build_unconnected_send(),
            PayloadKind::RockwellTag | PayloadKind::RockwellTagFragmented => self.build_rockwell_tag(),
            PayloadKind::RockwellTemplate => self.build_passthrough("template_bytes"),
            PayloadKind::RockwellPccc => self.build_passthrough("pccc_bytes"),
            PayloadKind::FileObject => self.build_passthrough("file_bytes"),
            PayloadKind::ModbusObject => self.build_passthrough("modbus_bytes"),
            PayloadKind::SafetyReset => self.build_passthrough("reset_bytes"),
        }
    }

    fn build_forward_open(&self) -> Result<Vec<u8>> {
        let rpi = require(&self.params, "rpi_us")?.as_u32().ok_or_else(|| {
            CipdipError::Invariant("rpi_us must be numeric".into())
        })?;
        let connection_serial = require(&self.params, "connection_serial")?
            .as_u16()
            .ok_or_else(|| CipdipError::Invariant("connection_serial must be u16".into()))?;
        let vendor_id = require(&self.params, "originator_vendor_id")?
            .as_u16()
            .ok_or_else(|| CipdipError::Invariant("originator_vendor_id must be u16".into()))?;
        let originator_serial = require(&self.params, "originator_serial")?
            .as_u32()
            .ok_or_else(|| CipdipError::Invariant("originator_serial must be u32".into()))?;

        let mut out = Vec::new();
        out.push(0x0A); // timeout_tick
        out.push(0x1E); // timeout_ticks
        out.extend_from_slice(&0u32.to_le_bytes()); // O->T connection ID, assigned by target
        out.extend_from_slice(&0u32.to_le_bytes()); // T->O connection ID, assigned by target
        out.extend_from_slice(&connection_serial.to_le_bytes());
        out.extend_from_slice(&vendor_id.to_le_bytes());
        out.extend_from_slice(&originator_serial.to_le_bytes());
        out.push(0x03); // connection timeout multiplier
        out.extend_from_slice(&[0, 0, 0]); // reserved
        out.extend_from_slice(&rpi.to_le_bytes()); // O->T RPI
        out.extend_from_slice(&0x4302_u16.to_le_bytes()); // O->T network connection params
        out.extend_from_slice(&rpi.to_le_bytes()); // T->O RPI
        out.extend_from_slice(&0x4302_u16.to_le_bytes()); // T->O network connection params
        out.push(0xA3); // transport type/trigger: class 3 trigger, application
        Ok(out)
    }

    fn build_forward_close(&self) -> Result<Vec<u8>> {
        let connection_serial = require(&self.params, "connection_serial")?
            .as_u16()
            .ok_or_else(|| CipdipError::Invariant("connection_serial must be u16".into()))?;
        let vendor_id = require(&self.params, "originator_vendor_id")?
            .as_u16()
            .ok_or_else(|| CipdipError::Invariant("originator_vendor_id must be u16".into()))?;
        let originator_serial = require(&self.params, "originator_serial")?
            .as_u32()
            .ok_or_else(|| CipdipError::Invariant("originator_serial must be u32".into()))?;

        let mut out = Vec::new();
        out.push(0x0A);
        out.push(0x1E);
        out.extend_from_slice(&connection_serial.to_le_bytes());
        out.extend_from_slice(&vendor_id.to_le_bytes());
        out.extend_from_slice(&originator_serial.to_le_bytes());
        Ok(out)
    }

    fn build_unconnected_send(&self) -> Result<Vec<u8>> {
        let embedded = require(&self.params, "embedded_request")?
            .as_bytes()
            .ok_or_else(|| CipdipError::Invariant("embedded_request must be bytes".into()))?;
        let mut out = Vec::new();
        out.push(0x0A);
        out.push(0x1E);
        out.extend_from_slice(&(embedded.len() as u16).to_le_bytes());
        out.extend_from_slice(embedded);
        if embedded.len() % 2 != 0 {
            out.push(0);
        }
        out.extend_from_slice(&[1, 0]); // route path size + pad, empty port/link
        Ok(out)
    }

    fn build_rockwell_tag(&self) -> Result<Vec<u8>> {
        if let Some(PayloadParam::Bytes(b)) = self.params.get("write_value") {
            let mut out = Vec::new();
            let datatype = require(&self.params, "datatype")?
                .as_u16()
                .ok_or_else(|| CipdipError::Invariant("datatype must be u16".into()))?;
            out.extend_from_slice(&datatype.to_le_bytes());
            out.extend_from_slice(&1u16.to_le_bytes()); // element count
            out.extend_from_slice(b);
            Ok(out)
        } else {
            // Read_Tag request body is just the element count.
            Ok(1u16.to_le_bytes().to_vec())
        }
    }

    fn build_passthrough(&self, key: &str) -> Result<Vec<u8>> {
        Ok(require(&self.params, key)?
            .as_bytes()
            .ok_or_else(|| CipdipError::Invariant(format!("{key} must be bytes")))?
            .to_vec())
    }
}

/// Deterministic, seed-driven malformations applied to an otherwise valid
/// payload. Used by fault-injection scenarios to exercise DPI edge cases
/// without making the generator's own output nondeterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    MissingFields,
    WrongLength,
    InvalidOffsets,
    WrongDatatype,
    FlipBits,
}

pub fn apply_mutation(payload: &[u8], mutation: Mutation, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    match mutation {
        Mutation::MissingFields => {
            if payload.is_empty() {
                Vec::new()
            } else {
                let cut = rng.gen_range(0..payload.len());
                payload[..cut].to_vec()
            }
        }
        Mutation::WrongLength => {
            let mut out = payload.to_vec();
            out.extend(std::iter::repeat(0xFFu8).take(1 + rng.gen_range(0..8)));
            out
        }
        Mutation::InvalidOffsets => {
            let mut out = payload.to_vec();
            if out.len() >= 2 {
                out[0] = 0xFF;
                out[1] = 0xFF;
            }
            out
        }
        Mutation::WrongDatatype => {
            let mut out = payload.to_vec();
            if out.len() >= 2 {
                out[0] = out[0].wrapping_add(1);
            }
            out
        }
        Mutation::FlipBits => {
            let mut out = payload.to_vec();
            if !out.is_empty() {
                let idx = rng.gen_range(0..out.len());
                out[idx] ^= 0xFF;
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_open_requires_rpi() {
        let spec = PayloadSpec::new(PayloadKind::ForwardOpen);
        assert!(spec.build().is_err());
    }

    #[test]
    fn forward_open_builds_with_all_params() {
        let spec = PayloadSpec::new(PayloadKind::ForwardOpen)
            .with("rpi_us", PayloadParam::U32(10_000))
            .with("connection_serial", PayloadParam::U16(1))
            .with("originator_vendor_id", PayloadParam::U16(0x1337))
            .with("originator_serial", PayloadParam::U32(0xDEADBEEF));
        let bytes = spec.build().unwrap();
        assert!(!bytes.is_empty());
    }

    #[test]
    fn mutation_is_deterministic_given_seed() {
        let payload = vec![1, 2, 3, 4, 5];
        let a = apply_mutation(&payload, Mutation::FlipBits, 42);
        let b = apply_mutation(&payload, Mutation::FlipBits, 42);
        assert_eq!(a, b);
    }
}
