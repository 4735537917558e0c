//! The CIP/ENIP wire codec: ENIP encapsulation, Common Packet Format,
//! CIP request/response framing, EPATH encoding, protocol profiles, and
//! service-payload builders.

pub mod cip;
pub mod cpf;
pub mod enip;
pub mod path;
pub mod payload;
pub mod profile;

pub use cip::{CipRequest, CipResponse};
pub use cpf::{CpfEnvelope, CpfItem, CpfItemType};
pub use enip::{EnipCommand, EnipFrame};
pub use path::{CipPath, LogicalSegment};
pub use payload::{apply_mutation, Mutation, PayloadKind, PayloadParam, PayloadSpec};
pub use profile::{current_profile, with_profile, ProtocolProfile};
