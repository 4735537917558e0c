//! PCAP engine: read captures, classify, summarize, diff.

pub mod analyze;
pub mod format;

pub use analyze::{classify, diff, parse_packet, summarize, CaptureDiff, CaptureSummary, Classification, DiffOptions, FlowKey};
pub use format::{PcapFile, PcapPacket};
