//! # CIPDIP
//!
//! EtherNet/IP (ENIP) and Common Industrial Protocol (CIP) traffic
//! generator, emulator, and orchestrator for deep-packet-inspection
//! testing of industrial-network firewalls.

pub mod capture;
pub mod catalog;
pub mod cli;
pub mod client;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod pcap;
pub mod scenario;
pub mod server;
pub mod transport;
pub mod wire;

pub use error::{CipdipError, ErrorKind, Result};

/// The current version of cipdip.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
