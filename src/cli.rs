//! Command-line argument parsing for the `cipdip` binary.
//!
//! Uses `clap`'s derive API with a custom `Styles` replicating clap v3's
//! coloring, organized as subcommands rather than one flat flag set since
//! `cipdip` wears several hats (traffic generator, emulator, orchestrator,
//! bundle tooling).

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, Subcommand, ValueEnum,
};
use std::path::PathBuf;

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// EtherNet/IP and CIP traffic generator, emulator, and orchestrator for
/// DPI testing of industrial firewalls.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Cli {
    /// Increase diagnostic log verbosity on stderr (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Silence user-facing stdout output; diagnostics still go to stderr.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Write detailed logs to this file instead of daily-rotated default.
    #[arg(long, global = true)]
    pub log_file: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the CIP/ENIP emulator server (adapter or logix-like personality).
    Server(ServerArgs),

    /// Run a traffic-generating client against a target device.
    Client(ClientArgs),

    /// Run a full orchestrated test from a YAML manifest.
    Run(RunArgs),

    /// Inspect or verify a completed run bundle.
    Bundle(BundleArgs),

    /// List or search the CIP service catalog.
    Catalog(CatalogArgs),
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileArg {
    #[value(name = "strict-odva")]
    StrictOdva,
    #[value(name = "legacy-compat")]
    LegacyCompat,
}

impl ProfileArg {
    pub fn resolve(self) -> crate::wire::profile::ProtocolProfile {
        match self {
            ProfileArg::StrictOdva => crate::wire::profile::ProtocolProfile::strict_odva(),
            ProfileArg::LegacyCompat => crate::wire::profile::ProtocolProfile::legacy_compat(),
        }
    }
}

#[derive(Parser, Debug)]
pub struct ServerArgs {
    /// Device personality to emulate.
    #[arg(long, value_enum, default_value = "adapter")]
    pub personality: PersonalityKindArg,

    /// TCP/UDP bind address, e.g. 0.0.0.0:44818.
    #[arg(long, default_value = "0.0.0.0:44818")]
    pub bind: String,

    /// Protocol profile governing wire-format edge cases.
    #[arg(long, value_enum, default_value = "strict-odva")]
    pub profile: ProfileArg,

    /// Base artificial latency added to every response, in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub fault_base_latency_ms: u64,

    /// Random jitter added on top of the base latency, in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub fault_jitter_ms: u64,

    /// Every Nth operation is silently dropped (0 disables).
    #[arg(long, default_value_t = 0)]
    pub fault_drop_every_n: u64,

    /// Every Nth operation closes the connection instead of responding (0 disables).
    #[arg(long, default_value_t = 0)]
    pub fault_close_every_n: u64,

    /// Every Nth operation gets extra spike latency on top of jitter (0 disables).
    #[arg(long, default_value_t = 0)]
    pub fault_spike_every_n: u64,

    /// Extra latency applied on a spike operation, in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub fault_spike_extra_latency_ms: u64,

    /// Seed for deterministic fault-injection jitter.
    #[arg(long, default_value_t = 0)]
    pub fault_seed: u64,

    /// Write a synthetic pcap of all traffic this server handles to this
    /// path when it shuts down.
    #[arg(long)]
    pub capture_out: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PersonalityKindArg {
    Adapter,
    #[value(name = "logix-like")]
    LogixLike,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ScenarioArg {
    Baseline,
    Mixed,
    Stress,
    Churn,
    Io,
}

/// Deterministic payload corruption kinds, mirroring
/// [`crate::wire::payload::Mutation`] for CLI selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum MutationArg {
    MissingFields,
    WrongLength,
    InvalidOffsets,
    WrongDatatype,
    FlipBits,
}

impl MutationArg {
    pub fn resolve(self) -> crate::wire::payload::Mutation {
        use crate::wire::payload::Mutation;
        match self {
            MutationArg::MissingFields => Mutation::MissingFields,
            MutationArg::WrongLength => Mutation::WrongLength,
            MutationArg::InvalidOffsets => Mutation::InvalidOffsets,
            MutationArg::WrongDatatype => Mutation::WrongDatatype,
            MutationArg::FlipBits => Mutation::FlipBits,
        }
    }
}

#[derive(Parser, Debug)]
pub struct ClientArgs {
    /// Traffic shape to run.
    #[arg(long, value_enum, default_value = "baseline")]
    pub scenario: ScenarioArg,

    /// Target address, e.g. 10.0.0.5:44818.
    #[arg(long)]
    pub target: String,

    /// How long to run the scenario.
    #[arg(long, default_value_t = 30)]
    pub duration_seconds: u64,

    /// Override the scenario's default tick interval, in milliseconds.
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Protocol profile to speak.
    #[arg(long, value_enum, default_value = "strict-odva")]
    pub profile: ProfileArg,

    /// Path to write per-operation metrics as CSV.
    #[arg(long)]
    pub metrics_csv: Option<PathBuf>,

    /// Percentiles to report in the summary (e.g. 50 95 99).
    #[arg(long, default_values_t = vec![50.0, 95.0, 99.0])]
    pub percentiles: Vec<f64>,

    /// Apply this deterministic malformation to write/I-O payloads, for
    /// exercising DPI edge cases against malformed traffic.
    #[arg(long, value_enum)]
    pub mutate: Option<MutationArg>,

    /// Seed for `--mutate`; the same seed always produces the same
    /// malformed bytes for a given payload.
    #[arg(long, default_value_t = 0)]
    pub mutation_seed: u64,

    /// Write a synthetic pcap of this scenario's traffic to this path when
    /// the run finishes.
    #[arg(long)]
    pub capture_out: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the run manifest (YAML).
    #[arg(long)]
    pub manifest: PathBuf,

    /// Directory to write the resulting bundle into.
    #[arg(long)]
    pub bundle_out: PathBuf,
}

#[derive(Parser, Debug)]
pub struct BundleArgs {
    #[command(subcommand)]
    pub command: BundleCommand,
}

#[derive(Subcommand, Debug)]
pub enum BundleCommand {
    /// Verify a bundle's content hashes and artifact integrity.
    Verify {
        /// Path to the bundle root directory.
        #[arg(long)]
        path: PathBuf,
    },
    /// Diff two captured bundles' CIP traffic summaries.
    Diff {
        /// Baseline bundle root.
        #[arg(long)]
        baseline: PathBuf,
        /// Bundle root to compare against the baseline.
        #[arg(long)]
        compare: PathBuf,
        /// Percentage change in packet volume treated as significant.
        #[arg(long, default_value_t = 10.0)]
        significance_threshold_pct: f64,
    },
}

#[derive(Parser, Debug)]
pub struct CatalogArgs {
    #[command(subcommand)]
    pub command: CatalogCommand,
}

#[derive(Subcommand, Debug)]
pub enum CatalogCommand {
    /// List every catalog entry, optionally filtered by domain prefix.
    List {
        /// Domain prefix, e.g. "assembly" or "symbol".
        domain: Option<String>,
    },
    /// Free-text search over catalog keys, names, and docs.
    Search {
        query: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_server_subcommand_with_defaults() {
        let cli = Cli::parse_from(["cipdip", "server"]);
        match cli.command {
            Command::Server(args) => {
                assert_eq!(args.bind, "0.0.0.0:44818");
                assert_eq!(args.personality, PersonalityKindArg::Adapter);
            }
            other => panic!("expected Server, got {other:?}"),
        }
    }

    #[test]
    fn parses_client_subcommand_target() {
        let cli = Cli::parse_from(["cipdip", "client", "--target", "10.0.0.5:44818"]);
        match cli.command {
            Command::Client(args) => assert_eq!(args.target, "10.0.0.5:44818"),
            other => panic!("expected Client, got {other:?}"),
        }
    }
}
