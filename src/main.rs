//! CIPDIP entry point: parses the CLI, layers a file sink and a colorized
//! stdout sink for logging, and dispatches to the requested subcommand.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use cipdip::cli::{BundleCommand, CatalogCommand, Cli, Command, PersonalityKindArg, ScenarioArg};
use cipdip::logging::ColorizedFormatter;
use cipdip::{catalog, orchestrator, pcap, scenario, server};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_log_layer;
    if let Some("stderr") = cli.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match cli.log_file.as_deref() {
            Some(path_str) => {
                let path = std::path::Path::new(path_str);
                let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
                let name = path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("cipdip.log"));
                tracing_appender::rolling::daily(dir, name)
            }
            None => tracing_appender::rolling::daily(".", "cipdip.log"),
        };
        let (writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_log = if !cli.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();
    let _log_guard = guard;

    let result = match cli.command {
        Command::Server(args) => run_server(args).await,
        Command::Client(args) => run_client(args).await,
        Command::Run(args) => run_orchestrated(args).await,
        Command::Bundle(args) => run_bundle(args.command).await,
        Command::Catalog(args) => run_catalog(args.command),
    };

    if let Err(e) = &result {
        error!(error = %e, "cipdip exited with an error");
    }
    result
}

async fn run_server(args: cipdip::cli::ServerArgs) -> Result<()> {
    let bind: std::net::SocketAddr = args.bind.parse().context("invalid --bind address")?;
    let personality = match args.personality {
        PersonalityKindArg::Adapter => server::personality::PersonalityKind::Adapter,
        PersonalityKindArg::LogixLike => server::personality::PersonalityKind::LogixLike,
    };
    let fault_policy = server::fault::FaultPolicy {
        base_latency: std::time::Duration::from_millis(args.fault_base_latency_ms),
        jitter: std::time::Duration::from_millis(args.fault_jitter_ms),
        spike_every_n: (args.fault_spike_every_n > 0).then_some(args.fault_spike_every_n as u32),
        spike_extra_latency: std::time::Duration::from_millis(args.fault_spike_extra_latency_ms),
        drop_every_n: (args.fault_drop_every_n > 0).then_some(args.fault_drop_every_n as u32),
        close_every_n: (args.fault_close_every_n > 0).then_some(args.fault_close_every_n as u32),
        seed: args.fault_seed,
    };
    let config = server::ServerConfig {
        tcp_bind: bind,
        udp_bind: bind,
        personality,
        profile: args.profile.resolve(),
        fault_policy,
    };
    info!(%bind, personality = ?personality, "starting emulator server");
    let mut emulator = server::EmulatorServer::new(&config);
    let capture = args.capture_out.as_ref().map(|_| std::sync::Arc::new(cipdip::capture::SoftwareCapture::new()));
    if let Some(capture) = &capture {
        emulator.attach_capture(capture.clone());
    }
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        let _ = shutdown_tx.send(());
    });
    emulator.run(bind, bind, shutdown_rx).await?;
    if let (Some(capture), Some(path)) = (&capture, &args.capture_out) {
        capture.write_to(path)?;
        info!(capture_out = %path.display(), packets = capture.packet_count(), "wrote capture");
    }
    Ok(())
}

async fn run_client(args: cipdip::cli::ClientArgs) -> Result<()> {
    let target: std::net::SocketAddr = args.target.parse().context("invalid --target address")?;
    let shape = match args.scenario {
        ScenarioArg::Baseline => scenario::ScenarioShape::Baseline,
        ScenarioArg::Mixed => scenario::ScenarioShape::Mixed,
        ScenarioArg::Stress => scenario::ScenarioShape::Stress,
        ScenarioArg::Churn => scenario::ScenarioShape::Churn,
        ScenarioArg::Io => scenario::ScenarioShape::Io,
    };
    let sink = std::sync::Arc::new(match &args.metrics_csv {
        Some(path) => cipdip::metrics::MetricsSink::with_csv_path(path)?,
        None => cipdip::metrics::MetricsSink::new(),
    });
    let capture = args
        .capture_out
        .as_ref()
        .map(|_| std::sync::Arc::new(cipdip::capture::SoftwareCapture::new()));
    let config = scenario::ScenarioConfig {
        shape,
        target,
        duration: std::time::Duration::from_secs(args.duration_seconds),
        interval: args.interval_ms.map(std::time::Duration::from_millis),
        profile: args.profile.resolve(),
        target_type: "emulator".to_string(),
        mutation: args.mutate.map(|m| (m.resolve(), args.mutation_seed)),
        capture: capture.clone().map(|c| c as std::sync::Arc<dyn cipdip::capture::CaptureHandle>),
    };
    let (_cancel_handle, cancel_token) = scenario::CancelHandle::new();
    info!(scenario = shape.name(), %target, "starting client scenario");
    if shape == scenario::ScenarioShape::Churn {
        scenario::run_churn_scenario(config, sink.clone(), cancel_token, 10).await?;
    } else {
        scenario::run_scenario(config, sink.clone(), cancel_token).await?;
    }
    if let (Some(capture), Some(path)) = (&capture, &args.capture_out) {
        capture.write_to(path)?;
        info!(capture_out = %path.display(), packets = capture.packet_count(), "wrote capture");
    }
    let summary = sink.get_summary(&args.percentiles)?;
    info!(
        total = summary.counts.total,
        success = summary.counts.success,
        failure = summary.counts.failure,
        throughput = cipdip::metrics::format::throughput(summary.throughput_ops_per_sec),
        "scenario complete"
    );
    Ok(())
}

async fn run_orchestrated(args: cipdip::cli::RunArgs) -> Result<()> {
    let orch = orchestrator::Orchestrator::new(args.bundle_out.clone());
    let bundle_path = orch.run(&args.manifest).await?;
    info!(bundle = %bundle_path.display(), "orchestrated run complete");
    Ok(())
}

async fn run_bundle(command: BundleCommand) -> Result<()> {
    match command {
        BundleCommand::Verify { path } => {
            let report = orchestrator::bundle::verify(&path)?;
            if report.ok {
                info!("bundle verified clean");
            } else {
                error!(
                    missing = ?report.missing_files,
                    mismatches = ?report.hash_mismatches,
                    empty_pcaps = ?report.empty_pcaps,
                    malformed_json = ?report.malformed_json,
                    "bundle verification failed"
                );
                anyhow::bail!("bundle verification failed");
            }
            Ok(())
        }
        BundleCommand::Diff {
            baseline,
            compare,
            significance_threshold_pct,
        } => {
            let baseline_summary = summarize_bundle_pcaps(&baseline)?;
            let compare_summary = summarize_bundle_pcaps(&compare)?;
            let opts = pcap::DiffOptions {
                significance_threshold_pct,
            };
            let result = pcap::diff(&baseline_summary, &compare_summary, &opts);
            info!(
                score = result.score,
                significant = result.significant,
                added = ?result.added_services,
                removed = ?result.removed_services,
                "capture diff complete"
            );
            Ok(())
        }
    }
}

fn summarize_bundle_pcaps(bundle_root: &std::path::Path) -> Result<pcap::CaptureSummary> {
    let mut combined = pcap::CaptureSummary::default();
    for entry in walkdir::WalkDir::new(bundle_root) {
        let entry = entry?;
        if entry.path().extension().and_then(|e| e.to_str()) == Some("pcap") {
            let bytes = std::fs::read(entry.path())?;
            let pcap_file = pcap::PcapFile::read(&bytes)?;
            let summary = pcap::summarize(&pcap_file);
            combined.total_packets += summary.total_packets;
            for (k, v) in summary.enip_command_counts {
                *combined.enip_command_counts.entry(k).or_insert(0) += v;
            }
            for (k, v) in summary.cip_service_counts {
                *combined.cip_service_counts.entry(k).or_insert(0) += v;
            }
            combined.cpf_items_present += summary.cpf_items_present;
            combined.cpf_items_absent += summary.cpf_items_absent;
            combined.handshake_complete = combined.handshake_complete || summary.handshake_complete;
        }
    }
    Ok(combined)
}

fn run_catalog(command: CatalogCommand) -> Result<()> {
    match command {
        CatalogCommand::List { domain } => {
            let entries = match &domain {
                Some(d) => catalog::list_by_domain(d),
                None => catalog::table().values().collect(),
            };
            for entry in entries {
                println!("{:<40} {}", entry.key, entry.human_name);
            }
        }
        CatalogCommand::Search { query } => {
            for entry in catalog::search(&query) {
                println!("{:<40} {}", entry.key, entry.doc);
            }
        }
    }
    Ok(())
}
