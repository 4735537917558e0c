//! Scenario engine: five shapes of client-driven traffic, each pacing
//! itself against a monotonic, non-drifting clock.
//!
//! `tokio::time::interval_at` with `MissedTickBehavior::Skip` is the
//! idiomatic tokio primitive for "don't burst to catch up after a slow
//! tick", giving the stricter `next = start + k*interval` guarantee these
//! scenarios need.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::capture::CaptureHandle;
use crate::client::ClientSession;
use crate::error::Result;
use crate::metrics::{MetricSample, MetricsSink};
use crate::wire::path::CipPath;
use crate::wire::payload::{Mutation, PayloadKind, PayloadParam, PayloadSpec};
use crate::wire::profile::ProtocolProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioShape {
    Baseline,
    Mixed,
    Stress,
    Churn,
    Io,
}

impl ScenarioShape {
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioShape::Baseline => "baseline",
            ScenarioShape::Mixed => "mixed",
            ScenarioShape::Stress => "stress",
            ScenarioShape::Churn => "churn",
            ScenarioShape::Io => "io",
        }
    }

    pub fn default_interval(&self) -> Duration {
        match self {
            ScenarioShape::Baseline => Duration::from_millis(250),
            ScenarioShape::Mixed => Duration::from_millis(100),
            ScenarioShape::Stress => Duration::from_millis(20),
            ScenarioShape::Churn => Duration::from_millis(100),
            ScenarioShape::Io => Duration::from_millis(10),
        }
    }
}

pub struct ScenarioConfig {
    pub shape: ScenarioShape,
    pub target: SocketAddr,
    pub duration: Duration,
    pub interval: Option<Duration>,
    pub profile: ProtocolProfile,
    pub target_type: String,
    /// Deterministic payload corruption applied to every write/I-O
    /// payload this scenario builds, for DPI fault-injection runs.
    pub mutation: Option<(Mutation, u64)>,
    /// Packet tap attached to every session this scenario opens.
    pub capture: Option<Arc<dyn CaptureHandle>>,
}

/// Cooperative cancellation token: a single bit behind a watch channel, so
/// every in-flight await (including the pacing tick) can race against it.
#[derive(Clone)]
pub struct CancelToken {
    rx: tokio::sync::watch::Receiver<bool>,
}

pub struct CancelHandle {
    tx: tokio::sync::watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = tokio::sync::watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    async fn cancelled(&mut self) {
        let _ = self.rx.changed().await;
    }
}

/// Runs `config.shape` against `config.target` for `config.duration`,
/// recording one [`MetricSample`] per attempted operation into `sink`.
pub async fn run_scenario(
    config: ScenarioConfig,
    sink: Arc<MetricsSink>,
    cancel: CancelToken,
) -> Result<()> {
    if config.shape == ScenarioShape::Io {
        return run_io_scenario(config, sink, cancel).await;
    }

    let interval = config.interval.unwrap_or_else(|| config.shape.default_interval());
    let start = Instant::now();
    let deadline = start + config.duration;
    let mut ticker = interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut session = ClientSession::connect(config.target, config.profile).await?;
    if let Some(capture) = &config.capture {
        session.attach_capture(capture.clone());
    }
    let mut op_index: u64 = 0;
    let mut cancel = cancel;

    loop {
        if Instant::now() >= deadline || cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }
        if Instant::now() >= deadline {
            break;
        }
        run_one_operation(&config, &mut session, &sink, op_index).await;
        op_index += 1;
    }

    let _ = session.disconnect().await;
    Ok(())
}

/// The `io` shape: a single ForwardOpen before the pacing loop, one
/// send/receive I/O round trip per tick, and ForwardClose on exit —
/// exactly one Class-1 connection lifecycle per scenario run.
async fn run_io_scenario(
    config: ScenarioConfig,
    sink: Arc<MetricsSink>,
    mut cancel: CancelToken,
) -> Result<()> {
    let interval = config.interval.unwrap_or_else(|| config.shape.default_interval());
    let start = Instant::now();
    let deadline = start + config.duration;
    let mut ticker = interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut session = ClientSession::connect(config.target, config.profile).await?;
    if let Some(capture) = &config.capture {
        session.attach_capture(capture.clone());
    }

    let open_spec = PayloadSpec::new(PayloadKind::ForwardOpen)
        .with("connection_serial", PayloadParam::U16(1))
        .with("originator_vendor_id", PayloadParam::U16(0x1337))
        .with("originator_serial", PayloadParam::U32(1))
        .with("rpi_us", PayloadParam::U32(interval.as_micros() as u32));
    let open_start = std::time::Instant::now();
    let open_result = session.forward_open(open_spec, 0).await;
    record_io_sample(&config, &sink, "forward_open", &open_result, open_start);
    if open_result.is_err() {
        let _ = session.disconnect().await;
        return open_result;
    }

    let mut op_index: u64 = 0;
    loop {
        if Instant::now() >= deadline || cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }
        if Instant::now() >= deadline {
            break;
        }
        let start = std::time::Instant::now();
        let mut payload = op_index.to_le_bytes().to_vec();
        if let Some((kind, seed)) = config.mutation {
            payload = crate::wire::payload::apply_mutation(&payload, kind, seed.wrapping_add(op_index));
        }
        let result = async {
            session.send_io_data(config.target, &payload).await?;
            session.receive_io_data(Duration::from_millis(500)).await?;
            Ok(())
        }
        .await;
        record_io_sample(&config, &sink, "send_io_data", &result, start);
        op_index += 1;
    }

    let close_start = std::time::Instant::now();
    let close_result = session.forward_close().await;
    record_io_sample(&config, &sink, "forward_close", &close_result, close_start);

    let _ = session.disconnect().await;
    Ok(())
}

fn record_io_sample(
    config: &ScenarioConfig,
    sink: &MetricsSink,
    operation: &str,
    result: &Result<()>,
    start: std::time::Instant,
) {
    let rtt_us = start.elapsed().as_micros() as u64;
    let sample = MetricSample {
        timestamp: chrono::Utc::now(),
        scenario: config.shape.name().to_string(),
        operation: operation.to_string(),
        target_name: config.target.to_string(),
        target_type: config.target_type.clone(),
        success: result.is_ok(),
        rtt_us,
        status: None,
        error: result.as_ref().err().map(|e| e.to_string()),
    };
    debug!(scenario = config.shape.name(), op = operation, success = sample.success, "recorded scenario sample");
    sink.record(sample);
}

async fn run_one_operation(
    config: &ScenarioConfig,
    session: &mut ClientSession,
    sink: &MetricsSink,
    op_index: u64,
) {
    let (operation, outcome) = match config.shape {
        ScenarioShape::Baseline => ("get_attribute_single", read_assembly(session).await),
        ScenarioShape::Mixed => {
            if op_index % 2 == 0 {
                ("get_attribute_single", read_assembly(session).await)
            } else {
                ("set_attribute_single", write_assembly(session, config.mutation).await)
            }
        }
        ScenarioShape::Stress => ("get_attribute_single", read_assembly(session).await),
        ScenarioShape::Churn => ("read_tag", read_assembly(session).await),
        ScenarioShape::Io => unreachable!("Io shape is driven by run_io_scenario, not run_one_operation"),
    };

    let start = std::time::Instant::now();
    let result = outcome;
    let rtt_us = start.elapsed().as_micros() as u64;

    let sample = MetricSample {
        timestamp: chrono::Utc::now(),
        scenario: config.shape.name().to_string(),
        operation: operation.to_string(),
        target_name: config.target.to_string(),
        target_type: config.target_type.clone(),
        success: result.is_ok(),
        rtt_us,
        status: None,
        error: result.err().map(|e| e.to_string()),
    };
    debug!(scenario = config.shape.name(), op = operation, success = sample.success, "recorded scenario sample");
    sink.record(sample);
}

async fn read_assembly(session: &mut ClientSession) -> Result<()> {
    let path = CipPath::class_instance_attribute(0x04, 100, Some(3));
    session.invoke_service(0x0E, path, None).await.map(|_| ())
}

async fn write_assembly(session: &mut ClientSession, mutation: Option<(Mutation, u64)>) -> Result<()> {
    let path = CipPath::class_instance_attribute(0x04, 100, Some(3));
    let spec = PayloadSpec::new(PayloadKind::RockwellTag)
        .with("datatype", PayloadParam::U16(0x00C3))
        .with("write_value", PayloadParam::Bytes(vec![0x01, 0x00]));
    session
        .invoke_service_with_mutation(0x10, path, Some(&spec), mutation)
        .await
        .map(|_| ())
}

/// The churn scenario additionally reconnects every N operations instead
/// of holding one session open; implemented as a thin wrapper since it
/// shares everything else with [`run_scenario`].
pub async fn run_churn_scenario(
    config: ScenarioConfig,
    sink: Arc<MetricsSink>,
    mut cancel: CancelToken,
    ops_per_connection: u32,
) -> Result<()> {
    let interval = config.interval.unwrap_or_else(|| config.shape.default_interval());
    let start = Instant::now();
    let deadline = start + config.duration;
    let mut ticker = interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut op_index: u64 = 0;
    'outer: loop {
        if Instant::now() >= deadline || cancel.is_cancelled() {
            break;
        }
        let mut session = match ClientSession::connect(config.target, config.profile).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "churn scenario failed to reconnect");
                continue;
            }
        };
        if let Some(capture) = &config.capture {
            session.attach_capture(capture.clone());
        }
        for _ in 0..ops_per_connection {
            if Instant::now() >= deadline || cancel.is_cancelled() {
                let _ = session.disconnect().await;
                break 'outer;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => { let _ = session.disconnect().await; break 'outer; }
            }
            run_one_operation(&config, &mut session, &sink, op_index).await;
            op_index += 1;
        }
        let _ = session.disconnect().await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_shapes_carry_expected_default_intervals() {
        assert_eq!(ScenarioShape::Baseline.default_interval(), Duration::from_millis(250));
        assert_eq!(ScenarioShape::Stress.default_interval(), Duration::from_millis(20));
        assert_eq!(ScenarioShape::Io.default_interval(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn cancel_handle_wakes_waiting_token() {
        let (handle, mut token) = CancelHandle::new();
        assert!(!token.is_cancelled());
        handle.cancel();
        token.cancelled().await;
        assert!(token.is_cancelled());
    }
}
