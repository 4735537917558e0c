//! Metrics sink: per-operation samples, percentile summaries, and CSV
//! streaming.
//!
//! An `hdrhistogram`-based collector over per-operation samples, extended
//! with the scenario-level CSV schema.

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::error::{CipdipError, Result};

pub const CSV_HEADER: &str =
    "timestamp,scenario,operation,target_name,target_type,success,rtt_us,status,error";

#[derive(Debug, Clone)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub scenario: String,
    pub operation: String,
    pub target_name: String,
    pub target_type: String,
    pub success: bool,
    pub rtt_us: u64,
    pub status: Option<u8>,
    pub error: Option<String>,
}

impl MetricSample {
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{}",
            self.timestamp.to_rfc3339(),
            self.scenario,
            self.operation,
            self.target_name,
            self.target_type,
            self.success,
            self.rtt_us,
            self.status.map(|s| s.to_string()).unwrap_or_default(),
            self.error.as_deref().unwrap_or(""),
        )
    }
}

/// Percentile value at a given quantile, expressed in microseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_us: u64,
}

#[derive(Debug, Clone)]
pub struct LatencySummary {
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub percentiles: Vec<PercentileValue>,
    pub total_samples: u64,
}

#[derive(Debug, Clone, Default)]
pub struct OpCounts {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub timeouts: u64,
    pub tcp_resets: u64,
    pub misclassified: u64,
}

#[derive(Debug, Clone)]
pub struct ScenarioSummary {
    pub counts: OpCounts,
    pub latency: Option<LatencySummary>,
    pub jitter: Option<LatencySummary>,
    pub throughput_ops_per_sec: f64,
}

/// Thread-safe sample recorder. `record` is O(1) and append-only; the CSV
/// writer (if enabled) is flushed on every sample so a crash mid-run still
/// leaves a usable partial file.
pub struct MetricsSink {
    samples: parking_lot::Mutex<Vec<MetricSample>>,
    csv_writer: Option<parking_lot::Mutex<std::fs::File>>,
}

impl MetricsSink {
    pub fn new() -> Self {
        MetricsSink {
            samples: parking_lot::Mutex::new(Vec::new()),
            csv_writer: None,
        }
    }

    pub fn with_csv_path(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(CipdipError::Io)?;
        if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
            writeln!(file, "{CSV_HEADER}").map_err(CipdipError::Io)?;
        }
        Ok(MetricsSink {
            samples: parking_lot::Mutex::new(Vec::new()),
            csv_writer: Some(parking_lot::Mutex::new(file)),
        })
    }

    pub fn record(&self, sample: MetricSample) {
        if let Some(writer) = &self.csv_writer {
            let mut f = writer.lock();
            let _ = writeln!(f, "{}", sample.to_csv_row());
        }
        self.samples.lock().push(sample);
    }

    pub fn snapshot(&self) -> Vec<MetricSample> {
        self.samples.lock().clone()
    }

    /// Builds the per-op summary: counts, P50/P95/P99 RTT, and throughput
    /// computed as `total / (last_ts - first_ts)` when the span is
    /// positive.
    pub fn get_summary(&self, percentiles: &[f64]) -> Result<ScenarioSummary> {
        let samples = self.samples.lock();
        let mut counts = OpCounts::default();
        let mut histogram = Histogram::<u64>::new(3)
            .map_err(|e| CipdipError::Invariant(format!("failed to allocate histogram: {e}")))?;
        let mut min_us = u64::MAX;
        let mut max_us = 0u64;
        let mut first_ts: Option<DateTime<Utc>> = None;
        let mut last_ts: Option<DateTime<Utc>> = None;

        for s in samples.iter() {
            counts.total += 1;
            if s.success {
                counts.success += 1;
            } else if s.error.as_deref() == Some("timeout") {
                counts.timeouts += 1;
            } else {
                counts.failure += 1;
            }
            if s.error.as_deref() == Some("tcp_reset") {
                counts.tcp_resets += 1;
            }
            let _ = histogram.record(s.rtt_us);
            min_us = min_us.min(s.rtt_us);
            max_us = max_us.max(s.rtt_us);
            first_ts = Some(first_ts.map_or(s.timestamp, |f| f.min(s.timestamp)));
            last_ts = Some(last_ts.map_or(s.timestamp, |l| l.max(s.timestamp)));
        }

        let latency = if counts.total > 0 {
            Some(LatencySummary {
                min_us,
                max_us,
                mean_us: histogram.mean(),
                percentiles: percentiles
                    .iter()
                    .map(|p| PercentileValue {
                        percentile: *p,
                        value_us: histogram.value_at_quantile(p / 100.0),
                    })
                    .collect(),
                total_samples: counts.total,
            })
        } else {
            None
        };

        let throughput_ops_per_sec = match (first_ts, last_ts) {
            (Some(f), Some(l)) if l > f => {
                let span = (l - f).num_milliseconds() as f64 / 1000.0;
                if span > 0.0 {
                    counts.total as f64 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        Ok(ScenarioSummary {
            counts,
            latency,
            jitter: None,
            throughput_ops_per_sec,
        })
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads a metrics CSV back, returning `(records, first_ts, last_ts)`;
/// malformed rows are skipped rather than aborting the whole read, so a
/// truncated-by-crash CSV is still partially usable.
pub fn read_metrics_csv(
    path: &Path,
) -> Result<(Vec<MetricSample>, Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
    let file = std::fs::File::open(path).map_err(CipdipError::Io)?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut first_ts = None;
    let mut last_ts = None;
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(CipdipError::Io)?;
        if i == 0 {
            continue; // header
        }
        if let Some(sample) = parse_csv_row(&line) {
            first_ts = Some(first_ts.map_or(sample.timestamp, |f: DateTime<Utc>| f.min(sample.timestamp)));
            last_ts = Some(last_ts.map_or(sample.timestamp, |l: DateTime<Utc>| l.max(sample.timestamp)));
            records.push(sample);
        }
    }
    Ok((records, first_ts, last_ts))
}

fn parse_csv_row(line: &str) -> Option<MetricSample> {
    let fields: Vec<&str> = line.splitn(9, ',').collect();
    if fields.len() < 9 {
        return None;
    }
    Some(MetricSample {
        timestamp: DateTime::parse_from_rfc3339(fields[0]).ok()?.with_timezone(&Utc),
        scenario: fields[1].to_string(),
        operation: fields[2].to_string(),
        target_name: fields[3].to_string(),
        target_type: fields[4].to_string(),
        success: fields[5].parse().ok()?,
        rtt_us: fields[6].parse().ok()?,
        status: fields[7].parse().ok(),
        error: (!fields[8].is_empty()).then(|| fields[8].to_string()),
    })
}

pub mod format {
    /// Human-readable duration formatting on an ns/us/ms/s threshold
    /// ladder, entering at microseconds since this sink already tracks
    /// RTT in `us`.
    pub fn latency(us: u64) -> String {
        if us < 1_000 {
            format!("{us}us")
        } else if us < 1_000_000 {
            format!("{:.2}ms", us as f64 / 1_000.0)
        } else {
            format!("{:.2}s", us as f64 / 1_000_000.0)
        }
    }

    pub fn throughput(ops_per_sec: f64) -> String {
        format!("{ops_per_sec:.1} ops/s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rtt_us: u64, success: bool) -> MetricSample {
        MetricSample {
            timestamp: Utc::now(),
            scenario: "baseline".into(),
            operation: "get_attribute_single".into(),
            target_name: "127.0.0.1:44818".into(),
            target_type: "adapter".into(),
            success,
            rtt_us,
            status: Some(0),
            error: None,
        }
    }

    #[test]
    fn percentiles_are_non_decreasing() {
        let sink = MetricsSink::new();
        for i in 1..=100u64 {
            sink.record(sample(i * 10, true));
        }
        let summary = sink.get_summary(&[50.0, 95.0, 99.0]).unwrap();
        let latency = summary.latency.unwrap();
        let values: Vec<u64> = latency.percentiles.iter().map(|p| p.value_us).collect();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn counts_tally_success_and_failure() {
        let sink = MetricsSink::new();
        sink.record(sample(100, true));
        sink.record(sample(200, false));
        let summary = sink.get_summary(&[50.0]).unwrap();
        assert_eq!(summary.counts.total, 2);
        assert_eq!(summary.counts.success, 1);
        assert_eq!(summary.counts.failure, 1);
    }

    #[test]
    fn success_failure_and_timeout_counts_are_mutually_exclusive() {
        let sink = MetricsSink::new();
        sink.record(sample(100, true));
        let mut timeout = sample(200, false);
        timeout.error = Some("timeout".to_string());
        sink.record(timeout);
        let mut reset = sample(300, false);
        reset.error = Some("tcp_reset".to_string());
        sink.record(reset);
        sink.record(sample(400, false));
        let summary = sink.get_summary(&[50.0]).unwrap();
        let counts = summary.counts;
        assert_eq!(counts.total, 4);
        assert_eq!(counts.success + counts.failure + counts.timeouts, counts.total);
        assert_eq!(counts.timeouts, 1);
        assert_eq!(counts.failure, 2);
        assert_eq!(counts.tcp_resets, 1);
    }

    #[test]
    fn csv_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let sink = MetricsSink::with_csv_path(&path).unwrap();
        sink.record(sample(123, true));
        drop(sink);
        let (records, first, last) = read_metrics_csv(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert!(first.is_some() && last.is_some());
    }

    #[test]
    fn empty_sink_yields_zero_throughput() {
        let sink = MetricsSink::new();
        let summary = sink.get_summary(&[50.0]).unwrap();
        assert_eq!(summary.throughput_ops_per_sec, 0.0);
        assert!(summary.latency.is_none());
    }

    #[test]
    fn format_latency_picks_appropriate_unit() {
        assert_eq!(format::latency(500), "500us");
        assert_eq!(format::latency(1_500), "1.50ms");
    }
}
