//! Per-socket transfer telemetry.
//!
//! When monitoring is enabled the [`crate::net::Network`] records one sample
//! per I/O operation: latency, byte count and operation kind. Reports are
//! emitted through `tracing` so they land in whatever sink the host set up.

use std::sync::Mutex;
use std::time::Instant;

use tracing::{info, warn};

/// Recent-latency window per socket.
const RECENT_SAMPLES: usize = 50;

/// Upper bound on retained per-operation records.
const MAX_RECORDS: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct SocketStats {
    pub operations: u64,
    pub total_bytes: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub bandwidth_mbps: f64,
    /// Last [`RECENT_SAMPLES`] latencies, for percentile analysis.
    pub recent_latencies: Vec<f64>,
}

impl SocketStats {
    fn record(&mut self, latency_ms: f64, bytes: u64) {
        self.operations += 1;
        self.total_bytes += bytes;

        if self.operations == 1 {
            self.min_latency_ms = latency_ms;
            self.max_latency_ms = latency_ms;
        } else {
            self.min_latency_ms = self.min_latency_ms.min(latency_ms);
            self.max_latency_ms = self.max_latency_ms.max(latency_ms);
        }
        self.avg_latency_ms =
            (self.avg_latency_ms * (self.operations - 1) as f64 + latency_ms) / self.operations as f64;

        if self.recent_latencies.len() < RECENT_SAMPLES {
            self.recent_latencies.push(latency_ms);
        }

        if latency_ms > 0.0 {
            let mbytes_per_s = (bytes as f64 / (1024.0 * 1024.0)) / (latency_ms / 1000.0);
            self.bandwidth_mbps = mbytes_per_s * 8.0;
        }
    }
}

#[derive(Debug, Clone)]
struct OperationRecord {
    kind: &'static str,
    bytes: u64,
    latency_ms: f64,
}

struct TelemetryState {
    sockets: Vec<SocketStats>,
    records: Vec<OperationRecord>,
}

/// Latency/bandwidth accounting for one socket array.
///
/// The enable flag is fixed at construction; a disabled telemetry object
/// makes `record` a no-op so the hot path pays one branch.
pub struct Telemetry {
    enabled: bool,
    state: Mutex<TelemetryState>,
}

impl Telemetry {
    pub fn new(n_sockets: usize, enabled: bool) -> Self {
        Self {
            enabled,
            state: Mutex::new(TelemetryState {
                sockets: vec![SocketStats::default(); n_sockets],
                records: Vec::new(),
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(
        &self,
        kind: &'static str,
        socket_index: usize,
        bytes: u64,
        start: Instant,
        end: Instant,
    ) {
        if !self.enabled {
            return;
        }
        let latency_ms = end.duration_since(start).as_secs_f64() * 1000.0;
        let mut state = self.state.lock().unwrap();
        if let Some(stats) = state.sockets.get_mut(socket_index) {
            stats.record(latency_ms, bytes);
        }
        if state.records.len() < MAX_RECORDS {
            state.records.push(OperationRecord { kind, bytes, latency_ms });
        }
    }

    pub fn socket_stats(&self, socket_index: usize) -> Option<SocketStats> {
        self.state.lock().unwrap().sockets.get(socket_index).cloned()
    }

    /// Emit a per-socket latency/bandwidth summary.
    pub fn performance_report(&self) {
        if !self.enabled {
            info!("network monitoring is disabled; no performance data");
            return;
        }
        let state = self.state.lock().unwrap();
        for (socket_index, stats) in state.sockets.iter().enumerate() {
            if stats.operations == 0 {
                continue;
            }
            info!(
                socket_index,
                operations = stats.operations,
                total_mb = format_args!("{:.2}", stats.total_bytes as f64 / (1024.0 * 1024.0)),
                avg_ms = format_args!("{:.2}", stats.avg_latency_ms),
                min_ms = format_args!("{:.2}", stats.min_latency_ms),
                max_ms = format_args!("{:.2}", stats.max_latency_ms),
                bandwidth_mbps = format_args!("{:.2}", stats.bandwidth_mbps),
                "socket performance"
            );
        }
    }

    /// Emit a bottleneck analysis: slowest socket, latency percentiles and
    /// per-operation aggregates.
    pub fn bottleneck_report(&self) {
        if !self.enabled {
            info!("network monitoring is disabled; no bottleneck data");
            return;
        }
        let state = self.state.lock().unwrap();

        let slowest = state
            .sockets
            .iter()
            .enumerate()
            .filter(|(_, s)| s.operations > 0)
            .max_by(|(_, a), (_, b)| a.avg_latency_ms.total_cmp(&b.avg_latency_ms));
        if let Some((socket_index, stats)) = slowest {
            info!(
                socket_index,
                avg_ms = format_args!("{:.2}", stats.avg_latency_ms),
                "slowest socket"
            );
        }

        for (socket_index, stats) in state.sockets.iter().enumerate() {
            if stats.recent_latencies.len() <= 10 {
                continue;
            }
            let mut latencies = stats.recent_latencies.clone();
            latencies.sort_by(|a, b| a.total_cmp(b));
            let p = |q: f64| latencies[((latencies.len() as f64 * q) as usize).min(latencies.len() - 1)];
            let (p50, p95, p99) = (p(0.50), p(0.95), p(0.99));
            info!(
                socket_index,
                p50 = format_args!("{:.2}", p50),
                p95 = format_args!("{:.2}", p95),
                p99 = format_args!("{:.2}", p99),
                "socket latency percentiles"
            );
            if p95 > p50 * 2.0 {
                warn!(socket_index, "high latency variance (p95 >> p50); possible congestion");
            }
            if stats.bandwidth_mbps < 10.0 && stats.operations > 100 {
                warn!(
                    socket_index,
                    bandwidth_mbps = format_args!("{:.2}", stats.bandwidth_mbps),
                    "low observed bandwidth"
                );
            }
        }

        let mut kinds: Vec<&'static str> = state.records.iter().map(|r| r.kind).collect();
        kinds.sort_unstable();
        kinds.dedup();
        for kind in kinds {
            let (mut count, mut bytes, mut latency) = (0u64, 0u64, 0.0f64);
            for record in state.records.iter().filter(|r| r.kind == kind) {
                count += 1;
                bytes += record.bytes;
                latency += record.latency_ms;
            }
            info!(
                kind,
                operations = count,
                total_mb = format_args!("{:.2}", bytes as f64 / (1024.0 * 1024.0)),
                avg_ms = format_args!("{:.2}", latency / count as f64),
                "operation aggregate"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn disabled_telemetry_records_nothing() {
        let telemetry = Telemetry::new(2, false);
        let now = Instant::now();
        telemetry.record("write", 0, 1024, now, now + Duration::from_millis(5));
        assert_eq!(telemetry.socket_stats(0).unwrap().operations, 0);
    }

    #[test]
    fn stats_track_min_max_avg() {
        let telemetry = Telemetry::new(1, true);
        let base = Instant::now();
        telemetry.record("write", 0, 100, base, base + Duration::from_millis(2));
        telemetry.record("write", 0, 100, base, base + Duration::from_millis(6));
        let stats = telemetry.socket_stats(0).unwrap();
        assert_eq!(stats.operations, 2);
        assert_eq!(stats.total_bytes, 200);
        assert!(stats.min_latency_ms <= stats.avg_latency_ms);
        assert!(stats.avg_latency_ms <= stats.max_latency_ms);
    }

    #[test]
    fn recent_window_is_bounded() {
        let telemetry = Telemetry::new(1, true);
        let base = Instant::now();
        for _ in 0..(RECENT_SAMPLES + 20) {
            telemetry.record("read", 0, 8, base, base + Duration::from_millis(1));
        }
        let stats = telemetry.socket_stats(0).unwrap();
        assert_eq!(stats.recent_latencies.len(), RECENT_SAMPLES);
        assert_eq!(stats.operations, (RECENT_SAMPLES + 20) as u64);
    }

    #[test]
    fn out_of_range_socket_is_ignored() {
        let telemetry = Telemetry::new(1, true);
        let now = Instant::now();
        telemetry.record("write", 7, 8, now, now);
        assert_eq!(telemetry.socket_stats(0).unwrap().operations, 0);
    }
}
