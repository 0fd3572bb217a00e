//! Store call and election metrics
//!
//! Prometheus-compatible text output for:
//! - Store call latency histograms per operation
//! - Call, failure and retry counters per operation
//! - Failure counts per error code
//! - Election gauges (running elections, keys led locally)

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for store call latency (in milliseconds)
const LATENCY_BUCKETS: [f64; 10] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
];

/// Fixed-bucket latency histogram
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: &'static [f64],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: (0..=LATENCY_BUCKETS.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: &LATENCY_BUCKETS,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in milliseconds
    pub fn observe(&self, value_ms: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| value_ms <= b)
            .unwrap_or(self.boundaries.len());

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value_ms * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative `(le, count)` pairs, ending with `+Inf`
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0u64;
        let mut out: Vec<(f64, u64)> = self
            .boundaries
            .iter()
            .zip(&self.buckets)
            .map(|(&le, bucket)| {
                running += bucket.load(Ordering::Relaxed);
                (le, running)
            })
            .collect();
        running += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        out.push((f64::INFINITY, running));
        out
    }

    /// Sum of observed values in milliseconds
    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics for one store operation (create, get_version, cas, ...)
#[derive(Debug, Default)]
pub struct OperationMetrics {
    pub calls: Counter,
    pub failures: Counter,
    pub retries: Counter,
    pub latency: Histogram,
}

/// Metrics registry shared by the executor and the election coordinator
#[derive(Debug)]
pub struct MetricsRegistry {
    operations: Mutex<HashMap<&'static str, Arc<OperationMetrics>>>,
    error_codes: Mutex<BTreeMap<(&'static str, u32), u64>>,

    /// Elections with a running state machine
    pub running_elections: Gauge,
    /// Keys this process currently leads
    pub leaders_held: Gauge,
    /// Leadership transitions observed by this process
    pub leader_transitions: Counter,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            operations: Mutex::new(HashMap::new()),
            error_codes: Mutex::new(BTreeMap::new()),
            running_elections: Gauge::new(),
            leaders_held: Gauge::new(),
            leader_transitions: Counter::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for a store operation
    pub fn operation(&self, op: &'static str) -> Arc<OperationMetrics> {
        let mut ops = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
        ops.entry(op).or_default().clone()
    }

    /// Record the final outcome of one store call. `code` is `None` on success.
    pub fn record_call(&self, op: &'static str, duration: Duration, code: Option<u32>) {
        let metrics = self.operation(op);
        metrics.calls.inc();
        metrics.latency.observe(duration.as_secs_f64() * 1000.0);

        if let Some(code) = code {
            metrics.failures.inc();
            let mut codes = self.error_codes.lock().unwrap_or_else(PoisonError::into_inner);
            *codes.entry((op, code)).or_insert(0) += 1;
        }
    }

    pub fn record_retry(&self, op: &'static str) {
        self.operation(op).retries.inc();
    }

    /// Failures recorded for `op` with error `code`
    pub fn error_count(&self, op: &'static str, code: u32) -> u64 {
        let codes = self.error_codes.lock().unwrap_or_else(PoisonError::into_inner);
        codes.get(&(op, code)).copied().unwrap_or(0)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Render Prometheus text exposition format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "# HELP leasehold_running_elections Elections with a running state machine");
        let _ = writeln!(out, "# TYPE leasehold_running_elections gauge");
        let _ = writeln!(out, "leasehold_running_elections {}", self.running_elections.get());

        let _ = writeln!(out, "# HELP leasehold_leaders_held Election keys led by this process");
        let _ = writeln!(out, "# TYPE leasehold_leaders_held gauge");
        let _ = writeln!(out, "leasehold_leaders_held {}", self.leaders_held.get());

        let _ = writeln!(out, "# HELP leasehold_leader_transitions_total Leadership transitions");
        let _ = writeln!(out, "# TYPE leasehold_leader_transitions_total counter");
        let _ = writeln!(
            out,
            "leasehold_leader_transitions_total {}",
            self.leader_transitions.get()
        );

        let _ = writeln!(out, "# HELP leasehold_uptime_seconds Process uptime in seconds");
        let _ = writeln!(out, "# TYPE leasehold_uptime_seconds gauge");
        let _ = writeln!(out, "leasehold_uptime_seconds {}", self.uptime_seconds());

        let ops: BTreeMap<&'static str, Arc<OperationMetrics>> = self
            .operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();

        let _ = writeln!(out, "# TYPE leasehold_store_calls_total counter");
        for (op, m) in &ops {
            let _ = writeln!(out, "leasehold_store_calls_total{{op=\"{}\"}} {}", op, m.calls.get());
        }
        let _ = writeln!(out, "# TYPE leasehold_store_retries_total counter");
        for (op, m) in &ops {
            let _ = writeln!(out, "leasehold_store_retries_total{{op=\"{}\"}} {}", op, m.retries.get());
        }

        let _ = writeln!(out, "# TYPE leasehold_store_errors_total counter");
        for ((op, code), n) in self
            .error_codes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            let _ = writeln!(
                out,
                "leasehold_store_errors_total{{op=\"{}\",code=\"{}\"}} {}",
                op, code, n
            );
        }

        let _ = writeln!(out, "# TYPE leasehold_store_duration_ms histogram");
        for (op, m) in &ops {
            for (le, count) in m.latency.cumulative() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "leasehold_store_duration_ms_bucket{{op=\"{}\",le=\"{}\"}} {}",
                    op, le, count
                );
            }
            let _ = writeln!(out, "leasehold_store_duration_ms_sum{{op=\"{}\"}} {}", op, m.latency.sum());
            let _ = writeln!(out, "leasehold_store_duration_ms_count{{op=\"{}\"}} {}", op, m.latency.count());
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
