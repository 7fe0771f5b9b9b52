//! Instrumentation sink and a prometheus-backed implementation.
//!
//! The coordinator reports into the narrow [`Instrumentation`] trait and
//! nothing else; what happens to the numbers is the embedder's business.
//! [`Metrics`] is the batteries-included implementation, registering plain
//! counters (durations as microsecond sums) against a
//! [`prometheus_client::registry::Registry`].

use std::time::Duration;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

/// Sink for coordinator observations. All methods default to no-ops, so
/// implementations only override what they care about. Implementations must
/// tolerate concurrent calls.
pub trait Instrumentation: Send + Sync + 'static {
    /// An insert call was made.
    fn insert_call(&self) {}
    /// Tuples carried by an insert call.
    fn insert_record_count(&self, _n: usize) {}
    /// Wall time of a whole insert call.
    fn insert_call_duration(&self, _d: Duration) {}
    /// Insert call time amortized per tuple.
    fn insert_record_duration(&self, _d: Duration) {}
    /// An insert failed to reach its write quorum.
    fn insert_quorum_failure(&self) {}

    /// A delete call was made.
    fn delete_call(&self) {}
    /// Tuples carried by a delete call.
    fn delete_record_count(&self, _n: usize) {}
    /// Wall time of a whole delete call.
    fn delete_call_duration(&self, _d: Duration) {}
    /// Delete call time amortized per tuple.
    fn delete_record_duration(&self, _d: Duration) {}
    /// A delete failed to reach its write quorum.
    fn delete_quorum_failure(&self) {}

    /// A select call was made.
    fn select_call(&self) {}
    /// Tuples returned by a select call.
    fn select_record_count(&self, _n: usize) {}
    /// Wall time of a whole select call.
    fn select_call_duration(&self, _d: Duration) {}
    /// Select call time amortized per returned tuple.
    fn select_record_duration(&self, _d: Duration) {}

    /// The walker asked for a batch and was granted nothing.
    fn walk_keys_throttled(&self) {}
    /// The walker finished a full sweep over all clusters.
    fn walk_sweep_completed(&self) {}

    /// Elements submitted to the repairer after coalescing.
    fn repair_request(&self, _n: usize) {}
    /// A correction was accepted by a lagging cluster.
    fn repair_write(&self) {}
}

/// Sink that discards every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopInstrumentation;

impl Instrumentation for NopInstrumentation {}

/// Counter-based [`Instrumentation`] registered under a `corral` prefix.
#[allow(missing_docs)]
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub insert_calls: Counter,
    pub insert_records: Counter,
    pub insert_call_duration_us: Counter,
    pub insert_record_duration_us: Counter,
    pub insert_quorum_failures: Counter,
    pub delete_calls: Counter,
    pub delete_records: Counter,
    pub delete_call_duration_us: Counter,
    pub delete_record_duration_us: Counter,
    pub delete_quorum_failures: Counter,
    pub select_calls: Counter,
    pub select_records: Counter,
    pub select_call_duration_us: Counter,
    pub select_record_duration_us: Counter,
    pub walk_keys_throttled: Counter,
    pub walk_sweeps_completed: Counter,
    pub repair_requests: Counter,
    pub repair_writes: Counter,
}

impl Metrics {
    /// Create the metrics and register every counter.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        let sub = registry.sub_registry_with_prefix("corral");
        sub.register("insert_calls", "Insert calls", metrics.insert_calls.clone());
        sub.register(
            "insert_records",
            "Tuples carried by insert calls",
            metrics.insert_records.clone(),
        );
        sub.register(
            "insert_call_duration_us",
            "Total insert call time in microseconds",
            metrics.insert_call_duration_us.clone(),
        );
        sub.register(
            "insert_record_duration_us",
            "Per-tuple insert time in microseconds",
            metrics.insert_record_duration_us.clone(),
        );
        sub.register(
            "insert_quorum_failures",
            "Inserts that missed the write quorum",
            metrics.insert_quorum_failures.clone(),
        );
        sub.register("delete_calls", "Delete calls", metrics.delete_calls.clone());
        sub.register(
            "delete_records",
            "Tuples carried by delete calls",
            metrics.delete_records.clone(),
        );
        sub.register(
            "delete_call_duration_us",
            "Total delete call time in microseconds",
            metrics.delete_call_duration_us.clone(),
        );
        sub.register(
            "delete_record_duration_us",
            "Per-tuple delete time in microseconds",
            metrics.delete_record_duration_us.clone(),
        );
        sub.register(
            "delete_quorum_failures",
            "Deletes that missed the write quorum",
            metrics.delete_quorum_failures.clone(),
        );
        sub.register("select_calls", "Select calls", metrics.select_calls.clone());
        sub.register(
            "select_records",
            "Tuples returned by select calls",
            metrics.select_records.clone(),
        );
        sub.register(
            "select_call_duration_us",
            "Total select call time in microseconds",
            metrics.select_call_duration_us.clone(),
        );
        sub.register(
            "select_record_duration_us",
            "Per-tuple select time in microseconds",
            metrics.select_record_duration_us.clone(),
        );
        sub.register(
            "walk_keys_throttled",
            "Walker batches denied by the rate police",
            metrics.walk_keys_throttled.clone(),
        );
        sub.register(
            "walk_sweeps_completed",
            "Completed walker sweeps over all clusters",
            metrics.walk_sweeps_completed.clone(),
        );
        sub.register(
            "repair_requests",
            "Elements submitted for repair",
            metrics.repair_requests.clone(),
        );
        sub.register(
            "repair_writes",
            "Corrections accepted by lagging clusters",
            metrics.repair_writes.clone(),
        );
        metrics
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

impl Instrumentation for Metrics {
    fn insert_call(&self) {
        self.insert_calls.inc();
    }

    fn insert_record_count(&self, n: usize) {
        self.insert_records.inc_by(n as u64);
    }

    fn insert_call_duration(&self, d: Duration) {
        self.insert_call_duration_us.inc_by(micros(d));
    }

    fn insert_record_duration(&self, d: Duration) {
        self.insert_record_duration_us.inc_by(micros(d));
    }

    fn insert_quorum_failure(&self) {
        self.insert_quorum_failures.inc();
    }

    fn delete_call(&self) {
        self.delete_calls.inc();
    }

    fn delete_record_count(&self, n: usize) {
        self.delete_records.inc_by(n as u64);
    }

    fn delete_call_duration(&self, d: Duration) {
        self.delete_call_duration_us.inc_by(micros(d));
    }

    fn delete_record_duration(&self, d: Duration) {
        self.delete_record_duration_us.inc_by(micros(d));
    }

    fn delete_quorum_failure(&self) {
        self.delete_quorum_failures.inc();
    }

    fn select_call(&self) {
        self.select_calls.inc();
    }

    fn select_record_count(&self, n: usize) {
        self.select_records.inc_by(n as u64);
    }

    fn select_call_duration(&self, d: Duration) {
        self.select_call_duration_us.inc_by(micros(d));
    }

    fn select_record_duration(&self, d: Duration) {
        self.select_record_duration_us.inc_by(micros(d));
    }

    fn walk_keys_throttled(&self) {
        self.walk_keys_throttled.inc();
    }

    fn walk_sweep_completed(&self) {
        self.walk_sweeps_completed.inc();
    }

    fn repair_request(&self, n: usize) {
        self.repair_requests.inc_by(n as u64);
    }

    fn repair_write(&self) {
        self.repair_writes.inc();
    }
}
