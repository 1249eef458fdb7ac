//! Prometheus metrics for the run engine

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramVec, IntCounter, TextEncoder, register_counter_vec,
    register_gauge, register_histogram_vec, register_int_counter,
};

lazy_static! {
    /// Total number of runs created
    pub static ref RUNS_CREATED_TOTAL: IntCounter = register_int_counter!(
        "maestro_runs_created_total",
        "Total number of runs created"
    )
    .unwrap();

    /// Runs that reached a terminal status, by status
    pub static ref RUNS_TERMINAL_TOTAL: CounterVec = register_counter_vec!(
        "maestro_runs_terminal_total",
        "Runs that reached a terminal status",
        &["status"]
    )
    .unwrap();

    /// Number of runs with a live driver task
    pub static ref ACTIVE_RUNS: Gauge = register_gauge!(
        "maestro_active_runs",
        "Runs with a live driver task"
    )
    .unwrap();

    /// Total number of agent invocations by agent and outcome
    pub static ref AGENT_INVOCATIONS_TOTAL: CounterVec = register_counter_vec!(
        "maestro_agent_invocations_total",
        "Agent invocations by agent and outcome",
        &["agent", "outcome"]
    )
    .unwrap();

    /// Agent invocation duration in seconds, retries included
    pub static ref AGENT_INVOCATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "maestro_agent_invocation_duration_seconds",
        "Wall-clock duration of agent invocations, retries included",
        &["agent"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 15.0, 30.0, 60.0, 120.0]
    )
    .unwrap();

    /// Write/verify rounds by result
    pub static ref WORK_ITEM_ROUNDS_TOTAL: CounterVec = register_counter_vec!(
        "maestro_work_item_rounds_total",
        "Write/verify rounds by result",
        &["result"]
    )
    .unwrap();

    /// Run events handed to the broadcaster
    pub static ref EVENTS_PUBLISHED_TOTAL: IntCounter = register_int_counter!(
        "maestro_events_published_total",
        "Run events handed to the broadcaster"
    )
    .unwrap();
}

/// Record a run creation
pub fn record_run_created() {
    RUNS_CREATED_TOTAL.inc();
}

/// Record a run reaching a terminal status
pub fn record_run_terminal(status: &str) {
    RUNS_TERMINAL_TOTAL.with_label_values(&[status]).inc();
}

/// Bump the active-run gauge when a driver task starts
pub fn inc_active_runs() {
    ACTIVE_RUNS.inc();
}

/// Drop the active-run gauge when a driver task exits
pub fn dec_active_runs() {
    ACTIVE_RUNS.dec();
}

/// Record an agent invocation and its duration
pub fn record_invocation(agent: &str, ok: bool, duration: std::time::Duration) {
    let outcome = if ok { "ok" } else { "error" };
    AGENT_INVOCATIONS_TOTAL
        .with_label_values(&[agent, outcome])
        .inc();
    AGENT_INVOCATION_DURATION_SECONDS
        .with_label_values(&[agent])
        .observe(duration.as_secs_f64());
}

/// Record the outcome of one write/verify round
pub fn record_round(passed: bool) {
    let result = if passed { "passed" } else { "failed" };
    WORK_ITEM_ROUNDS_TOTAL.with_label_values(&[result]).inc();
}

/// Record an event handed to the broadcaster
pub fn record_event_published() {
    EVENTS_PUBLISHED_TOTAL.inc();
}

/// Export all metrics in Prometheus text format
pub fn export_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_includes_registered_series() {
        record_run_created();
        record_invocation("mason", true, std::time::Duration::from_millis(120));
        record_round(false);

        let exported = export_metrics().unwrap();
        assert!(exported.contains("maestro_runs_created_total"));
        assert!(exported.contains("maestro_agent_invocations_total"));
        assert!(exported.contains("maestro_work_item_rounds_total"));
    }
}
