//! Prometheus metrics for the environment control plane.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::services::sweeper::SweepReport;

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a webhook received event.
pub fn webhook_received(event_type: &str) {
    counter!("ephemera_webhooks_received_total", "event" => event_type.to_string()).increment(1);
}

/// Record an environment entering `status`.
pub fn environment_status_changed(status: &str) {
    counter!("ephemera_environment_transitions_total", "status" => status.to_string())
        .increment(1);
}

/// Record a finished environment task.
pub fn task_finished(kind: &str, outcome: &str, duration: Duration) {
    counter!(
        "ephemera_tasks_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("ephemera_task_duration_ms", "kind" => kind.to_string())
        .record(duration.as_millis() as f64);
}

/// Record a task turned away by a full queue.
pub fn task_rejected(kind: &str) {
    counter!("ephemera_tasks_rejected_total", "kind" => kind.to_string()).increment(1);
}

/// Record the findings of one sweep.
pub fn sweep_completed(report: &SweepReport) {
    counter!("ephemera_sweeps_total").increment(1);
    for (reason, count) in [
        ("provisioning_stuck", report.provisioning_stuck),
        ("updating_stuck", report.updating_stuck),
        ("destroying_stuck", report.destroying_stuck),
        ("missing_namespace", report.missing_namespace),
    ] {
        counter!("ephemera_sweep_found_total", "reason" => reason).increment(count as u64);
    }
    counter!("ephemera_sweep_cleaned_total").increment(report.cleaned as u64);
    counter!("ephemera_webhook_deliveries_pruned_total").increment(report.deliveries_pruned as u64);
}

/// Set current active environment count.
pub fn active_environments(count: i64) {
    gauge!("ephemera_active_environments").set(count as f64);
}
