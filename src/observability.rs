//! Prometheus metrics. Metric names are declared once here so recording
//! sites and dashboards can't drift apart.

use metrics_exporter_prometheus::PrometheusBuilder;

pub const REQUESTS_TOTAL: &str = "parkade_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "parkade_request_duration_seconds";

pub const CONNECTIONS_ACTIVE: &str = "parkade_connections_active";
pub const CONNECTIONS_TOTAL: &str = "parkade_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkade_connections_rejected_total";

pub const RECONCILE_RUNS_TOTAL: &str = "parkade_reconcile_runs_total";
pub const RECONCILE_ACTIVATED_TOTAL: &str = "parkade_reconcile_activated_total";
pub const RECONCILE_EXPIRED_TOTAL: &str = "parkade_reconcile_expired_total";

pub const BOOKING_CONFLICTS_TOTAL: &str = "parkade_booking_conflicts_total";

pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkade_wal_flush_duration_seconds";
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkade_wal_flush_batch_size";

/// Install the Prometheus exporter and register metric descriptions.
/// With no port configured the recorder is skipped and every `metrics::`
/// call becomes a no-op.
pub fn init(port: Option<u16>) {
    if let Some(port) = port {
        match PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
        {
            Ok(()) => tracing::info!(port, "prometheus exporter listening"),
            Err(e) => tracing::error!(error = %e, "failed to install prometheus exporter"),
        }
    }

    metrics::describe_counter!(REQUESTS_TOTAL, "Requests processed, labeled by op and outcome");
    metrics::describe_histogram!(
        REQUEST_DURATION_SECONDS,
        "Request processing time in seconds, labeled by op"
    );
    metrics::describe_gauge!(CONNECTIONS_ACTIVE, "Client connections currently open");
    metrics::describe_counter!(CONNECTIONS_TOTAL, "Client connections accepted");
    metrics::describe_counter!(
        CONNECTIONS_REJECTED_TOTAL,
        "Client connections rejected at the connection cap"
    );
    metrics::describe_counter!(RECONCILE_RUNS_TOTAL, "Reconciliation passes started");
    metrics::describe_counter!(
        RECONCILE_ACTIVATED_TOTAL,
        "Bookings whose window opened during reconciliation"
    );
    metrics::describe_counter!(
        RECONCILE_EXPIRED_TOTAL,
        "Bookings expired to history during reconciliation"
    );
    metrics::describe_counter!(
        BOOKING_CONFLICTS_TOTAL,
        "Reservations rejected by the under-lock conflict recheck"
    );
    metrics::describe_histogram!(
        WAL_FLUSH_DURATION_SECONDS,
        "Group-commit WAL flush time in seconds"
    );
    metrics::describe_histogram!(
        WAL_FLUSH_BATCH_SIZE,
        "Transactions per group-commit WAL flush"
    );
}
