use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "bookd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "bookd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "bookd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "bookd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bookd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "bookd_tenants_active";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "bookd_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "bookd_journal_flush_batch_size";

/// Install the Prometheus metrics exporter on the given port. No-op if
/// port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RegisterBusiness { .. } => "register_business",
        Command::RegisterService { .. } => "register_service",
        Command::RetireService { .. } => "retire_service",
        Command::SetWorkingHours { .. } => "set_working_hours",
        Command::ReplaceWorkingHours { .. } => "replace_working_hours",
        Command::ClearWorkingHours { .. } => "clear_working_hours",
        Command::CreateBooking { .. } => "create_booking",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::ConfirmPayment { .. } => "confirm_payment",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectServices { .. } => "select_services",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectWorkingHours { .. } => "select_working_hours",
        Command::SelectSubscription { .. } => "select_subscription",
        Command::CancelSubscription { .. } => "cancel_subscription",
        Command::ReactivateSubscription { .. } => "reactivate_subscription",
        Command::ActivateSubscription { .. } => "activate_subscription",
        Command::Listen { .. } => "listen",
    }
}
