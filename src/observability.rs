use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::{Command, Table};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "vivat_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "vivat_query_duration_seconds";

/// Counter: defense bookings refused because the room was taken.
pub const SCHEDULING_CONFLICTS_TOTAL: &str = "vivat_scheduling_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "vivat_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "vivat_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "vivat_connections_rejected_total";

/// Gauge: number of loaded databases.
pub const TENANTS_ACTIVE: &str = "vivat_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "vivat_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "vivat_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "vivat_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "vivat_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command to a short label for metrics, e.g. `insert_defenses`.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::Insert { table, .. } => match table {
            Table::Students => "insert_students",
            Table::Professors => "insert_professors",
            Table::Theses => "insert_theses",
            Table::Juries => "insert_juries",
            Table::Defenses => "insert_defenses",
        },
        Command::Update { table, .. } => match table {
            Table::Students => "update_students",
            Table::Professors => "update_professors",
            Table::Theses => "update_theses",
            Table::Juries => "update_juries",
            Table::Defenses => "update_defenses",
        },
        Command::Delete { table, .. } => match table {
            Table::Students => "delete_students",
            Table::Professors => "delete_professors",
            Table::Theses => "delete_theses",
            Table::Juries => "delete_juries",
            Table::Defenses => "delete_defenses",
        },
        Command::Select { table, .. } => match table {
            Table::Students => "select_students",
            Table::Professors => "select_professors",
            Table::Theses => "select_theses",
            Table::Juries => "select_juries",
            Table::Defenses => "select_defenses",
        },
        Command::SlotAvailability { .. } => "slot_availability",
        Command::Stats => "stats",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_name_the_table() {
        let cmd = Command::Delete {
            table: Table::Defenses,
            id: ulid::Ulid::nil(),
        };
        assert_eq!(command_label(&cmd), "delete_defenses");
        assert_eq!(command_label(&Command::Stats), "stats");
    }

    #[test]
    fn init_without_port_is_noop() {
        assert!(init(None).is_ok());
    }
}
