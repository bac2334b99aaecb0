//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use spacecast_core::ManagerError;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "spacecast_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "spacecast_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "spacecast_connections_rejected_total";
    pub const CHAT_POSTS_TOTAL: &str = spacecast_core::CHAT_POSTS_METRIC;
    pub const EVENTS_TOTAL: &str = "spacecast_events_total";
    pub const SESSIONS_ACTIVE: &str = "spacecast_sessions_active";
    pub const SPACES_ACTIVE: &str = "spacecast_spaces_active";
    pub const ERRORS_TOTAL: &str = "spacecast_errors_total";
}

/// Which endpoint a connection came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Space,
    Notification,
    Presence,
}

impl ConnectionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Space => "space",
            Self::Notification => "notification",
            Self::Presence => "presence",
        }
    }
}

/// Describe all metrics.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused at the capacity ceiling"
    );
    metrics::describe_counter!(
        names::CHAT_POSTS_TOTAL,
        "Chat posts from sockets and REST, by outcome"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Domain events accepted");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Space sessions registered in the hub");
    metrics::describe_gauge!(names::SPACES_ACTIVE, "Spaces with at least one session");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection(kind: ConnectionKind) {
    counter!(names::CONNECTIONS_TOTAL, "kind" => kind.as_str()).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE, "kind" => kind.as_str()).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection(kind: ConnectionKind) {
    gauge!(names::CONNECTIONS_ACTIVE, "kind" => kind.as_str()).decrement(1.0);
}

/// Record a connection refused before upgrade.
pub fn record_rejection(kind: ConnectionKind) {
    counter!(names::CONNECTIONS_REJECTED, "kind" => kind.as_str()).increment(1);
}

/// Record a manager refusing a connection after the upgrade.
///
/// A capacity race counts as a rejection, anything else as an error.
pub fn record_handoff_failure(kind: ConnectionKind, error: &ManagerError) {
    if is_capacity(error) {
        record_rejection(kind);
    } else {
        record_error(kind.as_str());
    }
}

fn is_capacity(error: &ManagerError) -> bool {
    matches!(error, ManagerError::AtCapacity { .. })
}

/// Record an accepted domain event.
pub fn record_event(kind: &'static str) {
    counter!(names::EVENTS_TOTAL, "type" => kind).increment(1);
}

/// Update hub gauges.
pub fn set_hub_stats(sessions: usize, spaces: usize) {
    gauge!(names::SESSIONS_ACTIVE).set(sessions as f64);
    gauge!(names::SPACES_ACTIVE).set(spaces as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Records a disconnection on drop.
pub struct ConnectionMetricsGuard {
    kind: ConnectionKind,
}

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new(kind: ConnectionKind) -> Self {
        record_connection(kind);
        Self { kind }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection(self.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed, must still be a no-op
        let _guard = ConnectionMetricsGuard::new(ConnectionKind::Presence);
    }

    #[test]
    fn test_connection_kind_labels() {
        assert_eq!(ConnectionKind::Space.as_str(), "space");
        assert_eq!(ConnectionKind::Notification.as_str(), "notification");
    }

    #[test]
    fn test_handoff_failures_are_classified() {
        assert!(is_capacity(&ManagerError::AtCapacity { limit: 1 }));
        assert!(!is_capacity(&ManagerError::Delivery {
            user_id: "alice".into(),
            source: spacecast_transport::ConnectionError::Closed,
        }));

        // No recorder installed, both paths must be no-ops
        record_handoff_failure(ConnectionKind::Presence, &ManagerError::AtCapacity { limit: 1 });
    }
}
