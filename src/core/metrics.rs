use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of pool metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connection_attempts: u64,
    pub connections_created: u64,
    pub connection_failures: u64,
    pub connections_closed: u64,
    pub current_connections: u64,
    pub validation_failures: u64,
    pub failovers: u64,
    pub listener_reconnects: u64,
    pub active_listeners: u64,
}

/// Thread-safe counters shared by the factory, the listeners and the pool
#[derive(Debug, Default)]
pub struct AtomicPoolMetrics {
    // Connection counters
    connection_attempts: AtomicU64,
    connections_created: AtomicU64,
    connection_failures: AtomicU64,
    connections_closed: AtomicU64,
    current_connections: AtomicU64,

    validation_failures: AtomicU64,
    failovers: AtomicU64,

    // Sentinel listener tracking
    listener_reconnects: AtomicU64,
    active_listeners: AtomicU64,
}

impl AtomicPoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_success(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
        self.current_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        // Saturating: a connection opened before metrics were attached may still report
        let _ = self
            .current_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_listener_reconnect(&self) {
        self.listener_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_started(&self) {
        self.active_listeners.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_stopped(&self) {
        self.active_listeners.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_listeners(&self) -> u64 {
        self.active_listeners.load(Ordering::Relaxed)
    }

    pub fn current_connections(&self) -> u64 {
        self.current_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            current_connections: self.current_connections.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            listener_reconnects: self.listener_reconnects.load(Ordering::Relaxed),
            active_listeners: self.active_listeners.load(Ordering::Relaxed),
        }
    }
}
