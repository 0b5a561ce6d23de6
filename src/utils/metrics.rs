//! Observability and Metrics
//!
//! Counters for the map transport, shared by the receive loop, the pipelines
//! and the flush task.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for router operations
#[derive(Debug)]
pub struct Metrics {
    /// Datagrams read from the socket
    pub datagrams_received: AtomicU64,
    /// Datagrams written to the socket, resends included
    pub datagrams_sent: AtomicU64,
    /// Bytes read from the socket
    pub bytes_received: AtomicU64,
    /// Bytes written to the socket
    pub bytes_sent: AtomicU64,
    /// Login datagrams accepted
    pub logins: AtomicU64,
    /// Datagrams that failed under every available key
    pub decrypt_failures: AtomicU64,
    /// Datagrams accepted through the previous-key fallback
    pub previous_key_decrypts: AtomicU64,
    /// Plaintext datagrams with a bad checksum or login sum
    pub checksum_failures: AtomicU64,
    /// Corrupt, truncated or otherwise undecodable payloads
    pub decode_errors: AtomicU64,
    /// Sub-packets handed to the bus
    pub subpackets_forwarded: AtomicU64,
    /// Sub-packets dropped by the sequence window
    pub subpackets_skipped: AtomicU64,
    /// Key rotations performed
    pub key_rotations: AtomicU64,
    /// Datagrams retransmitted for a lagging ack
    pub resends: AtomicU64,
    /// Sessions created
    pub sessions_created: AtomicU64,
    /// Sessions removed by the idle sweep or capacity limit
    pub sessions_evicted: AtomicU64,
    /// Bus publish or decode failures
    pub bus_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            datagrams_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            logins: AtomicU64::new(0),
            decrypt_failures: AtomicU64::new(0),
            previous_key_decrypts: AtomicU64::new(0),
            checksum_failures: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            subpackets_forwarded: AtomicU64::new(0),
            subpackets_skipped: AtomicU64::new(0),
            key_rotations: AtomicU64::new(0),
            resends: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
            bus_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn datagram_received(&self, byte_count: u64) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn datagram_sent(&self, byte_count: u64) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn login(&self) {
        self.logins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrypt_failure(&self) {
        self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn previous_key_decrypt(&self) {
        self.previous_key_decrypts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn checksum_failure(&self) {
        self.checksum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subpackets(&self, forwarded: u64, skipped: u64) {
        self.subpackets_forwarded.fetch_add(forwarded, Ordering::Relaxed);
        self.subpackets_skipped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn key_rotation(&self) {
        self.key_rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resend(&self) {
        self.resends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_evicted(&self, count: u64) {
        self.sessions_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn bus_error(&self) {
        self.bus_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            logins: self.logins.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            previous_key_decrypts: self.previous_key_decrypts.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            subpackets_forwarded: self.subpackets_forwarded.load(Ordering::Relaxed),
            subpackets_skipped: self.subpackets_skipped.load(Ordering::Relaxed),
            key_rotations: self.key_rotations.load(Ordering::Relaxed),
            resends: self.resends.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
            bus_errors: self.bus_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            datagrams_received = snapshot.datagrams_received,
            datagrams_sent = snapshot.datagrams_sent,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            logins = snapshot.logins,
            decrypt_failures = snapshot.decrypt_failures,
            previous_key_decrypts = snapshot.previous_key_decrypts,
            checksum_failures = snapshot.checksum_failures,
            decode_errors = snapshot.decode_errors,
            subpackets_forwarded = snapshot.subpackets_forwarded,
            subpackets_skipped = snapshot.subpackets_skipped,
            key_rotations = snapshot.key_rotations,
            resends = snapshot.resends,
            sessions_created = snapshot.sessions_created,
            sessions_evicted = snapshot.sessions_evicted,
            bus_errors = snapshot.bus_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Router metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub logins: u64,
    pub decrypt_failures: u64,
    pub previous_key_decrypts: u64,
    pub checksum_failures: u64,
    pub decode_errors: u64,
    pub subpackets_forwarded: u64,
    pub subpackets_skipped: u64,
    pub key_rotations: u64,
    pub resends: u64,
    pub sessions_created: u64,
    pub sessions_evicted: u64,
    pub bus_errors: u64,
    pub uptime_seconds: u64,
}

/// Process-wide instance used by the binary
static METRICS: once_cell::sync::Lazy<Arc<Metrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(Metrics::new()));

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Shared handle to the global instance, for components that own their metrics
pub fn global_metrics_handle() -> Arc<Metrics> {
    Arc::clone(&METRICS)
}

/// Initialize metrics collection (call once at startup)
pub fn init_metrics() {
    let _ = global_metrics();
    info!("Metrics collection initialized");
}

/// Logs how long an operation took when dropped
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_us = self.start.elapsed().as_micros() as u64,
            "Operation completed"
        );
    }
}
