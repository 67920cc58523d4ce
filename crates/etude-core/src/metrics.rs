// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide counters shared by the reactor, the workers and every
/// connection. Connections hold an `Arc` to this block; they never own it.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct Metrics {
    pub live_connections: AtomicUsize,
    pub requests: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub rejected: AtomicUsize,
}

/// Point-in-time copy of [`Metrics`], used for reporting and assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub live_connections: usize,
    pub requests: usize,
    pub bytes_sent: usize,
    pub rejected: usize,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            live_connections: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        }
    }

    pub fn inc_conn(&self) {
        self.live_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.live_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_req(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            live_connections: self.live_connections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
