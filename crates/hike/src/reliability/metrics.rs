// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transmission metrics for one exchange manager.
//!
//! Tracks how many bytes each direction actually cost relative to the
//! original message sizes, which is the figure of merit for selective
//! fragment retransmission.
//!
//! All counters are atomic with `Relaxed` ordering: updates happen on the
//! SA's dispatch thread, observers may snapshot from anywhere.

use std::sync::atomic::{AtomicU64, Ordering};

/// Transmission counters, updated as exchanges complete.
#[derive(Debug, Default)]
pub struct ExchangeMetrics {
    /// Original size of the last completed request (bytes).
    request_original_size: AtomicU64,
    /// Bytes actually handed to the sender for that request.
    request_transmitted_size: AtomicU64,
    /// Retransmission rounds the request needed.
    request_retransmissions: AtomicU64,
    /// Original size of the last completed response (bytes).
    response_original_size: AtomicU64,
    /// Bytes actually handed to the sender for responses.
    response_transmitted_size: AtomicU64,
    /// Response retransmission rounds (cached-response replays).
    response_retransmissions: AtomicU64,
    /// Fragment ACK notifications emitted.
    acks_sent: AtomicU64,
    /// Fragment ACK notifications absorbed.
    acks_received: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub request_original_size: u64,
    pub request_transmitted_size: u64,
    pub request_retransmissions: u64,
    pub response_original_size: u64,
    pub response_transmitted_size: u64,
    pub response_retransmissions: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
}

impl MetricsSnapshot {
    /// Useful-bytes ratio of the request direction (1.0 = no waste).
    #[must_use]
    pub fn request_efficiency(&self) -> f64 {
        if self.request_transmitted_size == 0 {
            return 0.0;
        }
        self.request_original_size as f64 / self.request_transmitted_size as f64
    }
}

impl ExchangeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a completed request exchange.
    pub fn record_request(&self, original: u64, transmitted: u64, retransmissions: u64) {
        self.request_original_size.store(original, Ordering::Relaxed);
        self.request_transmitted_size
            .store(transmitted, Ordering::Relaxed);
        self.request_retransmissions
            .store(retransmissions, Ordering::Relaxed);
    }

    /// Record the outcome of a completed response.
    pub fn record_response(&self, original: u64, transmitted: u64, retransmissions: u64) {
        self.response_original_size
            .store(original, Ordering::Relaxed);
        self.response_transmitted_size
            .store(transmitted, Ordering::Relaxed);
        self.response_retransmissions
            .store(retransmissions, Ordering::Relaxed);
    }

    /// Account a replayed cached response.
    pub fn record_response_replay(&self, bytes: u64) {
        self.response_transmitted_size
            .fetch_add(bytes, Ordering::Relaxed);
        self.response_retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_acks_sent(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_acks_received(&self) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            request_original_size: self.request_original_size.load(Ordering::Relaxed),
            request_transmitted_size: self.request_transmitted_size.load(Ordering::Relaxed),
            request_retransmissions: self.request_retransmissions.load(Ordering::Relaxed),
            response_original_size: self.response_original_size.load(Ordering::Relaxed),
            response_transmitted_size: self.response_transmitted_size.load(Ordering::Relaxed),
            response_retransmissions: self.response_retransmissions.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_updates() {
        let metrics = ExchangeMetrics::new();
        metrics.record_request(600, 700, 1);
        metrics.increment_acks_received();
        metrics.increment_acks_received();

        let snap = metrics.snapshot();
        assert_eq!(snap.request_original_size, 600);
        assert_eq!(snap.request_transmitted_size, 700);
        assert_eq!(snap.request_retransmissions, 1);
        assert_eq!(snap.acks_received, 2);
    }

    #[test]
    fn test_efficiency() {
        let metrics = ExchangeMetrics::new();
        metrics.record_request(600, 700, 1);
        let eff = metrics.snapshot().request_efficiency();
        assert!((eff - 600.0 / 700.0).abs() < 1e-9);

        let empty = ExchangeMetrics::new();
        assert_eq!(empty.snapshot().request_efficiency(), 0.0);
    }
}
