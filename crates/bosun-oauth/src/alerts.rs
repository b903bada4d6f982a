// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Alert events for the OAuth layer.
//!
//! The sink is log-backed: an alert is a structured `tracing` event at
//! `warn`/`error` plus an in-memory counter, and the counters feed the
//! `/healthz/oauth` endpoint.  Wiring a pager comes down to a tracing layer
//! that matches on `alert = true`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Default, Clone, Serialize)]
pub struct AlertSnapshot {
    pub refresh_failures: u64,
    pub terminal_failures: u64,
    pub repeated_failure_alerts: u64,
}

/// Threshold at which repeated failures for one connection escalate from
/// `warn` to `error`.
const REPEATED_FAILURE_THRESHOLD: i32 = 3;

#[derive(Default)]
struct Counters {
    refresh_failures: AtomicU64,
    terminal_failures: AtomicU64,
    repeated_failure_alerts: AtomicU64,
}

#[derive(Clone, Default)]
pub struct AlertManager {
    counters: Arc<Counters>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a refresh failure for a connection.
    pub fn refresh_failure(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        failure_count: i32,
        message: &str,
        terminal: bool,
    ) {
        self.counters.refresh_failures.fetch_add(1, Ordering::Relaxed);
        if terminal {
            self.counters.terminal_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                alert = true,
                kind = "token_refresh_terminal",
                user_id = %user_id,
                connection_id = %connection_id,
                failure_count,
                message,
                "terminal refresh failure; connection needs re-authorisation"
            );
            return;
        }
        if failure_count >= REPEATED_FAILURE_THRESHOLD {
            self.counters
                .repeated_failure_alerts
                .fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                alert = true,
                kind = "token_refresh_repeated",
                user_id = %user_id,
                connection_id = %connection_id,
                failure_count,
                message,
                "repeated refresh failures for one connection"
            );
        } else {
            tracing::warn!(
                alert = true,
                kind = "token_refresh_failed",
                user_id = %user_id,
                connection_id = %connection_id,
                failure_count,
                message,
                "token refresh failed"
            );
        }
    }

    /// Flag an anomalously high share of expiring tokens in one sweep.
    pub fn expiry_rate_anomaly(&self, expiring: usize, total: usize) {
        tracing::warn!(
            alert = true,
            kind = "token_expiry_rate",
            expiring,
            total,
            "unusually high share of tokens close to expiry"
        );
    }

    pub fn snapshot(&self) -> AlertSnapshot {
        AlertSnapshot {
            refresh_failures: self.counters.refresh_failures.load(Ordering::Relaxed),
            terminal_failures: self.counters.terminal_failures.load(Ordering::Relaxed),
            repeated_failure_alerts: self
                .counters
                .repeated_failure_alerts
                .load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let alerts = AlertManager::new();
        let u = Uuid::new_v4();
        let c = Uuid::new_v4();
        alerts.refresh_failure(u, c, 1, "net down", false);
        alerts.refresh_failure(u, c, 2, "net down", false);
        alerts.refresh_failure(u, c, 3, "net down", false);
        alerts.refresh_failure(u, c, 4, "invalid_grant", true);

        let snap = alerts.snapshot();
        assert_eq!(snap.refresh_failures, 4);
        assert_eq!(snap.terminal_failures, 1);
        assert_eq!(snap.repeated_failure_alerts, 1);
    }

    #[test]
    fn clones_share_counters() {
        let a = AlertManager::new();
        let b = a.clone();
        a.refresh_failure(Uuid::new_v4(), Uuid::new_v4(), 1, "x", false);
        assert_eq!(b.snapshot().refresh_failures, 1);
    }
}
