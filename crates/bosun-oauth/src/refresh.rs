// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Background refresh scheduler.
//!
//! Each sweep queries connections whose access tokens expire within twice
//! the on-demand refresh window (the head start is what makes the refresh
//! *proactive*), skips anything already in flight, and refreshes a bounded
//! batch under a concurrency semaphore.  The per-connection re-read inside
//! `ensure_fresh_connection` catches tokens another actor refreshed while
//! the sweep was queued.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use bosun_config::OAuthSettings;
use bosun_store::ConnectionStore;

use crate::manager::{OAuthManager, RefreshOutcome};

/// Base sweep interval; each sleep is jittered around this.
const SWEEP_INTERVAL: Duration = Duration::from_secs(180);
/// Maximum connections processed per sweep.
const BATCH_SIZE: i64 = 20;
/// In-sweep refresh concurrency.
const MAX_CONCURRENT: usize = 5;
/// A sweep where more than this share of refresh-capable connections is
/// expiring points at an upstream problem worth alerting on.
const EXPIRY_ANOMALY_RATIO: f64 = 0.5;

#[derive(Debug, Default, Clone, Serialize)]
pub struct SchedulerStats {
    pub sweeps_completed: u64,
    pub connections_processed: u64,
    pub tokens_refreshed: u64,
    pub errors_encountered: u64,
    pub avg_sweep_duration_ms: f64,
    pub last_sweep_unix: Option<i64>,
}

pub struct RefreshScheduler {
    manager: Arc<OAuthManager>,
    store: ConnectionStore,
    settings: OAuthSettings,
    stats: Arc<StdMutex<SchedulerStats>>,
}

impl RefreshScheduler {
    pub fn new(manager: Arc<OAuthManager>, store: ConnectionStore, settings: OAuthSettings) -> Self {
        Self {
            manager,
            store,
            settings,
            stats: Arc::new(StdMutex::new(SchedulerStats::default())),
        }
    }

    pub fn stats_handle(&self) -> Arc<StdMutex<SchedulerStats>> {
        Arc::clone(&self.stats)
    }

    /// Run until cancelled.  In-flight refreshes complete before return.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            interval_s = SWEEP_INTERVAL.as_secs(),
            batch_size = BATCH_SIZE,
            max_concurrent = MAX_CONCURRENT,
            "token refresh scheduler started"
        );
        loop {
            let sleep_for = jittered_interval(SWEEP_INTERVAL, self.settings.refresh_jitter_seconds);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }

            let started = Instant::now();
            match self.sweep(&cancel).await {
                Ok((processed, refreshed)) => {
                    self.record_sweep(started.elapsed(), processed, refreshed, false);
                }
                Err(e) => {
                    tracing::error!(error = %e, "refresh sweep failed");
                    self.record_sweep(started.elapsed(), 0, 0, true);
                    // Brief pause so a persistently failing database does
                    // not turn the loop into a hot spin.
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                    }
                }
            }
        }
        tracing::info!("token refresh scheduler stopped");
    }

    /// One sweep: query candidates, filter in-flight, refresh a batch.
    async fn sweep(&self, cancel: &CancellationToken) -> anyhow::Result<(u64, u64)> {
        let window_seconds = self.settings.refresh_window_minutes * 60 * 2;
        let candidates = self
            .store
            .refresh_candidates(window_seconds, BATCH_SIZE)
            .await?;
        if candidates.is_empty() {
            tracing::debug!("no connections require background refresh");
            return Ok((0, 0));
        }

        let in_flight = self.manager.in_flight();
        let available: Vec<_> = candidates
            .iter()
            .filter(|c| !in_flight.contains(c.id))
            .cloned()
            .collect();

        tracing::info!(
            candidates = candidates.len(),
            available = available.len(),
            in_flight = in_flight.len(),
            "refresh sweep starting"
        );
        if candidates.len() >= 4
            && candidates.len() as f64 >= BATCH_SIZE as f64 * EXPIRY_ANOMALY_RATIO
        {
            self.manager
                .alerts()
                .expiry_rate_anomaly(candidates.len(), BATCH_SIZE as usize);
        }

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT));
        let mut tasks = Vec::with_capacity(available.len());
        for conn in available {
            if cancel.is_cancelled() {
                break;
            }
            let permit = Arc::clone(&semaphore).acquire_owned().await?;
            let manager = Arc::clone(&self.manager);
            tasks.push(tokio::spawn(async move {
                // ensure_fresh_connection re-reads the row, re-checks the
                // window, and holds the in-flight entry for the duration.
                let outcome = manager.ensure_fresh_connection(&conn).await;
                drop(permit);
                outcome
            }));
        }

        let mut processed = 0u64;
        let mut refreshed = 0u64;
        for task in tasks {
            processed += 1;
            match task.await {
                Ok(RefreshOutcome::Refreshed) => refreshed += 1,
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "refresh task panicked"),
            }
        }
        Ok((processed, refreshed))
    }

    fn record_sweep(&self, duration: Duration, processed: u64, refreshed: u64, errored: bool) {
        let mut stats = self.stats.lock().expect("scheduler stats");
        stats.sweeps_completed += 1;
        stats.connections_processed += processed;
        stats.tokens_refreshed += refreshed;
        if errored {
            stats.errors_encountered += 1;
        }
        let n = stats.sweeps_completed as f64;
        let ms = duration.as_secs_f64() * 1000.0;
        stats.avg_sweep_duration_ms = (stats.avg_sweep_duration_ms * (n - 1.0) + ms) / n;
        stats.last_sweep_unix = Some(chrono::Utc::now().timestamp());

        tracing::info!(
            duration_ms = ms as u64,
            processed,
            refreshed,
            total_sweeps = stats.sweeps_completed,
            "refresh sweep completed"
        );
    }
}

/// `base ± jitter`, floored at 10s.
fn jittered_interval(base: Duration, jitter_s: i64) -> Duration {
    if jitter_s <= 0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(-(jitter_s)..=jitter_s);
    let secs = (base.as_secs() as i64 + jitter).max(10);
    Duration::from_secs(secs as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..64 {
            let d = jittered_interval(Duration::from_secs(180), 60);
            assert!(d >= Duration::from_secs(120));
            assert!(d <= Duration::from_secs(240));
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        assert_eq!(
            jittered_interval(Duration::from_secs(180), 0),
            Duration::from_secs(180)
        );
    }

    #[test]
    fn tiny_base_is_floored() {
        for _ in 0..16 {
            assert!(jittered_interval(Duration::from_secs(5), 60) >= Duration::from_secs(10));
        }
    }
}
