// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Leaky-bucket rate limiting keyed by a SHA-256-derived identifier
//! (bearer key when present, client IP otherwise) with per-route policies.
//!
//! Buckets run on `Instant` (monotonic) so wall-clock jumps cannot grant or
//! steal capacity.  Memory is bounded two ways: a background sweep evicts
//! buckets idle for twice the cleanup interval, and a hard cap evicts the
//! least-recently-used bucket when full.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use bosun_config::{RatePolicy, RateLimitSettings};

use crate::error::{ApiError, ErrorCode};
use crate::middleware::RequestId;
use crate::state::AppState;

/// One identifier's leaky bucket.
#[derive(Debug)]
struct LeakyBucket {
    capacity: f64,
    /// Tokens per second draining out.
    leak_rate: f64,
    level: f64,
    last_update: Instant,
}

impl LeakyBucket {
    fn new(policy: &RatePolicy) -> Self {
        Self {
            capacity: policy.burst_capacity as f64,
            leak_rate: policy.requests_per_minute as f64 / 60.0,
            level: 0.0,
            last_update: Instant::now(),
        }
    }

    /// Admit or reject one request; returns `(allowed, retry_after_s)`.
    fn allow(&mut self) -> (bool, f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.level = (self.level - elapsed * self.leak_rate).max(0.0);
        self.last_update = now;

        if self.level + 1.0 <= self.capacity {
            self.level += 1.0;
            (true, 0.0)
        } else {
            let retry_after = (self.level - self.capacity + 1.0) / self.leak_rate;
            (false, retry_after.max(0.0))
        }
    }

    fn remaining(&self) -> u32 {
        (self.capacity - self.level).max(0.0) as u32
    }
}

/// Verdict handed back to the middleware.
#[derive(Debug)]
pub struct RateVerdict {
    pub allowed: bool,
    pub retry_after_s: f64,
    pub remaining: u32,
    pub limit: u32,
}

pub struct RateLimiterService {
    settings: RateLimitSettings,
    buckets: StdMutex<HashMap<String, LeakyBucket>>,
}

impl RateLimiterService {
    pub fn new(settings: RateLimitSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            buckets: StdMutex::new(HashMap::new()),
        })
    }

    fn policy_for(&self, route: &str) -> &RatePolicy {
        self.settings
            .route_policies
            .get(route)
            .unwrap_or(&self.settings.default_policy)
    }

    /// Check one request.  The bucket is keyed by `(identifier, route)` so
    /// the chat budget cannot be drained via the health endpoint.
    pub fn check(&self, identifier: &str, route: &str) -> RateVerdict {
        let policy = self.policy_for(route);
        if !policy.enabled {
            return RateVerdict {
                allowed: true,
                retry_after_s: 0.0,
                remaining: policy.burst_capacity,
                limit: policy.requests_per_minute,
            };
        }

        let key = format!("{identifier}:{route}");
        let mut buckets = self.buckets.lock().expect("bucket map");

        if !buckets.contains_key(&key) && buckets.len() >= self.settings.max_buckets {
            // Hard cap reached: drop the least-recently-touched bucket.
            if let Some(oldest) = buckets
                .iter()
                .min_by_key(|(_, b)| b.last_update)
                .map(|(k, _)| k.clone())
            {
                buckets.remove(&oldest);
                tracing::warn!(bucket_count = buckets.len(), "rate bucket evicted (LRU)");
            }
        }

        let bucket = buckets
            .entry(key)
            .or_insert_with(|| LeakyBucket::new(policy));
        let (allowed, retry_after_s) = bucket.allow();
        RateVerdict {
            allowed,
            retry_after_s,
            remaining: if allowed { bucket.remaining() } else { 0 },
            limit: policy.requests_per_minute,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().expect("bucket map").len()
    }

    /// Periodic sweep: evict buckets untouched for `2 × cleanup_interval`.
    pub async fn run_sweep(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.settings.cleanup_interval_s);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let cutoff = interval * 2;
            let mut buckets = self.buckets.lock().expect("bucket map");
            let before = buckets.len();
            buckets.retain(|_, b| b.last_update.elapsed() < cutoff);
            let evicted = before - buckets.len();
            if evicted > 0 {
                tracing::debug!(evicted, remaining = buckets.len(), "rate buckets swept");
            }
        }
        tracing::info!("rate limiter sweep stopped");
    }
}

/// Derive the caller's rate identifier: the bearer credential when present
/// (hashed, never stored raw), the client IP otherwise.
pub fn identifier_for(headers: &axum::http::HeaderMap, addr: Option<SocketAddr>) -> String {
    let material = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| {
            headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string())
        })
        .or_else(|| addr.map(|a| a.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string());
    hex::encode(Sha256::digest(material.as_bytes()))[..32].to_string()
}

/// Axum middleware enforcing the limiter and attaching the rate headers.
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();
    let addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0);
    let identifier = identifier_for(request.headers(), addr);
    let route = request.uri().path().to_string();

    let verdict = state.rate_limiter.check(&identifier, &route);
    if !verdict.allowed {
        tracing::warn!(
            route = %route,
            identifier = %identifier,
            retry_after_s = verdict.retry_after_s,
            "rate limited"
        );
        return ApiError::new(ErrorCode::Rate, "rate limit exceeded", request_id)
            .retry_after(verdict.retry_after_s.ceil() as u64)
            .into_response();
    }

    let mut resp = next.run(request).await;
    let headers = resp.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&verdict.limit.to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&verdict.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    resp
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn service(rpm: u32, burst: u32) -> Arc<RateLimiterService> {
        let mut settings = RateLimitSettings::default();
        settings.default_policy = RatePolicy {
            requests_per_minute: rpm,
            burst_capacity: burst,
            enabled: true,
        };
        settings.route_policies.clear();
        RateLimiterService::new(settings)
    }

    #[test]
    fn burst_is_admitted_then_rejected() {
        let svc = service(60, 3);
        for i in 0..3 {
            let v = svc.check("id", "/x");
            assert!(v.allowed, "request {i} within burst must pass");
        }
        let v = svc.check("id", "/x");
        assert!(!v.allowed);
        assert!(v.retry_after_s > 0.0);
        assert_eq!(v.remaining, 0);
        assert_eq!(v.limit, 60);
    }

    #[test]
    fn identifiers_have_independent_buckets() {
        let svc = service(60, 1);
        assert!(svc.check("a", "/x").allowed);
        assert!(!svc.check("a", "/x").allowed);
        assert!(svc.check("b", "/x").allowed, "other identifier unaffected");
    }

    #[test]
    fn routes_have_independent_buckets() {
        let svc = service(60, 1);
        assert!(svc.check("a", "/x").allowed);
        assert!(svc.check("a", "/y").allowed, "other route unaffected");
    }

    #[test]
    fn disabled_policy_admits_everything() {
        let mut settings = RateLimitSettings::default();
        settings.route_policies.insert(
            "/free".into(),
            RatePolicy {
                requests_per_minute: 1,
                burst_capacity: 1,
                enabled: false,
            },
        );
        let svc = RateLimiterService::new(settings);
        for _ in 0..50 {
            assert!(svc.check("id", "/free").allowed);
        }
    }

    #[test]
    fn lru_cap_bounds_bucket_count() {
        let mut settings = RateLimitSettings::default();
        settings.route_policies.clear();
        settings.max_buckets = 8;
        let svc = RateLimiterService::new(settings);
        for i in 0..32 {
            svc.check(&format!("id{i}"), "/x");
        }
        assert!(svc.bucket_count() <= 8);
    }

    #[test]
    fn leak_refills_capacity_over_time() {
        let mut bucket = LeakyBucket::new(&RatePolicy {
            requests_per_minute: 600, // 10/s: measurable leak without sleeping long
            burst_capacity: 1,
            enabled: true,
        });
        assert!(bucket.allow().0);
        assert!(!bucket.allow().0);
        std::thread::sleep(Duration::from_millis(150));
        assert!(bucket.allow().0, "leaked capacity must re-admit");
    }

    #[test]
    fn identifier_prefers_bearer_over_ip() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        let with_key = identifier_for(&headers, Some("1.2.3.4:80".parse().unwrap()));
        let ip_only = identifier_for(
            &axum::http::HeaderMap::new(),
            Some("1.2.3.4:80".parse().unwrap()),
        );
        assert_ne!(with_key, ip_only);
        // Identifier is a hash, never the raw credential.
        assert!(!with_key.contains("secret"));
        assert_eq!(with_key.len(), 32);
    }
}
