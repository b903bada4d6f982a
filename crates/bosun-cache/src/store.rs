// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The PostgreSQL cache store.
//!
//! Reads increment the hit counter atomically (CTE update) so concurrent
//! readers never lose counts.  Writes are size-capped upserts that preserve
//! the hit counter and re-associate tags in the same transaction.  Fill
//! coordination uses an in-process keyed mutex for same-process dedup plus
//! `pg_advisory_xact_lock` for cross-process dedup; the advisory lock is
//! only held inside the short re-check transaction, never across the fill.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::sync::Mutex as AsyncMutex;

use crate::keys::advisory_lock_key;

/// Hard cap on one entry's serialised size.
pub const MAX_ENTRY_BYTES: usize = 250 * 1024;
/// How long after expiry a stale read is still acceptable.
pub const STALE_GRACE_SECONDS: i64 = 30;
/// Upper bound of rows removed by one tag invalidation.
pub const INVALIDATION_CAP: i64 = 10_000;

/// Metadata attached to a cache read.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMeta {
    pub age_s: i64,
    pub ttl_remaining_s: i64,
    pub stale: bool,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_served: u64,
    pub errors_bypassed: u64,
    pub sets: u64,
    pub deletes: u64,
    pub size_rejected: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
    errors_bypassed: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    size_rejected: AtomicU64,
}

#[derive(Clone)]
pub struct CacheStore {
    pool: PgPool,
    counters: Arc<Counters>,
    /// Same-process fill locks keyed by the advisory-lock hash.
    fill_locks: Arc<StdMutex<HashMap<i64, Arc<AsyncMutex<()>>>>>,
}

impl CacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            counters: Arc::new(Counters::default()),
            fill_locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Read a key.
    ///
    /// A fresh row comes back with age/TTL metadata and bumps the hit
    /// counter.  An expired row inside the stale grace window is returned
    /// with `stale = true` when `allow_stale` is set.  Any database error
    /// degrades to a miss.
    pub async fn get(
        &self,
        key: &str,
        max_age_s: Option<i64>,
        allow_stale: bool,
    ) -> Option<(Value, CacheMeta)> {
        match self.get_inner(key, max_age_s, allow_stale).await {
            Ok(hit) => hit,
            Err(e) => {
                self.counters.errors_bypassed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(key = key_prefix(key), error = %e, "cache get bypassed");
                None
            }
        }
    }

    async fn get_inner(
        &self,
        key: &str,
        max_age_s: Option<i64>,
        allow_stale: bool,
    ) -> Result<Option<(Value, CacheMeta)>, sqlx::Error> {
        let row: Option<(Value, i64, i64)> = sqlx::query_as(
            r#"
            WITH hit AS (
                UPDATE agent_cache
                SET hit_count = hit_count + 1,
                    last_accessed = now()
                WHERE cache_key = $1 AND expires_at > now()
                RETURNING content, expires_at, created_at
            )
            SELECT content,
                   GREATEST(0, EXTRACT(EPOCH FROM (expires_at - now())))::bigint,
                   EXTRACT(EPOCH FROM (now() - created_at))::bigint
            FROM hit
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((content, ttl_remaining_s, age_s)) = row {
            if let Some(max_age) = max_age_s {
                if age_s > max_age {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = key_prefix(key), age_s, max_age, "cache entry too old");
                    return Ok(None);
                }
            }
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = key_prefix(key), age_s, ttl_remaining_s, "cache hit");
            return Ok(Some((
                content,
                CacheMeta {
                    age_s,
                    ttl_remaining_s,
                    stale: false,
                },
            )));
        }

        if allow_stale {
            let stale: Option<(Value, i64)> = sqlx::query_as(
                r#"
                SELECT content,
                       EXTRACT(EPOCH FROM (now() - created_at))::bigint
                FROM agent_cache
                WHERE cache_key = $1
                  AND expires_at > now() - make_interval(secs => $2::float8)
                "#,
            )
            .bind(key)
            .bind(STALE_GRACE_SECONDS as f64)
            .fetch_optional(&self.pool)
            .await?;

            if let Some((content, age_s)) = stale {
                self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = key_prefix(key), age_s, "serving stale cache entry");
                return Ok(Some((
                    content,
                    CacheMeta {
                        age_s,
                        ttl_remaining_s: 0,
                        stale: true,
                    },
                )));
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = key_prefix(key), "cache miss");
        Ok(None)
    }

    /// Write a key.  Returns `false` when the value exceeds the size cap or
    /// the write failed (both are non-fatal to the caller).
    pub async fn set(&self, key: &str, value: &Value, ttl_s: u64, tags: &[String]) -> bool {
        let serialised = value.to_string();
        if serialised.len() > MAX_ENTRY_BYTES {
            self.counters.size_rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                key = key_prefix(key),
                size_bytes = serialised.len(),
                limit_bytes = MAX_ENTRY_BYTES,
                "cache entry over size cap, rejected"
            );
            return false;
        }
        match self.set_inner(key, value, &serialised, ttl_s, tags).await {
            Ok(()) => {
                self.counters.sets.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = key_prefix(key), ttl_s, tags = tags.len(), "cache set");
                true
            }
            Err(e) => {
                self.counters.errors_bypassed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(key = key_prefix(key), error = %e, "cache set bypassed");
                false
            }
        }
    }

    async fn set_inner(
        &self,
        key: &str,
        value: &Value,
        serialised: &str,
        ttl_s: u64,
        tags: &[String],
    ) -> Result<(), sqlx::Error> {
        let content_hash = hex::encode(Sha256::digest(serialised.as_bytes()));
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO agent_cache
                (cache_key, content, content_hash, size_bytes, expires_at)
            VALUES ($1, $2, $3, $4, now() + make_interval(secs => $5::float8))
            ON CONFLICT (cache_key) DO UPDATE SET
                content = EXCLUDED.content,
                content_hash = EXCLUDED.content_hash,
                size_bytes = EXCLUDED.size_bytes,
                expires_at = EXCLUDED.expires_at,
                created_at = now(),
                updated_at = now(),
                last_accessed = now()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(content_hash)
        .bind(serialised.len() as i32)
        .bind(ttl_s as f64)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM agent_cache_tags WHERE cache_key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        for tag in tags {
            sqlx::query(
                "INSERT INTO agent_cache_tags (cache_key, tag) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(key)
            .bind(tag)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    pub async fn delete(&self, key: &str) -> bool {
        match sqlx::query("DELETE FROM agent_cache WHERE cache_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
        {
            Ok(res) if res.rows_affected() > 0 => {
                self.counters.deletes.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(_) => false,
            Err(e) => {
                self.counters.errors_bypassed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(key = key_prefix(key), error = %e, "cache delete bypassed");
                false
            }
        }
    }

    /// Delete every entry whose tag set intersects `tags`, bounded by the
    /// invalidation cap so a pathological tag cannot stall the writer.
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> u64 {
        if tags.is_empty() {
            return 0;
        }
        let res = sqlx::query(
            r#"
            DELETE FROM agent_cache
            WHERE cache_key IN (
                SELECT DISTINCT cache_key
                FROM agent_cache_tags
                WHERE tag = ANY($1)
                LIMIT $2
            )
            "#,
        )
        .bind(tags)
        .bind(INVALIDATION_CAP)
        .execute(&self.pool)
        .await;

        match res {
            Ok(res) => {
                let n = res.rows_affected();
                if n > 0 {
                    tracing::info!(?tags, count = n, "cache entries invalidated by tags");
                }
                n
            }
            Err(e) => {
                self.counters.errors_bypassed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(?tags, error = %e, "tag invalidation bypassed");
                0
            }
        }
    }

    /// Run `fill` under the key's fill lock unless another task beat us to
    /// the value.  Returns `(value, was_cached)`.
    ///
    /// The store does not write the filled value itself: whether a result
    /// is cacheable at all (auth errors are not) is the caller's call, so
    /// the fill closure performs its own `set` when appropriate.  Fill
    /// errors propagate (the tool call itself failed); cache errors do not.
    pub async fn with_fill_lock<F, Fut>(&self, key: &str, fill: F) -> anyhow::Result<(Value, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let lock_key = advisory_lock_key(key);
        let local = self.local_lock(lock_key);
        let _guard = local.lock().await;

        // Re-check once we hold the process-local lock: a concurrent caller
        // may have filled while we waited.
        if let Some((value, _)) = self.get(key, None, false).await {
            return Ok((value, true));
        }

        // Cross-process re-check under the advisory lock.  The transaction
        // is intentionally tiny: lock, read, commit.  Holding it across the
        // fill would pin a pool connection for the whole upstream call.
        if let Ok(mut tx) = self.pool.begin().await {
            let locked: Result<Option<(Value,)>, sqlx::Error> = async {
                sqlx::query("SELECT pg_advisory_xact_lock($1)")
                    .bind(lock_key)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query_as(
                    "SELECT content FROM agent_cache \
                     WHERE cache_key = $1 AND expires_at > now()",
                )
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
            }
            .await;
            let _ = tx.commit().await;

            if let Ok(Some((value,))) = locked {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok((value, true));
            }
        }

        let value = fill().await?;
        Ok((value, false))
    }

    /// Delete a bounded batch of expired rows; returns how many went.
    pub async fn cleanup_expired(&self, batch: i64) -> u64 {
        let res = sqlx::query(
            r#"
            DELETE FROM agent_cache
            WHERE cache_key IN (
                SELECT cache_key FROM agent_cache
                WHERE expires_at < now() - make_interval(secs => $2::float8)
                LIMIT $1
            )
            "#,
        )
        .bind(batch)
        // Keep rows alive through the stale grace window.
        .bind(STALE_GRACE_SECONDS as f64)
        .execute(&self.pool)
        .await;
        match res {
            Ok(res) => {
                let n = res.rows_affected();
                if n > 0 {
                    tracing::info!(count = n, "expired cache entries cleaned up");
                }
                n
            }
            Err(e) => {
                tracing::error!(error = %e, "cache cleanup failed");
                0
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_served: self.counters.stale_served.load(Ordering::Relaxed),
            errors_bypassed: self.counters.errors_bypassed.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            size_rejected: self.counters.size_rejected.load(Ordering::Relaxed),
        }
    }

    fn local_lock(&self, lock_key: i64) -> Arc<AsyncMutex<()>> {
        let mut map = self.fill_locks.lock().expect("fill lock map");
        // Drop entries nobody holds any more; the map stays bounded by the
        // number of keys with a fill currently in flight.
        map.retain(|_, arc| Arc::strong_count(arc) > 1);
        map.entry(lock_key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

fn key_prefix(key: &str) -> &str {
    &key[..key.len().min(50)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_cap_matches_contract() {
        assert_eq!(MAX_ENTRY_BYTES, 250 * 1024);
        assert_eq!(STALE_GRACE_SECONDS, 30);
        assert_eq!(INVALIDATION_CAP, 10_000);
    }

    #[test]
    fn stats_snapshot_starts_at_zero() {
        let counters = Counters::default();
        assert_eq!(counters.hits.load(Ordering::Relaxed), 0);
        counters.hits.fetch_add(2, Ordering::Relaxed);
        assert_eq!(counters.hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn key_prefix_truncates_long_keys() {
        let long = "k".repeat(200);
        assert_eq!(key_prefix(&long).len(), 50);
        assert_eq!(key_prefix("short"), "short");
    }
}
