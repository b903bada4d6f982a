// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Device sessions: opaque bearer tokens bound to a user and optional
//! workspace.
//!
//! Raw tokens are **never persisted**; only the SHA-256 digest is stored.
//! Validation and the sliding-expiry extension happen in one UPDATE
//! statement so there is no read-then-write race: the row that comes back
//! *is* the session that was just extended.

use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;

/// Sliding window added on every successful validation.
const SLIDE_DAYS: i32 = 7;
/// Absolute cap; no amount of activity extends a session past this.
const HARD_CAP_DAYS: i32 = 30;
/// Upper bound of rows removed per cleanup call.
const CLEANUP_BATCH: i64 = 1000;

/// A raw device token, shown to the client exactly once.
#[derive(Debug)]
#[must_use = "return this to the client, then drop it; only the hash is stored"]
pub struct DeviceToken(String);

impl DeviceToken {
    /// Generate a `dtok_`-prefixed token with 256 bits of entropy.
    pub fn generate() -> Self {
        use base64::Engine;
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let body = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
        DeviceToken(format!("dtok_{body}"))
    }

    /// Parse a client-supplied token, rejecting obviously malformed input
    /// before it reaches the database.
    pub fn parse(raw: &str) -> Option<Self> {
        let body = raw.strip_prefix("dtok_")?;
        // 32 bytes of base64url is 43 chars; be lenient about a few more.
        if !(40..=64).contains(&body.len()) {
            return None;
        }
        if !body
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return None;
        }
        Some(DeviceToken(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// SHA-256 digest stored at rest.
    pub fn hash(&self) -> Vec<u8> {
        Sha256::digest(self.0.as_bytes()).to_vec()
    }

    /// Loggable prefix; never log the full token.
    pub fn prefix(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

/// Outcome of a successful validation.
#[derive(Debug, Clone)]
pub struct DeviceSessionContext {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub workspace_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct DeviceSessionService {
    pool: PgPool,
}

impl DeviceSessionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a session and return the raw token, the only time it exists
    /// outside the client.
    pub async fn create(
        &self,
        user_id: Uuid,
        workspace_id: Option<&str>,
    ) -> Result<DeviceToken, StoreError> {
        let token = DeviceToken::generate();
        // The hash is unique; a collision is a 2^-256 event, and ON CONFLICT
        // DO NOTHING keeps even that from panicking mid-request.
        sqlx::query(
            r#"
            INSERT INTO device_sessions
                (session_token_hash, user_id, workspace_id, expires_at, hard_expires_at)
            VALUES ($1, $2, $3,
                    now() + make_interval(days => $4),
                    now() + make_interval(days => $5))
            ON CONFLICT (session_token_hash) DO NOTHING
            "#,
        )
        .bind(token.hash())
        .bind(user_id)
        .bind(workspace_id)
        .bind(SLIDE_DAYS)
        .bind(HARD_CAP_DAYS)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            workspace_id = workspace_id.unwrap_or("-"),
            token_prefix = token.prefix(),
            "device session created"
        );
        Ok(token)
    }

    /// Validate a raw token.
    ///
    /// The UPDATE is the validation: it touches only rows that are
    /// unrevoked and inside both expiries, extends the sliding window
    /// (clamped to the hard cap), bumps the request counter, and returns
    /// the session context.  Zero rows back means the token is invalid.
    pub async fn validate(&self, raw: &str) -> Result<Option<DeviceSessionContext>, StoreError> {
        let Some(token) = DeviceToken::parse(raw) else {
            return Ok(None);
        };

        let row: Option<(Uuid, Uuid, Option<String>, DateTime<Utc>)> = sqlx::query_as(
            r#"
            UPDATE device_sessions
            SET last_accessed = now(),
                expires_at = LEAST(now() + make_interval(days => $2), hard_expires_at),
                request_count = request_count + 1
            WHERE session_token_hash = $1
              AND revoked_at IS NULL
              AND expires_at > now()
              AND hard_expires_at > now()
            RETURNING session_id, user_id, workspace_id, expires_at
            "#,
        )
        .bind(token.hash())
        .bind(SLIDE_DAYS)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_none() {
            tracing::debug!(token_prefix = token.prefix(), "device token rejected");
        }
        Ok(row.map(
            |(session_id, user_id, workspace_id, expires_at)| DeviceSessionContext {
                session_id,
                user_id,
                workspace_id,
                expires_at,
            },
        ))
    }

    /// Add to the cumulative token counters.  Runs in its own transaction so
    /// metering survives a failed request and never blocks one.
    pub async fn meter(
        &self,
        session_id: Uuid,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<(), StoreError> {
        if input_tokens < 0 || output_tokens < 0 {
            tracing::warn!(%session_id, input_tokens, output_tokens, "negative meter values ignored");
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE device_sessions
            SET tokens_input_total = tokens_input_total + $2,
                tokens_output_total = tokens_output_total + $3
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(input_tokens)
        .bind(output_tokens)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Revoke a session.  Idempotent: revoking twice is a no-op.
    pub async fn revoke(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE device_sessions SET revoked_at = now() \
             WHERE session_id = $1 AND revoked_at IS NULL",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Delete sessions past either expiry, bounded per call.
    pub async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        let res = sqlx::query(
            r#"
            DELETE FROM device_sessions
            WHERE session_id IN (
                SELECT session_id FROM device_sessions
                WHERE expires_at <= now() OR hard_expires_at <= now()
                LIMIT $1
            )
            "#,
        )
        .bind(CLEANUP_BATCH)
        .execute(&self.pool)
        .await?;
        let n = res.rows_affected();
        if n > 0 {
            tracing::info!(count = n, "expired device sessions removed");
        }
        Ok(n)
    }

    /// Usage snapshot for ops tooling; exposes no token material.
    pub async fn stats(&self, session_id: Uuid) -> Result<Option<serde_json::Value>, StoreError> {
        let row: Option<(
            Uuid,
            Option<String>,
            DateTime<Utc>,
            DateTime<Utc>,
            DateTime<Utc>,
            i64,
            i64,
            i64,
            Option<DateTime<Utc>>,
        )> = sqlx::query_as(
            r#"
            SELECT user_id, workspace_id, last_accessed, expires_at, hard_expires_at,
                   tokens_input_total, tokens_output_total, request_count, revoked_at
            FROM device_sessions WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(user_id, ws, accessed, exp, hard, tin, tout, reqs, revoked)| {
                serde_json::json!({
                    "session_id": session_id,
                    "user_id": user_id,
                    "workspace_id": ws,
                    "last_accessed": accessed,
                    "expires_at": exp,
                    "hard_expires_at": hard,
                    "tokens_input_total": tin,
                    "tokens_output_total": tout,
                    "request_count": reqs,
                    "is_revoked": revoked.is_some(),
                })
            },
        ))
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_has_prefix_and_length() {
        let t = DeviceToken::generate();
        assert!(t.as_str().starts_with("dtok_"));
        // 43 chars of base64url after the prefix.
        assert_eq!(t.as_str().len(), 5 + 43);
    }

    #[test]
    fn parse_round_trips_generated_tokens() {
        let t = DeviceToken::generate();
        let parsed = DeviceToken::parse(t.as_str()).expect("must parse");
        assert_eq!(parsed.hash(), t.hash());
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(DeviceToken::parse("").is_none());
        assert!(DeviceToken::parse("dtok_short").is_none());
        assert!(DeviceToken::parse("wrong_prefix_aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").is_none());
        assert!(DeviceToken::parse("dtok_contains spaces and $symbols aaaaaaaaaaaaaaa").is_none());
    }

    #[test]
    fn hash_is_stable_and_token_specific() {
        let t = DeviceToken::generate();
        assert_eq!(t.hash(), t.hash());
        assert_ne!(t.hash(), DeviceToken::generate().hash());
        assert_eq!(t.hash().len(), 32);
    }

    #[test]
    fn prefix_is_short_and_safe_to_log() {
        let t = DeviceToken::generate();
        assert_eq!(t.prefix().len(), 12);
        assert!(t.as_str().starts_with(t.prefix()));
    }
}
