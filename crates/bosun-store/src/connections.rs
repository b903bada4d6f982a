// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Persistence for the OAuth layer: one-shot CSRF states and provider
//! connections.  The flow logic lives in `bosun-oauth`; this module owns
//! the SQL so state consumption and connection upserts stay atomic.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{OAuthState, ProviderConnection};

/// Upsert payload for [`ConnectionStore::upsert_connection`].
#[derive(Debug, Clone)]
pub struct ConnectionUpsert {
    pub user_id: Uuid,
    pub provider: String,
    pub workspace_id: String,
    pub workspace_name: Option<String>,
    pub bot_id: String,
    pub scopes: Vec<String>,
    pub access_token_ciphertext: Vec<u8>,
    pub refresh_token_ciphertext: Option<Vec<u8>>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    pub key_generation: i32,
}

#[derive(Clone)]
pub struct ConnectionStore {
    pool: PgPool,
}

impl ConnectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ── OAuth states ─────────────────────────────────────────────────────

    pub async fn create_state(
        &self,
        state: &str,
        provider: &str,
        user_id: Option<Uuid>,
        flow_session_id: Option<&str>,
        return_to: Option<&str>,
        ttl_seconds: i64,
    ) -> Result<OAuthState, StoreError> {
        let row: OAuthState = sqlx::query_as(
            r#"
            INSERT INTO oauth_states
                (state, provider, user_id, flow_session_id, return_to, expires_at)
            VALUES ($1, $2, $3, $4, $5, now() + make_interval(secs => $6::float8))
            RETURNING *
            "#,
        )
        .bind(state)
        .bind(provider)
        .bind(user_id)
        .bind(flow_session_id)
        .bind(return_to)
        .bind(ttl_seconds as f64)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Validate and consume a state in one statement.  The predicate only
    /// matches unused, unexpired rows, so of two racing consumers exactly
    /// one gets the row back and the other gets `None`.
    pub async fn consume_state(
        &self,
        state: &str,
        provider: &str,
    ) -> Result<Option<OAuthState>, StoreError> {
        let row: Option<OAuthState> = sqlx::query_as(
            r#"
            UPDATE oauth_states
            SET used_at = now()
            WHERE state = $1 AND provider = $2
              AND used_at IS NULL
              AND expires_at > now()
            RETURNING *
            "#,
        )
        .bind(state)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn cleanup_expired_states(&self) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM oauth_states WHERE expires_at < now()")
            .execute(&self.pool)
            .await?;
        let n = res.rows_affected();
        if n > 0 {
            tracing::info!(count = n, "expired oauth states removed");
        }
        Ok(n)
    }

    // ── Provider connections ─────────────────────────────────────────────

    /// Upsert keyed on `(user_id, bot_id)` among non-revoked rows.
    pub async fn upsert_connection(
        &self,
        c: ConnectionUpsert,
    ) -> Result<ProviderConnection, StoreError> {
        // The partial unique index (user_id, bot_id) WHERE revoked_at IS NULL
        // is the conflict target, so re-authorising an existing workspace
        // refreshes the row instead of duplicating it.
        let supports_refresh = c.refresh_token_ciphertext.is_some();
        let row: ProviderConnection = sqlx::query_as(
            r#"
            INSERT INTO provider_connections
                (user_id, provider, workspace_id, workspace_name, bot_id, scopes,
                 access_token_ciphertext, refresh_token_ciphertext,
                 access_token_expires_at, refresh_token_expires_at,
                 key_generation, supports_refresh)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (user_id, bot_id) WHERE revoked_at IS NULL DO UPDATE SET
                workspace_id = EXCLUDED.workspace_id,
                workspace_name = EXCLUDED.workspace_name,
                scopes = EXCLUDED.scopes,
                access_token_ciphertext = EXCLUDED.access_token_ciphertext,
                refresh_token_ciphertext = EXCLUDED.refresh_token_ciphertext,
                access_token_expires_at = EXCLUDED.access_token_expires_at,
                refresh_token_expires_at = EXCLUDED.refresh_token_expires_at,
                key_generation = EXCLUDED.key_generation,
                supports_refresh = EXCLUDED.supports_refresh,
                refresh_failure_count = 0,
                needs_reauth = false,
                updated_at = now()
            RETURNING id, user_id, provider, workspace_id, workspace_name, bot_id, scopes,
                      access_token_ciphertext, refresh_token_ciphertext,
                      access_token_expires_at, refresh_token_expires_at,
                      key_generation, supports_refresh, last_refresh_attempt,
                      refresh_failure_count, needs_reauth, revoked_at
            "#,
        )
        .bind(c.user_id)
        .bind(&c.provider)
        .bind(&c.workspace_id)
        .bind(&c.workspace_name)
        .bind(&c.bot_id)
        .bind(&c.scopes)
        .bind(&c.access_token_ciphertext)
        .bind(&c.refresh_token_ciphertext)
        .bind(c.access_token_expires_at)
        .bind(c.refresh_token_expires_at)
        .bind(c.key_generation)
        .bind(supports_refresh)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_connection(&self, id: Uuid) -> Result<Option<ProviderConnection>, StoreError> {
        let row = sqlx::query_as(
            "SELECT id, user_id, provider, workspace_id, workspace_name, bot_id, scopes, \
                    access_token_ciphertext, refresh_token_ciphertext, \
                    access_token_expires_at, refresh_token_expires_at, \
                    key_generation, supports_refresh, last_refresh_attempt, \
                    refresh_failure_count, needs_reauth, revoked_at \
             FROM provider_connections WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Active connections for one user and provider.
    pub async fn user_connections(
        &self,
        user_id: Uuid,
        provider: &str,
    ) -> Result<Vec<ProviderConnection>, StoreError> {
        let rows = sqlx::query_as(
            "SELECT id, user_id, provider, workspace_id, workspace_name, bot_id, scopes, \
                    access_token_ciphertext, refresh_token_ciphertext, \
                    access_token_expires_at, refresh_token_expires_at, \
                    key_generation, supports_refresh, last_refresh_attempt, \
                    refresh_failure_count, needs_reauth, revoked_at \
             FROM provider_connections \
             WHERE user_id = $1 AND provider = $2 AND revoked_at IS NULL \
             ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .bind(provider)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Connections the background scheduler should look at: non-revoked,
    /// refresh-capable, with a known expiry inside the window, earliest
    /// expiry first.
    pub async fn refresh_candidates(
        &self,
        window_seconds: i64,
        limit: i64,
    ) -> Result<Vec<ProviderConnection>, StoreError> {
        let rows = sqlx::query_as(
            r#"
            SELECT id, user_id, provider, workspace_id, workspace_name, bot_id, scopes,
                   access_token_ciphertext, refresh_token_ciphertext,
                   access_token_expires_at, refresh_token_expires_at,
                   key_generation, supports_refresh, last_refresh_attempt,
                   refresh_failure_count, needs_reauth, revoked_at
            FROM provider_connections
            WHERE revoked_at IS NULL
              AND supports_refresh
              AND NOT needs_reauth
              AND access_token_expires_at IS NOT NULL
              AND access_token_expires_at <= now() + make_interval(secs => $1::float8)
            ORDER BY access_token_expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(window_seconds as f64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Store freshly-refreshed tokens and clear the failure bookkeeping.
    pub async fn mark_refresh_success(
        &self,
        id: Uuid,
        access_token_ciphertext: &[u8],
        refresh_token_ciphertext: Option<&[u8]>,
        access_token_expires_at: Option<DateTime<Utc>>,
        refresh_token_expires_at: Option<DateTime<Utc>>,
        key_generation: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE provider_connections
            SET access_token_ciphertext = $2,
                refresh_token_ciphertext = COALESCE($3, refresh_token_ciphertext),
                access_token_expires_at = $4,
                refresh_token_expires_at = COALESCE($5, refresh_token_expires_at),
                key_generation = $6,
                last_refresh_attempt = now(),
                refresh_failure_count = 0,
                needs_reauth = false,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(access_token_ciphertext)
        .bind(refresh_token_ciphertext)
        .bind(access_token_expires_at)
        .bind(refresh_token_expires_at)
        .bind(key_generation)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a refresh failure; returns the updated failure count.
    pub async fn mark_refresh_failure(
        &self,
        id: Uuid,
        needs_reauth: bool,
    ) -> Result<i32, StoreError> {
        let (count,): (i32,) = sqlx::query_as(
            r#"
            UPDATE provider_connections
            SET refresh_failure_count = refresh_failure_count + 1,
                last_refresh_attempt = now(),
                needs_reauth = needs_reauth OR $2,
                updated_at = now()
            WHERE id = $1
            RETURNING refresh_failure_count
            "#,
        )
        .bind(id)
        .bind(needs_reauth)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn set_needs_reauth(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE provider_connections SET needs_reauth = true, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn revoke_connection(&self, id: Uuid) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE provider_connections SET revoked_at = now() \
             WHERE id = $1 AND revoked_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Aggregate counters for the OAuth health endpoint.
    pub async fn health_counters(&self) -> Result<serde_json::Value, StoreError> {
        let (total, needing_reauth, failing): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE needs_reauth),
                   COUNT(*) FILTER (WHERE refresh_failure_count > 0)
            FROM provider_connections
            WHERE revoked_at IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(serde_json::json!({
            "connections": total,
            "needs_reauth": needing_reauth,
            "with_failures": failing,
        }))
    }

    // ── Users (MVP surface used by the seeder and oauth flow) ────────────

    pub async fn ensure_user(&self, email: &str) -> Result<Uuid, StoreError> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO users (email) VALUES ($1)
            ON CONFLICT (email) DO UPDATE SET updated_at = now()
            RETURNING id
            "#,
        )
        .bind(email)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}
