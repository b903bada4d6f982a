// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The OAuth manager: begin/complete for the authorisation-code flow and
//! `ensure_fresh` for classified, serialised token refresh.
//!
//! Refresh serialisation is two-layered: a per-connection async mutex
//! serialises callers inside this process, and the shared [`InFlightSet`]
//! makes in-progress refreshes visible to the background scheduler so it
//! never starts a second refresh for a connection that already has one.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use bosun_config::OAuthSettings;
use bosun_store::{ConnectionStore, ProviderConnection, StoreError};
use bosun_vault::{Vault, VaultError};

use crate::alerts::AlertManager;
use crate::provider::{ProviderAdapter, TokenResponse};

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("oauth configuration error: {0}")]
    Config(String),
    #[error("state validation failed: {0}")]
    StateValidation(String),
    /// The user declined the consent screen.
    #[error("access denied by user")]
    AccessDenied,
    #[error("token exchange failed: {0}")]
    Exchange(String),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failure classification for refresh attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshClass {
    /// Worth retrying: network failures, 5xx, 429.
    Transient,
    /// Re-authorisation required: invalid_grant, 400/401/403.
    Terminal,
}

/// What `ensure_fresh` did for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Token was inside the window and is now renewed.
    Refreshed,
    /// Nothing to do; token comfortably fresh.
    StillFresh,
    /// Connection cannot refresh (no refresh token); left as-is.
    NotRefreshable,
    /// Connection is flagged for re-authorisation; skipped.
    NeedsReauth,
    /// Refresh attempted and failed.
    Failed(RefreshClass),
}

/// Shared set of connection ids with a refresh in flight.
///
/// The guard removes its id on drop, so a panicking refresh can never leak
/// an entry and permanently shadow a connection from the scheduler.
#[derive(Clone, Default)]
pub struct InFlightSet {
    inner: Arc<StdMutex<HashSet<Uuid>>>,
}

pub struct InFlightGuard {
    set: InFlightSet,
    id: Uuid,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id`; `None` when a refresh for it is already in flight.
    pub fn try_acquire(&self, id: Uuid) -> Option<InFlightGuard> {
        let mut set = self.inner.lock().expect("in-flight set");
        if set.insert(id) {
            Some(InFlightGuard {
                set: self.clone(),
                id,
            })
        } else {
            None
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner.lock().expect("in-flight set").contains(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("in-flight set").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .inner
            .lock()
            .expect("in-flight set")
            .remove(&self.id);
    }
}

pub struct OAuthManager {
    settings: OAuthSettings,
    store: ConnectionStore,
    vault: Arc<Vault>,
    provider: Box<dyn ProviderAdapter>,
    alerts: AlertManager,
    in_flight: InFlightSet,
    http: reqwest::Client,
    /// Per-connection refresh serialisation inside this process.
    conn_locks: StdMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    /// One-shot state TTL.
    state_ttl_seconds: i64,
}

impl OAuthManager {
    pub fn new(
        settings: OAuthSettings,
        store: ConnectionStore,
        vault: Arc<Vault>,
        provider: Box<dyn ProviderAdapter>,
        alerts: AlertManager,
        in_flight: InFlightSet,
    ) -> Self {
        // OAuth endpoints answer quickly or not at all; keep timeouts tight
        // and never follow redirects automatically.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("oauth http client");
        Self {
            settings,
            store,
            vault,
            provider,
            alerts,
            in_flight,
            http,
            conn_locks: StdMutex::new(HashMap::new()),
            state_ttl_seconds: 600,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn in_flight(&self) -> &InFlightSet {
        &self.in_flight
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    // ── Flow: begin ──────────────────────────────────────────────────────

    /// Start the flow: persist a one-shot state and build the provider's
    /// authorisation URL.
    pub async fn begin(
        &self,
        user_id: Option<Uuid>,
        flow_session: Option<&str>,
        return_to: Option<&str>,
    ) -> Result<(String, String), OAuthError> {
        let state = generate_state_token();
        let auth_url = self
            .provider
            .authorization_url(&state)
            .ok_or_else(|| OAuthError::Config("provider client id / redirect uri missing".into()))?;

        self.store
            .create_state(
                &state,
                self.provider.name(),
                user_id,
                flow_session,
                return_to,
                self.state_ttl_seconds,
            )
            .await?;

        tracing::info!(
            provider = self.provider.name(),
            user_id = ?user_id,
            state_prefix = &state[..8],
            "oauth flow started"
        );
        Ok((state, auth_url))
    }

    // ── Flow: complete ───────────────────────────────────────────────────

    /// Finish the flow: consume the state atomically, exchange the code,
    /// store the encrypted connection.
    pub async fn complete(
        &self,
        code: &str,
        state: &str,
        flow_session: Option<&str>,
        fallback_user: Option<Uuid>,
    ) -> Result<ProviderConnection, OAuthError> {
        // One UPDATE validates expiry and unused-ness and marks the row
        // used; a concurrent second consumer simply gets nothing back.
        let row = self
            .store
            .consume_state(state, self.provider.name())
            .await?
            .ok_or_else(|| {
                OAuthError::StateValidation("state invalid, expired, or already used".into())
            })?;

        if let (Some(bound), Some(offered)) = (row.flow_session_id.as_deref(), flow_session) {
            if bound != offered {
                return Err(OAuthError::StateValidation(
                    "state belongs to a different flow session".into(),
                ));
            }
        }

        let token = self.exchange_code(code).await?;
        let bot_id = token
            .bot_id
            .clone()
            .ok_or_else(|| OAuthError::Exchange("token response missing bot_id".into()))?;
        let workspace_id = token
            .workspace_id
            .clone()
            .ok_or_else(|| OAuthError::Exchange("token response missing workspace_id".into()))?;

        let user_id = row
            .user_id
            .or(fallback_user)
            .ok_or_else(|| OAuthError::Config("no user to bind the connection to".into()))?;

        let access_ct = self.vault.encrypt(&token.access_token)?;
        let refresh_ct = token
            .refresh_token
            .as_deref()
            .map(|t| self.vault.encrypt(t))
            .transpose()?;

        let connection = self
            .store
            .upsert_connection(bosun_store::ConnectionUpsert {
                user_id,
                provider: self.provider.name().to_string(),
                workspace_id,
                workspace_name: token.workspace_name.clone(),
                bot_id,
                scopes: token.scopes(),
                access_token_ciphertext: access_ct,
                refresh_token_ciphertext: refresh_ct,
                access_token_expires_at: expiry_from_seconds(token.expires_in),
                refresh_token_expires_at: expiry_from_seconds(token.refresh_token_expires_in),
                key_generation: self.vault.primary_generation() as i32,
            })
            .await?;

        // Post-success sanity check; failures are logged, never fatal.
        self.identity_check(&token.access_token).await;

        tracing::info!(
            provider = self.provider.name(),
            connection_id = %connection.id,
            user_id = %user_id,
            workspace_id = %connection.workspace_id,
            supports_refresh = connection.supports_refresh,
            "oauth connection stored"
        );
        Ok(connection)
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, OAuthError> {
        let body = serde_json::json!({
            "grant_type": "authorization_code",
            "code": code,
            "redirect_uri": self.provider.redirect_uri()
                .ok_or_else(|| OAuthError::Config("redirect uri not configured".into()))?,
        });
        self.token_endpoint_call(&body).await
    }

    /// POST to the token endpoint with HTTP Basic client authentication.
    async fn token_endpoint_call(
        &self,
        body: &serde_json::Value,
    ) -> Result<TokenResponse, OAuthError> {
        let (id, secret) = match (self.provider.client_id(), self.provider.client_secret()) {
            (Some(id), Some(secret)) => (id, secret),
            _ => return Err(OAuthError::Config("client credentials not configured".into())),
        };

        let resp = self
            .http
            .post(self.provider.token_url())
            .basic_auth(id, Some(secret))
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            // Never log the body verbatim past a short prefix; it can echo
            // the authorisation code.
            let detail = truncate_utf8(&text, 200);
            tracing::error!(
                provider = self.provider.name(),
                status = status.as_u16(),
                detail,
                "token endpoint rejected request"
            );
            return Err(OAuthError::Exchange(format!(
                "token endpoint returned {status}: {detail}"
            )));
        }
        Ok(resp.json::<TokenResponse>().await?)
    }

    async fn identity_check(&self, access_token: &str) {
        let Some(url) = self.provider.identity_url() else {
            return;
        };
        let mut req = self.http.get(url).bearer_auth(access_token);
        for (k, v) in self.provider.identity_headers() {
            req = req.header(k, v);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(provider = self.provider.name(), "identity check passed");
            }
            Ok(resp) => {
                tracing::warn!(
                    provider = self.provider.name(),
                    status = resp.status().as_u16(),
                    "identity check failed"
                );
            }
            Err(e) => {
                tracing::warn!(provider = self.provider.name(), error = %e, "identity check errored");
            }
        }
    }

    // ── Freshness ────────────────────────────────────────────────────────

    /// Ensure every active connection of `user_id` has a fresh access
    /// token, refreshing those inside the window.  Returns the (re-read)
    /// connections.
    pub async fn ensure_fresh(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ProviderConnection>, OAuthError> {
        let connections = self
            .store
            .user_connections(user_id, self.provider.name())
            .await?;
        let mut fresh = Vec::with_capacity(connections.len());
        for conn in connections {
            let id = conn.id;
            self.ensure_fresh_connection(&conn).await;
            // Re-read: the refresh (ours or a concurrent one) rewrote the row.
            if let Some(row) = self.store.get_connection(id).await? {
                fresh.push(row);
            }
        }
        Ok(fresh)
    }

    /// Refresh one connection if its token is inside the refresh window.
    ///
    /// Serialised per connection: the per-connection mutex queues callers in
    /// this process, the in-flight entry tells the scheduler to stay away.
    pub async fn ensure_fresh_connection(&self, conn: &ProviderConnection) -> RefreshOutcome {
        if conn.needs_reauth {
            return RefreshOutcome::NeedsReauth;
        }
        let window_seconds =
            self.settings.refresh_window_minutes * 60 + self.settings.clock_skew_seconds;
        if !conn.expires_within(window_seconds) {
            return RefreshOutcome::StillFresh;
        }
        if !conn.supports_refresh || conn.refresh_token_ciphertext.is_none() {
            return RefreshOutcome::NotRefreshable;
        }

        let lock = self.conn_lock(conn.id);
        let _guard = lock.lock().await;
        // Queued behind an in-flight refresh: register ourselves only after
        // the previous holder is done, then re-read and re-check the window.
        let _flight = self.in_flight.try_acquire(conn.id);

        let current = match self.store.get_connection(conn.id).await {
            Ok(Some(row)) => row,
            Ok(None) => return RefreshOutcome::NeedsReauth,
            Err(e) => {
                tracing::error!(connection_id = %conn.id, error = %e, "refresh re-read failed");
                return RefreshOutcome::Failed(RefreshClass::Transient);
            }
        };
        if current.needs_reauth {
            return RefreshOutcome::NeedsReauth;
        }
        if !current.expires_within(window_seconds) {
            // Another actor refreshed while we waited on the lock.
            return RefreshOutcome::StillFresh;
        }

        self.refresh_with_backoff(&current).await
    }

    /// Refresh with exponential backoff and jitter on transient failures;
    /// terminal failures stop immediately and flag re-auth.
    async fn refresh_with_backoff(&self, conn: &ProviderConnection) -> RefreshOutcome {
        let max_retries = self.settings.refresh_max_retries.max(1);
        for attempt in 0..max_retries {
            match self.refresh_once(conn).await {
                Ok(()) => {
                    tracing::info!(
                        connection_id = %conn.id,
                        user_id = %conn.user_id,
                        attempt,
                        "token refresh succeeded"
                    );
                    return RefreshOutcome::Refreshed;
                }
                Err((class, msg)) => {
                    tracing::warn!(
                        connection_id = %conn.id,
                        attempt,
                        classification = ?class,
                        error = %msg,
                        "token refresh attempt failed"
                    );
                    if class == RefreshClass::Terminal {
                        self.record_failure(conn, true, &msg, class).await;
                        return RefreshOutcome::Failed(class);
                    }
                    if attempt + 1 < max_retries {
                        tokio::time::sleep(backoff_delay(
                            attempt,
                            self.settings.refresh_jitter_seconds,
                        ))
                        .await;
                        continue;
                    }
                    self.record_failure(conn, false, &msg, class).await;
                    return RefreshOutcome::Failed(class);
                }
            }
        }
        RefreshOutcome::Failed(RefreshClass::Transient)
    }

    async fn refresh_once(
        &self,
        conn: &ProviderConnection,
    ) -> Result<(), (RefreshClass, String)> {
        let refresh_ct = conn
            .refresh_token_ciphertext
            .as_deref()
            .ok_or((RefreshClass::Terminal, "no refresh token stored".into()))?;
        let refresh_token = self
            .vault
            .decrypt(refresh_ct)
            .map_err(|e| (RefreshClass::Terminal, format!("refresh token undecryptable: {e}")))?;

        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        });
        let token = match self.token_endpoint_call(&body).await {
            Ok(t) => t,
            Err(OAuthError::Exchange(msg)) => {
                return Err((classify_exchange_error(&msg), msg));
            }
            Err(OAuthError::Http(e)) => {
                let class = match e.status() {
                    Some(s) => classify_status(s.as_u16()),
                    None => RefreshClass::Transient,
                };
                return Err((class, e.to_string()));
            }
            Err(e) => return Err((RefreshClass::Terminal, e.to_string())),
        };

        let access_ct = self
            .vault
            .encrypt(&token.access_token)
            .map_err(|e| (RefreshClass::Terminal, e.to_string()))?;
        let new_refresh_ct = token
            .refresh_token
            .as_deref()
            .map(|t| self.vault.encrypt(t))
            .transpose()
            .map_err(|e| (RefreshClass::Terminal, e.to_string()))?;

        self.store
            .mark_refresh_success(
                conn.id,
                &access_ct,
                new_refresh_ct.as_deref(),
                expiry_from_seconds(token.expires_in),
                expiry_from_seconds(token.refresh_token_expires_in),
                self.vault.primary_generation() as i32,
            )
            .await
            .map_err(|e| (RefreshClass::Transient, e.to_string()))?;
        Ok(())
    }

    async fn record_failure(
        &self,
        conn: &ProviderConnection,
        terminal: bool,
        msg: &str,
        class: RefreshClass,
    ) {
        let count = match self.store.mark_refresh_failure(conn.id, terminal).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(connection_id = %conn.id, error = %e, "failed to record refresh failure");
                conn.refresh_failure_count + 1
            }
        };
        if !terminal && count >= self.settings.max_failure_count {
            let _ = self.store.set_needs_reauth(conn.id).await;
        }
        self.alerts.refresh_failure(
            conn.user_id,
            conn.id,
            count,
            msg,
            class == RefreshClass::Terminal,
        );
    }

    fn conn_lock(&self, id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut map = self.conn_locks.lock().expect("conn lock map");
        map.entry(id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Cleanup passthrough used by the background maintenance loop.
    pub async fn cleanup_expired_states(&self) -> Result<u64, OAuthError> {
        Ok(self.store.cleanup_expired_states().await?)
    }
}

// ── Pure helpers ──────────────────────────────────────────────────────────────

/// ≥ 48 bytes of CSPRNG randomness as url-safe base64 (64 chars).
pub(crate) fn generate_state_token() -> String {
    use base64::Engine;
    use rand::RngCore;
    let mut bytes = [0u8; 48];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn expiry_from_seconds(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.map(|s| Utc::now() + chrono::Duration::seconds(s))
}

/// Classify an HTTP status from the token endpoint.
pub(crate) fn classify_status(status: u16) -> RefreshClass {
    match status {
        429 => RefreshClass::Transient,
        s if s >= 500 => RefreshClass::Transient,
        400..=403 => RefreshClass::Terminal,
        _ => RefreshClass::Transient,
    }
}

/// Classify an exchange error message (carries the status + body prefix).
pub(crate) fn classify_exchange_error(msg: &str) -> RefreshClass {
    if msg.contains("invalid_grant") {
        return RefreshClass::Terminal;
    }
    for status in [400u16, 401, 403] {
        if msg.contains(&format!("returned {status}")) {
            return RefreshClass::Terminal;
        }
    }
    RefreshClass::Transient
}

/// Byte-bounded truncation that never splits a UTF-8 code point.
fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Exponential backoff with jitter: 1s, 2s, 4s… plus up to `jitter_s` of
/// random skew, capped at 30s.
pub(crate) fn backoff_delay(attempt: u32, jitter_s: i64) -> Duration {
    let base = Duration::from_secs(1 << attempt.min(4));
    let jitter_ms = if jitter_s > 0 {
        rand::thread_rng().gen_range(0..(jitter_s as u64 * 1000).min(5_000))
    } else {
        0
    };
    (base + Duration::from_millis(jitter_ms)).min(Duration::from_secs(30))
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_tokens_are_long_and_unique() {
        let a = generate_state_token();
        let b = generate_state_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(500), RefreshClass::Transient);
        assert_eq!(classify_status(503), RefreshClass::Transient);
        assert_eq!(classify_status(429), RefreshClass::Transient);
        assert_eq!(classify_status(400), RefreshClass::Terminal);
        assert_eq!(classify_status(401), RefreshClass::Terminal);
        assert_eq!(classify_status(403), RefreshClass::Terminal);
    }

    #[test]
    fn exchange_error_classification() {
        assert_eq!(
            classify_exchange_error("token endpoint returned 400: {\"error\":\"invalid_grant\"}"),
            RefreshClass::Terminal
        );
        assert_eq!(
            classify_exchange_error("token endpoint returned 401: unauthorized"),
            RefreshClass::Terminal
        );
        assert_eq!(
            classify_exchange_error("token endpoint returned 503: upstream down"),
            RefreshClass::Transient
        );
    }

    #[test]
    fn backoff_grows_and_caps() {
        let d0 = backoff_delay(0, 0);
        let d2 = backoff_delay(2, 0);
        assert_eq!(d0, Duration::from_secs(1));
        assert_eq!(d2, Duration::from_secs(4));
        assert!(backoff_delay(10, 0) <= Duration::from_secs(30));
    }

    #[test]
    fn backoff_jitter_stays_bounded() {
        for _ in 0..32 {
            let d = backoff_delay(0, 60);
            assert!(d >= Duration::from_secs(1));
            assert!(d <= Duration::from_secs(6));
        }
    }

    #[test]
    fn in_flight_set_is_exclusive_and_self_cleaning() {
        let set = InFlightSet::new();
        let id = Uuid::new_v4();

        let guard = set.try_acquire(id).expect("first acquire");
        assert!(set.contains(id));
        assert!(set.try_acquire(id).is_none(), "second acquire must fail");

        drop(guard);
        assert!(!set.contains(id), "guard drop must release");
        assert!(set.try_acquire(id).is_some());
    }

    #[test]
    fn expiry_mapping() {
        assert!(expiry_from_seconds(None).is_none());
        let at = expiry_from_seconds(Some(3600)).unwrap();
        let delta = (at - Utc::now()).num_seconds();
        assert!((3595..=3605).contains(&delta));
    }
}
