// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-user tool-client pool.
//!
//! At most one authenticated client per user, versioned by a fingerprint of
//! the token material.  When `ensure_fresh` rotates the access token the
//! fingerprint changes and the next `get` transparently rebuilds the
//! client; `evict` forces the same after an authorisation failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use bosun_oauth::OAuthManager;
use bosun_store::ProviderConnection;
use bosun_vault::Vault;

use crate::client::ToolClient;

/// Idle period after which an unused per-user mutex entry is pruned.
const LOCK_IDLE_TTL: Duration = Duration::from_secs(15 * 60);

struct CachedClient {
    version_tag: String,
    client: Arc<ToolClient>,
}

struct UserLock {
    lock: Arc<AsyncMutex<()>>,
    last_used: Instant,
}

pub struct UserClientPool {
    oauth: Arc<OAuthManager>,
    vault: Arc<Vault>,
    /// The provider's hosted MCP endpoint (per-user bearer auth).
    mcp_url: String,
    call_timeout: Duration,
    clients: StdMutex<HashMap<Uuid, CachedClient>>,
    locks: StdMutex<HashMap<Uuid, UserLock>>,
}

impl UserClientPool {
    pub fn new(
        oauth: Arc<OAuthManager>,
        vault: Arc<Vault>,
        mcp_url: String,
        call_timeout: Duration,
    ) -> Self {
        Self {
            oauth,
            vault,
            mcp_url,
            call_timeout,
            clients: StdMutex::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.oauth.provider_name()
    }

    /// The user's authenticated client, or `None` when there is no usable
    /// connection (never connected, revoked, or flagged for re-auth).
    pub async fn get(&self, user_id: Uuid) -> anyhow::Result<Option<Arc<ToolClient>>> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let connections = self.oauth.ensure_fresh(user_id).await?;
        let Some(conn) = connections.iter().find(|c| !c.needs_reauth) else {
            tracing::debug!(user_id = %user_id, "no usable provider connection");
            return Ok(None);
        };

        let access_token = self.vault.decrypt(&conn.access_token_ciphertext)?;
        let tag = version_tag(conn, &access_token);

        if let Some(cached) = self.lookup(user_id, &tag) {
            return Ok(Some(cached));
        }

        tracing::info!(
            user_id = %user_id,
            connection_id = %conn.id,
            tag = &tag[..12],
            "building per-user tool client"
        );
        let client = Arc::new(
            ToolClient::connect(
                bosun_config::McpTransport::StreamableHttp,
                &self.mcp_url,
                Some(&access_token),
                self.call_timeout,
            )
            .await?,
        );
        self.clients.lock().expect("client map").insert(
            user_id,
            CachedClient {
                version_tag: tag,
                client: Arc::clone(&client),
            },
        );
        Ok(Some(client))
    }

    /// Drop the cached client so the next `get` rebuilds it.  The transport
    /// holds no long-lived session, so there is no teardown beyond the drop.
    pub fn evict(&self, user_id: Uuid) {
        if self
            .clients
            .lock()
            .expect("client map")
            .remove(&user_id)
            .is_some()
        {
            tracing::info!(user_id = %user_id, "per-user tool client evicted");
        }
    }

    /// Refresh tokens for the user and evict the cached client; the next
    /// `get` builds one against the fresh token.  Used by the interceptor's
    /// single 401 retry.
    pub async fn refresh_and_evict(&self, user_id: Uuid) -> anyhow::Result<()> {
        self.oauth.ensure_fresh(user_id).await?;
        self.evict(user_id);
        Ok(())
    }

    pub fn cached_users(&self) -> usize {
        self.clients.lock().expect("client map").len()
    }

    fn lookup(&self, user_id: Uuid, tag: &str) -> Option<Arc<ToolClient>> {
        let map = self.clients.lock().expect("client map");
        map.get(&user_id)
            .filter(|c| c.version_tag == tag)
            .map(|c| Arc::clone(&c.client))
    }

    fn user_lock(&self, user_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut map = self.locks.lock().expect("lock map");
        // Opportunistic pruning keeps the map bounded by active users.
        map.retain(|_, entry| {
            entry.last_used.elapsed() < LOCK_IDLE_TTL || Arc::strong_count(&entry.lock) > 1
        });
        let entry = map.entry(user_id).or_insert_with(|| UserLock {
            lock: Arc::new(AsyncMutex::new(())),
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();
        Arc::clone(&entry.lock)
    }
}

/// Fingerprint of the token material a client was built against:
/// `sha256(key_generation:token_suffix:expiry_epoch)`.
fn version_tag(conn: &ProviderConnection, access_token: &str) -> String {
    let suffix_start = access_token.len().saturating_sub(8);
    let suffix = access_token.get(suffix_start..).unwrap_or(access_token);
    let expiry_epoch = conn
        .access_token_expires_at
        .map(|t| t.timestamp())
        .unwrap_or(0);
    let material = format!("{}:{}:{}", conn.key_generation, suffix, expiry_epoch);
    hex::encode(Sha256::digest(material.as_bytes()))
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn conn(generation: i32, expiry_epoch: i64) -> ProviderConnection {
        ProviderConnection {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider: "notion".into(),
            workspace_id: "ws".into(),
            workspace_name: None,
            bot_id: "bot".into(),
            scopes: vec![],
            access_token_ciphertext: vec![],
            refresh_token_ciphertext: None,
            access_token_expires_at: Some(
                chrono::DateTime::from_timestamp(expiry_epoch, 0).unwrap_or_else(Utc::now),
            ),
            refresh_token_expires_at: None,
            key_generation: generation,
            supports_refresh: true,
            last_refresh_attempt: None,
            refresh_failure_count: 0,
            needs_reauth: false,
            revoked_at: None,
        }
    }

    #[test]
    fn version_tag_is_stable_for_same_material() {
        let c = conn(1, 1_900_000_000);
        assert_eq!(
            version_tag(&c, "ntn_tokenvalue_abcd1234"),
            version_tag(&c, "ntn_tokenvalue_abcd1234")
        );
    }

    #[test]
    fn version_tag_changes_with_token_suffix() {
        let c = conn(1, 1_900_000_000);
        assert_ne!(
            version_tag(&c, "ntn_tokenvalue_abcd1234"),
            version_tag(&c, "ntn_tokenvalue_efgh5678")
        );
    }

    #[test]
    fn version_tag_changes_with_generation_and_expiry() {
        let base = conn(1, 1_900_000_000);
        assert_ne!(
            version_tag(&base, "token"),
            version_tag(&conn(2, 1_900_000_000), "token")
        );
        assert_ne!(
            version_tag(&base, "token"),
            version_tag(&conn(1, 1_900_003_600), "token")
        );
    }

    #[test]
    fn version_tag_handles_short_tokens() {
        let c = conn(1, 0);
        // Tokens shorter than the suffix window must not panic.
        let tag = version_tag(&c, "abc");
        assert_eq!(tag.len(), 64);
    }
}
