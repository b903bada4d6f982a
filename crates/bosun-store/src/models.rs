// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Row types shared by the repositories.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Thread {
    pub id: Uuid,
    pub owner_user_id: Option<Uuid>,
    pub workspace_id: Option<String>,
    pub title: Option<String>,
    pub metadata: serde_json::Value,
    pub share_token_hash: Option<Vec<u8>>,
    pub share_token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ThreadMessage {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub request_id: Option<Uuid>,
    pub role: String,
    pub content: serde_json::Value,
    pub client_message_id: Option<String>,
    pub in_reply_to: Option<Uuid>,
    pub status: String,
    pub tool_calls: Option<serde_json::Value>,
    pub tokens_input: Option<i32>,
    pub tokens_output: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ToolCallLog {
    pub id: Uuid,
    pub request_id: Uuid,
    pub thread_id: Uuid,
    pub message_id: Option<Uuid>,
    pub call_index: i32,
    pub idempotency_key: String,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub result_digest: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// An OAuth-backed connection to a tool-server provider.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProviderConnection {
    pub id: Uuid,
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
    pub supports_refresh: bool,
    pub last_refresh_attempt: Option<DateTime<Utc>>,
    pub refresh_failure_count: i32,
    pub needs_reauth: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ProviderConnection {
    /// True when the access token expires within `window_seconds` of now
    /// (an unset expiry never counts as expiring).
    pub fn expires_within(&self, window_seconds: i64) -> bool {
        match self.access_token_expires_at {
            Some(at) => (at - Utc::now()).num_seconds() <= window_seconds,
            None => false,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OAuthState {
    pub id: Uuid,
    pub state: String,
    pub provider: String,
    pub user_id: Option<Uuid>,
    pub flow_session_id: Option<String>,
    pub return_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserTokenBudget {
    pub user_id: Uuid,
    pub workspace_id: String,
    pub daily_limit: i64,
    pub monthly_limit: i64,
    pub warning_threshold_percent: i32,
    pub soft_block: bool,
}

impl UserTokenBudget {
    /// Classify a usage percentage against this budget.
    pub fn level_for(&self, percent_used: i64) -> crate::metering::BudgetLevel {
        use crate::metering::BudgetLevel;
        let threshold = self.warning_threshold_percent as i64;
        if percent_used >= 100 {
            BudgetLevel::Over
        } else if percent_used >= 90 {
            BudgetLevel::Critical
        } else if percent_used >= threshold {
            BudgetLevel::Warning
        } else {
            BudgetLevel::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering::BudgetLevel;

    fn budget(threshold: i32) -> UserTokenBudget {
        UserTokenBudget {
            user_id: Uuid::new_v4(),
            workspace_id: String::new(),
            daily_limit: 1000,
            monthly_limit: 30_000,
            warning_threshold_percent: threshold,
            soft_block: true,
        }
    }

    #[test]
    fn budget_levels_follow_thresholds() {
        let b = budget(80);
        assert_eq!(b.level_for(10), BudgetLevel::None);
        assert_eq!(b.level_for(80), BudgetLevel::Warning);
        assert_eq!(b.level_for(90), BudgetLevel::Critical);
        assert_eq!(b.level_for(100), BudgetLevel::Over);
        assert_eq!(b.level_for(250), BudgetLevel::Over);
    }

    #[test]
    fn connection_expiry_window() {
        let mut c = ProviderConnection {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider: "notion".into(),
            workspace_id: "ws".into(),
            workspace_name: None,
            bot_id: "bot".into(),
            scopes: vec![],
            access_token_ciphertext: vec![],
            refresh_token_ciphertext: None,
            access_token_expires_at: Some(Utc::now() + chrono::Duration::minutes(4)),
            refresh_token_expires_at: None,
            key_generation: 1,
            supports_refresh: true,
            last_refresh_attempt: None,
            refresh_failure_count: 0,
            needs_reauth: false,
            revoked_at: None,
        };
        assert!(c.expires_within(300));
        assert!(!c.expires_within(120));
        c.access_token_expires_at = None;
        assert!(!c.expires_within(300));
    }
}
