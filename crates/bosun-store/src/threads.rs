// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Conversation threads, messages, and the tool-call journal.
//!
//! Client idempotency: a message with a `client_message_id` is stored at
//! most once per thread; a journal row with a given idempotency key is
//! stored at most once globally.  Share tokens are random, `thr_`-prefixed,
//! and stored only as SHA-256 digests with their own expiry.

use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Thread, ThreadMessage, ToolCallLog};

/// Parameters for [`ThreadStore::add_message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
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
    /// When set, an existing row with the same `client_message_id` is
    /// overwritten instead of returned as-is.
    pub force_retry: bool,
}

impl NewMessage {
    pub fn user(thread_id: Uuid, content: serde_json::Value) -> Self {
        Self {
            thread_id,
            request_id: None,
            role: "user".into(),
            content,
            client_message_id: None,
            in_reply_to: None,
            status: "complete".into(),
            tool_calls: None,
            tokens_input: None,
            tokens_output: None,
            force_retry: false,
        }
    }
}

#[derive(Clone)]
pub struct ThreadStore {
    pool: PgPool,
}

impl ThreadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve the thread a request addresses.
    ///
    /// Precedence: explicit id → share token → create new.  An explicit id
    /// that does not exist is `NotFound`; a share token whose thread exists
    /// but whose expiry passed is `Gone` (the client should request a fresh
    /// token), an unknown token is `NotFound`.  A workspace mismatch between
    /// the resolved thread and the caller is `WorkspaceMismatch` (403).
    pub async fn find_or_create(
        &self,
        thread_id: Option<Uuid>,
        share_token: Option<&str>,
        user_id: Option<Uuid>,
        workspace_id: Option<&str>,
    ) -> Result<Thread, StoreError> {
        let thread = if let Some(id) = thread_id {
            let thread: Option<Thread> =
                sqlx::query_as("SELECT * FROM threads WHERE id = $1 AND deleted_at IS NULL")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            Some(thread.ok_or_else(|| StoreError::NotFound(format!("thread {id}")))?)
        } else if let Some(token) = share_token {
            let hash = Sha256::digest(token.as_bytes()).to_vec();
            let thread: Option<Thread> = sqlx::query_as(
                "SELECT * FROM threads WHERE share_token_hash = $1 AND deleted_at IS NULL",
            )
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
            let thread =
                thread.ok_or_else(|| StoreError::NotFound("unknown share token".into()))?;
            match thread.share_token_expires_at {
                Some(at) if at <= Utc::now() => {
                    return Err(StoreError::Gone("share token expired".into()));
                }
                _ => {}
            }
            Some(thread)
        } else {
            None
        };

        let thread = match thread {
            Some(t) => {
                if let (Some(tw), Some(cw)) = (t.workspace_id.as_deref(), workspace_id) {
                    if tw != cw {
                        return Err(StoreError::WorkspaceMismatch {
                            thread_id: t.id,
                            thread_workspace: t.workspace_id.clone(),
                            caller_workspace: Some(cw.to_string()),
                        });
                    }
                }
                sqlx::query("UPDATE threads SET last_activity_at = now() WHERE id = $1")
                    .bind(t.id)
                    .execute(&self.pool)
                    .await?;
                t
            }
            None => {
                let t: Thread = sqlx::query_as(
                    "INSERT INTO threads (owner_user_id, workspace_id) VALUES ($1, $2) RETURNING *",
                )
                .bind(user_id)
                .bind(workspace_id)
                .fetch_one(&self.pool)
                .await?;
                tracing::info!(thread_id = %t.id, workspace_id = workspace_id.unwrap_or("-"), "thread created");
                t
            }
        };

        Ok(thread)
    }

    /// Append a message, idempotent on `(thread, client_message_id)`.
    ///
    /// Returns `(message, created)`; `created == false` means an existing
    /// row was returned (or refreshed when `force_retry` was set).
    pub async fn add_message(&self, msg: NewMessage) -> Result<(ThreadMessage, bool), StoreError> {
        if let Some(cmid) = &msg.client_message_id {
            let existing: Option<ThreadMessage> = sqlx::query_as(
                "SELECT * FROM thread_messages WHERE thread_id = $1 AND client_message_id = $2",
            )
            .bind(msg.thread_id)
            .bind(cmid)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(existing) = existing {
                if !msg.force_retry {
                    tracing::info!(
                        thread_id = %msg.thread_id,
                        client_message_id = %cmid,
                        message_id = %existing.id,
                        "duplicate message returned idempotently"
                    );
                    return Ok((existing, false));
                }
                let updated: ThreadMessage = sqlx::query_as(
                    r#"
                    UPDATE thread_messages
                    SET content = $2, status = $3, tool_calls = $4,
                        tokens_input = $5, tokens_output = $6, request_id = $7
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(existing.id)
                .bind(&msg.content)
                .bind(&msg.status)
                .bind(&msg.tool_calls)
                .bind(msg.tokens_input)
                .bind(msg.tokens_output)
                .bind(msg.request_id)
                .fetch_one(&self.pool)
                .await?;
                return Ok((updated, false));
            }
        }

        // Two clients racing on the same client_message_id: the second
        // insert loses on the partial unique index and re-reads the winner.
        let inserted: Result<ThreadMessage, sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO thread_messages
                (thread_id, request_id, role, content, client_message_id,
                 in_reply_to, status, tool_calls, tokens_input, tokens_output)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(msg.thread_id)
        .bind(msg.request_id)
        .bind(&msg.role)
        .bind(&msg.content)
        .bind(&msg.client_message_id)
        .bind(msg.in_reply_to)
        .bind(&msg.status)
        .bind(&msg.tool_calls)
        .bind(msg.tokens_input)
        .bind(msg.tokens_output)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => Ok((row, true)),
            Err(e) if is_unique_violation(&e) && msg.client_message_id.is_some() => {
                let row: ThreadMessage = sqlx::query_as(
                    "SELECT * FROM thread_messages WHERE thread_id = $1 AND client_message_id = $2",
                )
                .bind(msg.thread_id)
                .bind(msg.client_message_id.as_deref())
                .fetch_one(&self.pool)
                .await?;
                Ok((row, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Messages in chronological order, optionally excluding one id.
    ///
    /// The exclusion exists for the chat flow: the caller persists the user
    /// message first and then loads history *without it*, so the new turn is
    /// never doubled in the prompt.
    pub async fn messages(
        &self,
        thread_id: Uuid,
        limit: i64,
        exclude_message_id: Option<Uuid>,
    ) -> Result<Vec<ThreadMessage>, StoreError> {
        let rows: Vec<ThreadMessage> = sqlx::query_as(
            r#"
            SELECT * FROM thread_messages
            WHERE thread_id = $1 AND ($3::uuid IS NULL OR id <> $3)
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(thread_id)
        .bind(limit)
        .bind(exclude_message_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Create a share token; the plaintext is returned exactly once.
    pub async fn generate_share_token(
        &self,
        thread_id: Uuid,
        ttl_hours: i64,
    ) -> Result<String, StoreError> {
        use base64::Engine;
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = format!(
            "thr_{}",
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
        );
        let hash = Sha256::digest(token.as_bytes()).to_vec();

        let res = sqlx::query(
            r#"
            UPDATE threads
            SET share_token_hash = $2,
                share_token_expires_at = now() + make_interval(hours => $3::int)
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(thread_id)
        .bind(hash)
        .bind(ttl_hours as i32)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("thread {thread_id}")));
        }

        tracing::info!(
            thread_id = %thread_id,
            token_prefix = &token[..12],
            ttl_hours,
            "share token generated"
        );
        Ok(token)
    }

    /// Begin a journal entry for a tool call.
    ///
    /// Returns `(row, existing)`.  `existing == true` means a call with the
    /// same idempotency key was journaled before; the caller inspects its
    /// status and result digest instead of blindly re-executing.
    pub async fn log_tool_call(
        &self,
        request_id: Uuid,
        thread_id: Uuid,
        message_id: Option<Uuid>,
        call_index: i32,
        idempotency_key: &str,
        tool_name: &str,
        args: &serde_json::Value,
    ) -> Result<(ToolCallLog, bool), StoreError> {
        let existing: Option<ToolCallLog> =
            sqlx::query_as("SELECT * FROM tool_call_log WHERE idempotency_key = $1")
                .bind(idempotency_key)
                .fetch_optional(&self.pool)
                .await?;
        if let Some(row) = existing {
            tracing::info!(
                tool_name,
                status = %row.status,
                key_prefix = &idempotency_key[..16.min(idempotency_key.len())],
                "tool call already journaled"
            );
            return Ok((row, true));
        }

        let inserted: Result<ToolCallLog, sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO tool_call_log
                (request_id, thread_id, message_id, call_index, idempotency_key,
                 tool_name, args, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            RETURNING *
            "#,
        )
        .bind(request_id)
        .bind(thread_id)
        .bind(message_id)
        .bind(call_index)
        .bind(idempotency_key)
        .bind(tool_name)
        .bind(args)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => Ok((row, false)),
            // Lost a race on the unique key: another task journaled this call.
            Err(e) if is_unique_violation(&e) => {
                let row: ToolCallLog =
                    sqlx::query_as("SELECT * FROM tool_call_log WHERE idempotency_key = $1")
                        .bind(idempotency_key)
                        .fetch_one(&self.pool)
                        .await?;
                Ok((row, true))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Finalise a journal entry.
    pub async fn update_tool_call_status(
        &self,
        log_id: Uuid,
        status: &str,
        result_digest: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        // Long upstream errors are truncated to fit the column comfortably.
        let error = error.map(|e| truncate_utf8(e, 1000));
        sqlx::query(
            r#"
            UPDATE tool_call_log
            SET status = $2,
                result_digest = COALESCE($3, result_digest),
                error = $4,
                finished_at = now()
            WHERE id = $1
            "#,
        )
        .bind(log_id)
        .bind(status)
        .bind(result_digest)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Journal rows for a thread, newest first (debugging/recovery surface).
    pub async fn recent_tool_calls(
        &self,
        thread_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ToolCallLog>, StoreError> {
        let rows: Vec<ToolCallLog> = sqlx::query_as(
            "SELECT * FROM tool_call_log WHERE thread_id = $1 ORDER BY started_at DESC LIMIT $2",
        )
        .bind(thread_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Clear share-token fields on threads whose tokens have expired.
    pub async fn cleanup_expired_tokens(&self) -> Result<u64, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE threads
            SET share_token_hash = NULL, share_token_expires_at = NULL
            WHERE share_token_hash IS NOT NULL
              AND share_token_expires_at IS NOT NULL
              AND share_token_expires_at < now()
            "#,
        )
        .execute(&self.pool)
        .await?;
        let n = res.rows_affected();
        if n > 0 {
            tracing::info!(count = n, "expired share tokens cleared");
        }
        Ok(n)
    }

    /// Soft-delete a thread and drop its share token so the deleted thread
    /// is unreachable through any path.
    pub async fn soft_delete(&self, thread_id: Uuid) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE threads
            SET deleted_at = now(), share_token_hash = NULL, share_token_expires_at = NULL
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(thread_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Expire a share token immediately (test and admin surface).
    pub async fn expire_share_token(&self, thread_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE threads SET share_token_expires_at = now() - interval '1 hour' WHERE id = $1",
        )
        .bind(thread_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
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

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_user_defaults() {
        let m = NewMessage::user(Uuid::new_v4(), serde_json::json!({"text": "hi"}));
        assert_eq!(m.role, "user");
        assert_eq!(m.status, "complete");
        assert!(!m.force_retry);
        assert!(m.client_message_id.is_none());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_utf8("hello", 1000), "hello");
        assert_eq!(truncate_utf8("hello", 3), "hel");
        // "é" is two bytes; cutting at 1 must not split it.
        assert_eq!(truncate_utf8("é", 1), "");
        assert_eq!(truncate_utf8("aé", 2), "a");
    }

    #[test]
    fn share_token_shape() {
        // The token format is part of the external contract (`thr_` prefix,
        // url-safe base64 body); the random body comes from OsRng.
        use base64::Engine;
        let body = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode([7u8; 32]);
        let token = format!("thr_{body}");
        assert!(token.starts_with("thr_"));
        assert_eq!(token.len(), 4 + 43);
    }
}
