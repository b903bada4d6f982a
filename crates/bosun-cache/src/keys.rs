// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Deterministic key and tag derivation.
//!
//! Cache keys deliberately exclude session and device identifiers: the same
//! read by the same user from two devices must collapse onto one row.

use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::canonical::canonical_json;

/// Scope half of a cache key.  User-scoped tools isolate per
/// `(user, workspace)`; everything else shares the `global` scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    Global,
    User {
        user_id: Uuid,
        workspace_id: Option<String>,
    },
}

impl CacheScope {
    fn as_key_part(&self) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::User {
                user_id,
                workspace_id,
            } => format!(
                "{}:{}",
                user_id,
                workspace_id.as_deref().unwrap_or("-")
            ),
        }
    }
}

/// Build the cache key for one tool invocation.
///
/// Format: `mcp:{server}:{tool}:{version}:{schema_fp|noschema}:{scope}:{args_hash}`.
pub fn make_cache_key(
    server: &str,
    tool: &str,
    args: &Value,
    scope: &CacheScope,
    tool_version: &str,
    schema_fingerprint: Option<&str>,
) -> String {
    let args_hash = &hex::encode(Sha256::digest(canonical_json(args).as_bytes()))[..16];
    let schema_part = schema_fingerprint
        .map(|fp| &fp[..fp.len().min(8)])
        .unwrap_or("noschema");
    format!(
        "mcp:{server}:{tool}:{tool_version}:{schema_part}:{}:{args_hash}",
        scope.as_key_part()
    )
}

/// Idempotency digest for one journaled tool call.
///
/// `sha256(request_id:thread_id:user_message_id:tool_name:canonical(args):call_index)`;
/// identical inputs always produce the same key, any differing component a
/// different one.
pub fn idempotency_key(
    request_id: Uuid,
    thread_id: Uuid,
    user_message_id: Uuid,
    tool_name: &str,
    args: &Value,
    call_index: u32,
) -> String {
    let material = format!(
        "{request_id}:{thread_id}:{user_message_id}:{tool_name}:{}:{call_index}",
        canonical_json(args)
    );
    hex::encode(Sha256::digest(material.as_bytes()))
}

/// Project tool arguments into stable entity tags so a write to an entity
/// can invalidate every cached read of it.
pub fn derive_tags(provider: &str, args: &Value) -> Vec<String> {
    let mut tags = Vec::new();
    let get = |k: &str| args.get(k).and_then(Value::as_str);

    match provider {
        "notion" => {
            if let Some(id) = get("page_id") {
                tags.push(format!("notion:page:{id}"));
            }
            if let Some(id) = get("database_id") {
                tags.push(format!("notion:db:{id}"));
            }
            if let Some(id) = get("workspace_id") {
                tags.push(format!("notion:ws:{id}"));
            }
        }
        "github" => {
            let owner = get("owner");
            let repo = get("repo");
            if let (Some(owner), Some(repo)) = (owner, repo) {
                tags.push(format!("github:repo:{owner}/{repo}"));
            }
            if let Some(path) = get("path") {
                tags.push(format!(
                    "github:file:{}/{}:{path}",
                    owner.unwrap_or(""),
                    repo.unwrap_or("")
                ));
            }
        }
        _ => {}
    }
    tags
}

/// 64-bit advisory-lock key for a cache key (low half of its SHA-256).
pub fn advisory_lock_key(cache_key: &str) -> i64 {
    let digest = Sha256::digest(cache_key.as_bytes());
    i64::from_be_bytes(digest[..8].try_into().expect("8 bytes"))
}

/// Short schema fingerprint for key derivation.
pub fn schema_fingerprint(schema: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(schema).as_bytes()))[..8].to_string()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> CacheScope {
        CacheScope::User {
            user_id: Uuid::nil(),
            workspace_id: Some("ws1".into()),
        }
    }

    #[test]
    fn key_is_deterministic_under_reordering() {
        let a = json!({"query": "X", "limit": 5});
        let b = json!({"limit": 5, "query": "  X  "});
        let ka = make_cache_key("notion", "API-post-search", &a, &scope(), "v1", None);
        let kb = make_cache_key("notion", "API-post-search", &b, &scope(), "v1", None);
        assert_eq!(ka, kb);
    }

    #[test]
    fn key_embeds_scope_but_never_session_ids() {
        let args = json!({"q": "x"});
        let global = make_cache_key("notion", "t", &args, &CacheScope::Global, "v1", None);
        let user = make_cache_key("notion", "t", &args, &scope(), "v1", None);
        assert!(global.contains(":global:"));
        assert!(user.contains(&format!("{}:ws1", Uuid::nil())));
        assert_ne!(global, user);
    }

    #[test]
    fn key_includes_schema_fingerprint_when_present() {
        let args = json!({});
        let k = make_cache_key("github", "get_issue", &args, &CacheScope::Global, "v1", Some("abcdef0123"));
        assert!(k.contains(":abcdef01:"));
        let k2 = make_cache_key("github", "get_issue", &args, &CacheScope::Global, "v1", None);
        assert!(k2.contains(":noschema:"));
    }

    #[test]
    fn idempotency_key_changes_with_every_component() {
        let r = Uuid::new_v4();
        let t = Uuid::new_v4();
        let m = Uuid::new_v4();
        let args = json!({"q": "x"});
        let base = idempotency_key(r, t, m, "notion.search", &args, 0);

        assert_eq!(base, idempotency_key(r, t, m, "notion.search", &args, 0));
        assert_ne!(base, idempotency_key(Uuid::new_v4(), t, m, "notion.search", &args, 0));
        assert_ne!(base, idempotency_key(r, Uuid::new_v4(), m, "notion.search", &args, 0));
        assert_ne!(base, idempotency_key(r, t, Uuid::new_v4(), "notion.search", &args, 0));
        assert_ne!(base, idempotency_key(r, t, m, "notion.fetch", &args, 0));
        assert_ne!(base, idempotency_key(r, t, m, "notion.search", &json!({"q": "y"}), 0));
        assert_ne!(base, idempotency_key(r, t, m, "notion.search", &args, 1));
    }

    #[test]
    fn idempotency_key_is_canonical_over_args() {
        let r = Uuid::new_v4();
        let t = Uuid::new_v4();
        let m = Uuid::new_v4();
        let a = json!({"b": 1.0000000000001, "a": " x "});
        let b = json!({"a": "x", "b": 1.0});
        assert_eq!(
            idempotency_key(r, t, m, "tool", &a, 2),
            idempotency_key(r, t, m, "tool", &b, 2)
        );
    }

    #[test]
    fn notion_tags_project_entity_ids() {
        let tags = derive_tags("notion", &json!({"page_id": "p1", "database_id": "d1"}));
        assert_eq!(tags, vec!["notion:page:p1", "notion:db:d1"]);
    }

    #[test]
    fn github_tags_include_repo_and_file() {
        let tags = derive_tags(
            "github",
            &json!({"owner": "acme", "repo": "site", "path": "src/main.rs"}),
        );
        assert_eq!(
            tags,
            vec!["github:repo:acme/site", "github:file:acme/site:src/main.rs"]
        );
    }

    #[test]
    fn unknown_provider_has_no_tags() {
        assert!(derive_tags("time", &json!({"tz": "UTC"})).is_empty());
    }

    #[test]
    fn advisory_lock_key_is_stable() {
        let k = advisory_lock_key("mcp:notion:t:v1:noschema:global:abc");
        assert_eq!(k, advisory_lock_key("mcp:notion:t:v1:noschema:global:abc"));
        assert_ne!(k, advisory_lock_key("mcp:notion:t:v1:noschema:global:abd"));
    }
}
