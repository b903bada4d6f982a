// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Provider adapters: the handful of URLs and quirks that differ between
//! authorisation-code providers.  Everything else (state handling, token
//! encryption, refresh classification) is provider-independent and lives in
//! the manager.

use bosun_config::NotionSettings;
use serde::Deserialize;

/// Token endpoint response, normalised across providers.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub workspace_name: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    /// Access-token lifetime in seconds, when the provider reports one.
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token_expires_in: Option<i64>,
}

impl TokenResponse {
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .map(|s| {
                s.split([',', ' '])
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One authorisation-code provider.
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;
    /// Full authorisation URL for a state token.
    fn authorization_url(&self, state: &str) -> Option<String>;
    fn token_url(&self) -> &str;
    fn client_id(&self) -> Option<&str>;
    fn client_secret(&self) -> Option<&str>;
    fn redirect_uri(&self) -> Option<&str>;
    /// Optional self-identification endpoint used as a post-connect sanity
    /// check (`users/me` for Notion).  `None` disables the check.
    fn identity_url(&self) -> Option<&str> {
        None
    }
    /// Extra headers for data-plane calls (not the token endpoint).
    fn identity_headers(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

struct NotionProvider {
    settings: NotionSettings,
}

impl ProviderAdapter for NotionProvider {
    fn name(&self) -> &str {
        "notion"
    }

    fn authorization_url(&self, state: &str) -> Option<String> {
        let client_id = self.settings.client_id.as_deref()?;
        let redirect_uri = self.settings.redirect_uri.as_deref()?;
        let mut url = url::Url::parse(&self.settings.auth_url).ok()?;
        url.query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            // Notion requires owner=user on the authorisation request.
            .append_pair("owner", "user")
            .append_pair("state", state);
        Some(url.to_string())
    }

    fn token_url(&self) -> &str {
        &self.settings.token_url
    }

    fn client_id(&self) -> Option<&str> {
        self.settings.client_id.as_deref()
    }

    fn client_secret(&self) -> Option<&str> {
        self.settings.client_secret.as_deref()
    }

    fn redirect_uri(&self) -> Option<&str> {
        self.settings.redirect_uri.as_deref()
    }

    fn identity_url(&self) -> Option<&str> {
        Some("https://api.notion.com/v1/users/me")
    }

    fn identity_headers(&self) -> Vec<(&'static str, String)> {
        // Notion-Version is required on data-plane calls and must NOT be
        // sent to the token endpoint.
        vec![("Notion-Version", "2022-06-28".to_string())]
    }
}

/// Build the Notion adapter from settings.
pub fn notion_provider(settings: NotionSettings) -> Box<dyn ProviderAdapter> {
    Box::new(NotionProvider { settings })
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> NotionSettings {
        NotionSettings {
            client_id: Some("client123".into()),
            client_secret: Some("secret456".into()),
            redirect_uri: Some("https://app.example.com/oauth/notion/callback".into()),
            ..NotionSettings::default()
        }
    }

    #[test]
    fn authorization_url_carries_required_params() {
        let p = notion_provider(settings());
        let url = p.authorization_url("state-abc").unwrap();
        assert!(url.starts_with("https://api.notion.com/v1/oauth/authorize?"));
        assert!(url.contains("client_id=client123"));
        assert!(url.contains("owner=user"));
        assert!(url.contains("state=state-abc"));
        assert!(url.contains("response_type=code"));
    }

    #[test]
    fn authorization_url_requires_configuration() {
        let p = notion_provider(NotionSettings::default());
        assert!(p.authorization_url("s").is_none());
    }

    #[test]
    fn token_response_scope_splitting() {
        let r: TokenResponse = serde_json::from_str(
            r#"{"access_token":"a","scope":"read_content,update_content"}"#,
        )
        .unwrap();
        assert_eq!(r.scopes(), vec!["read_content", "update_content"]);

        let r: TokenResponse = serde_json::from_str(r#"{"access_token":"a"}"#).unwrap();
        assert!(r.scopes().is_empty());
    }

    #[test]
    fn identity_headers_include_notion_version() {
        let p = notion_provider(settings());
        assert_eq!(
            p.identity_headers(),
            vec![("Notion-Version", "2022-06-28".to_string())]
        );
    }
}
