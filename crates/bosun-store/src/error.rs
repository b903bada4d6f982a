// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use uuid::Uuid;

/// Errors surfaced by the repositories.
///
/// The gateway maps these onto the HTTP error envelope: `NotFound` → 404,
/// `Gone` → 410, `Forbidden` → 403, everything else → 500.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource existed but is no longer reachable (expired share token).
    #[error("gone: {0}")]
    Gone(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("thread {thread_id} belongs to workspace {thread_workspace:?}, caller is in {caller_workspace:?}")]
    WorkspaceMismatch {
        thread_id: Uuid,
        thread_workspace: Option<String>,
        caller_workspace: Option<String>,
    },

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl StoreError {
    /// True for the workspace-mismatch flavour of `Forbidden`.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden(_) | Self::WorkspaceMismatch { .. })
    }
}
