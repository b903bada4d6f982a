// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The services struct threaded through every handler.  Everything here is
//! constructed once at startup (`bosun serve`) and cheap to clone.

use std::sync::{Arc, Mutex as StdMutex};

use bosun_cache::CacheStore;
use bosun_config::Settings;
use bosun_core::Orchestrator;
use bosun_mcp::McpRouter;
use bosun_oauth::{AlertManager, OAuthManager, SchedulerStats};
use bosun_store::{ConnectionStore, DeviceSessionService, ThreadStore, TokenMeter};

use crate::ratelimit::RateLimiterService;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub sessions: DeviceSessionService,
    pub threads: ThreadStore,
    pub meter: TokenMeter,
    pub connections: ConnectionStore,
    pub cache: CacheStore,
    pub oauth: Arc<OAuthManager>,
    pub alerts: AlertManager,
    pub orchestrator: Arc<Orchestrator>,
    pub router: Arc<McpRouter>,
    pub rate_limiter: Arc<RateLimiterService>,
    pub scheduler_stats: Arc<StdMutex<SchedulerStats>>,
}
