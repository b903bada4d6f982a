// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Keygen => {
            println!("{}", bosun_vault::generate_key_b64());
            Ok(())
        }
        Commands::ShowConfig => {
            let settings = bosun_config::load()?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Commands::Migrate => {
            let settings = bosun_config::load()?;
            let pool = bosun_store::connect(&settings).await?;
            bosun_store::migrate(&pool).await
        }
        Commands::Seed { email, daily_limit } => seed(&email, daily_limit).await,
        Commands::Serve => serve().await,
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("bosun={default},tower_http=info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

/// Seed a development database: dev user, budget row, and one device
/// session whose raw token is printed exactly once.
async fn seed(email: &str, daily_limit: i64) -> anyhow::Result<()> {
    let settings = bosun_config::load()?;
    let pool = bosun_store::connect(&settings).await?;
    bosun_store::migrate(&pool).await?;

    let connections = bosun_store::ConnectionStore::new(pool.clone());
    let user_id = connections.ensure_user(email).await?;

    let meter = bosun_store::TokenMeter::new(pool.clone());
    meter.set_budget(user_id, None, daily_limit, 80).await?;

    let sessions = bosun_store::DeviceSessionService::new(pool);
    let token = sessions.create(user_id, None).await?;

    println!("seeded user {user_id} <{email}>");
    println!("daily budget: {daily_limit} tokens");
    println!("device token (shown once): {}", token.as_str());
    println!("set DEFAULT_USER_ID={user_id} to allow sessionless dev requests");
    Ok(())
}

async fn serve() -> anyhow::Result<()> {
    let settings = Arc::new(bosun_config::load()?);

    // ── Persistence ──────────────────────────────────────────────────────
    let pool = bosun_store::connect(&settings).await?;
    bosun_store::migrate(&pool).await?;
    let sessions = bosun_store::DeviceSessionService::new(pool.clone());
    let threads = bosun_store::ThreadStore::new(pool.clone());
    let meter = bosun_store::TokenMeter::new(pool.clone());
    let connections = bosun_store::ConnectionStore::new(pool.clone());
    let cache = bosun_cache::CacheStore::new(pool.clone());

    // ── Secrets & OAuth ──────────────────────────────────────────────────
    let vault = Arc::new(
        bosun_vault::Vault::new(&settings.fernet_key, &settings.fernet_retired_keys)
            .context("building the secret vault")?,
    );
    let alerts = bosun_oauth::AlertManager::new();
    let in_flight = bosun_oauth::InFlightSet::new();
    let oauth = Arc::new(bosun_oauth::OAuthManager::new(
        settings.oauth.clone(),
        connections.clone(),
        Arc::clone(&vault),
        bosun_oauth::notion_provider(settings.notion.clone()),
        alerts.clone(),
        in_flight,
    ));

    // ── MCP ──────────────────────────────────────────────────────────────
    let pool_client_timeout = Duration::from_millis(settings.mcp_timeout_ms);
    let user_pool = Arc::new(bosun_mcp::UserClientPool::new(
        Arc::clone(&oauth),
        Arc::clone(&vault),
        settings.notion.mcp_url.clone(),
        pool_client_timeout,
    ));
    let interceptor = bosun_mcp::ToolInterceptor::new(
        cache.clone(),
        threads.clone(),
        Arc::clone(&settings),
    );
    let router = bosun_mcp::McpRouter::connect(
        Arc::clone(&settings),
        interceptor,
        Some(Arc::clone(&user_pool)),
    )
    .await;

    // ── Model & orchestrator ─────────────────────────────────────────────
    let model: Arc<dyn bosun_model::ModelProvider> = Arc::new(bosun_model::AnthropicProvider::new(
        settings.model.model.clone(),
        settings.model.anthropic_api_key.clone(),
        Some(settings.model.anthropic_base_url.clone()),
        Some(settings.model.max_output_tokens),
        Some(Duration::from_secs(settings.model.request_timeout_s)),
    ));
    let orchestrator = Arc::new(bosun_core::Orchestrator::new(
        model,
        Arc::clone(&router) as Arc<dyn bosun_core::ToolDispatcher>,
    ));

    // ── Background tasks ─────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    router.spawn_health_monitors(cancel.clone());

    let scheduler = bosun_oauth::RefreshScheduler::new(
        Arc::clone(&oauth),
        connections.clone(),
        settings.oauth.clone(),
    );
    let scheduler_stats = scheduler.stats_handle();
    if settings.oauth.background_refresh_enabled {
        let scheduler_cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(scheduler_cancel).await });
    } else {
        tracing::info!("background token refresh disabled by configuration");
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    let rate_limiter = bosun_gateway::RateLimiterService::new(settings.rate_limit.clone());
    let state = bosun_gateway::AppState {
        settings: Arc::clone(&settings),
        sessions,
        threads,
        meter,
        connections,
        cache,
        oauth,
        alerts,
        orchestrator,
        router,
        rate_limiter,
        scheduler_stats,
    };
    bosun_gateway::spawn_maintenance(state.clone(), cancel.clone());

    let serve_cancel = cancel.clone();
    let server = tokio::spawn(async move { bosun_gateway::serve(state, serve_cancel).await });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");
    cancel.cancel();
    server.await??;
    Ok(())
}
