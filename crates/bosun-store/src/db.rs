// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::{PgPool, PgPoolOptions};

use bosun_config::Settings;

/// Statement timeout applied to every pooled connection.
const STATEMENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Open the PostgreSQL pool described by the settings.
pub async fn connect(settings: &Settings) -> anyhow::Result<PgPool> {
    let url = settings
        .database_url
        .as_deref()
        .context("DATABASE_URL is not configured")?;

    let statement_timeout_ms = STATEMENT_TIMEOUT.as_millis();
    let pool = PgPoolOptions::new()
        .max_connections(settings.database_pool_size)
        .acquire_timeout(Duration::from_secs(settings.database_pool_timeout_s))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query(&format!("SET statement_timeout = {statement_timeout_ms}"))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(url)
        .await
        .context("connecting to PostgreSQL")?;

    tracing::info!(
        pool_size = settings.database_pool_size,
        "database pool ready"
    );
    Ok(pool)
}

/// Run the embedded migrations.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("running database migrations")?;
    tracing::info!("database migrations applied");
    Ok(())
}
