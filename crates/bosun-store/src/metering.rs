// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Token metering: per-request usage rows, daily rollups, budget checks.
//!
//! `track` is idempotent on `request_id`: a retried request upserts with
//! `GREATEST(existing, new)` so counts never go down and never undercount.
//! The rollup increment runs in the same transaction as the usage upsert,
//! so the O(1) budget reads are always consistent with the detail table.

use chrono::NaiveDate;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::UserTokenBudget;

/// Budget classification returned by [`TokenMeter::check_budget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetLevel {
    None,
    Warning,
    Critical,
    Over,
}

impl BudgetLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Over => "over",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub over_threshold: bool,
    pub percent_used: i64,
    pub level: BudgetLevel,
    pub daily_limit: i64,
    pub tokens_used: i64,
}

/// One `track` call.
#[derive(Debug, Clone)]
pub struct UsageUpdate {
    pub request_id: Uuid,
    pub user_id: Uuid,
    pub workspace_id: Option<String>,
    pub device_session_id: Option<Uuid>,
    pub thread_id: Option<Uuid>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub model_name: Option<String>,
    pub provider: Option<String>,
    pub cache_hit: bool,
    pub tool_calls_count: i32,
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageReport {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub request_count: i64,
    pub cache_hits: i64,
    pub error_count: i64,
}

#[derive(Clone)]
pub struct TokenMeter {
    pool: PgPool,
}

impl TokenMeter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record usage for a request.  Never fails the caller: database errors
    /// are logged and swallowed, the same way cache errors are.
    pub async fn track(&self, mut usage: UsageUpdate) {
        // Cache hits consume nothing and are recorded as such.
        if usage.cache_hit {
            usage.input_tokens = 0;
            usage.output_tokens = 0;
            if usage.status == "ok" {
                usage.status = "cache".to_string();
            }
        }
        if let Err(e) = self.track_inner(&usage).await {
            tracing::error!(
                request_id = %usage.request_id,
                error = %e,
                "failed to track token usage"
            );
        }
    }

    async fn track_inner(&self, usage: &UsageUpdate) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO token_usage
                (request_id, user_id, workspace_id, device_session_id, thread_id,
                 input_tokens, output_tokens, model_name, provider,
                 tool_calls_count, cache_hit, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (request_id) DO UPDATE SET
                input_tokens     = GREATEST(token_usage.input_tokens, EXCLUDED.input_tokens),
                output_tokens    = GREATEST(token_usage.output_tokens, EXCLUDED.output_tokens),
                tool_calls_count = GREATEST(token_usage.tool_calls_count, EXCLUDED.tool_calls_count),
                cache_hit        = token_usage.cache_hit OR EXCLUDED.cache_hit,
                status           = EXCLUDED.status
            "#,
        )
        .bind(usage.request_id)
        .bind(usage.user_id)
        .bind(&usage.workspace_id)
        .bind(usage.device_session_id)
        .bind(usage.thread_id)
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(&usage.model_name)
        .bind(&usage.provider)
        .bind(usage.tool_calls_count)
        .bind(usage.cache_hit)
        .bind(&usage.status)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO token_usage_rollup_daily
                (user_id, workspace_id, day, input_tokens, output_tokens,
                 request_count, cache_hits, error_count)
            VALUES ($1, $2, CURRENT_DATE, $3, $4, 1, $5, $6)
            ON CONFLICT (user_id, workspace_id, day) DO UPDATE SET
                input_tokens  = token_usage_rollup_daily.input_tokens + EXCLUDED.input_tokens,
                output_tokens = token_usage_rollup_daily.output_tokens + EXCLUDED.output_tokens,
                request_count = token_usage_rollup_daily.request_count + 1,
                cache_hits    = token_usage_rollup_daily.cache_hits + EXCLUDED.cache_hits,
                error_count   = token_usage_rollup_daily.error_count + EXCLUDED.error_count,
                updated_at    = now()
            "#,
        )
        .bind(usage.user_id)
        .bind(usage.workspace_id.as_deref().unwrap_or(""))
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(if usage.cache_hit { 1i64 } else { 0 })
        .bind(if usage.status == "error" { 1i64 } else { 0 })
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Today's usage from the rollup (O(1)).
    pub async fn user_usage(
        &self,
        user_id: Uuid,
        workspace_id: Option<&str>,
        day: Option<NaiveDate>,
    ) -> Result<UsageReport, StoreError> {
        let row: Option<(i64, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT input_tokens, output_tokens, request_count, cache_hits, error_count
            FROM token_usage_rollup_daily
            WHERE user_id = $1 AND workspace_id = $2
              AND day = COALESCE($3, CURRENT_DATE)
            "#,
        )
        .bind(user_id)
        .bind(workspace_id.unwrap_or(""))
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(
                |(input_tokens, output_tokens, request_count, cache_hits, error_count)| {
                    UsageReport {
                        input_tokens,
                        output_tokens,
                        request_count,
                        cache_hits,
                        error_count,
                    }
                },
            )
            .unwrap_or_default())
    }

    /// Thread usage aggregated from the detail table.
    pub async fn thread_usage(&self, thread_id: Uuid) -> Result<UsageReport, StoreError> {
        let row: (Option<i64>, Option<i64>, i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT SUM(input_tokens), SUM(output_tokens), COUNT(*),
                   SUM(CASE WHEN cache_hit THEN 1 ELSE 0 END)
            FROM token_usage WHERE thread_id = $1
            "#,
        )
        .bind(thread_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(UsageReport {
            input_tokens: row.0.unwrap_or(0),
            output_tokens: row.1.unwrap_or(0),
            request_count: row.2,
            cache_hits: row.3.unwrap_or(0),
            error_count: 0,
        })
    }

    /// Check today's usage against the user's budget, creating a default
    /// budget row on first contact.
    pub async fn check_budget(
        &self,
        user_id: Uuid,
        workspace_id: Option<&str>,
    ) -> Result<BudgetStatus, StoreError> {
        let budget = self.get_or_create_budget(user_id, workspace_id).await?;
        let usage = self.user_usage(user_id, workspace_id, None).await?;
        let tokens_used = usage.input_tokens + usage.output_tokens;

        let percent_used = if budget.daily_limit == 0 {
            0
        } else {
            tokens_used * 100 / budget.daily_limit
        };
        let level = budget.level_for(percent_used);
        let over_threshold = percent_used >= budget.warning_threshold_percent as i64;

        Ok(BudgetStatus {
            over_threshold,
            percent_used,
            level,
            daily_limit: budget.daily_limit,
            tokens_used,
        })
    }

    async fn get_or_create_budget(
        &self,
        user_id: Uuid,
        workspace_id: Option<&str>,
    ) -> Result<UserTokenBudget, StoreError> {
        let budget: UserTokenBudget = sqlx::query_as(
            r#"
            INSERT INTO user_token_budget (user_id, workspace_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id, workspace_id) DO UPDATE SET user_id = EXCLUDED.user_id
            RETURNING user_id, workspace_id, daily_limit, monthly_limit,
                      warning_threshold_percent, soft_block
            "#,
        )
        .bind(user_id)
        .bind(workspace_id.unwrap_or(""))
        .fetch_one(&self.pool)
        .await?;
        Ok(budget)
    }

    /// Admin/test surface: set a budget row explicitly.
    pub async fn set_budget(
        &self,
        user_id: Uuid,
        workspace_id: Option<&str>,
        daily_limit: i64,
        warning_threshold_percent: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_token_budget
                (user_id, workspace_id, daily_limit, warning_threshold_percent)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, workspace_id) DO UPDATE SET
                daily_limit = EXCLUDED.daily_limit,
                warning_threshold_percent = EXCLUDED.warning_threshold_percent
            "#,
        )
        .bind(user_id)
        .bind(workspace_id.unwrap_or(""))
        .bind(daily_limit)
        .bind(warning_threshold_percent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_level_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&BudgetLevel::Critical).unwrap(),
            "\"critical\""
        );
        assert_eq!(BudgetLevel::Warning.as_str(), "warning");
    }

    #[test]
    fn usage_report_defaults_to_zero() {
        let r = UsageReport::default();
        assert_eq!(r.input_tokens, 0);
        assert_eq!(r.request_count, 0);
    }
}
