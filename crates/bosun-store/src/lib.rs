// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! PostgreSQL persistence layer.
//!
//! One crate owns the pool and every repository: conversation threads and
//! their tool-call journal, device sessions, token metering/budgets, and the
//! OAuth rows (states + provider connections) the oauth crate drives.  The
//! tool-result cache shares the same database but lives in `bosun-cache`.

mod connections;
mod db;
mod error;
mod metering;
mod models;
mod sessions;
mod threads;

pub use connections::{ConnectionStore, ConnectionUpsert};
pub use db::{connect, migrate};
pub use error::StoreError;
pub use metering::{BudgetLevel, BudgetStatus, TokenMeter, UsageReport, UsageUpdate};
pub use models::*;
pub use sessions::{DeviceSessionContext, DeviceSessionService, DeviceToken};
pub use threads::{NewMessage, ThreadStore};
