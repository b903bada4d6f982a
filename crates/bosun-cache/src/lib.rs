// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Tool-result cache shared by every tool invocation.
//!
//! Keys are deterministic functions of the canonicalised arguments
//! ([`canonical`]), so identical reads land on identical rows regardless of
//! argument ordering or float noise.  The store itself lives in PostgreSQL
//! ([`store`]) so cache hits survive restarts and are shared across
//! processes; single-flight coordination combines an in-process keyed mutex
//! with a database advisory lock.
//!
//! Cache failures never propagate: every public read/write degrades to a
//! miss (or a dropped write) with a log line and a counter bump.

pub mod canonical;
pub mod keys;
mod store;

pub use keys::{derive_tags, idempotency_key, make_cache_key, CacheScope};
pub use store::{CacheMeta, CacheStats, CacheStore};
