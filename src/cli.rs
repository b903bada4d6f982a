// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "bosun",
    version,
    about = "Agent-core runtime: chat in, LLM + cached MCP tools out"
)]
pub struct Cli {
    /// Log more (sets the default filter to debug).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run migrations, connect the MCP servers, and serve HTTP.
    Serve,
    /// Apply database migrations and exit.
    Migrate,
    /// Create the development user, a device session, and a budget row.
    Seed {
        /// Email for the dev user.
        #[arg(long, default_value = "dev@localhost")]
        email: String,
        /// Daily token budget for the dev user.
        #[arg(long, default_value_t = 1_000_000)]
        daily_limit: i64,
    },
    /// Print the resolved configuration (secrets redacted).
    ShowConfig,
    /// Generate a fresh vault key for FERNET_KEY / FERNET_KEYS.
    Keygen,
}
