// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "courier",
    about = "A Telegram front-end for the Claude Code agent",
    version,
    long_about = None,
)]
pub struct Cli {
    /// Enable debug logging (same as RUST_LOG=debug)
    #[arg(long)]
    pub debug: bool,

    /// Path to config file (overrides auto-discovery)
    #[arg(long, value_name = "PATH")]
    pub config_file: Option<PathBuf>,
}
