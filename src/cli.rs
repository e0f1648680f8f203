// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "tiller",
    about = "On-device agent runtime driving a language model through a think/act/observe loop",
    version
)]
pub struct Cli {
    /// Prompt for a one-shot generation.
    pub prompt: Option<String>,

    /// Explicit config file (merged over the discovered layers).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Generate an image instead of running the text loop.
    #[arg(long)]
    pub image: bool,

    /// OpenAI-compatible endpoint; overrides `remote.base_url` from config.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Model name forwarded to the endpoint.
    #[arg(long, default_value = "default")]
    pub model: String,

    /// Log to stderr (RUST_LOG-style filtering via TILLER_LOG).
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the effective merged configuration as YAML.
    ShowConfig,
}
