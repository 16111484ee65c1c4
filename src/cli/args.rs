use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable debug-level logging regardless of --log-level
    #[arg(short, long)]
    pub debug: bool,

    /// Metrics server port (omit to disable)
    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Path to the Chrome/Chromium executable (overrides auto-detection)
    #[arg(long)]
    pub chrome: Option<PathBuf>,

    /// Force headless mode on or off
    #[arg(long)]
    pub headless: Option<bool>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Start a new goal-driven session against a tab
    Start(StartArgs),

    /// Stop the active session, if any
    Stop,

    /// Report the session controller's current state
    Status,
}

#[derive(clap::Args, Clone)]
pub struct StartArgs {
    /// Natural-language goal for the policy to pursue
    pub goal: String,

    /// Maximum steps before the loop gives up (default from config)
    #[arg(long)]
    pub max_steps: Option<u32>,
}
