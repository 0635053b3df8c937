// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Membership Service Daemon
//!
//! The `membershipd` binary runs either half of the Company/User membership
//! protocol. The role comes from configuration (`spec.service.role`) or the
//! `--role` flag.
//!
//! ## Commands
//!
//! - `membershipd serve [--role company|user] [--port N]` - Run a service
//! - `membershipd config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use membership_cli::commands::{self, ConfigCommand, ServeArgs};
use membership_core::domain::service_config::{LoggingSettings, ServiceConfigManifest, ServiceRole};

/// Company/User membership service
#[derive(Parser)]
#[command(name = "membershipd")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "MEMBERSHIP_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the configured level
    #[arg(long, global = true, env = "MEMBERSHIP_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (text, json); defaults to the configured format
    #[arg(long, global = true, env = "MEMBERSHIP_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Company or User service
    #[command(name = "serve")]
    Serve(ServeArgs),

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file unless overridden; a broken
    // file is reported by the command itself.
    let configured = match &cli.command {
        Some(Commands::Serve(_)) => ServiceConfigManifest::load_or_default(cli.config.clone(), ServiceRole::User)
            .map(|c| c.spec.observability.logging)
            .unwrap_or_default(),
        _ => LoggingSettings::default(),
    };
    let level = cli.log_level.clone().unwrap_or(configured.level);
    let format = cli.log_format.clone().unwrap_or(configured.format);
    init_logging(&level, &format)?;

    match cli.command {
        Some(Commands::Serve(args)) => commands::serve::run(args, cli.config).await,
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            // No command provided - show help
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        "json" => builder.json().init(),
        "text" => builder.compact().init(),
        other => anyhow::bail!("Unknown log format '{}'. Expected text or json", other),
    }

    Ok(())
}
