// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use membership_core::domain::service_config::{
    ServiceConfigManifest, ServiceRole, StorageKind, CONFIG_PATH_ENV,
};

const ANNOTATED_TEMPLATE: &str = include_str!("../../templates/membership-config.yaml");

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./membership-config.yaml)
        #[arg(short, long, default_value = "./membership-config.yaml")]
        output: PathBuf,

        /// Service role the sample is written for
        #[arg(long, default_value = "user")]
        role: ServiceRole,

        /// Write the annotated user-service template instead
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate {
            output,
            role,
            examples,
        } => generate(output, role, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = ServiceConfigManifest::load_or_default(config_override.clone(), ServiceRole::User)
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. {}: {}",
            CONFIG_PATH_ENV,
            std::env::var(CONFIG_PATH_ENV)
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./membership-config.yaml");
        println!("  4. ~/.membership/config.yaml");
        println!("  5. /etc/membership/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Service:".bold());
    println!("  Name: {}", config.metadata.name);
    println!("  Role: {}", spec.service.role);
    println!("  Listen: {}:{}", spec.service.bind_address, spec.service.port);
    println!();

    println!("{}", "Peer:".bold());
    println!("  Base URL: {}", spec.peer.base_url);
    println!("  Timeout: {:?}", spec.peer.timeout);
    println!();

    println!("{}", "Storage:".bold());
    match spec.storage.backend {
        StorageKind::InMemory => println!("  Backend: in-memory"),
        StorageKind::Postgres => {
            println!("  Backend: postgres");
            // Only show env references; literal strings may carry credentials.
            match spec.storage.connection_string.as_deref() {
                Some(s) if s.starts_with("env:") => println!("  Connection: {}", s),
                Some(_) => println!("  Connection: {}", "(set)".dimmed()),
                None => println!("  Connection: {}", "(missing)".red()),
            }
        }
    }
    println!();

    println!("{}", "Membership policy:".bold());
    println!("  On peer unavailable: {:?}", spec.membership.on_peer_unavailable);
    println!("  Deletion unlink: {:?}", spec.membership.deletion_unlink);
    println!("  Propagation buffer: {}", spec.membership.propagation_buffer);
    println!();

    println!("{}", "Observability:".bold());
    println!(
        "  Logging: {} ({})",
        spec.observability.logging.level, spec.observability.logging.format
    );
    if spec.observability.metrics.enabled {
        println!("  Metrics: enabled on :{}", spec.observability.metrics.port);
    } else {
        println!("  Metrics: {}", "disabled".dimmed());
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = ServiceConfigManifest::load_or_default(config_path, ServiceRole::User)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;
    config
        .storage_backend()
        .context("Storage configuration cannot be resolved")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

/// Sample configuration text for `role`
pub fn sample_config(role: ServiceRole, with_examples: bool) -> Result<String> {
    if with_examples {
        return Ok(ANNOTATED_TEMPLATE.to_string());
    }
    ServiceConfigManifest::for_role(role)
        .to_yaml_string()
        .context("Failed to render configuration")
}

async fn generate(output: PathBuf, role: ServiceRole, with_examples: bool) -> Result<()> {
    let sample = sample_config(role, with_examples)?;

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotated_template_is_valid() {
        let config = ServiceConfigManifest::from_yaml_str(ANNOTATED_TEMPLATE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.spec.service.role, ServiceRole::User);
    }

    #[test]
    fn test_generated_samples_round_trip_per_role() {
        for role in [ServiceRole::Company, ServiceRole::User] {
            let yaml = sample_config(role, false).unwrap();
            let config = ServiceConfigManifest::from_yaml_str(&yaml).unwrap();
            config.validate().unwrap();
            assert_eq!(config.spec.service.role, role);
            assert_eq!(config.spec.service.port, role.default_port());
        }
    }

    #[tokio::test]
    async fn test_generate_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("company.yaml");
        generate(output.clone(), ServiceRole::Company, false).await.unwrap();

        let config = ServiceConfigManifest::from_yaml_file(&output).unwrap();
        assert_eq!(config.spec.service.role, ServiceRole::Company);
        assert!(config.spec.peer.base_url.ends_with("/api/users"));
    }
}
