// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `membershipd serve`
//!
//! Wiring order matters: the propagation channel exists before the stores
//! (which hold its sender), and the worker is spawned last because its handler
//! needs those stores. On shutdown the HTTP server stops accepting requests
//! first, then the worker drains whatever committed events are still queued.

use anyhow::{Context, Result};
use axum::Router;
use clap::Args;
use sqlx::PgPool;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use membership_core::application::repository_factory::{
    create_company_repository, create_user_repository,
};
use membership_core::application::{
    CompanyPropagationHandler, StandardCompanyService, StandardUserService, UserPropagationHandler,
};
use membership_core::domain::membership::{CompanyMembershipEvent, UserMembershipEvent};
use membership_core::domain::peer::{CompanyPeer, UserPeer, COMPANY_PEER, USER_PEER};
use membership_core::domain::repository::StorageBackend;
use membership_core::domain::service_config::{ServiceConfigManifest, ServiceRole};
use membership_core::infrastructure::db::Database;
use membership_core::infrastructure::{
    HttpCompanyPeer, HttpUserPeer, PropagationChannel, PropagationWorker,
};
use membership_core::presentation::{company_router, user_router};

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Service role to run; must match the config file when one is loaded
    #[arg(long, env = "MEMBERSHIP_ROLE")]
    pub role: Option<ServiceRole>,

    /// HTTP port (default: from config)
    #[arg(long, env = "MEMBERSHIP_PORT")]
    pub port: Option<u16>,
}

/// Load the manifest and reconcile it with the command-line overrides
pub fn resolve_config(args: &ServeArgs, config_path: Option<PathBuf>) -> Result<ServiceConfigManifest> {
    let fallback = args.role.unwrap_or(ServiceRole::User);
    let mut config = ServiceConfigManifest::load_or_default(config_path, fallback)
        .context("Failed to load configuration")?;

    if let Some(role) = args.role {
        if config.spec.service.role != role {
            anyhow::bail!(
                "--role {} conflicts with configured role {}",
                role,
                config.spec.service.role
            );
        }
    }
    if let Some(port) = args.port {
        config.spec.service.port = port;
    }

    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

pub async fn run(args: ServeArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = resolve_config(&args, config_path)?;
    let spec = &config.spec;
    let role = spec.service.role;

    info!(
        role = %role,
        peer = %spec.peer.base_url,
        timeout = ?spec.peer.timeout,
        "Starting {}-service",
        role
    );

    if spec.observability.metrics.enabled {
        install_metrics_exporter(spec.observability.metrics.port)?;
    }

    let backend = config.storage_backend()?;
    let pool = match &backend {
        StorageBackend::PostgreSQL(pg) => {
            let db = Database::new(&pg.connection_string).await?;
            db.migrate(role).await?;
            info!("Connected to PostgreSQL");
            Some(db.get_pool().clone())
        }
        StorageBackend::InMemory => {
            warn!("Using in-memory storage; data is lost on restart");
            None
        }
    };

    let (app, worker) = match role {
        ServiceRole::Company => build_company_service(&config, &backend, pool)?,
        ServiceRole::User => build_user_service(&config, &backend, pool)?,
    };

    let addr = format!("{}:{}", spec.service.bind_address, spec.service.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("{}-service listening on {}", role, addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("HTTP server stopped; draining propagation queue");
    worker.shutdown().await;
    info!("{}-service shut down", role);

    Ok(())
}

fn build_company_service(
    config: &ServiceConfigManifest,
    backend: &StorageBackend,
    pool: Option<PgPool>,
) -> Result<(Router, PropagationWorker)> {
    let spec = &config.spec;
    let channel = PropagationChannel::<CompanyMembershipEvent>::new(
        COMPANY_PEER,
        spec.membership.propagation_buffer,
    );
    let companies = create_company_repository(backend, pool, channel.sender())?;
    let users: Arc<dyn UserPeer> = Arc::new(
        HttpUserPeer::new(spec.peer.base_url.clone(), spec.peer.timeout)
            .context("Failed to build user-service client")?,
    );

    let handler = Arc::new(CompanyPropagationHandler::new(users.clone(), companies.clone()));
    let worker = channel.spawn(handler);
    let service = Arc::new(StandardCompanyService::new(companies, users, spec.membership));

    Ok((company_router(service), worker))
}

fn build_user_service(
    config: &ServiceConfigManifest,
    backend: &StorageBackend,
    pool: Option<PgPool>,
) -> Result<(Router, PropagationWorker)> {
    let spec = &config.spec;
    let channel =
        PropagationChannel::<UserMembershipEvent>::new(USER_PEER, spec.membership.propagation_buffer);
    let users = create_user_repository(backend, pool, channel.sender())?;
    let companies: Arc<dyn CompanyPeer> = Arc::new(
        HttpCompanyPeer::new(spec.peer.base_url.clone(), spec.peer.timeout)
            .context("Failed to build company-service client")?,
    );

    let handler = Arc::new(UserPropagationHandler::new(companies.clone(), users.clone()));
    let worker = channel.spawn(handler);
    let service = Arc::new(StandardUserService::new(users, companies, spec.membership));

    Ok((user_router(service), worker))
}

fn install_metrics_exporter(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    metrics::describe_counter!(
        "membership_propagation_total",
        "Deferred membership events by service and outcome (delivered, superseded, failed, dropped)"
    );
    metrics::describe_counter!(
        "membership_compensation_total",
        "Compensating remote membership calls by outcome"
    );
    info!("Prometheus metrics exposed on {}", addr);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_flag_must_match_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("company.yaml");
        let yaml = ServiceConfigManifest::for_role(ServiceRole::Company)
            .to_yaml_string()
            .unwrap();
        std::fs::write(&path, yaml).unwrap();

        let args = ServeArgs {
            role: Some(ServiceRole::User),
            port: None,
        };
        let err = resolve_config(&args, Some(path.clone())).unwrap_err();
        assert!(err.to_string().contains("conflicts"));

        let args = ServeArgs {
            role: Some(ServiceRole::Company),
            port: Some(18882),
        };
        let config = resolve_config(&args, Some(path)).unwrap();
        assert_eq!(config.spec.service.port, 18882);
    }

    #[tokio::test]
    async fn test_user_service_wires_in_memory() {
        let config = ServiceConfigManifest::for_role(ServiceRole::User);
        let (_app, worker) = build_user_service(&config, &StorageBackend::InMemory, None).unwrap();
        worker.shutdown().await;
    }
}
