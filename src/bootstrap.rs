//! Process entry point: load configuration, wire the server and stub
//! pipelines to their shared TLS/upstream collaborators, and run until
//! a shutdown signal arrives.

use std::fs::File;
use std::io::BufReader;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ConfigManager;
use crate::dns::client::{StubConfig, StubPipeline};
use crate::dns::server::{DohServer, DohServerConfig};
use crate::dns::tls;
use crate::dns::trust::TrustedProxies;
use crate::dns::upstream::UpstreamClient;
use crate::error::AppError;
use crate::log::{LogConfig, LogManager, RotationPolicy};

pub async fn run() -> Result<()> {
    let config = ConfigManager::load().map_err(|e| AppError::Config(e.to_string()))?;
    let app_config = config.get();

    let log_config = LogConfig {
        path: app_config.log_path.clone(),
        level: app_config.log_level.clone(),
        max_size: app_config.log_max_size,
        rotation: RotationPolicy::Daily,
        retention_days: app_config.log_retention_days,
    };
    LogManager::init_with_config(log_config.clone())?;

    info!("doh-gateway starting up");

    let log_manager = LogManager::new(log_config);
    match log_manager.cleanup_old_logs() {
        Ok(result) if result.deleted_files > 0 => {
            info!(
                deleted_files = result.deleted_files,
                deleted_bytes = result.deleted_bytes,
                "cleaned up stale log files"
            );
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "failed to clean up old logs"),
    }

    let upstream_addr = resolve_one(&app_config.upstream_dns_host, app_config.upstream_dns_port)?;
    let upstream = Arc::new(UpstreamClient::new(upstream_addr));
    info!(upstream = %upstream_addr, "upstream DNS client ready");

    let trusted_proxies = TrustedProxies::from_strs(&app_config.trusted_proxies);

    let server_certs = load_certs(&app_config.server_cert_path)?;
    let server_key = load_key(&app_config.server_key_path)?;
    let server_tls = tls::build_server_config(server_certs, server_key, &app_config.tls_ciphers)
        .map_err(|e| AppError::Tls(e.to_string()))?;
    let tls_acceptor = TlsAcceptor::from(server_tls);

    let doh_config = DohServerConfig {
        endpoint_path: app_config.server_endpoint_path.clone(),
        trusted_proxies: trusted_proxies.clone(),
        upstream_timeout: Duration::from_millis(app_config.upstream_query_timeout_ms),
        verbose_errors: app_config.verbose_errors,
    };
    let doh_server = Arc::new(DohServer::new(doh_config, Arc::clone(&upstream)));

    let server_listen: SocketAddr = app_config
        .server_listen
        .parse()
        .context("invalid server_listen address")?;
    let server_tcp_listener = TcpListener::bind(server_listen)
        .await
        .with_context(|| format!("failed to bind DoH server listener on {server_listen}"))?;
    info!(address = %server_listen, path = %app_config.server_endpoint_path, "DoH server listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = doh_server.run(server_tcp_listener, tls_acceptor).await {
            tracing::error!(error = %e, "DoH server accept loop exited");
        }
    });

    let stub_remote_host = app_config
        .stub_remote_address
        .clone()
        .unwrap_or_else(|| app_config.stub_domain.clone());
    let stub_remote_addr = resolve_one(&stub_remote_host, app_config.stub_remote_port)?;

    let stub_ca = match &app_config.stub_ca_file {
        Some(path) => Some(load_certs(path)?),
        None => None,
    };
    let stub_client_tls = tls::build_client_config(app_config.stub_insecure, stub_ca)
        .map_err(|e| AppError::Tls(e.to_string()))?;

    let stub_listen: SocketAddr =
        format!("{}:{}", app_config.stub_listen_address, app_config.stub_listen_port)
            .parse()
            .map_err(|_| {
                AppError::Config("invalid stub_listen_address/stub_listen_port".to_string())
            })?;

    let stub_pipeline = Arc::new(StubPipeline::new(StubConfig {
        listen_addr: stub_listen,
        remote_addr: stub_remote_addr,
        authority: app_config.stub_domain.clone(),
        uri_path: app_config.stub_uri.clone(),
        use_post: app_config.stub_post,
        tls_config: stub_client_tls,
    }));

    let stub_shutdown = CancellationToken::new();
    let stub_listen_log = stub_listen;
    let stub_remote_log = stub_remote_addr;
    let stub_handle = {
        let stub_pipeline = Arc::clone(&stub_pipeline);
        let stub_shutdown = stub_shutdown.clone();
        tokio::spawn(async move {
            info!(address = %stub_listen_log, upstream = %stub_remote_log, "stub DNS listener starting");
            if let Err(e) = stub_pipeline.run(stub_shutdown).await {
                tracing::error!(error = %e, "stub pipeline accept loop exited");
            }
        })
    };

    info!("doh-gateway started successfully");
    shutdown_signal().await;
    info!("shutting down doh-gateway");

    stub_shutdown.cancel();
    server_handle.abort();
    stub_handle.abort();

    info!("doh-gateway stopped");
    Ok(())
}

fn resolve_one(host: &str, port: u16) -> Result<SocketAddr, AppError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| AppError::Dns(format!("failed to resolve {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| AppError::Dns(format!("{host}:{port} resolved to no addresses")))
}

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, AppError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| AppError::Tls(format!("parsing certificates from {}: {e}", path.display())))
}

fn load_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, AppError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| AppError::Tls(format!("parsing private key from {}: {e}", path.display())))?
        .ok_or_else(|| AppError::Tls(format!("no private key found in {}", path.display())))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C signal"),
        _ = terminate => info!("received SIGTERM signal"),
    }
}
