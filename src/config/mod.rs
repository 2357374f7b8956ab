//! Configuration management module
//!
//! Handles loading configuration from environment variables and a config
//! file, with environment variables taking priority over config file
//! values, which in turn take priority over defaults.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (highest priority)
//! 2. Configuration file (config.toml)
//! 3. Default values (lowest priority)

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Address the DoH server listens on (TLS-terminated HTTP/2)
    pub server_listen: String,
    /// Path the DoH server accepts requests on
    pub server_endpoint_path: String,
    /// PEM certificate chain for the DoH server
    pub server_cert_path: PathBuf,
    /// PEM private key for the DoH server
    pub server_key_path: PathBuf,
    /// Cipher suite string, informational (see DESIGN.md)
    pub tls_ciphers: String,

    /// Upstream classical-DNS host used by the DoH server pipeline
    pub upstream_dns_host: String,
    /// Upstream classical-DNS port, default 53
    pub upstream_dns_port: u16,
    /// Upstream query deadline in milliseconds
    pub upstream_query_timeout_ms: u64,

    /// Address the stub listens on for classical DNS ingress
    pub stub_listen_address: String,
    /// Port the stub listens on (UDP and TCP)
    pub stub_listen_port: u16,
    /// DoH server hostname, used for `:authority` and TLS SNI
    pub stub_domain: String,
    /// Optional override of the resolved upstream IP
    pub stub_remote_address: Option<String>,
    /// Upstream DoH server port
    pub stub_remote_port: u16,
    /// Upstream DoH server URI path
    pub stub_uri: String,
    /// Use POST instead of GET for upstream requests
    pub stub_post: bool,
    /// Disable upstream TLS certificate verification
    pub stub_insecure: bool,
    /// Optional extra trusted CA file for the upstream connection
    pub stub_ca_file: Option<PathBuf>,

    /// Peers allowed to set X-Forwarded-For
    pub trusted_proxies: Vec<String>,
    /// Include codec error detail in 400 response bodies
    pub verbose_errors: bool,

    /// Log directory
    pub log_path: PathBuf,
    /// Log level filter (trace, debug, info, warn, error)
    pub log_level: String,
    /// Maximum size per log file in bytes (size-based rotation reference)
    pub log_max_size: u64,
    /// Number of days to retain log files
    pub log_retention_days: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_listen: "0.0.0.0:443".to_string(),
            server_endpoint_path: "/dns-query".to_string(),
            server_cert_path: PathBuf::from("cert.pem"),
            server_key_path: PathBuf::from("key.pem"),
            tls_ciphers: "ECDHE+AESGCM".to_string(),

            upstream_dns_host: "127.0.0.1".to_string(),
            upstream_dns_port: 53,
            upstream_query_timeout_ms: 10_000,

            stub_listen_address: "::1".to_string(),
            stub_listen_port: 53,
            stub_domain: "dns.google".to_string(),
            stub_remote_address: None,
            stub_remote_port: 443,
            stub_uri: "/dns-query".to_string(),
            stub_post: false,
            stub_insecure: false,
            stub_ca_file: None,

            trusted_proxies: vec!["::1".to_string(), "127.0.0.1".to_string()],
            verbose_errors: false,

            log_path: PathBuf::from("logs"),
            log_level: "info".to_string(),
            log_max_size: 10 * 1024 * 1024,
            log_retention_days: 30,
        }
    }
}

/// Partial configuration for merging from different sources
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PartialConfig {
    pub server_listen: Option<String>,
    pub server_endpoint_path: Option<String>,
    pub server_cert_path: Option<PathBuf>,
    pub server_key_path: Option<PathBuf>,
    pub tls_ciphers: Option<String>,

    pub upstream_dns_host: Option<String>,
    pub upstream_dns_port: Option<u16>,
    pub upstream_query_timeout_ms: Option<u64>,

    pub stub_listen_address: Option<String>,
    pub stub_listen_port: Option<u16>,
    pub stub_domain: Option<String>,
    pub stub_remote_address: Option<String>,
    pub stub_remote_port: Option<u16>,
    pub stub_uri: Option<String>,
    pub stub_post: Option<bool>,
    pub stub_insecure: Option<bool>,
    pub stub_ca_file: Option<PathBuf>,

    pub trusted_proxies: Option<Vec<String>>,
    pub verbose_errors: Option<bool>,

    pub log_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_max_size: Option<u64>,
    pub log_retention_days: Option<u32>,
}

/// Configuration manager responsible for loading and providing access to configuration
pub struct ConfigManager {
    config: RwLock<AppConfig>,
}

impl ConfigManager {
    /// Load configuration from environment variables and config file
    pub fn load() -> Result<Self> {
        Self::load_with_path("config.toml")
    }

    /// Load configuration with a custom config file path
    pub fn load_with_path<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = AppConfig::default();

        if let Ok(file_config) = Self::load_from_file(config_path.as_ref()) {
            Self::merge_config(&mut config, file_config);
        }

        let env_config = Self::load_from_env();
        Self::merge_config(&mut config, env_config);

        Ok(Self {
            config: RwLock::new(config),
        })
    }

    /// Create ConfigManager from explicit configs, for testing
    pub fn from_configs(
        file_config: Option<PartialConfig>,
        env_config: Option<PartialConfig>,
    ) -> Self {
        let mut config = AppConfig::default();

        if let Some(fc) = file_config {
            Self::merge_config(&mut config, fc);
        }
        if let Some(ec) = env_config {
            Self::merge_config(&mut config, ec);
        }

        Self {
            config: RwLock::new(config),
        }
    }

    /// Get current configuration
    pub fn get(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> PartialConfig {
        PartialConfig {
            server_listen: std::env::var("DOH_SERVER_LISTEN").ok(),
            server_endpoint_path: std::env::var("DOH_SERVER_ENDPOINT_PATH").ok(),
            server_cert_path: std::env::var("DOH_SERVER_CERT_PATH").ok().map(PathBuf::from),
            server_key_path: std::env::var("DOH_SERVER_KEY_PATH").ok().map(PathBuf::from),
            tls_ciphers: std::env::var("DOH_TLS_CIPHERS").ok(),

            upstream_dns_host: std::env::var("DOH_UPSTREAM_DNS_HOST").ok(),
            upstream_dns_port: std::env::var("DOH_UPSTREAM_DNS_PORT")
                .ok()
                .and_then(|v| v.parse().ok()),
            upstream_query_timeout_ms: std::env::var("DOH_UPSTREAM_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok()),

            stub_listen_address: std::env::var("DOH_STUB_LISTEN_ADDRESS").ok(),
            stub_listen_port: std::env::var("DOH_STUB_LISTEN_PORT")
                .ok()
                .and_then(|v| v.parse().ok()),
            stub_domain: std::env::var("DOH_STUB_DOMAIN").ok(),
            stub_remote_address: std::env::var("DOH_STUB_REMOTE_ADDRESS").ok(),
            stub_remote_port: std::env::var("DOH_STUB_REMOTE_PORT")
                .ok()
                .and_then(|v| v.parse().ok()),
            stub_uri: std::env::var("DOH_STUB_URI").ok(),
            stub_post: std::env::var("DOH_STUB_POST")
                .ok()
                .and_then(|v| v.parse().ok()),
            stub_insecure: std::env::var("DOH_STUB_INSECURE")
                .ok()
                .and_then(|v| v.parse().ok()),
            stub_ca_file: std::env::var("DOH_STUB_CA_FILE").ok().map(PathBuf::from),

            trusted_proxies: std::env::var("DOH_TRUSTED_PROXIES")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect()),
            verbose_errors: std::env::var("DOH_VERBOSE_ERRORS")
                .ok()
                .and_then(|v| v.parse().ok()),

            log_path: std::env::var("LOG_PATH").ok().map(PathBuf::from),
            log_level: std::env::var("LOG_LEVEL").ok(),
            log_max_size: std::env::var("LOG_MAX_SIZE").ok().and_then(|v| v.parse().ok()),
            log_retention_days: std::env::var("LOG_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<PartialConfig> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let config: PartialConfig =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;
        Ok(config)
    }

    /// Merge a partial config into a full config, field by field
    pub fn merge_config(config: &mut AppConfig, partial: PartialConfig) {
        if let Some(v) = partial.server_listen {
            config.server_listen = v;
        }
        if let Some(v) = partial.server_endpoint_path {
            config.server_endpoint_path = v;
        }
        if let Some(v) = partial.server_cert_path {
            config.server_cert_path = v;
        }
        if let Some(v) = partial.server_key_path {
            config.server_key_path = v;
        }
        if let Some(v) = partial.tls_ciphers {
            config.tls_ciphers = v;
        }
        if let Some(v) = partial.upstream_dns_host {
            config.upstream_dns_host = v;
        }
        if let Some(v) = partial.upstream_dns_port {
            config.upstream_dns_port = v;
        }
        if let Some(v) = partial.upstream_query_timeout_ms {
            config.upstream_query_timeout_ms = v;
        }
        if let Some(v) = partial.stub_listen_address {
            config.stub_listen_address = v;
        }
        if let Some(v) = partial.stub_listen_port {
            config.stub_listen_port = v;
        }
        if let Some(v) = partial.stub_domain {
            config.stub_domain = v;
        }
        if let Some(v) = partial.stub_remote_address {
            config.stub_remote_address = Some(v);
        }
        if let Some(v) = partial.stub_remote_port {
            config.stub_remote_port = v;
        }
        if let Some(v) = partial.stub_uri {
            config.stub_uri = v;
        }
        if let Some(v) = partial.stub_post {
            config.stub_post = v;
        }
        if let Some(v) = partial.stub_insecure {
            config.stub_insecure = v;
        }
        if let Some(v) = partial.stub_ca_file {
            config.stub_ca_file = Some(v);
        }
        if let Some(v) = partial.trusted_proxies {
            config.trusted_proxies = v;
        }
        if let Some(v) = partial.verbose_errors {
            config.verbose_errors = v;
        }
        if let Some(v) = partial.log_path {
            config.log_path = v;
        }
        if let Some(v) = partial.log_level {
            config.log_level = v;
        }
        if let Some(v) = partial.log_max_size {
            config.log_max_size = v;
        }
        if let Some(v) = partial.log_retention_days {
            config.log_retention_days = v;
        }
    }
}
