// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! Echo server configuration.

use rustls::{Certificate, PrivateKey};

use sloggers::terminal::TerminalLoggerBuilder;
use sloggers::Build;

use std::convert::TryFrom;
use std::time::Duration;

use crate::error::WrapError;
use crate::metrics::MetricsConfig;
use crate::reactor;

fn get_metrics_config(settings: &config::Config) -> Option<MetricsConfig> {
    let mut metrics = None;
    if let Ok(addr) = settings.get_str("metrics_addr") {
        if let Ok(port) = settings.get_int("metrics_port") {
            metrics = Some(MetricsConfig {
                port: port as u16,
                addr,
            });
        }
    }
    metrics
}

/// Read an optional non-negative integer key, failing only when the key is present but bad.
fn get_optional_seconds(
    settings: &config::Config,
    key: &str,
) -> Result<Option<u64>, config::ConfigError> {
    match settings.get_int(key) {
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(error) => Err(error),
        Ok(value) => match u64::try_from(value) {
            Ok(value) => Ok(Some(value)),
            Err(_) => Err(config::ConfigError::Message(format!(
                "{} is not a valid u64",
                key
            ))),
        },
    }
}

/// Configuration for running the echo server.
pub struct EchoServerConfig {
    pub addrs: Vec<String>,

    /// Begin TLS immediately on accept instead of waiting for STARTTLS.
    pub direct_tls: bool,

    /// Optional reactor timeout overrides, in seconds.
    pub read_timeout: Option<u64>,
    pub send_timeout: Option<u64>,
    pub connect_timeout: Option<u64>,

    /// The logger used throughout while the server is running.
    logger: slog::Logger,

    /// Runtime data directory; the `READY=1` notification socket lives here.
    pub data_dir: Option<String>,

    pub metrics_config: Option<MetricsConfig>,
    pub tls_certs: Vec<Certificate>,
    pub tls_secret_keys: Vec<PrivateKey>,
}

impl EchoServerConfig {
    /// Set a new logger to the config.
    pub fn set_logger(&mut self, logger: slog::Logger) {
        self.logger = logger;
    }

    /// Return the logger of the config.
    pub fn logger(&self) -> &slog::Logger {
        &self.logger
    }

    /// Derive the reactor tunables from the defaults plus any file overrides.
    pub fn reactor_config(&self) -> reactor::Config {
        let mut config = reactor::Config::default();
        if let Some(secs) = self.read_timeout {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.send_timeout {
            config.send_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.connect_timeout {
            config.connect_timeout = Duration::from_secs(secs);
        }
        config
    }

    /// Parse a config from a file.
    ///
    /// # Errors
    ///
    /// Returns `config::ConfigError` for unreadable or unparsable settings; errors from the
    /// TLS material files are wrapped into `ConfigError::Foreign`.
    pub fn parse(filename: &str) -> Result<EchoServerConfig, config::ConfigError> {
        let mut settings = config::Config::new();
        settings.merge(config::File::with_name(filename))?;

        let read_timeout = get_optional_seconds(&settings, "read_timeout")?;
        let send_timeout = get_optional_seconds(&settings, "send_timeout")?;
        let connect_timeout = get_optional_seconds(&settings, "connect_timeout")?;

        let direct_tls = settings.get_bool("direct_tls").unwrap_or(false);
        let data_dir = settings.get_str("data_dir").ok();
        let metrics_config = get_metrics_config(&settings);

        // TLS material is optional: a plaintext echo server is a valid configuration. When one
        // of the two files is given, the other must be too.
        let certs_filename = settings.get_str("tls_cert_file").ok();
        let keys_filename = settings.get_str("tls_key_file").ok();
        let (tls_certs, tls_secret_keys) = match (certs_filename, keys_filename) {
            (Some(certs_filename), Some(keys_filename)) => {
                let certs = reactor::load_certs(&certs_filename).wrap_err()?;
                let key = reactor::load_private_key(&keys_filename).wrap_err()?;
                (certs, vec![key])
            }
            (None, None) => (Vec::new(), Vec::new()),
            _ => {
                return Err(config::ConfigError::Message(String::from(
                    "tls_cert_file and tls_key_file must be given together",
                )));
            }
        };

        let mut addrs = Vec::new();
        for addr in settings.get_array("addr")? {
            addrs.push(addr.to_string());
        }

        Ok(EchoServerConfig {
            addrs,
            direct_tls,
            read_timeout,
            send_timeout,
            connect_timeout,
            // Use a terminal logger as a default. The caller overrides it with a child of the
            // global logger via `set_logger`.
            logger: TerminalLoggerBuilder::new()
                .build()
                .expect("BUG: TerminalLoggerBuilder::build shouldn't return an error."),
            data_dir,
            metrics_config,
            tls_certs,
            tls_secret_keys,
        })
    }
}
