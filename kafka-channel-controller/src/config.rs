//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The controller's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for healthchecks & metrics.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The Kubernetes namespace holding the Kafka credential Secrets.
    pub namespace: String,
    /// The maximum number of topics a single Kafka namespace may host.
    #[serde(default = "Config::default_max_topics_per_namespace")]
    pub max_topics_per_namespace: usize,
    /// The timeout in seconds applied to each Kafka admin request.
    #[serde(default = "Config::default_kafka_admin_timeout_seconds")]
    pub kafka_admin_timeout_seconds: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    /// The timeout applied to each Kafka admin request.
    pub fn kafka_admin_timeout(&self) -> Duration {
        Duration::from_secs(self.kafka_admin_timeout_seconds)
    }

    fn default_http_port() -> u16 {
        8080
    }

    fn default_max_topics_per_namespace() -> usize {
        10
    }

    fn default_kafka_admin_timeout_seconds() -> u64 {
        10
    }
}
