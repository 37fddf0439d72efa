//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// The dispatcher's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for healthchecks & metrics.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// The `namespace/name` key of the channel served by this dispatcher.
    pub channel_key: String,
    /// The Kubernetes namespace of the channel.
    ///
    /// This value is derived from the `channel_key` value.
    #[serde(skip, default)]
    pub namespace: String,
    /// The name of the channel.
    ///
    /// This value is derived from the `channel_key` value.
    #[serde(skip, default)]
    pub channel: String,

    /// The comma-separated broker addresses of the channel's Kafka namespace.
    pub kafka_brokers: String,
    /// The SASL username of the channel's Kafka namespace.
    pub kafka_username: String,
    /// The SASL password of the channel's Kafka namespace.
    pub kafka_password: String,
    /// The topic backing the channel, defaults to the channel's canonical topic name.
    #[serde(default)]
    pub kafka_topic: Option<String>,
    /// The maximum time in milliseconds the broker may wait to fill a fetch response.
    #[serde(default = "Config::default_fetch_max_wait_millis")]
    pub fetch_max_wait_millis: i32,

    /// The time in seconds a single convergence of subscriptions may take.
    #[serde(default = "Config::default_converge_timeout_seconds")]
    pub converge_timeout_seconds: u64,
    /// The number of attempts made to deliver a single message to a subscriber.
    #[serde(default = "Config::default_delivery_max_attempts")]
    pub delivery_max_attempts: u32,
    /// The linear backoff step in milliseconds between delivery attempts.
    #[serde(default = "Config::default_delivery_backoff_millis")]
    pub delivery_backoff_millis: u64,
    /// The timeout in seconds of a single delivery request.
    #[serde(default = "Config::default_delivery_timeout_seconds")]
    pub delivery_timeout_seconds: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.with_derived_fields()
    }

    /// Derive the channel namespace & name from the channel key.
    pub fn with_derived_fields(mut self) -> Result<Self> {
        let (namespace, channel) = kafka_channel_core::split_object_key(&self.channel_key)
            .map(|(namespace, channel)| (namespace.to_string(), channel.to_string()))
            .context("invalid channel key, expected the form namespace/name")?;
        self.namespace = namespace;
        self.channel = channel;
        Ok(self)
    }

    /// The broker addresses of the channel's Kafka namespace.
    pub fn brokers(&self) -> Vec<String> {
        self.kafka_brokers
            .split(',')
            .map(|broker| broker.trim())
            .filter(|broker| !broker.is_empty())
            .map(String::from)
            .collect()
    }

    /// The topic backing the channel.
    pub fn topic(&self) -> String {
        self.kafka_topic
            .clone()
            .unwrap_or_else(|| kafka_channel_core::topic_name(&self.namespace, &self.channel))
    }

    /// The time a single convergence of subscriptions may take.
    pub fn converge_timeout(&self) -> Duration {
        Duration::from_secs(self.converge_timeout_seconds)
    }

    fn default_metrics_port() -> u16 {
        9090
    }

    fn default_fetch_max_wait_millis() -> i32 {
        500
    }

    fn default_converge_timeout_seconds() -> u64 {
        30
    }

    fn default_delivery_max_attempts() -> u32 {
        5
    }

    fn default_delivery_backoff_millis() -> u64 {
        500
    }

    fn default_delivery_timeout_seconds() -> u64 {
        10
    }
}
