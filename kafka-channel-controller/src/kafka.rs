//! Broker administration.
//!
//! Each broker namespace has its own credentials, and thus its own admin client. The traits here
//! are what the namespace cache & the topic provisioner are written against; `KafkaAdminConnector`
//! is the production implementation built on `rskafka`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rskafka::client::{Client, ClientBuilder, SaslConfig};
use tokio::time::timeout;

use crate::cache::NamespaceCredentials;

/// The administrative API of a single broker namespace.
#[async_trait]
pub trait BrokerAdmin: Send + Sync + 'static {
    /// List the names of all topics in the namespace.
    async fn list_topics(&self) -> Result<Vec<String>>;

    /// Create the given topic.
    ///
    /// Creating a topic which already exists is not an error.
    async fn create_topic(&self, topic: &str, num_partitions: i32, replication_factor: i16) -> Result<()>;

    /// Delete the given topic.
    ///
    /// Deleting a topic which does not exist is not an error.
    async fn delete_topic(&self, topic: &str) -> Result<()>;
}

/// A type which is able to build a broker admin client from a namespace's credentials.
#[async_trait]
pub trait AdminConnector: Send + Sync + 'static {
    /// Connect to the given broker namespace.
    async fn connect(&self, namespace: &str, credentials: &NamespaceCredentials) -> Result<Arc<dyn BrokerAdmin>>;
}

/// An `AdminConnector` producing `rskafka` backed admin clients using SASL/PLAIN.
pub struct KafkaAdminConnector {
    /// The timeout applied to every admin request.
    timeout: Duration,
}

impl KafkaAdminConnector {
    /// Create a new instance.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl AdminConnector for KafkaAdminConnector {
    #[tracing::instrument(level = "debug", skip(self, credentials))]
    async fn connect(&self, namespace: &str, credentials: &NamespaceCredentials) -> Result<Arc<dyn BrokerAdmin>> {
        let sasl = SaslConfig::Plain { username: credentials.username.clone(), password: credentials.password.clone() };
        let client = timeout(self.timeout, ClientBuilder::new(credentials.brokers.clone()).sasl_config(sasl).build())
            .await
            .with_context(|| format!("timeout while connecting to brokers of namespace {}", namespace))?
            .with_context(|| format!("error connecting to brokers of namespace {}", namespace))?;
        Ok(Arc::new(KafkaAdmin { client, timeout: self.timeout }))
    }
}

/// A broker admin client of a single namespace.
struct KafkaAdmin {
    client: Client,
    timeout: Duration,
}

impl KafkaAdmin {
    /// The admin request timeout as the broker expects it.
    fn timeout_ms(&self) -> i32 {
        self.timeout.as_millis().min(i32::MAX as u128) as i32
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        Ok(self.list_topics().await?.iter().any(|name| name == topic))
    }
}

#[async_trait]
impl BrokerAdmin for KafkaAdmin {
    async fn list_topics(&self) -> Result<Vec<String>> {
        let topics = timeout(self.timeout, self.client.list_topics())
            .await
            .context("timeout while listing topics")?
            .context("error listing topics")?;
        Ok(topics.into_iter().map(|topic| topic.name).collect())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn create_topic(&self, topic: &str, num_partitions: i32, replication_factor: i16) -> Result<()> {
        let controller = self.client.controller_client().context("error building broker controller client")?;
        let res = timeout(self.timeout, controller.create_topic(topic, num_partitions, replication_factor, self.timeout_ms()))
            .await
            .context("timeout while creating topic")?;
        match res {
            Ok(()) => Ok(()),
            // The topic may have been created by a previous attempt which we never heard back from.
            Err(err) => match self.topic_exists(topic).await {
                Ok(true) => Ok(()),
                _ => Err(err).context("error creating topic"),
            },
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_topic(&self, topic: &str) -> Result<()> {
        let controller = self.client.controller_client().context("error building broker controller client")?;
        let res = timeout(self.timeout, controller.delete_topic(topic, self.timeout_ms()))
            .await
            .context("timeout while deleting topic")?;
        match res {
            Ok(()) => Ok(()),
            Err(err) => match self.topic_exists(topic).await {
                Ok(false) => Ok(()),
                _ => Err(err).context("error deleting topic"),
            },
        }
    }
}
