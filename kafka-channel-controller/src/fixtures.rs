use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cache::{CredentialSource, NamespaceCache, NamespaceCredentials, NamespaceRecord};
use crate::kafka::{AdminConnector, BrokerAdmin};

/// A credential source serving a fixed set of records.
#[derive(Default)]
pub struct StaticCredentialSource {
    pub records: Mutex<Vec<NamespaceRecord>>,
    pub fail: Mutex<bool>,
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn fetch(&self) -> Result<Vec<NamespaceRecord>> {
        if *self.fail.lock() {
            bail!("credential source unavailable");
        }
        Ok(self.records.lock().clone())
    }
}

/// An in-memory broker shared by all namespaces, keyed by namespace name.
#[derive(Default)]
pub struct InMemoryBrokers {
    pub topics: Mutex<HashMap<String, Vec<String>>>,
    /// Namespaces whose topic listing fails.
    pub failing_list: Mutex<Vec<String>>,
    /// Topics whose creation fails.
    pub failing_create: Mutex<Vec<String>>,
}

/// A connector handing out admin clients over `InMemoryBrokers`.
pub struct InMemoryConnector {
    pub brokers: Arc<InMemoryBrokers>,
}

#[async_trait]
impl AdminConnector for InMemoryConnector {
    async fn connect(&self, namespace: &str, _credentials: &NamespaceCredentials) -> Result<Arc<dyn BrokerAdmin>> {
        Ok(Arc::new(InMemoryAdmin {
            namespace: namespace.into(),
            brokers: self.brokers.clone(),
        }))
    }
}

struct InMemoryAdmin {
    namespace: String,
    brokers: Arc<InMemoryBrokers>,
}

#[async_trait]
impl BrokerAdmin for InMemoryAdmin {
    async fn list_topics(&self) -> Result<Vec<String>> {
        if self.brokers.failing_list.lock().contains(&self.namespace) {
            bail!("broker unavailable");
        }
        Ok(self.brokers.topics.lock().get(&self.namespace).cloned().unwrap_or_default())
    }

    async fn create_topic(&self, topic: &str, _num_partitions: i32, _replication_factor: i16) -> Result<()> {
        if self.brokers.failing_create.lock().iter().any(|name| name == topic) {
            bail!("topic creation rejected");
        }
        let mut topics = self.brokers.topics.lock();
        let ns_topics = topics.entry(self.namespace.clone()).or_default();
        if !ns_topics.iter().any(|name| name == topic) {
            ns_topics.push(topic.into());
        }
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        if let Some(ns_topics) = self.brokers.topics.lock().get_mut(&self.namespace) {
            ns_topics.retain(|name| name != topic);
        }
        Ok(())
    }
}

/// Build a valid credential record for the given namespace.
pub fn record(namespace: &str) -> NamespaceRecord {
    NamespaceRecord {
        source: format!("kafka-secret-{}", namespace),
        brokers: "broker-0:9093,broker-1:9093".into(),
        username: "$ConnectionString".into(),
        password: "secret".into(),
        namespace: namespace.into(),
    }
}

/// Build a cache over the given namespaces, each seeded with the given number of topics.
pub async fn setup_cache(namespaces: &[(&str, usize)], max_topics: usize) -> Result<(Arc<NamespaceCache>, Arc<StaticCredentialSource>, Arc<InMemoryBrokers>)> {
    let source = Arc::new(StaticCredentialSource::default());
    let brokers = Arc::new(InMemoryBrokers::default());
    for (namespace, count) in namespaces {
        source.records.lock().push(record(namespace));
        let topics = (0..*count).map(|offset| format!("{}-topic-{}", namespace, offset)).collect();
        brokers.topics.lock().insert(namespace.to_string(), topics);
    }
    let connector = Arc::new(InMemoryConnector { brokers: brokers.clone() });
    let cache = Arc::new(NamespaceCache::new(source.clone(), connector, max_topics));
    cache.update().await?;
    Ok((cache, source, brokers))
}
