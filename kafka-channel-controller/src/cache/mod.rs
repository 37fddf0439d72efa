//! Broker namespace capacity cache.
//!
//! Each broker namespace has its own credentials and may only host a bounded number of topics.
//! This cache tracks all known namespaces along with the topics they host, and is used to decide
//! which namespace a new channel topic should be created in.
//!
//! Both mappings & all topic counts are guarded by a single lock, so every mutation, as well as
//! the capacity selection scan, observes & leaves the cache in a consistent state. A full `update`
//! builds a complete replacement off to the side and swaps it in at the end, so a failed or
//! cancelled update leaves the cache untouched, and `Namespace` handles already given out remain
//! valid.

mod namespace;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::kafka::AdminConnector;
pub use namespace::{Namespace, NamespaceCredentials, NamespaceRecord};

/// A source of broker namespace credentials.
#[async_trait]
pub trait CredentialSource: Send + Sync + 'static {
    /// Fetch the credential records of all broker namespaces.
    async fn fetch(&self) -> Result<Vec<NamespaceRecord>>;
}

/// A cache of broker namespaces & the topics they host.
pub struct NamespaceCache {
    /// The source of namespace credentials.
    source: Arc<dyn CredentialSource>,
    /// The builder of per-namespace admin clients.
    connector: Arc<dyn AdminConnector>,
    /// The maximum number of topics a namespace may host.
    max_topics: usize,
    /// The cache contents.
    state: Mutex<CacheState>,
}

/// The contents of the cache.
#[derive(Default)]
struct CacheState {
    /// Namespaces by name, along with their topic count.
    namespaces: HashMap<String, NamespaceEntry>,
    /// The owning namespace of each known topic.
    topics: HashMap<String, Arc<Namespace>>,
}

struct NamespaceEntry {
    namespace: Arc<Namespace>,
    count: usize,
}

impl NamespaceCache {
    /// Create a new empty instance.
    pub fn new(source: Arc<dyn CredentialSource>, connector: Arc<dyn AdminConnector>, max_topics: usize) -> Self {
        Self {
            source,
            connector,
            max_topics,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// The maximum number of topics a namespace may host.
    pub fn max_topics(&self) -> usize {
        self.max_topics
    }

    /// Rebuild the cache from the credential source & the brokers of each namespace.
    ///
    /// Any invalid credential record, or any error fetching credentials or listing topics, will
    /// abort the update, leaving the cache as it was.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn update(&self) -> Result<()> {
        let records = self.source.fetch().await.context("error fetching Kafka secrets")?;

        let mut state = CacheState::default();
        for record in records {
            let (name, credentials) = record.validate()?;
            let admin = self
                .connector
                .connect(&name, &credentials)
                .await
                .with_context(|| format!("error connecting to namespace {}", name))?;
            let topics: HashSet<String> = admin
                .list_topics()
                .await
                .with_context(|| format!("error listing topics in namespace {}", name))?
                .into_iter()
                .collect();

            let namespace = Arc::new(Namespace::new(name, credentials, admin));
            let mut count = 0;
            for topic in topics {
                // A topic name should be unique across namespaces; if not, the last listing wins.
                if let Some(prev) = state.topics.insert(topic, namespace.clone()) {
                    if let Some(prev_entry) = state.namespaces.get_mut(prev.name()) {
                        prev_entry.count = prev_entry.count.saturating_sub(1);
                    }
                }
                count += 1;
            }
            if count > self.max_topics {
                tracing::warn!(namespace = namespace.name(), count, max = self.max_topics, "namespace hosts more topics than allowed");
            }
            state.namespaces.insert(namespace.name().to_string(), NamespaceEntry { namespace, count });
        }

        tracing::info!(
            namespaces = ?state.namespace_names(),
            topics = ?state.topic_names(),
            "updating namespace cache",
        );
        *self.state.lock() = state;
        Ok(())
    }

    /// Record the given topic as hosted by the given namespace.
    ///
    /// This is a no-op if no namespace is given, if the namespace is not known to the cache, or if
    /// the namespace is already at capacity.
    pub fn add_topic(&self, topic: &str, namespace: Option<&Namespace>) {
        let namespace = match namespace {
            Some(namespace) => namespace,
            None => return,
        };
        let mut state = self.state.lock();
        let state = &mut *state;
        let entry = match state.namespaces.get_mut(namespace.name()) {
            Some(entry) => entry,
            None => {
                tracing::debug!(topic, namespace = namespace.name(), "namespace unknown to cache, topic not recorded");
                return;
            }
        };
        if let Some(owner) = state.topics.get(topic) {
            if owner.name() == namespace.name() {
                return;
            }
        }
        if entry.count >= self.max_topics {
            tracing::debug!(topic, namespace = namespace.name(), "namespace at capacity, topic not recorded");
            return;
        }
        entry.count += 1;
        let owner = entry.namespace.clone();
        if let Some(prev) = state.topics.insert(topic.into(), owner) {
            if let Some(prev_entry) = state.namespaces.get_mut(prev.name()) {
                prev_entry.count = prev_entry.count.saturating_sub(1);
            }
        }
    }

    /// Remove the given topic from the cache, releasing its namespace's capacity.
    pub fn remove_topic(&self, topic: &str) {
        let mut state = self.state.lock();
        if let Some(owner) = state.topics.remove(topic) {
            if let Some(entry) = state.namespaces.get_mut(owner.name()) {
                entry.count = entry.count.saturating_sub(1);
            }
        }
    }

    /// Get the namespace which hosts the given topic.
    pub fn get_namespace(&self, topic: &str) -> Option<Arc<Namespace>> {
        self.state.lock().topics.get(topic).cloned()
    }

    /// Get the namespace with the most available capacity, if any namespace has capacity.
    ///
    /// Ties between equally loaded namespaces are broken arbitrarily.
    pub fn get_namespace_with_max_capacity(&self) -> Option<Arc<Namespace>> {
        let state = self.state.lock();
        let mut selected: Option<&NamespaceEntry> = None;
        for entry in state.namespaces.values() {
            if entry.count >= self.max_topics {
                continue;
            }
            if selected.map(|current| entry.count < current.count).unwrap_or(true) {
                selected = Some(entry);
            }
            // Can't do better than an empty namespace.
            if entry.count == 0 {
                break;
            }
        }

        match selected {
            Some(entry) => {
                tracing::info!(
                    namespace = entry.namespace.name(),
                    capacity = self.max_topics - entry.count,
                    "max capacity namespace lookup",
                );
                Some(entry.namespace.clone())
            }
            None => {
                tracing::warn!("found no namespace with available capacity");
                None
            }
        }
    }

    /// The number of topics hosted by the given namespace, if the namespace is known.
    pub fn topic_count(&self, namespace: &str) -> Option<usize> {
        self.state.lock().namespaces.get(namespace).map(|entry| entry.count)
    }

    /// The number of namespaces known to the cache.
    pub fn namespace_count(&self) -> usize {
        self.state.lock().namespaces.len()
    }
}

impl CacheState {
    /// Summarize all namespaces as `name (count)`.
    fn namespace_names(&self) -> Vec<String> {
        self.namespaces
            .iter()
            .map(|(name, entry)| format!("{} ({})", name, entry.count))
            .collect()
    }

    /// Summarize all topics as `topic -> namespace`.
    fn topic_names(&self) -> Vec<String> {
        self.topics
            .iter()
            .map(|(topic, namespace)| format!("{} -> {}", topic, namespace.name()))
            .collect()
    }
}
