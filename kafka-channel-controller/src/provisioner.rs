//! Broker topic provisioning for channels.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cache::NamespaceCache;
use kafka_channel_core::crd::{ChannelCondition, KafkaChannel, CONDITION_READY, CONDITION_TOPIC_READY};

/// The condition reason used when no namespace is able to host a new topic.
pub const REASON_CAPACITY_EXHAUSTED: &str = "NamespaceCapacityExhausted";

/// The provisioning state of a channel's topic.
#[derive(Clone, Debug, PartialEq)]
pub enum TopicState {
    /// The topic exists in the given namespace.
    Ready { namespace: String },
    /// No namespace has capacity for the topic.
    NoCapacity,
}

impl TopicState {
    /// The channel conditions which reflect this state.
    pub fn conditions(&self, topic: &str) -> Vec<ChannelCondition> {
        match self {
            Self::Ready { .. } => vec![ChannelCondition::ready(CONDITION_TOPIC_READY), ChannelCondition::ready(CONDITION_READY)],
            Self::NoCapacity => {
                let message = format!("no Kafka namespace has capacity for topic {}", topic);
                vec![
                    ChannelCondition::not_ready(CONDITION_TOPIC_READY, REASON_CAPACITY_EXHAUSTED, message.clone()),
                    ChannelCondition::not_ready(CONDITION_READY, REASON_CAPACITY_EXHAUSTED, message),
                ]
            }
        }
    }
}

/// Creates & deletes channel topics within the namespaces of the cache.
#[derive(Clone)]
pub struct TopicProvisioner {
    cache: Arc<NamespaceCache>,
}

impl TopicProvisioner {
    /// Create a new instance.
    pub fn new(cache: Arc<NamespaceCache>) -> Self {
        Self { cache }
    }

    /// Ensure the topic of the given channel exists in some namespace.
    #[tracing::instrument(level = "debug", skip(self, channel))]
    pub async fn ensure_topic(&self, channel: &KafkaChannel) -> Result<TopicState> {
        let topic = channel.topic_name();
        if let Some(namespace) = self.cache.get_namespace(&topic) {
            return Ok(TopicState::Ready {
                namespace: namespace.name().into(),
            });
        }

        let namespace = match self.cache.get_namespace_with_max_capacity() {
            Some(namespace) => namespace,
            None => return Ok(TopicState::NoCapacity),
        };
        tracing::info!(%topic, namespace = namespace.name(), "creating topic");
        namespace
            .admin()
            .create_topic(&topic, channel.spec.num_partitions, channel.spec.replication_factor)
            .await
            .with_context(|| format!("error creating topic {} in namespace {}", topic, namespace.name()))?;
        self.cache.add_topic(&topic, Some(namespace.as_ref()));
        Ok(TopicState::Ready {
            namespace: namespace.name().into(),
        })
    }

    /// Delete the topic of the given channel, releasing its namespace's capacity.
    ///
    /// A topic unknown to the cache has nothing to release.
    #[tracing::instrument(level = "debug", skip(self, channel))]
    pub async fn delete_topic(&self, channel: &KafkaChannel) -> Result<()> {
        let topic = channel.topic_name();
        let namespace = match self.cache.get_namespace(&topic) {
            Some(namespace) => namespace,
            None => {
                tracing::debug!(%topic, "topic not known to any namespace, nothing to delete");
                return Ok(());
            }
        };
        tracing::info!(%topic, namespace = namespace.name(), "deleting topic");
        namespace
            .admin()
            .delete_topic(&topic)
            .await
            .with_context(|| format!("error deleting topic {} from namespace {}", topic, namespace.name()))?;
        self.cache.remove_topic(&topic);
        Ok(())
    }
}
