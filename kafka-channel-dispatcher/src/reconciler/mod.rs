//! Channel reconciler.
//!
//! Each reconcile loads the channel served by this process, converges the dispatcher to the
//! channel's declared subscribers & publishes the readiness of every subscriber in the channel's
//! status. The status is only written when it actually changed.

mod k8s;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::Instant;

use crate::dispatcher::{ConvergeFailures, Dispatcher, Subscription};
use kafka_channel_core::crd::{ConditionStatus, KafkaChannel, SubscriberStatus, CONDITION_TOPIC_READY};
use kafka_channel_core::AppError;

pub use k8s::{KubeChannelStore, KubeEventRecorder};

/// The event reason of a successful reconcile.
pub const REASON_CHANNEL_RECONCILED: &str = "ChannelReconciled";
/// The event reason of a reconcile in which some subscriptions failed to converge.
pub const REASON_CHANNEL_RECONCILE_FAILED: &str = "ChannelReconcileFailed";
/// The event reason of a reconcile which failed to write the channel's status.
pub const REASON_CHANNEL_UPDATE_STATUS_FAILED: &str = "ChannelUpdateStatusFailed";

/// The storage of channel resources.
#[async_trait]
pub trait ChannelStore: Send + Sync + 'static {
    /// Get the given channel, returning `None` if it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<KafkaChannel>>;

    /// Write the status of the given channel.
    async fn update_status(&self, channel: &KafkaChannel) -> Result<KafkaChannel>;
}

/// The type of a recorded event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// A recorder of events about channels.
#[async_trait]
pub trait EventRecorder: Send + Sync + 'static {
    /// Record an event about the given channel.
    async fn record(&self, channel: &KafkaChannel, type_: EventType, reason: &str, message: String) -> Result<()>;
}

/// The reconciler of the channel served by this process.
pub struct ChannelReconciler {
    /// The `namespace/name` key of the channel served by this process.
    channel_key: String,
    store: Arc<dyn ChannelStore>,
    recorder: Arc<dyn EventRecorder>,
    dispatcher: Arc<Dispatcher>,
    /// The time a single convergence may take.
    converge_timeout: Duration,
}

impl ChannelReconciler {
    /// Create a new instance.
    pub fn new(store: Arc<dyn ChannelStore>, recorder: Arc<dyn EventRecorder>, dispatcher: Arc<Dispatcher>, converge_timeout: Duration) -> Self {
        Self {
            channel_key: dispatcher.channel_key().to_string(),
            store,
            recorder,
            dispatcher,
            converge_timeout,
        }
    }

    /// Reconcile the channel with the given `namespace/name` key.
    ///
    /// An error is returned when the key should be retried.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn reconcile(&self, key: &str) -> Result<()> {
        let (namespace, name) = match kafka_channel_core::split_object_key(key) {
            Some(parts) => parts,
            None => {
                tracing::error!(key, "invalid resource key, expected the form namespace/name");
                return Ok(());
            }
        };
        if key != self.channel_key {
            tracing::debug!(key, "ignoring channel not served by this dispatcher");
            return Ok(());
        }

        let mut channel = match self.store.get(namespace, name).await? {
            Some(channel) => channel,
            None => {
                tracing::debug!(key, "channel no longer exists");
                return Ok(());
            }
        };
        if !channel.is_topic_ready() {
            return Err(AppError::PreconditionFailed(format!("channel {} does not have a {} condition", key, CONDITION_TOPIC_READY)).into());
        }

        let desired: Vec<Subscription> = channel.subscribers().iter().map(Subscription::from_subscriber).collect();
        let deadline = Instant::now() + self.converge_timeout;
        let failures = self.dispatcher.converge(&desired, deadline).await;

        let failure_message = if failures.is_empty() {
            None
        } else {
            let mut groups: Vec<&str> = failures.keys().map(|sub| sub.group_id()).collect();
            groups.sort_unstable();
            Some(format!("failed to converge subscriptions: {}", groups.join(", ")))
        };

        let old_status = channel.status.clone().unwrap_or_default();
        let mut new_status = old_status.clone();
        new_status.subscribers = subscriber_statuses(&channel, &failures);
        if new_status != old_status {
            channel.status = Some(new_status);
            if let Err(err) = self.store.update_status(&channel).await {
                if let Some(message) = failure_message {
                    self.record(&channel, EventType::Warning, REASON_CHANNEL_RECONCILE_FAILED, message).await;
                }
                let message = format!("failed to update channel status: {:#}", err);
                self.record(&channel, EventType::Warning, REASON_CHANNEL_UPDATE_STATUS_FAILED, message).await;
                return Err(err).context("error updating channel status");
            }
        }

        if let Some(message) = failure_message {
            self.record(&channel, EventType::Warning, REASON_CHANNEL_RECONCILE_FAILED, message.clone()).await;
            anyhow::bail!(message);
        }
        self.record(&channel, EventType::Normal, REASON_CHANNEL_RECONCILED, format!("channel reconciled: {}", key))
            .await;
        Ok(())
    }

    /// Record an event, logging any error.
    async fn record(&self, channel: &KafkaChannel, type_: EventType, reason: &str, message: String) {
        if let Err(err) = self.recorder.record(channel, type_, reason, message).await {
            tracing::error!(error = ?err, reason, "error recording channel event");
        }
    }
}

/// Build the status of every declared subscriber from the outcome of a convergence.
fn subscriber_statuses(channel: &KafkaChannel, failures: &ConvergeFailures) -> Vec<SubscriberStatus> {
    channel
        .subscribers()
        .iter()
        .map(|subscriber| {
            let error = failures.get(&Subscription::from_subscriber(subscriber));
            SubscriberStatus {
                uid: subscriber.uid.clone(),
                observed_generation: subscriber.generation,
                ready: if error.is_some() { ConditionStatus::False } else { ConditionStatus::True },
                message: error.map(|err| err.to_string()),
            }
        })
        .collect()
}
