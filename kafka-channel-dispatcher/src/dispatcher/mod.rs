//! Subscription dispatcher.
//!
//! A dispatcher owns the consumer processes of a single channel, one per subscription. The only
//! way to change the set of running consumers is `converge`, which diffs a desired set of
//! subscriptions against the running set by consumer group & starts or stops consumers as needed.
//!
//! Each start/stop operation of a converge call runs concurrently with the others. A failed
//! operation only affects its own subscription: a failed start leaves the subscription out of the
//! running set, a failed stop leaves it in, so either way the next converge call retries it.

mod consumer;
#[cfg(test)]
mod mod_test;

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};

use crate::error::ConvergeError;
use kafka_channel_core::crd::SubscriberSpec;

pub use consumer::KafkaConsumers;

const METRIC_CONVERGE_ERRORS: &str = "kafka_channel_dispatcher_converge_errors";

/// A subscriber's attachment to a channel: where to deliver & which consumer group delivers.
///
/// Identity is the consumer group alone. Two subscriptions of the same subscriber are equal even
/// when their URIs differ.
#[derive(Clone, Debug)]
pub struct Subscription {
    uri: String,
    group_id: String,
}

impl Subscription {
    /// Create a new instance for the subscriber with the given UID.
    pub fn new(uid: &str, uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            group_id: kafka_channel_core::consumer_group_id(uid),
        }
    }

    /// Build the subscription of the given declared subscriber.
    pub fn from_subscriber(subscriber: &SubscriberSpec) -> Self {
        Self::new(&subscriber.uid, subscriber.subscriber_uri.as_str())
    }

    /// The destination URI of this subscription.
    pub fn uri(&self) -> &str {
        self.uri.as_str()
    }

    /// The consumer group ID of this subscription.
    pub fn group_id(&self) -> &str {
        self.group_id.as_str()
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.group_id == other.group_id
    }
}

impl Eq for Subscription {}

impl Hash for Subscription {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.group_id.hash(state);
    }
}

/// The subscriptions which failed to converge, along with their error.
pub type ConvergeFailures = HashMap<Subscription, ConvergeError>;

/// Control over the lifecycle of consumer processes.
#[async_trait]
pub trait ConsumerControl: Send + Sync + 'static {
    /// Start a consumer for the given group, delivering to the given URI.
    ///
    /// Returns once the consumer is live.
    async fn start(&self, group_id: &str, uri: &str) -> Result<()>;

    /// Stop the consumer of the given group.
    ///
    /// Returns once the consumer has terminated. Stopping an unknown group is not an error.
    async fn stop(&self, group_id: &str) -> Result<()>;
}

/// A single lifecycle operation computed by a converge call.
#[derive(Debug)]
enum Operation {
    Start(Subscription),
    Stop(Subscription),
    /// The subscription's URI changed, its consumer must be replaced.
    Restart { old: Subscription, new: Subscription },
}

/// The owner of all consumer processes of a channel.
pub struct Dispatcher {
    /// The `namespace/name` key of the channel this dispatcher serves.
    channel_key: String,
    /// The consumer process control.
    consumers: Arc<dyn ConsumerControl>,
    /// All subscriptions backed by a running consumer, by consumer group.
    active: Mutex<HashMap<String, Subscription>>,
}

impl Dispatcher {
    /// Create a new instance.
    pub fn new(channel_key: String, consumers: Arc<dyn ConsumerControl>) -> Self {
        metrics::register_counter!(METRIC_CONVERGE_ERRORS, metrics::Unit::Count, "subscriptions which failed to converge");
        Self {
            channel_key,
            consumers,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// The key of the channel this dispatcher serves.
    pub fn channel_key(&self) -> &str {
        self.channel_key.as_str()
    }

    /// Converge the running consumers to the given desired subscriptions.
    ///
    /// Operations still pending when the deadline passes are reported as cancelled. Only one
    /// converge call is in flight at any time.
    #[tracing::instrument(level = "debug", skip(self, desired, deadline), fields(channel = %self.channel_key))]
    pub async fn converge(&self, desired: &[Subscription], deadline: Instant) -> ConvergeFailures {
        let mut active = self.active.lock().await;

        let desired: HashMap<&str, &Subscription> = desired.iter().map(|sub| (sub.group_id(), sub)).collect();
        let mut ops = vec![];
        for (group_id, sub) in desired.iter() {
            match active.get(*group_id) {
                None => ops.push(Operation::Start((*sub).clone())),
                Some(current) if current.uri() != sub.uri() => ops.push(Operation::Restart {
                    old: current.clone(),
                    new: (*sub).clone(),
                }),
                Some(_) => (),
            }
        }
        for (group_id, current) in active.iter() {
            if !desired.contains_key(group_id.as_str()) {
                ops.push(Operation::Stop(current.clone()));
            }
        }
        if ops.is_empty() {
            return ConvergeFailures::new();
        }

        tracing::debug!(operations = ops.len(), "converging subscriptions");
        let outcomes = join_all(ops.into_iter().map(|op| self.apply(op, deadline))).await;

        let mut failures = ConvergeFailures::new();
        for (op, res) in outcomes {
            match (op, res) {
                (Operation::Start(sub), Ok(())) | (Operation::Restart { new: sub, .. }, Ok(())) => {
                    active.insert(sub.group_id().into(), sub);
                }
                (Operation::Stop(sub), Ok(())) => {
                    active.remove(sub.group_id());
                }
                (Operation::Restart { new, .. }, Err(err @ ConvergeError::Start { .. })) => {
                    // The old consumer is gone, the new one never came up.
                    active.remove(new.group_id());
                    failures.insert(new, err);
                }
                (Operation::Start(sub), Err(err)) | (Operation::Stop(sub), Err(err)) | (Operation::Restart { new: sub, .. }, Err(err)) => {
                    failures.insert(sub, err);
                }
            }
        }
        for (sub, err) in failures.iter() {
            tracing::error!(group_id = sub.group_id(), uri = sub.uri(), error = %err, "subscription failed to converge");
            metrics::increment_counter!(METRIC_CONVERGE_ERRORS);
        }
        failures
    }

    /// Apply a single operation, bounded by the given deadline.
    async fn apply(&self, op: Operation, deadline: Instant) -> (Operation, Result<(), ConvergeError>) {
        let res = match &op {
            Operation::Start(sub) => timeout_at(deadline, self.start(sub)).await,
            Operation::Stop(sub) => timeout_at(deadline, self.stop(sub)).await,
            Operation::Restart { old, new } => {
                timeout_at(deadline, async {
                    tracing::info!(group_id = new.group_id(), old_uri = old.uri(), new_uri = new.uri(), "subscription URI changed, restarting consumer");
                    self.stop(old).await?;
                    self.start(new).await
                })
                .await
            }
        };
        let res = match res {
            Ok(res) => res,
            Err(_elapsed) => {
                let group_id = match &op {
                    Operation::Start(sub) | Operation::Stop(sub) | Operation::Restart { new: sub, .. } => sub.group_id().to_string(),
                };
                Err(ConvergeError::Cancelled { group_id })
            }
        };
        (op, res)
    }

    async fn start(&self, sub: &Subscription) -> Result<(), ConvergeError> {
        tracing::info!(group_id = sub.group_id(), uri = sub.uri(), "starting consumer");
        self.consumers
            .start(sub.group_id(), sub.uri())
            .await
            .map_err(|error| ConvergeError::Start {
                group_id: sub.group_id().into(),
                error,
            })
    }

    async fn stop(&self, sub: &Subscription) -> Result<(), ConvergeError> {
        tracing::info!(group_id = sub.group_id(), "stopping consumer");
        self.consumers.stop(sub.group_id()).await.map_err(|error| ConvergeError::Stop {
            group_id: sub.group_id().into(),
            error,
        })
    }

    /// A snapshot of all subscriptions backed by a running consumer.
    pub async fn active(&self) -> Vec<Subscription> {
        self.active.lock().await.values().cloned().collect()
    }

    /// Stop all consumers, bounded by the given deadline.
    pub async fn shutdown(&self, deadline: Instant) {
        let failures = self.converge(&[], deadline).await;
        if !failures.is_empty() {
            tracing::error!(count = failures.len(), "some consumers failed to stop during shutdown");
        }
    }
}
