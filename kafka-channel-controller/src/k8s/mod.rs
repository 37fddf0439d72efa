//! Kubernetes controller.
//!
//! This controller observes every KafkaChannel in the cluster & provisions the broker topic
//! backing each channel. Topics are placed in the broker namespace with the most free capacity,
//! as tracked by the namespace cache, and the outcome is published as channel conditions.
//!
//! The namespace cache is rebuilt whenever the watch stream restarts. Channel tasks are held back
//! until the cache has been built at least once, as placement decisions made against an empty
//! cache would be wrong.

#[cfg(test)]
mod mod_test;
mod secrets;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::prelude::*;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::cache::NamespaceCache;
use crate::provisioner::{TopicProvisioner, TopicState};
use kafka_channel_core::crd::{KafkaChannel, RequiredMetadata};

pub use secrets::SecretCredentialSource;

/// The default timeout to use for API calls.
pub(crate) const API_TIMEOUT: Duration = Duration::from_secs(5);
/// The timeout duration used before rescheduling a provisioning task.
const RESCHEDULE_TIMEOUT: Duration = Duration::from_secs(5);

const METRIC_WATCHER_ERRORS: &str = "kafka_channel_controller_watcher_errors";
const METRIC_PROVISION_ERRORS: &str = "kafka_channel_controller_provision_errors";
const METRIC_CACHE_REFRESH_ERRORS: &str = "kafka_channel_controller_cache_refresh_errors";

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// A provisioning task to be performed.
#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum ProvisionTask {
    /// Rebuild the namespace cache.
    RefreshCache,
    /// Ensure the topic of the channel with the given key exists.
    ChannelUpdated(Arc<String>),
    /// Delete the topic of the given channel.
    ChannelDeleted(Arc<String>, KafkaChannel),
}

/// Kubernetes controller for provisioning KafkaChannel topics.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// The namespace cache shared with the provisioner.
    cache: Arc<NamespaceCache>,
    /// The topic provisioner.
    provisioner: TopicProvisioner,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// A channel of provisioning tasks.
    tasks_tx: mpsc::Sender<ProvisionTask>,
    /// A channel of provisioning tasks.
    tasks_rx: ReceiverStream<ProvisionTask>,

    /// All known channels, by `namespace/name` key.
    channels: HashMap<Arc<String>, KafkaChannel>,
    /// Whether the namespace cache has been built since the last watch restart.
    cache_ready: bool,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, cache: Arc<NamespaceCache>, shutdown: broadcast::Receiver<()>) -> Self {
        metrics::register_counter!(METRIC_WATCHER_ERRORS, metrics::Unit::Count, "k8s watcher errors from the channels watcher");
        metrics::register_counter!(METRIC_PROVISION_ERRORS, metrics::Unit::Count, "errors while provisioning channel topics");
        metrics::register_counter!(METRIC_CACHE_REFRESH_ERRORS, metrics::Unit::Count, "errors while rebuilding the namespace cache");
        let (tasks_tx, tasks_rx) = mpsc::channel(1000);
        Self {
            client,
            provisioner: TopicProvisioner::new(cache.clone()),
            cache,
            shutdown_rx: BroadcastStream::new(shutdown),
            tasks_tx,
            tasks_rx: ReceiverStream::new(tasks_rx),
            channels: Default::default(),
            cache_ready: false,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let api: Api<KafkaChannel> = Api::all(self.client.clone());
        let channels_watcher = watcher(api, ListParams::default());
        tokio::pin!(channels_watcher);

        tracing::info!("k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = channels_watcher.next() => self.handle_channel_event(k8s_event_res).await,
                Some(task) = self.tasks_rx.next() => self.handle_task(task).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Handle `KafkaChannel` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_channel_event(&mut self, res: EventResult<KafkaChannel>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from KafkaChannel k8s watcher");
                metrics::increment_counter!(METRIC_WATCHER_ERRORS);
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(channel) => self.channel_applied(channel),
            Event::Deleted(channel) => self.channel_deleted(channel),
            Event::Restarted(channels) => self.channels_restarted(channels).await,
        }
    }

    fn channel_applied(&mut self, channel: KafkaChannel) {
        let key_str = channel.key();
        let key = match self.channels.get_key_value(&key_str) {
            Some((key, old)) => {
                if old == &channel {
                    return;
                }
                Arc::clone(key)
            }
            None => Arc::new(key_str),
        };
        self.channels.insert(key.clone(), channel);
        self.spawn_task(ProvisionTask::ChannelUpdated(key), false);
    }

    fn channel_deleted(&mut self, channel: KafkaChannel) {
        let key = match self.channels.remove_entry(&channel.key()) {
            Some((key, _old)) => key,
            None => Arc::new(channel.key()),
        };
        self.spawn_task(ProvisionTask::ChannelDeleted(key, channel), false);
    }

    /// Handle a full relisting of all channels.
    ///
    /// The namespace cache is rebuilt first, and channels which disappeared while the watch was
    /// down have their topics deleted.
    #[tracing::instrument(level = "debug", skip(self, channels))]
    async fn channels_restarted(&mut self, channels: Vec<KafkaChannel>) {
        tracing::debug!(count = channels.len(), "KafkaChannel watcher restarted");
        self.cache_ready = false;
        self.refresh_cache().await;

        let mut previous = std::mem::take(&mut self.channels);
        for channel in channels {
            let key_str = channel.key();
            let key = match previous.remove_entry(&key_str) {
                Some((key, old)) if old == channel => {
                    self.channels.insert(key, channel);
                    continue;
                }
                Some((key, _old)) => key,
                None => Arc::new(key_str),
            };
            self.channels.insert(key.clone(), channel);
            self.spawn_task(ProvisionTask::ChannelUpdated(key), false);
        }
        for (key, channel) in previous {
            self.spawn_task(ProvisionTask::ChannelDeleted(key, channel), false);
        }
    }

    /// Spawn a task which emits a new provisioning task.
    ///
    /// This keeps the controller loop from dead-locking on its own bounded queue.
    fn spawn_task(&self, task: ProvisionTask, is_retry: bool) {
        let tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            if is_retry {
                tokio::time::sleep(RESCHEDULE_TIMEOUT).await;
            }
            let _res = tx.send(task).await;
        });
    }

    /// Handle provisioning tasks.
    async fn handle_task(&mut self, task: ProvisionTask) {
        match task {
            ProvisionTask::RefreshCache => self.refresh_cache().await,
            ProvisionTask::ChannelUpdated(key) if !self.cache_ready => self.spawn_task(ProvisionTask::ChannelUpdated(key), true),
            ProvisionTask::ChannelDeleted(key, channel) if !self.cache_ready => self.spawn_task(ProvisionTask::ChannelDeleted(key, channel), true),
            ProvisionTask::ChannelUpdated(key) => self.provision_channel(key).await,
            ProvisionTask::ChannelDeleted(key, channel) => self.deprovision_channel(key, channel).await,
        }
    }

    /// Rebuild the namespace cache, rescheduling on failure.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn refresh_cache(&mut self) {
        if self.cache_ready {
            return;
        }
        if let Err(err) = self.cache.update().await {
            tracing::error!(error = ?err, "error updating namespace cache");
            metrics::increment_counter!(METRIC_CACHE_REFRESH_ERRORS);
            self.spawn_task(ProvisionTask::RefreshCache, true);
            return;
        }
        tracing::info!(namespaces = self.cache.namespace_count(), "namespace cache updated");
        self.cache_ready = true;
    }

    #[tracing::instrument(level = "debug", skip(self, key), fields(key = %key))]
    async fn provision_channel(&mut self, key: Arc<String>) {
        let channel = match self.channels.get(&key) {
            Some(channel) => channel.clone(),
            None => return, // Deleted since this task was scheduled.
        };
        let state = match self.provisioner.ensure_topic(&channel).await {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(error = ?err, "error provisioning channel topic");
                metrics::increment_counter!(METRIC_PROVISION_ERRORS);
                self.spawn_task(ProvisionTask::ChannelUpdated(key), true);
                return;
            }
        };
        if let Err(err) = self.patch_conditions(&channel, &state).await {
            tracing::error!(error = ?err, "error updating channel conditions");
            metrics::increment_counter!(METRIC_PROVISION_ERRORS);
            self.spawn_task(ProvisionTask::ChannelUpdated(key), true);
            return;
        }
        if state == TopicState::NoCapacity {
            tracing::warn!(topic = %channel.topic_name(), "no namespace capacity for channel topic, will retry");
            self.spawn_task(ProvisionTask::ChannelUpdated(key), true);
        }
    }

    #[tracing::instrument(level = "debug", skip(self, key, channel), fields(key = %key))]
    async fn deprovision_channel(&mut self, key: Arc<String>, channel: KafkaChannel) {
        // The channel may have been recreated in the meantime.
        if self.channels.contains_key(&key) {
            return;
        }
        if let Err(err) = self.provisioner.delete_topic(&channel).await {
            tracing::error!(error = ?err, "error deleting channel topic");
            metrics::increment_counter!(METRIC_PROVISION_ERRORS);
            self.spawn_task(ProvisionTask::ChannelDeleted(key, channel), true);
        }
    }

    /// Publish the conditions reflecting the given topic state, if they changed.
    #[tracing::instrument(level = "debug", skip(self, channel, state))]
    async fn patch_conditions(&self, channel: &KafkaChannel, state: &TopicState) -> Result<()> {
        let current = channel.status.clone().unwrap_or_default();
        let mut status = current.clone();
        for cond in state.conditions(&channel.topic_name()) {
            status.set_condition(cond);
        }
        if current.conditions == status.conditions {
            return Ok(());
        }

        tracing::info!(name = channel.name(), namespace = channel.namespace(), "patching channel conditions");
        let api: Api<KafkaChannel> = Api::namespaced(self.client.clone(), channel.namespace());
        let patch = serde_json::json!({"status": {"conditions": status.conditions}});
        let res = timeout(API_TIMEOUT, api.patch_status(channel.name(), &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .context("timeout while patching channel conditions")?;
        match res {
            Ok(_) => Ok(()),
            // The channel was deleted, its deletion event will release the topic.
            Err(err) if is_not_found(&err) => {
                tracing::debug!(name = channel.name(), namespace = channel.namespace(), "channel no longer exists, skipping conditions");
                Ok(())
            }
            Err(err) => Err(err).context("error patching channel conditions"),
        }
    }
}

/// Check if the given error is a K8s API not-found response.
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND)
}
