use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::reconciler::ChannelReconciler;
use crate::watchers::queue::ReconcileQueue;
use kafka_channel_core::crd::{KafkaChannel, RequiredMetadata};

const METRIC_CHANNEL_WATCHER_ERRORS: &str = "kafka_channel_dispatcher_channel_watcher_errors";
const METRIC_RECONCILE_ERRORS: &str = "kafka_channel_dispatcher_reconcile_errors";

/// The timeout duration used before retrying a failed reconcile.
const RESCHEDULE_TIMEOUT: Duration = Duration::from_secs(5);

/// A result type used for CR events coming from K8s.
pub type ChannelCREventResult = std::result::Result<Event<KafkaChannel>, WatcherError>;

/// A K8s event watcher of the KafkaChannel CR served by this process.
///
/// Every observed change enqueues the channel's key. Keys are reconciled one at a time, so two
/// reconciles of the same channel never overlap.
pub struct ChannelWatcher {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// The channel reconciler.
    reconciler: ChannelReconciler,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,

    /// Keys waiting to be reconciled.
    queue: ReconcileQueue,
}

impl ChannelWatcher {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, reconciler: ChannelReconciler, shutdown: broadcast::Receiver<()>) -> Self {
        metrics::register_counter!(METRIC_CHANNEL_WATCHER_ERRORS, metrics::Unit::Count, "k8s watcher errors from the channel watcher");
        metrics::register_counter!(METRIC_RECONCILE_ERRORS, metrics::Unit::Count, "failed channel reconciles");
        Self {
            client,
            config,
            reconciler,
            shutdown: BroadcastStream::new(shutdown),
            queue: ReconcileQueue::new(RESCHEDULE_TIMEOUT),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let api: Api<KafkaChannel> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let params = ListParams {
            field_selector: Some(format!("metadata.name={}", &self.config.channel)),
            ..Default::default()
        };
        let stream = watcher(api, params);
        tokio::pin!(stream);

        tracing::info!(channel = %self.config.channel_key, "channel CR watcher initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = stream.next() => self.handle_k8s_event(k8s_event_res).await,
                Some(key) = self.queue.next() => self.reconcile(key).await,
                _ = self.shutdown.next() => break,
            }
        }

        tracing::debug!("channel CR watcher shutdown");
        Ok(())
    }

    /// Handle watcher events coming from K8s.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_k8s_event(&mut self, res: ChannelCREventResult) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from k8s watch stream");
                metrics::increment_counter!(METRIC_CHANNEL_WATCHER_ERRORS);
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(channel) => self.queue.enqueue(channel.key()),
            // Consumers of a deleted channel are stopped when the process shuts down.
            Event::Deleted(_channel) => (),
            Event::Restarted(channels) => {
                tracing::debug!("channel CR watcher restarted");
                for channel in channels {
                    self.queue.enqueue(channel.key());
                }
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn reconcile(&mut self, key: String) {
        if let Err(err) = self.reconciler.reconcile(&key).await {
            tracing::error!(error = ?err, key = %key, "error reconciling channel, will retry");
            metrics::increment_counter!(METRIC_RECONCILE_ERRORS);
            self.queue.retry(key);
        }
    }
}
