use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::dispatcher::{Dispatcher, KafkaConsumers};
use crate::reconciler::{ChannelReconciler, KubeChannelStore, KubeEventRecorder};
use crate::server::spawn_metrics_server;
use crate::watchers::ChannelWatcher;

/// The name under which events are reported.
const EVENT_COMPONENT: &str = "kafka-channel-dispatcher";

/// The application object of the Kafka channel dispatcher.
pub struct App {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The dispatcher owning all consumer processes.
    dispatcher: Arc<Dispatcher>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
    /// The join handle of the channel watcher.
    channel_watcher: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;

        // Connect to the channel's brokers & build the dispatcher over them.
        let consumers = Arc::new(KafkaConsumers::connect(&config).await?);
        let dispatcher = Arc::new(Dispatcher::new(config.channel_key.clone(), consumers));
        let reconciler = ChannelReconciler::new(
            Arc::new(KubeChannelStore::new(client.clone())),
            Arc::new(KubeEventRecorder::new(client.clone(), EVENT_COMPONENT.into())),
            dispatcher.clone(),
            config.converge_timeout(),
        );

        // Spawn various core tasks.
        let metrics_server = spawn_metrics_server(&config, metrics, shutdown_tx.subscribe());
        let channel_watcher = ChannelWatcher::new(client, config.clone(), reconciler, shutdown_tx.subscribe()).spawn();

        Ok(Self {
            config,
            dispatcher,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            metrics_server,
            channel_watcher,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Kafka channel dispatcher is shutting down");
        if let Err(err) = self.channel_watcher.await.context("error joining channel watcher handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down channel watcher");
        }
        self.dispatcher.shutdown(Instant::now() + self.config.converge_timeout()).await;
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }

        tracing::debug!("Kafka channel dispatcher shutdown complete");
        Ok(())
    }
}
