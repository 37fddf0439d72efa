//! Kafka consumer processes.
//!
//! Each consumer group is served by a single task which pulls every partition of the channel's
//! topic, starting from the latest offset at the time the consumer was started, and delivers each
//! record to the group's subscriber over HTTP.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rskafka::client::partition::{OffsetAt, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder, SaslConfig};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dispatcher::ConsumerControl;

const METRIC_DELIVERY_ERRORS: &str = "kafka_channel_dispatcher_delivery_errors";
const METRIC_FETCH_ERRORS: &str = "kafka_channel_dispatcher_fetch_errors";

/// The maximum number of bytes fetched from a partition at once.
const FETCH_MAX_BYTES: i32 = 1_000_000;
/// The pause after a failed fetch before the partition is polled again.
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Message delivery settings.
#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    /// The number of attempts made to deliver a single message.
    pub max_attempts: u32,
    /// The linear backoff step between attempts.
    pub backoff: Duration,
    /// The maximum time the broker may wait to fill a fetch response.
    pub fetch_max_wait_ms: i32,
}

impl DeliveryConfig {
    /// Build the delivery settings of the given config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.delivery_max_attempts.max(1),
            backoff: Duration::from_millis(config.delivery_backoff_millis),
            fetch_max_wait_ms: config.fetch_max_wait_millis,
        }
    }
}

/// A running consumer process.
pub(super) struct ConsumerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// The running consumer processes, by consumer group.
#[derive(Default)]
pub(crate) struct ConsumerRegistry {
    pub(super) processes: Mutex<HashMap<String, ConsumerHandle>>,
}

impl ConsumerRegistry {
    /// Spawn the given consumer task & register it under the given group.
    ///
    /// The task is only spawned once the registry lock is held, so dropping this future before it
    /// completes never leaves an untracked task running. A task previously registered under the
    /// same group is signalled & joined.
    pub(crate) async fn spawn<F>(&self, group_id: &str, shutdown: oneshot::Sender<()>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let prev = {
            let mut processes = self.processes.lock().await;
            let task = tokio::spawn(task);
            processes.insert(group_id.into(), ConsumerHandle { shutdown, task })
        };
        if let Some(prev) = prev {
            let _ = prev.shutdown.send(());
            let _ = prev.task.await;
        }
    }

    /// Signal the task of the given group & wait for it to terminate.
    ///
    /// Stopping an unknown group is not an error.
    pub(crate) async fn stop(&self, group_id: &str) -> Result<()> {
        let handle = self.processes.lock().await.remove(group_id);
        let handle = match handle {
            Some(handle) => handle,
            None => return Ok(()),
        };
        let _ = handle.shutdown.send(());
        handle.task.await.with_context(|| format!("error joining consumer task of group {}", group_id))
    }

    /// The number of registered consumer tasks.
    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.processes.lock().await.len()
    }
}

/// A `ConsumerControl` running one task per consumer group against a single topic.
pub struct KafkaConsumers {
    client: Client,
    topic: String,
    http: reqwest::Client,
    delivery: DeliveryConfig,
    processes: ConsumerRegistry,
}

impl KafkaConsumers {
    /// Connect to the channel's brokers.
    pub async fn connect(config: &Config) -> Result<Self> {
        let sasl = SaslConfig::Plain { username: config.kafka_username.clone(), password: config.kafka_password.clone() };
        let client = ClientBuilder::new(config.brokers())
            .sasl_config(sasl)
            .build()
            .await
            .context("error connecting to Kafka brokers")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.delivery_timeout_seconds))
            .build()
            .context("error building HTTP delivery client")?;
        metrics::register_counter!(METRIC_DELIVERY_ERRORS, metrics::Unit::Count, "messages dropped after exhausting delivery attempts");
        metrics::register_counter!(METRIC_FETCH_ERRORS, metrics::Unit::Count, "errors fetching records from Kafka");
        Ok(Self {
            client,
            topic: config.topic(),
            http,
            delivery: DeliveryConfig::from_config(config),
            processes: ConsumerRegistry::default(),
        })
    }

    /// Open a partition client positioned at the latest offset for every partition of the topic.
    async fn open_partitions(&self) -> Result<Vec<PartitionCursor>> {
        let topics = self.client.list_topics().await.context("error listing topics")?;
        let topic = topics
            .into_iter()
            .find(|topic| topic.name == self.topic)
            .with_context(|| format!("topic {} does not exist", self.topic))?;
        let mut cursors = vec![];
        for partition in topic.partitions.iter().copied() {
            let client = self
                .client
                .partition_client(self.topic.clone(), partition, UnknownTopicHandling::Error)
                .await
                .with_context(|| format!("error opening partition {} of topic {}", partition, self.topic))?;
            let offset = client
                .get_offset(OffsetAt::Latest)
                .await
                .with_context(|| format!("error reading latest offset of partition {}", partition))?;
            cursors.push(PartitionCursor { partition, client, offset });
        }
        Ok(cursors)
    }
}

#[async_trait]
impl ConsumerControl for KafkaConsumers {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn start(&self, group_id: &str, uri: &str) -> Result<()> {
        self.stop(group_id).await?;
        let cursors = self.open_partitions().await?;
        let (shutdown, shutdown_rx) = oneshot::channel();
        let consumer = Consumer {
            group_id: group_id.into(),
            uri: uri.into(),
            cursors,
            http: self.http.clone(),
            delivery: self.delivery.clone(),
        };
        // A concurrent start of the same group may have won the race, in which case it is replaced.
        self.processes.spawn(group_id, shutdown, consumer.run(shutdown_rx)).await;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn stop(&self, group_id: &str) -> Result<()> {
        self.processes.stop(group_id).await
    }
}

/// The read position of a single partition.
struct PartitionCursor {
    partition: i32,
    client: PartitionClient,
    offset: i64,
}

/// A consumer process delivering the records of every partition to one subscriber.
struct Consumer {
    group_id: String,
    uri: String,
    cursors: Vec<PartitionCursor>,
    http: reqwest::Client,
    delivery: DeliveryConfig,
}

impl Consumer {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        tracing::info!(group_id = %self.group_id, uri = %self.uri, partitions = self.cursors.len(), "consumer started");
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = self.poll_partitions() => (),
            }
        }
        tracing::info!(group_id = %self.group_id, "consumer stopped");
    }

    /// Fetch one batch from each partition & deliver its records.
    async fn poll_partitions(&mut self) {
        for cursor in self.cursors.iter_mut() {
            let res = cursor
                .client
                .fetch_records(cursor.offset, 1..FETCH_MAX_BYTES, self.delivery.fetch_max_wait_ms)
                .await;
            let records = match res {
                Ok((records, _high_watermark)) => records,
                Err(err) => {
                    tracing::error!(error = ?err, partition = cursor.partition, group_id = %self.group_id, "error fetching records");
                    metrics::increment_counter!(METRIC_FETCH_ERRORS);
                    tokio::time::sleep(FETCH_ERROR_BACKOFF).await;
                    continue;
                }
            };
            for record in records {
                // Records of a batch may precede the requested offset.
                if record.offset < cursor.offset {
                    continue;
                }
                cursor.offset = record.offset + 1;
                let headers = forwarded_headers(&record.record.headers);
                let body = record.record.value.unwrap_or_default();
                if let Err(err) = deliver(&self.http, &self.uri, headers, body, &self.delivery).await {
                    tracing::error!(
                        error = ?err,
                        partition = cursor.partition,
                        offset = record.offset,
                        group_id = %self.group_id,
                        "dropping message after exhausting delivery attempts",
                    );
                    metrics::increment_counter!(METRIC_DELIVERY_ERRORS);
                }
            }
        }
    }
}

/// Deliver a message to the given URI, retrying with linear backoff.
pub(crate) async fn deliver(http: &reqwest::Client, uri: &str, headers: HeaderMap, body: Vec<u8>, delivery: &DeliveryConfig) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let res = http.post(uri).headers(headers.clone()).body(body.clone()).send().await;
        let err = match res {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => anyhow::anyhow!("subscriber responded with status {}", resp.status()),
            Err(err) => anyhow::Error::from(err).context("error sending message to subscriber"),
        };
        if attempt >= delivery.max_attempts {
            bail!("delivery failed after {} attempts: {:#}", attempt, err);
        }
        tracing::debug!(error = ?err, attempt, uri, "delivery attempt failed, will retry");
        tokio::time::sleep(delivery.backoff * attempt).await;
    }
}

/// Convert record headers into HTTP headers, skipping any which are not valid HTTP headers.
pub(crate) fn forwarded_headers(headers: &BTreeMap<String, Vec<u8>>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, val) in headers {
        match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_bytes(val)) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => tracing::debug!(header = %key, "skipping record header which is not a valid HTTP header"),
        }
    }
    map
}
