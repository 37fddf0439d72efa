use std::collections::HashSet;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::dispatcher::ConsumerControl;
use crate::reconciler::{ChannelStore, EventRecorder, EventType};
use kafka_channel_core::crd::{
    ChannelCondition, KafkaChannel, KafkaChannelSpec, KafkaChannelStatus, RequiredMetadata, SubscriberSpec, CONDITION_TOPIC_READY,
};

/// A recorded consumer lifecycle call.
#[derive(Clone, Debug, PartialEq)]
pub enum ConsumerCall {
    Start { group_id: String, uri: String },
    Stop { group_id: String },
}

/// A `ConsumerControl` which records calls & fails or hangs on demand.
#[derive(Default)]
pub struct FakeConsumers {
    pub calls: Mutex<Vec<ConsumerCall>>,
    /// Consumer groups whose start fails.
    pub fail_start: Mutex<HashSet<String>>,
    /// Consumer groups whose stop fails.
    pub fail_stop: Mutex<HashSet<String>>,
    /// Consumer groups whose start never completes.
    pub hang_start: Mutex<HashSet<String>>,
}

impl FakeConsumers {
    /// Take all calls recorded so far.
    pub fn take_calls(&self) -> Vec<ConsumerCall> {
        std::mem::take(&mut *self.calls.lock())
    }
}

#[async_trait]
impl ConsumerControl for FakeConsumers {
    async fn start(&self, group_id: &str, uri: &str) -> Result<()> {
        self.calls.lock().push(ConsumerCall::Start {
            group_id: group_id.into(),
            uri: uri.into(),
        });
        if self.hang_start.lock().contains(group_id) {
            futures::future::pending::<()>().await;
        }
        if self.fail_start.lock().contains(group_id) {
            bail!("broker unavailable");
        }
        Ok(())
    }

    async fn stop(&self, group_id: &str) -> Result<()> {
        self.calls.lock().push(ConsumerCall::Stop { group_id: group_id.into() });
        if self.fail_stop.lock().contains(group_id) {
            bail!("consumer did not terminate");
        }
        Ok(())
    }
}

/// Build a start call.
pub fn start_call(uid: &str, uri: &str) -> ConsumerCall {
    ConsumerCall::Start {
        group_id: kafka_channel_core::consumer_group_id(uid),
        uri: uri.into(),
    }
}

/// Build a stop call.
pub fn stop_call(uid: &str) -> ConsumerCall {
    ConsumerCall::Stop {
        group_id: kafka_channel_core::consumer_group_id(uid),
    }
}

/// An in-memory `ChannelStore` holding a single channel.
#[derive(Default)]
pub struct FakeChannelStore {
    pub channel: Mutex<Option<KafkaChannel>>,
    /// The number of status writes performed.
    pub status_writes: Mutex<usize>,
    pub fail_status_write: Mutex<bool>,
}

#[async_trait]
impl ChannelStore for FakeChannelStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<KafkaChannel>> {
        Ok(self
            .channel
            .lock()
            .clone()
            .filter(|channel| channel.namespace() == namespace && channel.name() == name))
    }

    async fn update_status(&self, channel: &KafkaChannel) -> Result<KafkaChannel> {
        if *self.fail_status_write.lock() {
            bail!("conflict");
        }
        *self.status_writes.lock() += 1;
        let mut stored = self.channel.lock();
        if let Some(stored) = stored.as_mut() {
            stored.status = channel.status.clone();
        }
        Ok(channel.clone())
    }
}

/// An `EventRecorder` keeping all events in memory.
#[derive(Default)]
pub struct FakeEventRecorder {
    pub events: Mutex<Vec<(EventType, String)>>,
}

impl FakeEventRecorder {
    /// The reasons of all recorded events.
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|(_, reason)| reason.clone()).collect()
    }
}

#[async_trait]
impl EventRecorder for FakeEventRecorder {
    async fn record(&self, _channel: &KafkaChannel, type_: EventType, reason: &str, _message: String) -> Result<()> {
        self.events.lock().push((type_, reason.into()));
        Ok(())
    }
}

/// Build a channel with a ready topic & the given `(uid, uri)` subscribers.
pub fn channel(namespace: &str, name: &str, subscribers: Option<Vec<(&str, &str)>>) -> KafkaChannel {
    let subscribers = subscribers.map(|subs| {
        subs.into_iter()
            .map(|(uid, uri)| SubscriberSpec {
                uid: uid.into(),
                generation: Some(1),
                subscriber_uri: uri.into(),
                reply_uri: None,
            })
            .collect()
    });
    let mut channel = KafkaChannel::new(
        name,
        KafkaChannelSpec {
            num_partitions: KafkaChannelSpec::num_partitions_default(),
            replication_factor: KafkaChannelSpec::replication_factor_default(),
            retention_millis: KafkaChannelSpec::retention_millis_default(),
            subscribers,
        },
    );
    channel.metadata.namespace = Some(namespace.into());
    let mut status = KafkaChannelStatus::default();
    status.set_condition(ChannelCondition::ready(CONDITION_TOPIC_READY));
    channel.status = Some(status);
    channel
}
