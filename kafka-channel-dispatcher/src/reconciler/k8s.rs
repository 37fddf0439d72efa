use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, EventSource};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::client::Client;
use kube::Resource;
use tokio::time::timeout;

use crate::reconciler::{ChannelStore, EventRecorder, EventType};
use kafka_channel_core::crd::{KafkaChannel, RequiredMetadata};

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// A `ChannelStore` backed by the K8s API.
pub struct KubeChannelStore {
    client: Client,
}

impl KubeChannelStore {
    /// Create a new instance.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelStore for KubeChannelStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<KafkaChannel>> {
        let api: Api<KafkaChannel> = Api::namespaced(self.client.clone(), namespace);
        let res = timeout(API_TIMEOUT, api.get(name)).await.context("timeout while fetching channel")?;
        match res {
            Ok(channel) => Ok(Some(channel)),
            Err(err) => match err {
                kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND => Ok(None),
                _ => Err(err).context("error fetching channel"),
            },
        }
    }

    /// Replace the channel's status, guarded by the channel's resource version.
    #[tracing::instrument(level = "debug", skip(self, channel))]
    async fn update_status(&self, channel: &KafkaChannel) -> Result<KafkaChannel> {
        tracing::info!(name = channel.name(), namespace = channel.namespace(), "updating channel status");
        let api: Api<KafkaChannel> = Api::namespaced(self.client.clone(), channel.namespace());
        let data = serde_json::to_vec(channel).context("error serializing channel")?;
        timeout(API_TIMEOUT, api.replace_status(channel.name(), &PostParams::default(), data))
            .await
            .context("timeout while updating channel status")?
            .context("error updating channel status")
    }
}

/// An `EventRecorder` creating K8s `Event` objects.
pub struct KubeEventRecorder {
    client: Client,
    /// The name of the component reporting events.
    component: String,
}

impl KubeEventRecorder {
    /// Create a new instance.
    pub fn new(client: Client, component: String) -> Self {
        Self { client, component }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    #[tracing::instrument(level = "debug", skip(self, channel, message))]
    async fn record(&self, channel: &KafkaChannel, type_: EventType, reason: &str, message: String) -> Result<()> {
        let now = Time(chrono::Utc::now());
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", channel.name())),
                namespace: Some(channel.namespace().into()),
                ..Default::default()
            },
            involved_object: channel.object_ref(&()),
            type_: Some(type_.as_str().into()),
            reason: Some(reason.into()),
            message: Some(message),
            count: Some(1),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                host: None,
            }),
            reporting_component: Some(self.component.clone()),
            ..Default::default()
        };
        let api: Api<Event> = Api::namespaced(self.client.clone(), channel.namespace());
        timeout(API_TIMEOUT, api.create(&PostParams::default(), &event))
            .await
            .context("timeout while creating event")?
            .context("error creating event")?;
        Ok(())
    }
}
