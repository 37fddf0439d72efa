//! KafkaChannel CRD.
//!
//! The spec is owned by users. The status is shared: the controller owns `conditions`, the
//! channel's dispatcher owns `subscribers`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::RequiredMetadata;

pub type KafkaChannel = KafkaChannelCRD; // Mostly to resolve a Rust Analyzer issue.

/// The condition type indicating that the channel's broker topic exists.
pub const CONDITION_TOPIC_READY: &str = "TopicReady";
/// The condition type indicating overall channel readiness.
pub const CONDITION_READY: &str = "Ready";

/// CRD spec for the KafkaChannel resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "KafkaChannelCRD",
    status = "KafkaChannelStatus",
    group = "knativekafka.kyma-project.io",
    version = "v1alpha1",
    kind = "KafkaChannel",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "kc",
    printcolumn = r#"{"name":"Partitions","type":"number","jsonPath":".spec.numPartitions"}"#,
    printcolumn = r#"{"name":"Replication Factor","type":"number","jsonPath":".spec.replicationFactor"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaChannelSpec {
    /// The number of partitions of the backing topic.
    #[serde(default = "KafkaChannelSpec::num_partitions_default")]
    pub num_partitions: i32,
    /// The replication factor of the backing topic.
    #[serde(default = "KafkaChannelSpec::replication_factor_default")]
    pub replication_factor: i16,
    /// The retention period of the backing topic's data in milliseconds.
    #[serde(default = "KafkaChannelSpec::retention_millis_default")]
    pub retention_millis: i64,
    /// The subscribers of this channel.
    ///
    /// An absent list and an empty list are treated the same.
    #[serde(default)]
    pub subscribers: Option<Vec<SubscriberSpec>>,
}

impl KafkaChannelSpec {
    pub fn num_partitions_default() -> i32 {
        4
    }

    pub fn replication_factor_default() -> i16 {
        1
    }

    /// The default retention value, which is 7 days.
    pub fn retention_millis_default() -> i64 {
        604_800_000
    }
}

/// A single subscriber of a channel.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberSpec {
    /// The unique ID of the subscriber, stable across generations.
    pub uid: String,
    /// The generation of the subscription this entry was built from.
    #[serde(default)]
    pub generation: Option<i64>,
    /// The endpoint to which channel messages are delivered.
    pub subscriber_uri: String,
    /// The endpoint to which replies are delivered.
    #[serde(default)]
    pub reply_uri: Option<String>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KafkaChannelStatus {
    /// The conditions of the channel.
    #[serde(default)]
    pub conditions: Vec<ChannelCondition>,
    /// The readiness of each subscriber, as observed by the channel's dispatcher.
    #[serde(default)]
    pub subscribers: Vec<SubscriberStatus>,
}

impl KafkaChannelStatus {
    /// Get the condition of the given type, if present.
    pub fn condition(&self, type_: &str) -> Option<&ChannelCondition> {
        self.conditions.iter().find(|cond| cond.type_ == type_)
    }

    /// Check if the channel's broker topic is ready.
    pub fn is_topic_ready(&self) -> bool {
        self.condition(CONDITION_TOPIC_READY)
            .map(|cond| cond.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Set the given condition, replacing any condition of the same type.
    pub fn set_condition(&mut self, condition: ChannelCondition) {
        match self.conditions.iter_mut().find(|cond| cond.type_ == condition.type_) {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }
}

/// A condition of a channel.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCondition {
    /// The type of this condition.
    #[serde(rename = "type")]
    pub type_: String,
    /// The status of this condition.
    pub status: ConditionStatus,
    /// A machine readable reason for the condition's status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// A human readable message about the condition's status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ChannelCondition {
    /// Build a new `True` condition of the given type.
    pub fn ready(type_: &str) -> Self {
        Self {
            type_: type_.into(),
            status: ConditionStatus::True,
            reason: None,
            message: None,
        }
    }

    /// Build a new `False` condition of the given type.
    pub fn not_ready(type_: &str, reason: &str, message: String) -> Self {
        Self {
            type_: type_.into(),
            status: ConditionStatus::False,
            reason: Some(reason.into()),
            message: Some(message),
        }
    }
}

/// The readiness of a single subscriber.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberStatus {
    /// The unique ID of the subscriber.
    pub uid: String,
    /// The generation of the subscriber which was observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// The readiness of the subscriber.
    pub ready: ConditionStatus,
    /// The error which left the subscriber not ready, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The status of a condition.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::True => "True",
                Self::False => "False",
                Self::Unknown => "Unknown",
            }
        )
    }
}

impl KafkaChannelCRD {
    /// The broker topic name backing this channel.
    pub fn topic_name(&self) -> String {
        crate::topic_name(self.namespace(), self.name())
    }

    /// The declared subscribers of this channel, empty if absent.
    pub fn subscribers(&self) -> &[SubscriberSpec] {
        self.spec.subscribers.as_deref().unwrap_or_default()
    }

    /// Check if this channel's broker topic is ready.
    pub fn is_topic_ready(&self) -> bool {
        self.status.as_ref().map(|status| status.is_topic_ready()).unwrap_or(false)
    }
}
