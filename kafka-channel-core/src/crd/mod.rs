//! Kafka channel CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns

mod channel;

use kube::Resource;

pub use channel::{
    ChannelCondition, ConditionStatus, KafkaChannel, KafkaChannelSpec, KafkaChannelStatus, SubscriberSpec, SubscriberStatus, CONDITION_READY,
    CONDITION_TOPIC_READY,
};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;

    /// The `namespace/name` key of this object.
    fn key(&self) -> String {
        crate::object_key(self.namespace(), self.name())
    }
}

impl RequiredMetadata for KafkaChannel {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}
