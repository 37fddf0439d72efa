pub mod crd;
pub mod error;

pub use error::AppError;

/// The label which marks a K8s Secret as holding the credentials of a broker namespace.
pub const LABEL_KAFKA_SECRET: &str = "knativekafka.kyma-project.io/kafka-secret";
/// The label selector matching all broker namespace credential Secrets.
pub const KAFKA_SECRET_LABEL_SELECTORS: &str = "knativekafka.kyma-project.io/kafka-secret=true";

/// The Secret data key holding the comma-separated broker address list.
pub const KAFKA_SECRET_KEY_BROKERS: &str = "brokers";
/// The Secret data key holding the SASL username.
pub const KAFKA_SECRET_KEY_USERNAME: &str = "username";
/// The Secret data key holding the SASL password.
pub const KAFKA_SECRET_KEY_PASSWORD: &str = "password";
/// The Secret data key holding the broker namespace name.
pub const KAFKA_SECRET_KEY_NAMESPACE: &str = "namespace";

/// The prefix of every consumer group created for a channel subscriber.
const CONSUMER_GROUP_PREFIX: &str = "kafka";

/// Build the consumer group ID of the subscriber with the given UID.
///
/// This is a pure function of the UID, which is what makes a subscriber's consumer group stable
/// across spec generations.
pub fn consumer_group_id(subscriber_uid: &str) -> String {
    format!("{}.{}", CONSUMER_GROUP_PREFIX, subscriber_uid)
}

/// Build the broker topic name backing the channel with the given namespace & name.
pub fn topic_name(namespace: &str, name: &str) -> String {
    format!("{}.{}", namespace, name)
}

/// Build the `namespace/name` key of a namespaced object.
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Split a `namespace/name` key into its parts.
///
/// Returns `None` if the key does not have exactly two non-empty segments.
pub fn split_object_key(key: &str) -> Option<(&str, &str)> {
    let mut segments = key.split('/');
    match (segments.next(), segments.next(), segments.next()) {
        (Some(namespace), Some(name), None) if !namespace.is_empty() && !name.is_empty() => Some((namespace, name)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_group_id_is_derived_from_uid() {
        let id = consumer_group_id("2a3c1f");
        assert_eq!(id, "kafka.2a3c1f", "unexpected consumer group id, got {}", id);
    }

    #[test]
    fn split_object_key_accepts_only_namespaced_keys() {
        assert_eq!(split_object_key("default/events"), Some(("default", "events")));
        assert_eq!(split_object_key("events"), None, "expected key without namespace to be rejected");
        assert_eq!(split_object_key("a/b/c"), None, "expected key with three segments to be rejected");
        assert_eq!(split_object_key("/events"), None, "expected key with empty namespace to be rejected");
    }
}
