use std::sync::Arc;

use kafka_channel_core::AppError;

use crate::kafka::BrokerAdmin;

/// A raw record of a broker namespace's credentials, as found in the credential source.
///
/// Fields are kept as found; `validate` is what turns a record into usable credentials.
#[derive(Clone, Default)]
pub struct NamespaceRecord {
    /// The name of the object this record was read from, used for logging.
    pub source: String,
    /// The comma-separated broker address list.
    pub brokers: String,
    /// The SASL username.
    pub username: String,
    /// The SASL password.
    pub password: String,
    /// The name of the broker namespace.
    pub namespace: String,
}

impl NamespaceRecord {
    /// Validate this record, returning the namespace name & its credentials.
    ///
    /// All of the broker list, username, password & namespace name must be non-empty.
    pub fn validate(self) -> Result<(String, NamespaceCredentials), AppError> {
        let brokers: Vec<String> = self
            .brokers
            .split(',')
            .map(|broker| broker.trim())
            .filter(|broker| !broker.is_empty())
            .map(String::from)
            .collect();
        if brokers.is_empty() || self.username.is_empty() || self.password.is_empty() || self.namespace.is_empty() {
            let password = if self.password.is_empty() { "" } else { "********" };
            tracing::error!(
                source = %self.source,
                brokers = %self.brokers,
                username = %self.username,
                password,
                namespace = %self.namespace,
                "Kafka secret contains invalid data",
            );
            return Err(AppError::InvalidNamespaceSecret(self.source));
        }
        Ok((
            self.namespace,
            NamespaceCredentials {
                brokers,
                username: self.username,
                password: self.password,
            },
        ))
    }
}

impl std::fmt::Debug for NamespaceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceRecord")
            .field("source", &self.source)
            .field("brokers", &self.brokers)
            .field("username", &self.username)
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// The validated connection credentials of a broker namespace.
#[derive(Clone, PartialEq)]
pub struct NamespaceCredentials {
    /// The broker addresses of the namespace.
    pub brokers: Vec<String>,
    /// The SASL username.
    pub username: String,
    /// The SASL password.
    pub password: String,
}

impl std::fmt::Debug for NamespaceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceCredentials")
            .field("brokers", &self.brokers)
            .field("username", &self.username)
            .finish()
    }
}

/// A broker namespace: a credential scope which may host a bounded number of topics.
///
/// Namespaces are immutable and shared. The number of topics hosted by a namespace is tracked
/// by the cache which owns it.
pub struct Namespace {
    name: String,
    credentials: NamespaceCredentials,
    admin: Arc<dyn BrokerAdmin>,
}

impl Namespace {
    /// Create a new instance.
    pub fn new(name: String, credentials: NamespaceCredentials, admin: Arc<dyn BrokerAdmin>) -> Self {
        Self {
            name,
            credentials,
            admin,
        }
    }

    /// The name of this namespace.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// The connection credentials of this namespace.
    pub fn credentials(&self) -> &NamespaceCredentials {
        &self.credentials
    }

    /// The admin client of this namespace.
    pub fn admin(&self) -> &dyn BrokerAdmin {
        self.admin.as_ref()
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace").field("name", &self.name).field("credentials", &self.credentials).finish()
    }
}
