use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::Resource;
use tokio::time::timeout;

use crate::cache::{CredentialSource, NamespaceRecord};
use crate::k8s::API_TIMEOUT;
use kafka_channel_core::{KAFKA_SECRET_KEY_BROKERS, KAFKA_SECRET_KEY_NAMESPACE, KAFKA_SECRET_KEY_PASSWORD, KAFKA_SECRET_KEY_USERNAME, KAFKA_SECRET_LABEL_SELECTORS};

/// A credential source backed by the labelled K8s Secrets of a single namespace.
pub struct SecretCredentialSource {
    client: Client,
    namespace: String,
}

impl SecretCredentialSource {
    /// Create a new instance reading Secrets from the given K8s namespace.
    pub fn new(client: Client, namespace: String) -> Self {
        Self { client, namespace }
    }
}

#[async_trait]
impl CredentialSource for SecretCredentialSource {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn fetch(&self) -> Result<Vec<NamespaceRecord>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams {
            label_selector: Some(KAFKA_SECRET_LABEL_SELECTORS.into()),
            ..Default::default()
        };
        let secrets = timeout(API_TIMEOUT, api.list(&params))
            .await
            .context("timeout while listing Kafka secrets")?
            .context("error listing Kafka secrets")?;
        Ok(secrets.items.iter().map(record_from_secret).collect())
    }
}

/// Build a namespace credential record from the data of the given Secret.
///
/// Missing keys are left empty, validation happens later.
pub(super) fn record_from_secret(secret: &Secret) -> NamespaceRecord {
    let empty = BTreeMap::new();
    let data = secret.data.as_ref().unwrap_or(&empty);
    NamespaceRecord {
        source: secret.meta().name.clone().unwrap_or_default(),
        brokers: data_value(data, KAFKA_SECRET_KEY_BROKERS),
        username: data_value(data, KAFKA_SECRET_KEY_USERNAME),
        password: data_value(data, KAFKA_SECRET_KEY_PASSWORD),
        namespace: data_value(data, KAFKA_SECRET_KEY_NAMESPACE),
    }
}

fn data_value(data: &BTreeMap<String, ByteString>, key: &str) -> String {
    data.get(key)
        .map(|val| String::from_utf8_lossy(&val.0).trim().to_string())
        .unwrap_or_default()
}
