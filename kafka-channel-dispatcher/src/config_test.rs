use anyhow::Result;

use crate::config::Config;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("METRICS_PORT".into(), "7002".into()),
        ("CHANNEL_KEY".into(), "shop/orders".into()),
        ("KAFKA_BROKERS".into(), "broker-0:9093, broker-1:9093".into()),
        ("KAFKA_USERNAME".into(), "$ConnectionString".into()),
        ("KAFKA_PASSWORD".into(), "secret".into()),
        ("KAFKA_TOPIC".into(), "orders-topic".into()),
        ("FETCH_MAX_WAIT_MILLIS".into(), "100".into()),
        ("CONVERGE_TIMEOUT_SECONDS".into(), "5".into()),
        ("DELIVERY_MAX_ATTEMPTS".into(), "3".into()),
        ("DELIVERY_BACKOFF_MILLIS".into(), "50".into()),
        ("DELIVERY_TIMEOUT_SECONDS".into(), "2".into()),
    ])?;
    let config = config.with_derived_fields()?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.metrics_port == 7002, "unexpected value parsed for METRICS_PORT, got {}, expected {}", config.metrics_port, 7002);
    assert!(config.namespace == "shop", "unexpected value derived for namespace, got {}, expected {}", config.namespace, "shop");
    assert!(config.channel == "orders", "unexpected value derived for channel, got {}, expected {}", config.channel, "orders");
    assert!(
        config.brokers() == vec!["broker-0:9093".to_string(), "broker-1:9093".to_string()],
        "unexpected value parsed for KAFKA_BROKERS, got {:?}",
        config.brokers()
    );
    assert!(config.topic() == "orders-topic", "unexpected value parsed for KAFKA_TOPIC, got {}, expected {}", config.topic(), "orders-topic");
    assert!(
        config.fetch_max_wait_millis == 100,
        "unexpected value parsed for FETCH_MAX_WAIT_MILLIS, got {}, expected {}",
        config.fetch_max_wait_millis,
        100
    );
    assert!(
        config.converge_timeout_seconds == 5,
        "unexpected value parsed for CONVERGE_TIMEOUT_SECONDS, got {}, expected {}",
        config.converge_timeout_seconds,
        5
    );
    assert!(
        config.delivery_max_attempts == 3,
        "unexpected value parsed for DELIVERY_MAX_ATTEMPTS, got {}, expected {}",
        config.delivery_max_attempts,
        3
    );
    assert!(
        config.delivery_backoff_millis == 50,
        "unexpected value parsed for DELIVERY_BACKOFF_MILLIS, got {}, expected {}",
        config.delivery_backoff_millis,
        50
    );
    assert!(
        config.delivery_timeout_seconds == 2,
        "unexpected value parsed for DELIVERY_TIMEOUT_SECONDS, got {}, expected {}",
        config.delivery_timeout_seconds,
        2
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("CHANNEL_KEY".into(), "shop/orders".into()),
        ("KAFKA_BROKERS".into(), "broker-0:9093".into()),
        ("KAFKA_USERNAME".into(), "user".into()),
        ("KAFKA_PASSWORD".into(), "secret".into()),
    ])?;
    let config = config.with_derived_fields()?;

    assert!(config.metrics_port == 9090, "unexpected default for METRICS_PORT, got {}, expected {}", config.metrics_port, 9090);
    assert!(config.topic() == "shop.orders", "unexpected default topic, got {}, expected {}", config.topic(), "shop.orders");
    assert!(
        config.converge_timeout_seconds == 30,
        "unexpected default for CONVERGE_TIMEOUT_SECONDS, got {}, expected {}",
        config.converge_timeout_seconds,
        30
    );
    assert!(
        config.delivery_max_attempts == 5,
        "unexpected default for DELIVERY_MAX_ATTEMPTS, got {}, expected {}",
        config.delivery_max_attempts,
        5
    );

    Ok(())
}

#[test]
fn config_rejects_malformed_channel_key() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("CHANNEL_KEY".into(), "orders".into()),
        ("KAFKA_BROKERS".into(), "broker-0:9093".into()),
        ("KAFKA_USERNAME".into(), "user".into()),
        ("KAFKA_PASSWORD".into(), "secret".into()),
    ])?;

    assert!(config.with_derived_fields().is_err(), "expected channel key without namespace to be rejected");
    Ok(())
}
