use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;

use crate::dispatcher::{Dispatcher, Subscription};
use crate::error::ConvergeError;
use crate::fixtures::{start_call, stop_call, FakeConsumers};

fn setup() -> (Dispatcher, Arc<FakeConsumers>) {
    let consumers = Arc::new(FakeConsumers::default());
    let dispatcher = Dispatcher::new("shop/orders".into(), consumers.clone());
    (dispatcher, consumers)
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

async fn active_groups(dispatcher: &Dispatcher) -> HashSet<String> {
    dispatcher.active().await.iter().map(|sub| sub.group_id().to_string()).collect()
}

#[test]
fn subscriptions_of_the_same_subscriber_collide() {
    let a = Subscription::new("u1", "http://a");
    let b = Subscription::new("u1", "http://b");

    assert_eq!(a.group_id(), "kafka.u1", "unexpected group id {}", a.group_id());
    assert_eq!(a, b, "expected subscriptions of the same subscriber to be equal");
    let set: HashSet<_> = vec![a, b].into_iter().collect();
    assert_eq!(set.len(), 1, "expected subscriptions to collide as one key, got {}", set.len());
}

#[tokio::test]
async fn converge_starts_and_stops_consumers() -> Result<()> {
    let (dispatcher, consumers) = setup();

    let failures = dispatcher.converge(&[Subscription::new("u1", "http://a")], deadline()).await;
    assert!(failures.is_empty(), "expected no failures, got {:?}", failures);
    assert_eq!(consumers.take_calls(), vec![start_call("u1", "http://a")]);
    assert_eq!(active_groups(&dispatcher).await, HashSet::from(["kafka.u1".to_string()]));

    let failures = dispatcher.converge(&[], deadline()).await;
    assert!(failures.is_empty(), "expected no failures, got {:?}", failures);
    assert_eq!(consumers.take_calls(), vec![stop_call("u1")]);
    assert!(dispatcher.active().await.is_empty(), "expected no active subscriptions");
    Ok(())
}

#[tokio::test]
async fn converge_is_idempotent() -> Result<()> {
    let (dispatcher, consumers) = setup();
    let desired = vec![Subscription::new("u1", "http://a"), Subscription::new("u2", "http://b")];

    let failures = dispatcher.converge(&desired, deadline()).await;
    assert!(failures.is_empty(), "expected no failures, got {:?}", failures);
    let calls = consumers.take_calls();
    assert_eq!(calls.len(), 2, "expected 2 start calls, got {:?}", calls);

    let failures = dispatcher.converge(&desired, deadline()).await;
    assert!(failures.is_empty(), "expected no failures, got {:?}", failures);
    let calls = consumers.take_calls();
    assert!(calls.is_empty(), "expected no calls on second converge, got {:?}", calls);
    Ok(())
}

#[tokio::test]
async fn converge_isolates_and_retries_failed_starts() -> Result<()> {
    let (dispatcher, consumers) = setup();
    consumers.fail_start.lock().insert("kafka.u2".into());
    let desired = vec![Subscription::new("u1", "http://a"), Subscription::new("u2", "http://b")];

    let failures = dispatcher.converge(&desired, deadline()).await;
    assert_eq!(failures.len(), 1, "expected 1 failure, got {:?}", failures);
    match failures.get(&Subscription::new("u2", "http://b")) {
        Some(ConvergeError::Start { group_id, .. }) => assert_eq!(group_id, "kafka.u2"),
        other => panic!("expected start error for u2, got {:?}", other),
    }
    assert_eq!(active_groups(&dispatcher).await, HashSet::from(["kafka.u1".to_string()]));
    consumers.take_calls();

    consumers.fail_start.lock().clear();
    let failures = dispatcher.converge(&desired, deadline()).await;
    assert!(failures.is_empty(), "expected no failures, got {:?}", failures);
    assert_eq!(consumers.take_calls(), vec![start_call("u2", "http://b")], "expected only u2 to be retried");
    Ok(())
}

#[tokio::test]
async fn converge_keeps_subscriptions_which_failed_to_stop() -> Result<()> {
    let (dispatcher, consumers) = setup();
    dispatcher.converge(&[Subscription::new("u1", "http://a")], deadline()).await;
    consumers.fail_stop.lock().insert("kafka.u1".into());
    consumers.take_calls();

    let failures = dispatcher.converge(&[], deadline()).await;
    assert!(
        matches!(failures.get(&Subscription::new("u1", "")), Some(ConvergeError::Stop { .. })),
        "expected stop error for u1, got {:?}",
        failures
    );
    assert_eq!(active_groups(&dispatcher).await, HashSet::from(["kafka.u1".to_string()]));

    consumers.fail_stop.lock().clear();
    let failures = dispatcher.converge(&[], deadline()).await;
    assert!(failures.is_empty(), "expected no failures, got {:?}", failures);
    assert_eq!(consumers.take_calls(), vec![stop_call("u1"), stop_call("u1")]);
    assert!(dispatcher.active().await.is_empty(), "expected no active subscriptions");
    Ok(())
}

#[tokio::test]
async fn converge_restarts_consumer_on_uri_change() -> Result<()> {
    let (dispatcher, consumers) = setup();
    let desired = vec![Subscription::new("u1", "http://a"), Subscription::new("u2", "http://b")];
    dispatcher.converge(&desired, deadline()).await;
    consumers.take_calls();

    let desired = vec![Subscription::new("u1", "http://a2"), Subscription::new("u2", "http://b")];
    let failures = dispatcher.converge(&desired, deadline()).await;

    assert!(failures.is_empty(), "expected no failures, got {:?}", failures);
    assert_eq!(consumers.take_calls(), vec![stop_call("u1"), start_call("u1", "http://a2")]);
    let active = dispatcher.active().await;
    let u1 = active.iter().find(|sub| sub.group_id() == "kafka.u1").map(|sub| sub.uri().to_string());
    assert_eq!(u1.as_deref(), Some("http://a2"), "expected u1 to run against the new URI, got {:?}", u1);
    Ok(())
}

#[tokio::test]
async fn converge_reports_pending_operations_as_cancelled() -> Result<()> {
    let (dispatcher, consumers) = setup();
    consumers.hang_start.lock().insert("kafka.u2".into());
    let desired = vec![Subscription::new("u1", "http://a"), Subscription::new("u2", "http://b")];

    let failures = dispatcher.converge(&desired, Instant::now() + Duration::from_millis(50)).await;

    assert_eq!(failures.len(), 1, "expected 1 failure, got {:?}", failures);
    assert!(
        matches!(failures.get(&Subscription::new("u2", "")), Some(ConvergeError::Cancelled { .. })),
        "expected u2 to be cancelled, got {:?}",
        failures
    );
    assert_eq!(active_groups(&dispatcher).await, HashSet::from(["kafka.u1".to_string()]));
    Ok(())
}

#[tokio::test]
async fn shutdown_stops_all_consumers() -> Result<()> {
    let (dispatcher, consumers) = setup();
    dispatcher.converge(&[Subscription::new("u1", "http://a")], deadline()).await;
    consumers.take_calls();

    dispatcher.shutdown(deadline()).await;

    assert_eq!(consumers.take_calls(), vec![stop_call("u1")]);
    assert!(dispatcher.active().await.is_empty(), "expected no active subscriptions");
    Ok(())
}
