use std::io::Write;

use super::*;
use crate::acl::{AdminTagCheck, PredicateRegistry, ADMIN_TAG_CHECK};
use crate::bus::{fingerprint, MockChannel};
use crate::registry::{MockRegistry, RegistryStore, Role, Subscriber};

const INBOUND: &str = "inbound";

fn channel_of(username: &str) -> String {
    format!("{}-events.fifo", username)
}

async fn add_subscriber(registry: &MockRegistry, username: &str, event_type: &str) {
    registry
        .upsert_subscriber(&Subscriber::new(
            username,
            Role::User,
            channel_of(username),
            "token",
        ))
        .await
        .unwrap();
    registry
        .upsert_subscription(username, event_type, "echo <event_type>")
        .await
        .unwrap();
}

async fn map_chain(registry: &MockRegistry, event_type: &str, names: &[&str]) {
    for name in names {
        registry.register_acl_function(name, name).await.unwrap();
        registry.map_acl_function(event_type, name).await.unwrap();
    }
}

fn limits() -> DispatchLimits {
    DispatchLimits {
        max_concurrency: 4,
        registry_timeout: Duration::from_millis(200),
        send_timeout: Duration::from_millis(200),
    }
}

fn dispatcher(
    registry: &Arc<MockRegistry>,
    channel: &Arc<MockChannel>,
    predicates: PredicateRegistry,
) -> Dispatcher {
    Dispatcher::new(
        registry.clone(),
        AclEngine::new(predicates, Duration::from_millis(200)),
        channel.clone(),
        limits(),
    )
}

fn names(set: &BTreeSet<String>) -> Vec<&str> {
    set.iter().map(String::as_str).collect()
}

#[tokio::test]
async fn test_no_subscribers_forwards_nothing() {
    let registry = Arc::new(MockRegistry::new());
    let channel = Arc::new(MockChannel::new());
    let dispatcher = dispatcher(&registry, &channel, PredicateRegistry::new());

    let record = dispatcher.dispatch(r#"{"event_type":"t1"}"#).await.unwrap();
    assert!(record.subscribers.is_empty());
    assert!(record.forwarded.is_empty());
    assert!(channel.sent().await.is_empty());
}

#[tokio::test]
async fn test_empty_chain_forwards_identical_body_to_everyone() {
    let registry = Arc::new(MockRegistry::new());
    let channel = Arc::new(MockChannel::new());
    add_subscriber(&registry, "alice", "t1").await;
    add_subscriber(&registry, "bob", "t1").await;
    add_subscriber(&registry, "carol", "other").await;
    let dispatcher = dispatcher(&registry, &channel, PredicateRegistry::new());

    let body = r#"{ "event_type": "t1", "strategy": "s1",  "n": [1, 2] }"#;
    let record = dispatcher.dispatch(body).await.unwrap();

    assert_eq!(names(&record.authorized()), vec!["alice", "bob"]);
    assert_eq!(names(&record.forwarded), vec!["alice", "bob"]);
    assert!(record.failures.is_empty());
    assert!(!record.acknowledged);

    for user in ["alice", "bob"] {
        let sent = channel.sent_to(&channel_of(user)).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, body);
        assert_eq!(sent[0].ordering_key, ordering_key(user));
        assert_eq!(sent[0].dedup_id, fingerprint(body));
    }
    assert!(channel.sent_to(&channel_of("carol")).await.is_empty());
}

#[tokio::test]
async fn test_chain_is_anded_per_subscriber() {
    let registry = Arc::new(MockRegistry::new());
    let channel = Arc::new(MockChannel::new());
    add_subscriber(&registry, "alice", "t1").await;
    add_subscriber(&registry, "bob", "t1").await;
    map_chain(&registry, "t1", &["always", "not_bob"]).await;

    let mut predicates = PredicateRegistry::new();
    predicates.register_fn("always", |_, _| Ok(true));
    predicates.register_fn("not_bob", |user, _| Ok(user != "bob"));
    let dispatcher = dispatcher(&registry, &channel, predicates);

    let record = dispatcher.dispatch(r#"{"event_type":"t1"}"#).await.unwrap();
    assert_eq!(names(&record.forwarded), vec!["alice"]);
    assert_eq!(record.authorization["bob"], Authorization::Denied);
    assert!(channel.sent_to(&channel_of("bob")).await.is_empty());
}

#[tokio::test]
async fn test_admin_tag_scenario() {
    let mut strategies = tempfile::NamedTempFile::new().unwrap();
    write!(
        strategies,
        r#"{{"s1": {{"users": {{"alice": ["admin"], "bob": ["viewer"]}}}}}}"#
    )
    .unwrap();

    let registry = Arc::new(MockRegistry::new());
    let channel = Arc::new(MockChannel::new());
    add_subscriber(&registry, "alice", "t2").await;
    add_subscriber(&registry, "bob", "t2").await;
    map_chain(&registry, "t2", &[ADMIN_TAG_CHECK]).await;

    let mut predicates = PredicateRegistry::new();
    predicates.register(ADMIN_TAG_CHECK, AdminTagCheck::new(strategies.path()));
    let dispatcher = dispatcher(&registry, &channel, predicates);

    let record = dispatcher
        .dispatch(r#"{"event_type":"t2","strategy":"s1"}"#)
        .await
        .unwrap();
    assert_eq!(names(&record.forwarded), vec!["alice"]);
    assert_eq!(channel.sent().await.len(), 1);
}

#[tokio::test]
async fn test_predicate_fault_denies_only_that_subscriber() {
    let registry = Arc::new(MockRegistry::new());
    let channel = Arc::new(MockChannel::new());
    add_subscriber(&registry, "alice", "t1").await;
    add_subscriber(&registry, "bob", "t1").await;
    map_chain(&registry, "t1", &["flaky"]).await;

    let mut predicates = PredicateRegistry::new();
    predicates.register_fn("flaky", |user, _| {
        if user == "bob" {
            Err("lookup failed".into())
        } else {
            Ok(true)
        }
    });
    let dispatcher = dispatcher(&registry, &channel, predicates);

    let record = dispatcher.dispatch(r#"{"event_type":"t1"}"#).await.unwrap();
    assert_eq!(names(&record.forwarded), vec!["alice"]);
    assert!(matches!(record.authorization["bob"], Authorization::Fault(_)));
}

#[tokio::test]
async fn test_unknown_predicate_fails_closed() {
    let registry = Arc::new(MockRegistry::new());
    let channel = Arc::new(MockChannel::new());
    add_subscriber(&registry, "alice", "t1").await;
    map_chain(&registry, "t1", &["missing"]).await;
    let dispatcher = dispatcher(&registry, &channel, PredicateRegistry::new());

    let record = dispatcher.dispatch(r#"{"event_type":"t1"}"#).await.unwrap();
    assert!(record.authorized().is_empty());
    assert!(channel.sent().await.is_empty());
    assert_eq!(
        dispatcher.unresolved_acl_functions().await.unwrap(),
        vec!["missing".to_string()]
    );
}

#[tokio::test]
async fn test_send_failure_does_not_block_siblings_or_ack() {
    let registry = Arc::new(MockRegistry::new());
    let channel = Arc::new(MockChannel::new());
    add_subscriber(&registry, "alice", "t1").await;
    add_subscriber(&registry, "bob", "t1").await;
    channel.set_fail_on_send(&channel_of("bob"), true).await;
    let dispatcher = dispatcher(&registry, &channel, PredicateRegistry::new());

    channel.send(INBOUND, r#"{"event_type":"t1"}"#, "t1").await.unwrap();
    let message = channel.receive(INBOUND, 1).await.unwrap().remove(0);
    let record = dispatcher.process(&message).await.unwrap();

    assert_eq!(names(&record.forwarded), vec!["alice"]);
    assert!(matches!(record.failures["bob"], DeliveryFault::Send(_)));
    assert!(record.acknowledged);
    assert_eq!(channel.depth(INBOUND).await, 0);
}

#[tokio::test]
async fn test_send_timeout_is_a_delivery_fault() {
    let registry = Arc::new(MockRegistry::new());
    let channel = Arc::new(MockChannel::new());
    add_subscriber(&registry, "alice", "t1").await;
    channel
        .set_send_delay(Some(Duration::from_millis(500)))
        .await;
    let dispatcher = dispatcher(&registry, &channel, PredicateRegistry::new());

    let record = dispatcher.dispatch(r#"{"event_type":"t1"}"#).await.unwrap();
    assert!(record.forwarded.is_empty());
    assert!(matches!(record.failures["alice"], DeliveryFault::Timeout(_)));
}

#[tokio::test]
async fn test_redispatch_is_idempotent() {
    let registry = Arc::new(MockRegistry::new());
    let channel = Arc::new(MockChannel::new());
    add_subscriber(&registry, "alice", "t1").await;
    let dispatcher = dispatcher(&registry, &channel, PredicateRegistry::new());

    let body = r#"{"event_type":"t1","id":7}"#;
    dispatcher.dispatch(body).await.unwrap();
    dispatcher.dispatch(body).await.unwrap();

    // Both attempts reach the channel, the channel keeps one copy.
    assert_eq!(channel.sent_to(&channel_of("alice")).await.len(), 2);
    assert_eq!(channel.depth(&channel_of("alice")).await, 1);
}

#[tokio::test]
async fn test_malformed_event_is_not_acked() {
    let registry = Arc::new(MockRegistry::new());
    let channel = Arc::new(MockChannel::new());
    let dispatcher = dispatcher(&registry, &channel, PredicateRegistry::new());

    channel.send(INBOUND, r#"{"strategy":"s1"}"#, "g").await.unwrap();
    let message = channel.receive(INBOUND, 1).await.unwrap().remove(0);

    let err = dispatcher.process(&message).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::MalformedEvent(EventError::MissingEventType)
    ));
    assert_eq!(channel.depth(INBOUND).await, 1);
    assert!(channel.ack(INBOUND, &message.receipt_handle).await.unwrap());
}

#[tokio::test]
async fn test_registry_failure_is_event_level() {
    let registry = Arc::new(MockRegistry::new());
    let channel = Arc::new(MockChannel::new());
    add_subscriber(&registry, "alice", "t1").await;
    registry.set_fail_queries(true).await;
    let dispatcher = dispatcher(&registry, &channel, PredicateRegistry::new());

    channel.send(INBOUND, r#"{"event_type":"t1"}"#, "g").await.unwrap();
    let message = channel.receive(INBOUND, 1).await.unwrap().remove(0);

    let err = dispatcher.process(&message).await.unwrap_err();
    assert!(matches!(err, DispatchError::Registry(_)));
    assert_eq!(channel.depth(INBOUND).await, 1);
    assert!(channel.sent_to(&channel_of("alice")).await.is_empty());
}

#[tokio::test]
async fn test_registry_timeout_is_event_level() {
    let registry = Arc::new(MockRegistry::new());
    let channel = Arc::new(MockChannel::new());
    add_subscriber(&registry, "alice", "t1").await;
    registry
        .set_query_delay(Some(Duration::from_millis(500)))
        .await;
    let dispatcher = dispatcher(&registry, &channel, PredicateRegistry::new());

    let err = dispatcher
        .dispatch(r#"{"event_type":"t1"}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::RegistryTimeout(_)));
}

#[tokio::test]
async fn test_fan_out_beyond_concurrency_bound() {
    let registry = Arc::new(MockRegistry::new());
    let channel = Arc::new(MockChannel::new());
    let users: Vec<String> = (0..20).map(|i| format!("user{:02}", i)).collect();
    for user in &users {
        add_subscriber(&registry, user, "t1").await;
    }
    let dispatcher = dispatcher(&registry, &channel, PredicateRegistry::new());

    let record = dispatcher.dispatch(r#"{"event_type":"t1"}"#).await.unwrap();
    assert_eq!(record.forwarded.len(), 20);
    for user in &users {
        let sent = channel.sent_to(&channel_of(user)).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ordering_key, ordering_key(user));
    }
}
