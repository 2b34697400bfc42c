use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use kameo::Actor;
use kameo::prelude::ActorRef;
use sonic_rs::{Value, json};
use subwire::core::{
    ConnectionId, FixedRetry, Network, SubscribeRequest, SubscriptionCallbacks, SubscriptionId,
    TransportPayload,
};
use subwire::testing::{MemoryStore, MockHost};
use subwire::{
    EndpointConfig, EngineArgs, GetConnectionId, GetSubscription, OpenConnection, Subscribe,
    SubscriptionEngine, spawn_event_pump,
};

type Engine = SubscriptionEngine<MockHost, MemoryStore, FixedRetry>;

fn spawn_engine() -> (ActorRef<Engine>, MockHost) {
    let (host, events) = MockHost::new();
    let config = EndpointConfig::new().with_endpoint("mainnet", "wss://mainnet.example");
    let engine = SubscriptionEngine::spawn(EngineArgs {
        host: host.clone(),
        store: Arc::new(MemoryStore::new()),
        config,
        retry: FixedRetry::new(1, Duration::ZERO),
    });
    let _pump = spawn_event_pump(events, engine.clone());
    (engine, host)
}

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Subscribe with a collecting callback and drive the record to confirmed
/// with the given server-assigned id.
async fn confirmed_subscription(
    engine: &ActorRef<Engine>,
    host: &MockHost,
    connection: ConnectionId,
    request_id: u64,
    rpc_subscription_id: u64,
) -> (SubscriptionId, Arc<Mutex<Vec<Value>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let id = engine
        .ask(Subscribe {
            request: SubscribeRequest {
                network: Network::new("mainnet"),
                method: "accountSubscribe".to_string(),
                unsubscribe_method: "accountUnsubscribe".to_string(),
                params: json!([format!("pubkey-{request_id}")]),
            },
            callbacks: SubscriptionCallbacks::notify_only(Box::new(move |value| {
                sink.lock().unwrap().push(value);
                Ok(())
            })),
        })
        .await
        .unwrap();

    host.push_message(
        connection,
        TransportPayload::Text(Bytes::from(format!(
            r#"{{"jsonrpc":"2.0","id":{request_id},"result":{rpc_subscription_id}}}"#
        ))),
    );
    let probe = engine.clone();
    let probe_id = id.clone();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let record = probe
            .ask(GetSubscription(probe_id.clone()))
            .await
            .unwrap()
            .expect("record present");
        if !record.is_pending() {
            break;
        }
        if Instant::now() >= deadline {
            panic!("subscription never confirmed");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (id, received)
}

fn notification(rpc_subscription_id: u64, slot: u64) -> TransportPayload {
    TransportPayload::Text(Bytes::from(format!(
        r#"{{"jsonrpc":"2.0","method":"accountNotification","params":{{"subscription":{rpc_subscription_id},"result":{{"slot":{slot}}}}}}}"#
    )))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notifications_route_by_server_id() {
    let (engine, host) = spawn_engine();
    let connection = engine
        .ask(OpenConnection(Network::new("mainnet")))
        .await
        .unwrap();

    let (_a, received_a) = confirmed_subscription(&engine, &host, connection, 1, 10).await;
    let (_b, received_b) = confirmed_subscription(&engine, &host, connection, 2, 20).await;

    host.push_message(connection, notification(10, 111));
    let probe_a = Arc::clone(&received_a);
    wait_for(|| !probe_a.lock().unwrap().is_empty(), "first notification").await;
    assert!(received_b.lock().unwrap().is_empty());

    host.push_message(connection, notification(20, 222));
    host.push_message(connection, notification(20, 223));
    let probe_b = Arc::clone(&received_b);
    wait_for(|| probe_b.lock().unwrap().len() == 2, "second notifications").await;
    assert_eq!(received_a.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_server_id_is_dropped_without_damage() {
    let (engine, host) = spawn_engine();
    let connection = engine
        .ask(OpenConnection(Network::new("mainnet")))
        .await
        .unwrap();

    let (_id, received) = confirmed_subscription(&engine, &host, connection, 1, 10).await;

    host.push_message(connection, notification(99, 1));
    host.push_message(connection, notification(10, 2));
    let probe = Arc::clone(&received);
    wait_for(|| !probe.lock().unwrap().is_empty(), "routed notification").await;

    // Only the matching notification was delivered and the engine still
    // answers queries.
    assert_eq!(received.lock().unwrap().len(), 1);
    let resolved: Option<ConnectionId> = engine
        .ask(GetConnectionId(Network::new("mainnet")))
        .await
        .unwrap();
    assert_eq!(resolved, Some(connection));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_callback_does_not_affect_others() {
    let (engine, host) = spawn_engine();
    let connection = engine
        .ask(OpenConnection(Network::new("mainnet")))
        .await
        .unwrap();

    let poisoned_calls = Arc::new(Mutex::new(0usize));
    let poisoned_probe = Arc::clone(&poisoned_calls);
    engine
        .ask(Subscribe {
            request: SubscribeRequest {
                network: Network::new("mainnet"),
                method: "accountSubscribe".to_string(),
                unsubscribe_method: "accountUnsubscribe".to_string(),
                params: json!(["poisoned"]),
            },
            callbacks: SubscriptionCallbacks::notify_only(Box::new(move |_| {
                *poisoned_probe.lock().unwrap() += 1;
                Err("handler exploded".into())
            })),
        })
        .await
        .unwrap();
    host.push_message(
        connection,
        TransportPayload::Text(Bytes::from_static(br#"{"jsonrpc":"2.0","id":1,"result":10}"#)),
    );

    let (_healthy, received) = confirmed_subscription(&engine, &host, connection, 2, 20).await;

    host.push_message(connection, notification(10, 1));
    host.push_message(connection, notification(20, 2));

    let probe = Arc::clone(&received);
    wait_for(|| !probe.lock().unwrap().is_empty(), "healthy notification").await;
    assert_eq!(*poisoned_calls.lock().unwrap(), 1);

    // The poisoned callback keeps erroring on every delivery without being
    // dropped.
    host.push_message(connection, notification(10, 3));
    let poisoned_again = Arc::clone(&poisoned_calls);
    wait_for(|| *poisoned_again.lock().unwrap() == 2, "poisoned redelivery").await;
}
