use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kameo::Actor;
use kameo::prelude::ActorRef;
use sonic_rs::json;
use subwire::core::{
    FixedRetry, Network, RecoveryCallback, RequestId, SubscribeRequest, Subscription,
    SubscriptionCallbacks, SubscriptionId, SubscriptionState, now_epoch_ms,
};
use subwire::store::KvStoreExt;
use subwire::testing::{MemoryStore, MockHost};
use subwire::{
    EndpointConfig, EngineArgs, GetSubscription, OpenConnection, RegisterRecovery, Subscribe,
    SubscriptionEngine, spawn_event_pump,
};

type Engine = SubscriptionEngine<MockHost, MemoryStore, FixedRetry>;

fn spawn_engine_with_store(store: Arc<MemoryStore>) -> (ActorRef<Engine>, MockHost) {
    let (host, events) = MockHost::new();
    let config = EndpointConfig::new().with_endpoint("mainnet", "wss://mainnet.example");
    let engine = SubscriptionEngine::spawn(EngineArgs {
        host: host.clone(),
        store,
        config,
        retry: FixedRetry::new(1, Duration::ZERO),
    });
    let _pump = spawn_event_pump(events, engine.clone());
    (engine, host)
}

fn spawn_engine() -> (ActorRef<Engine>, MockHost) {
    spawn_engine_with_store(Arc::new(MemoryStore::new()))
}

fn counting_recovery(counter: Arc<AtomicUsize>) -> RecoveryCallback {
    Box::new(move || {
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    })
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

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribe_while_disconnected_defers_until_connect() {
    let (engine, host) = spawn_engine();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let id = engine
        .ask(Subscribe {
            request: SubscribeRequest {
                network: Network::new("mainnet"),
                method: "accountSubscribe".to_string(),
                unsubscribe_method: "accountUnsubscribe".to_string(),
                params: json!(["pubkey"]),
            },
            callbacks: SubscriptionCallbacks::notify_only(Box::new(move |value| {
                sink.lock().unwrap().push(value);
                Ok(())
            })),
        })
        .await
        .unwrap();

    // The record exists but nothing went on the wire yet.
    assert!(host.sent_texts().is_empty());
    let record = engine
        .ask(GetSubscription(id))
        .await
        .unwrap()
        .expect("pending record persisted");
    assert_eq!(record.request_id(), Some(RequestId(1)));

    engine
        .ask(OpenConnection(Network::new("mainnet")))
        .await
        .unwrap();

    let host_probe = host.clone();
    wait_for(|| !host_probe.sent_texts().is_empty(), "deferred subscribe").await;
    let sent = host.sent_texts();
    assert_eq!(sent.len(), 1);
    // The deferred call keeps the request id allocated at subscribe time.
    assert!(sent[0].contains(r#""id":1"#), "wire: {}", sent[0]);
    assert!(sent[0].contains(r#""method":"accountSubscribe""#), "wire: {}", sent[0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recovery_callbacks_fan_out_on_every_connect() {
    let (engine, host) = spawn_engine();

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    engine
        .tell(RegisterRecovery(counting_recovery(Arc::clone(&first))))
        .send()
        .await
        .unwrap();
    engine
        .tell(RegisterRecovery(counting_recovery(Arc::clone(&second))))
        .send()
        .await
        .unwrap();
    // A callback that always fails sits between the two counters.
    engine
        .tell(RegisterRecovery(Box::new(|| {
            Box::pin(async { Err("resync failed".into()) })
        })))
        .send()
        .await
        .unwrap();

    let connection = engine
        .ask(OpenConnection(Network::new("mainnet")))
        .await
        .unwrap();
    let first_probe = Arc::clone(&first);
    let second_probe = Arc::clone(&second);
    wait_for(
        || first_probe.load(Ordering::SeqCst) == 1 && second_probe.load(Ordering::SeqCst) == 1,
        "first fan-out",
    )
    .await;

    host.drop_connection(connection);
    let first_probe = Arc::clone(&first);
    let second_probe = Arc::clone(&second);
    wait_for(
        || first_probe.load(Ordering::SeqCst) == 2 && second_probe.load(Ordering::SeqCst) == 2,
        "reconnect fan-out",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscription_recovery_callback_runs_on_reconnect() {
    let (engine, host) = spawn_engine();
    let connection = engine
        .ask(OpenConnection(Network::new("mainnet")))
        .await
        .unwrap();

    let recoveries = Arc::new(AtomicUsize::new(0));
    engine
        .ask(Subscribe {
            request: SubscribeRequest {
                network: Network::new("mainnet"),
                method: "slotSubscribe".to_string(),
                unsubscribe_method: "slotUnsubscribe".to_string(),
                params: json!([]),
            },
            callbacks: SubscriptionCallbacks {
                on_notification: Box::new(|_| Ok(())),
                on_subscription_failed: None,
                on_connection_recovery: Some(counting_recovery(Arc::clone(&recoveries))),
            },
        })
        .await
        .unwrap();

    // Let any fan-out from the initial connect settle before measuring.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let baseline = recoveries.load(Ordering::SeqCst);

    host.drop_connection(connection);
    let probe = Arc::clone(&recoveries);
    wait_for(
        || probe.load(Ordering::SeqCst) > baseline,
        "recovery after reconnect",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn startup_reaps_orphaned_records() {
    let store = Arc::new(MemoryStore::new());

    // Seed records from a previous process lifetime: one confirmed, one
    // still pending.
    let confirmed = Subscription {
        id: SubscriptionId("orphan-confirmed".to_string()),
        network: Network::new("mainnet"),
        method: "accountSubscribe".to_string(),
        unsubscribe_method: "accountUnsubscribe".to_string(),
        params: json!(["pubkey"]),
        created_at: now_epoch_ms(),
        state: SubscriptionState::Confirmed {
            rpc_subscription_id: subwire::core::RpcSubscriptionId(555),
            confirmed_at: now_epoch_ms(),
        },
    };
    let pending = Subscription {
        id: SubscriptionId("orphan-pending".to_string()),
        network: Network::new("mainnet"),
        method: "logsSubscribe".to_string(),
        unsubscribe_method: "logsUnsubscribe".to_string(),
        params: json!([]),
        created_at: now_epoch_ms(),
        state: SubscriptionState::Pending {
            request_id: RequestId(9),
        },
    };
    let mut seed = std::collections::BTreeMap::new();
    seed.insert(confirmed.id.0.clone(), confirmed);
    seed.insert(pending.id.0.clone(), pending);
    store.set_json("subscriptions", &seed).await.unwrap();

    let (engine, host) = spawn_engine_with_store(Arc::clone(&store));

    // Both records are gone after startup.
    for orphan in ["orphan-confirmed", "orphan-pending"] {
        let record = engine
            .ask(GetSubscription(SubscriptionId(orphan.to_string())))
            .await
            .unwrap();
        assert!(record.is_none(), "{orphan} should be reaped");
    }

    // Connecting flushes the queued unsubscribe for the confirmed orphan;
    // the pending orphan produces no wire traffic.
    engine
        .ask(OpenConnection(Network::new("mainnet")))
        .await
        .unwrap();
    let host_probe = host.clone();
    wait_for(|| !host_probe.sent_texts().is_empty(), "orphan unsubscribe").await;

    let sent = host.sent_texts();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains(r#""method":"accountUnsubscribe""#), "wire: {}", sent[0]);
    assert!(sent[0].contains(r#""params":[555]"#), "wire: {}", sent[0]);
}
