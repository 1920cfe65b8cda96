//! End-to-end flows between two cores over an in-process relay

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use wc_core::expirer::ExpirerTarget;
use wc_core::pairing::PairingUri;
use wc_core::relayer::connection::{ConnectionEvents, RelayConnection, TransportError};
use wc_core::relayer::loopback::{LoopbackConnection, LoopbackRelay};
use wc_core::relayer::PublishOptions;
use wc_core::rpc::{JsonRpcRequest, PairingDelete, PairingPing, PublishPolicy, RpcMethod, RpcMethodMetadata};
use wc_core::time::unix_now;
use wc_core::{Core, CoreOptions, Error, KeyValueStorage, MemoryStorage, PairingEvent, Reply};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SessionPing {}

impl RpcMethod for SessionPing {
    type Response = bool;

    const METADATA: RpcMethodMetadata = RpcMethodMetadata {
        method: "wc_sessionPing",
        request: PublishPolicy {
            ttl: 30,
            tag: 1114,
            prompt: false,
        },
        response: PublishPolicy {
            ttl: 30,
            tag: 1115,
            prompt: false,
        },
    };
}

/// One-way notice with a two second TTL
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Notice {
    text: String,
}

impl RpcMethod for Notice {
    type Response = bool;

    const METADATA: RpcMethodMetadata = RpcMethodMetadata {
        method: "wc_testNotice",
        request: PublishPolicy {
            ttl: 2,
            tag: 9100,
            prompt: false,
        },
        response: PublishPolicy {
            ttl: 2,
            tag: 9101,
            prompt: false,
        },
    };
}

/// Loopback connection that can be told to refuse new connections
struct RefusingConnection {
    inner: Arc<LoopbackConnection>,
    refuse: AtomicBool,
}

#[async_trait]
impl RelayConnection for RefusingConnection {
    async fn open(&self, url: &str, events: ConnectionEvents) -> Result<(), TransportError> {
        if self.refuse.load(Ordering::Acquire) {
            return Err(TransportError::Connect("refused".into()));
        }
        self.inner.open(url, events).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    async fn send(&self, payload: String) -> Result<(), TransportError> {
        self.inner.send(payload).await
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

fn memory() -> Arc<dyn KeyValueStorage> {
    Arc::new(MemoryStorage::new())
}

fn options() -> CoreOptions {
    CoreOptions {
        heartbeat_interval: Duration::from_millis(200),
        ..CoreOptions::default()
    }
}

async fn start_core(relay: &LoopbackRelay, storage: Arc<dyn KeyValueStorage>, options: CoreOptions) -> Arc<Core> {
    let core = Core::new(options, storage, relay.connection());
    core.start().await.unwrap();
    core
}

async fn next_event(
    events: &mut broadcast::Receiver<PairingEvent>,
    matches: impl Fn(&PairingEvent) -> bool,
) -> PairingEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("pairing event")
}

async fn eventually(condition: impl Fn() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn test_pair_ping_and_disconnect() {
    let relay = LoopbackRelay::new();
    let alice = start_core(&relay, memory(), options()).await;
    let bob = start_core(&relay, memory(), options()).await;
    let mut alice_events = alice.pairing().subscribe();

    let created = alice.pairing().create(None).await.unwrap();
    assert!(!alice.pairing().get_pairing(&created.topic).unwrap().active);

    let paired = bob.pairing().pair(&created.uri, true).await.unwrap();
    assert_eq!(paired.topic, created.topic);
    assert!(paired.active);
    assert!(paired.expiry > unix_now() + 29 * 24 * 3600);

    bob.pairing().ping(&created.topic).await.unwrap();
    next_event(&mut alice_events, |e| {
        matches!(e, PairingEvent::Ping { topic, .. } if *topic == created.topic)
    })
    .await;

    bob.pairing().disconnect(&created.topic).await.unwrap();
    assert!(bob.pairing().get_pairings().unwrap().is_empty());
    assert!(!bob.crypto().has_keys(&created.topic));
    assert!(bob.expirer().is_empty());
    assert!(bob.handler().history::<PairingDelete>().await.unwrap().is_empty());

    match next_event(&mut alice_events, |e| matches!(e, PairingEvent::Deleted { .. })).await {
        PairingEvent::Deleted { topic, reason } => {
            assert_eq!(topic, created.topic);
            assert_eq!(reason.code, 6000);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(alice.pairing().get_pairings().unwrap().is_empty());
    assert!(!alice.crypto().has_keys(&created.topic));
    assert!(!alice.relayer().subscriber().is_subscribed(&created.topic));
    assert!(alice.expirer().is_empty());
    assert!(alice.handler().history::<PairingPing>().await.unwrap().is_empty());
    assert!(alice.handler().history::<PairingDelete>().await.unwrap().is_empty());
    assert_eq!(alice.relayer().tracker().topics(), 0);
}

#[tokio::test]
async fn test_ping_unknown_pairing() {
    let relay = LoopbackRelay::new();
    let alice = start_core(&relay, memory(), options()).await;

    let err = alice.pairing().ping("not-a-topic").await.unwrap_err();
    assert!(matches!(err, Error::NoMatchingTopic { .. }));
}

#[tokio::test]
async fn test_pair_rejects_expired_uri() {
    let relay = LoopbackRelay::new();
    let alice = start_core(&relay, memory(), options()).await;
    let bob = start_core(&relay, memory(), options()).await;

    let created = alice.pairing().create(None).await.unwrap();
    let mut uri = PairingUri::parse(&created.uri).unwrap();
    uri.expiry_timestamp = Some(unix_now() - 1);

    let err = bob.pairing().pair(&uri.to_string(), false).await.unwrap_err();
    assert!(matches!(err, Error::Expired(_)));
    assert!(bob.pairing().get_pairings().unwrap().is_empty());
}

#[tokio::test]
async fn test_pairing_expires() {
    let relay = LoopbackRelay::new();
    let alice = start_core(&relay, memory(), options()).await;
    let mut events = alice.pairing().subscribe();

    let created = alice.pairing().create(None).await.unwrap();
    alice
        .pairing()
        .update_expiry(&created.topic, unix_now() + 1)
        .await
        .unwrap();

    next_event(&mut events, |e| {
        matches!(e, PairingEvent::Expired { topic } if *topic == created.topic)
    })
    .await;
    assert!(alice.pairing().get_pairings().unwrap().is_empty());
    assert!(!alice.expirer().has(created.topic.as_str()));
    assert!(!alice.crypto().has_keys(&created.topic));
}

#[tokio::test]
async fn test_request_timeout_cleans_up() {
    let relay = LoopbackRelay::new();
    let bob = start_core(&relay, memory(), options()).await;

    // nobody else is on this topic
    let created = bob.pairing().create(None).await.unwrap();
    let err = bob
        .handler()
        .request(&created.topic, PairingPing {}, Some(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    assert!(bob
        .expirer()
        .values()
        .iter()
        .all(|e| matches!(e.target(), Ok(ExpirerTarget::Topic(_)))));
    assert!(bob.handler().history::<PairingPing>().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_method_rejected_when_configured() {
    let relay = LoopbackRelay::new();
    let strict = CoreOptions {
        reject_unknown_methods: true,
        ..options()
    };
    let alice = start_core(&relay, memory(), strict).await;
    let bob = start_core(&relay, memory(), options()).await;

    let created = alice.pairing().create(None).await.unwrap();
    bob.pairing().pair(&created.uri, false).await.unwrap();

    let err = bob
        .handler()
        .request(&created.topic, SessionPing {}, None)
        .await
        .unwrap_err();
    match err {
        Error::Rpc { code, .. } => assert_eq!(code, 10001),
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn test_unknown_method_dropped_by_default() {
    let relay = LoopbackRelay::new();
    let alice = start_core(&relay, memory(), options()).await;
    let bob = start_core(&relay, memory(), options()).await;

    let created = alice.pairing().create(None).await.unwrap();
    bob.pairing().pair(&created.uri, false).await.unwrap();

    let err = bob
        .handler()
        .request(&created.topic, SessionPing {}, Some(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
}

#[tokio::test]
async fn test_concurrent_subscribe_hits_relay_once() {
    let relay = LoopbackRelay::new();
    let alice = start_core(&relay, memory(), options()).await;
    let before = relay.subscribe_requests();
    let topic = "7".repeat(64);

    let (first, second) = tokio::join!(
        alice.relayer().subscribe(&topic, None),
        alice.relayer().subscribe(&topic, None)
    );
    let id = first.unwrap();
    assert_eq!(second.unwrap(), id);
    assert_eq!(alice.relayer().subscribe(&topic, None).await.unwrap(), id);
    assert_eq!(relay.subscribe_requests(), before + 1);
}

#[tokio::test]
async fn test_publish_without_subscribers() {
    let relay = LoopbackRelay::new();
    let alice = start_core(&relay, memory(), options()).await;

    let publish = PublishOptions {
        ttl: 30,
        ..PublishOptions::default()
    };
    alice
        .relayer()
        .publish(&"a".repeat(64), "hello", &publish)
        .await
        .unwrap();
    assert_eq!(relay.publish_requests(), 1);
}

#[tokio::test]
async fn test_redelivered_messages_are_dropped() {
    let relay = LoopbackRelay::new();
    let alice = start_core(&relay, memory(), options()).await;
    let bob = start_core(&relay, memory(), options()).await;
    let mut alice_events = alice.pairing().subscribe();

    let created = alice.pairing().create(None).await.unwrap();
    bob.pairing().pair(&created.uri, true).await.unwrap();

    bob.pairing().ping(&created.topic).await.unwrap();
    relay.redeliver(&created.topic);
    // the second ping orders after the redelivery on alice's topic worker
    bob.pairing().ping(&created.topic).await.unwrap();

    let mut pings = 0;
    while let Ok(event) = alice_events.try_recv() {
        if matches!(event, PairingEvent::Ping { .. }) {
            pings += 1;
        }
    }
    assert_eq!(pings, 2);
}

#[tokio::test]
async fn test_resubscribe_after_relay_drop() {
    let relay = LoopbackRelay::new();
    let alice = start_core(&relay, memory(), options()).await;
    let bob = start_core(&relay, memory(), options()).await;

    let created = alice.pairing().create(None).await.unwrap();
    bob.pairing().pair(&created.uri, true).await.unwrap();
    let before = relay.subscribe_requests();

    relay.disconnect_all("relay restarting");
    eventually(|| {
        relay.subscribe_requests() >= before + 2
            && alice.relayer().is_connected()
            && bob.relayer().is_connected()
    })
    .await;

    bob.pairing().ping(&created.topic).await.unwrap();
    let urls = relay.connected_urls();
    assert_eq!(urls.len(), 4);
    assert!(urls.iter().all(|url| url.contains("auth=")));
}

#[tokio::test]
async fn test_restart_restores_state() {
    let relay = LoopbackRelay::new();
    let alice_storage = memory();
    let alice = start_core(&relay, alice_storage.clone(), options()).await;
    let bob = start_core(&relay, memory(), options()).await;
    let client_id = alice.crypto().client_id().unwrap();

    let created = alice.pairing().create(None).await.unwrap();
    bob.pairing().pair(&created.uri, true).await.unwrap();
    alice.stop().await.unwrap();
    drop(alice);

    let alice = start_core(&relay, alice_storage, options()).await;
    assert_eq!(alice.crypto().client_id().unwrap(), client_id);
    assert_eq!(alice.pairing().get_pairings().unwrap().len(), 1);
    assert!(alice.expirer().has(created.topic.as_str()));
    assert!(alice.crypto().has_keys(&created.topic));

    bob.pairing().ping(&created.topic).await.unwrap();
}

#[tokio::test]
async fn test_failed_subscribe_leaves_no_pairing() {
    let relay = LoopbackRelay::new();
    let connection = Arc::new(RefusingConnection {
        inner: relay.connection(),
        refuse: AtomicBool::new(false),
    });
    let alice = Core::new(options(), memory(), connection.clone());
    alice.start().await.unwrap();
    let bob = start_core(&relay, memory(), options()).await;
    let offered = bob.pairing().create(None).await.unwrap();

    let keys_before = alice.crypto().keychain().entries().len();
    alice.relayer().transport_close().await.unwrap();
    connection.refuse.store(true, Ordering::Release);

    let err = alice.pairing().create(None).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err}");
    let err = alice.pairing().pair(&offered.uri, false).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err}");

    assert!(alice.pairing().get_pairings().unwrap().is_empty());
    assert!(alice.expirer().is_empty());
    assert!(!alice.crypto().has_keys(&offered.topic));
    assert_eq!(alice.crypto().keychain().entries().len(), keys_before);
}

#[tokio::test]
async fn test_undecryptable_messages_do_not_stall_other_topics() {
    let relay = LoopbackRelay::new();
    let alice = start_core(&relay, memory(), options()).await;
    let bob = start_core(&relay, memory(), options()).await;
    let first = alice.pairing().create(None).await.unwrap();
    let second = alice.pairing().create(None).await.unwrap();
    bob.pairing().pair(&first.uri, true).await.unwrap();
    bob.pairing().pair(&second.uri, true).await.unwrap();
    let mut alice_events = alice.pairing().subscribe();

    let forged = JsonRpcRequest::new("wc_pairingPing", PairingPing {});
    let forged_json = serde_json::to_string(&forged).unwrap();
    let forged_plain = STANDARD.encode(&forged_json);
    let publish = PublishOptions {
        ttl: 30,
        ..PublishOptions::default()
    };
    for garbage in ["not an envelope", "AQID", forged_json.as_str(), forged_plain.as_str()] {
        bob.relayer().publish(&first.topic, garbage, &publish).await.unwrap();
    }

    bob.pairing().ping(&second.topic).await.unwrap();
    bob.pairing().ping(&first.topic).await.unwrap();

    let mut pings = Vec::new();
    while let Ok(event) = alice_events.try_recv() {
        if let PairingEvent::Ping { topic, id } = event {
            pings.push((topic, id));
        }
    }
    assert_eq!(pings.len(), 2);
    assert!(pings.iter().any(|(topic, _)| *topic == first.topic));
    assert!(pings.iter().any(|(topic, _)| *topic == second.topic));
    assert!(pings.iter().all(|(_, id)| *id != forged.id));
}

#[tokio::test]
async fn test_unanswered_inbound_request_expires() {
    let relay = LoopbackRelay::new();
    let alice = start_core(&relay, memory(), options()).await;
    let bob = start_core(&relay, memory(), options()).await;
    let created = alice.pairing().create(None).await.unwrap();
    bob.pairing().pair(&created.uri, true).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    alice
        .handler()
        .handle_message_type::<Notice, _, _, _, _>(
            move |_topic, request: JsonRpcRequest<Notice>| {
                let _ = tx.send(request.id);
                async { Reply::NoReply }
            },
            |_topic, _response| async {},
        )
        .await
        .unwrap();

    bob.handler()
        .send_request(&created.topic, Notice { text: "hello".into() }, None)
        .await
        .unwrap();
    let id = timeout(WAIT, rx.recv()).await.unwrap().unwrap();

    let received = alice.handler().history::<Notice>().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(received[0].expiry.is_some_and(|expiry| expiry <= unix_now() + 2));
    assert!(alice.expirer().has(id));

    timeout(WAIT, async {
        while !alice.handler().history::<Notice>().await.unwrap().is_empty() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("inbound record never expired");
    assert!(!alice.expirer().has(id));
}
