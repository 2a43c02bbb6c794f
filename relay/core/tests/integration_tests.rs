//! Integration tests for the transport adapter over the in-process channel
//!
//! Covers the server dispatch path, lifecycle hook ordering, instance
//! selection and the client's publish/request correlation:
//! - One response per inbound message, isolated failing handlers
//! - Init hooks complete before readiness; failures abort startup
//! - Disconnect hooks run when a peer goes away
//! - Single-flight and request-ID correlation on the client

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_test::assert_ok;

use relay_core::{
    events, ClientChannel, ClientError, ClientOptions, Component, CorrelationMode,
    HandlerError, HandlerRegistry, HookResult, InProcessClient, InProcessServer, InstanceKind,
    InstanceRegistry, OnIpcDisconnect, OnIpcInit, Payload, PeerHandle, Registration, Reply,
    ResponseEvent, Scope, ServerChannel, ServerError, ServerOptions, TransportClient,
    TransportServer,
};

// =============================================================================
// Fixtures
// =============================================================================

const WAIT: Duration = Duration::from_secs(2);

type Journal = Arc<Mutex<Vec<String>>>;

/// Component that records each hook call into a shared journal
struct Recorder {
    name: &'static str,
    journal: Journal,
    fail_init: bool,
}

impl Recorder {
    fn new(name: &'static str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            name,
            journal: Arc::clone(journal),
            fail_init: false,
        })
    }

    fn failing(name: &'static str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            name,
            journal: Arc::clone(journal),
            fail_init: true,
        })
    }
}

impl Component for Recorder {
    fn init_hook(self: Arc<Self>) -> Option<Arc<dyn OnIpcInit>> {
        Some(self)
    }

    fn disconnect_hook(self: Arc<Self>) -> Option<Arc<dyn OnIpcDisconnect>> {
        Some(self)
    }
}

#[async_trait]
impl OnIpcInit for Recorder {
    async fn on_ipc_init(&self, _channel: &dyn ServerChannel) -> HookResult {
        tokio::task::yield_now().await;
        self.journal.lock().push(format!("init:{}", self.name));
        if self.fail_init {
            return Err(format!("{} refused to start", self.name).into());
        }
        Ok(())
    }
}

#[async_trait]
impl OnIpcDisconnect for Recorder {
    async fn on_ipc_disconnect(&self, _peer: &PeerHandle) -> HookResult {
        self.journal.lock().push(format!("disconnect:{}", self.name));
        Ok(())
    }
}

/// Component without hooks
struct Plain;

impl Component for Plain {}

fn pattern_responses() -> ServerOptions {
    ServerOptions {
        response_event: ResponseEvent::Pattern,
        ..ServerOptions::default()
    }
}

fn echo_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.subscribe("echo", |d| async move { Ok(d) }).unwrap();
    handlers
}

fn server_over(hub: &InProcessServer, handlers: HandlerRegistry) -> TransportServer {
    TransportServer::new(
        Arc::new(hub.clone()),
        handlers,
        InstanceRegistry::new(),
        pattern_responses(),
    )
}

fn capture(client: &InProcessClient, event: &str) -> UnboundedReceiver<Payload> {
    let (tx, rx) = unbounded_channel();
    client.events().on(event, move |e| {
        let _ = tx.send(e.data);
    });
    rx
}

async fn next(rx: &mut UnboundedReceiver<Payload>) -> Payload {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// =============================================================================
// Server dispatch
// =============================================================================

#[tokio::test]
async fn test_each_message_gets_exactly_one_response() {
    let hub = InProcessServer::new();
    let server = server_over(&hub, echo_handlers());
    assert_ok!(server.listen(|| {}).await);

    let client = hub.client();
    let mut replies = capture(&client, "echo");
    assert_ok!(client.connect().await);

    for n in 0..3 {
        assert_ok!(client.emit("echo", json!({ "n": n })).await);
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(next(&mut replies).await["n"].as_i64().unwrap());
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(replies.try_recv().is_err());
}

#[tokio::test]
async fn test_failing_handler_does_not_block_other_patterns() {
    let hub = InProcessServer::new();
    let mut handlers = echo_handlers();
    handlers
        .subscribe("explode", |_| async { Err(HandlerError::new("kaboom")) })
        .unwrap();
    let server = server_over(&hub, handlers);
    assert_ok!(server.listen(|| {}).await);

    let client = hub.client();
    let mut replies = capture(&client, "echo");
    assert_ok!(client.connect().await);

    assert_ok!(client.emit("explode", Payload::Null).await);
    assert_ok!(client.emit("echo", json!("still here")).await);

    assert_eq!(next(&mut replies).await, json!("still here"));
}

#[tokio::test]
async fn test_typed_handler_rejects_malformed_payload() {
    #[derive(serde::Deserialize)]
    struct Sum {
        a: i64,
        b: i64,
    }

    let hub = InProcessServer::new();
    let mut handlers = HandlerRegistry::new();
    handlers
        .subscribe_typed("sum", |req: Sum| async move { Ok(req.a + req.b) })
        .unwrap();

    let (err_tx, mut errors) = unbounded_channel();
    hub.events().on(events::ERROR, move |e| {
        let _ = err_tx.send(e.data);
    });
    let server = server_over(&hub, handlers);
    assert_ok!(server.listen(|| {}).await);

    let client = hub.client();
    let mut replies = capture(&client, "sum");
    assert_ok!(client.connect().await);

    assert_ok!(client.emit("sum", json!({ "a": 2, "b": 3 })).await);
    assert_eq!(next(&mut replies).await, json!(5));

    assert_ok!(client.emit("sum", json!("nonsense")).await);
    let error = next(&mut errors).await;
    assert_eq!(error["pattern"], json!("sum"));
    assert!(error["message"]
        .as_str()
        .unwrap()
        .starts_with("Invalid request payload"));
}

#[tokio::test]
async fn test_nothing_dispatched_after_close() {
    let hub = InProcessServer::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    let counter = Arc::clone(&calls);
    handlers
        .subscribe("count", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Payload::Null)
            }
        })
        .unwrap();

    let server = server_over(&hub, handlers);
    assert_ok!(server.listen(|| {}).await);
    assert_ok!(server.close().await);
    assert!(!server.is_listening());
    assert!(!hub.is_started());

    let peer = PeerHandle::new(None);
    hub.events().emit("count", Payload::Null, Some(peer));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Lifecycle hooks
// =============================================================================

#[tokio::test]
async fn test_ready_fires_after_every_init_hook() {
    let journal = Journal::default();
    let instances = InstanceRegistry::new();
    instances
        .register(Registration::provider("Store", Recorder::new("Store", &journal)))
        .unwrap();
    instances
        .register(Registration::controller("Api", Recorder::new("Api", &journal)).depends_on("Store"))
        .unwrap();
    instances
        .register(Registration::provider("Plain", Arc::new(Plain)))
        .unwrap();

    let hub = InProcessServer::new();
    let server = TransportServer::new(
        Arc::new(hub.clone()),
        HandlerRegistry::new(),
        instances,
        ServerOptions::default(),
    );

    let ready_journal = Arc::clone(&journal);
    assert_ok!(
        server
            .listen(move || ready_journal.lock().push("ready".to_string()))
            .await
    );

    assert_eq!(*journal.lock(), vec!["init:Api", "init:Store", "ready"]);
}

#[tokio::test]
async fn test_request_scoped_and_placeholder_instances_get_no_hooks() {
    let journal = Journal::default();
    let instances = InstanceRegistry::new();
    instances
        .register(Registration::provider("Session", Recorder::new("Session", &journal)).scope(Scope::Request))
        .unwrap();
    instances
        .register(Registration::provider("PerCall", Recorder::new("PerCall", &journal)).depends_on("Session"))
        .unwrap();
    instances
        .register(Registration::placeholder("Token", InstanceKind::Provider))
        .unwrap();
    instances
        .register(Registration::provider("Cache", Recorder::new("Cache", &journal)).depends_on("Token"))
        .unwrap();
    instances
        .register(Registration::provider("Pool", Recorder::new("Pool", &journal)).scope(Scope::Transient))
        .unwrap();

    let hub = InProcessServer::new();
    let server = TransportServer::new(
        Arc::new(hub.clone()),
        HandlerRegistry::new(),
        instances,
        ServerOptions::default(),
    );
    assert_ok!(server.listen(|| {}).await);

    assert_eq!(server.get_instances().names(), vec!["Cache", "Pool"]);
    assert_eq!(*journal.lock(), vec!["init:Cache", "init:Pool"]);
}

#[tokio::test]
async fn test_failing_init_hook_aborts_startup() {
    let journal = Journal::default();
    let instances = InstanceRegistry::new();
    instances
        .register(Registration::provider("First", Recorder::failing("First", &journal)))
        .unwrap();
    instances
        .register(Registration::provider("Second", Recorder::new("Second", &journal)))
        .unwrap();

    let hub = InProcessServer::new();
    let server = TransportServer::new(
        Arc::new(hub.clone()),
        echo_handlers(),
        instances,
        ServerOptions::default(),
    );

    let ready = Arc::new(AtomicUsize::new(0));
    let ready_count = Arc::clone(&ready);
    let result = server
        .listen(move || {
            ready_count.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    assert!(matches!(result, Err(ServerError::Hook(_))));
    assert_eq!(ready.load(Ordering::SeqCst), 0);
    assert_eq!(*journal.lock(), vec!["init:First"]);
    assert!(!server.is_listening());
    assert!(!hub.is_started());
    assert_eq!(hub.events().listener_count("echo"), 0);
}

#[tokio::test]
async fn test_unknown_dependency_rejected_before_start() {
    let instances = InstanceRegistry::new();
    instances
        .register(Registration::provider("Api", Arc::new(Plain)).depends_on("Missing"))
        .unwrap();

    let hub = InProcessServer::new();
    let server = TransportServer::new(
        Arc::new(hub.clone()),
        HandlerRegistry::new(),
        instances,
        ServerOptions::default(),
    );

    assert!(matches!(
        server.listen(|| {}).await,
        Err(ServerError::Registry(_))
    ));
    assert!(!hub.is_started());
}

#[tokio::test]
async fn test_disconnect_hooks_run_when_peer_leaves() {
    let journal = Journal::default();
    let instances = InstanceRegistry::new();
    instances
        .register(Registration::provider("Presence", Recorder::new("Presence", &journal)))
        .unwrap();

    let hub = InProcessServer::new();
    let server = TransportServer::new(
        Arc::new(hub.clone()),
        HandlerRegistry::new(),
        instances,
        ServerOptions::default(),
    );
    assert_ok!(server.listen(|| {}).await);

    let client = hub.client();
    assert_ok!(client.connect().await);
    assert_eq!(hub.peers().len(), 1);
    assert_ok!(client.disconnect().await);

    let observed = Arc::clone(&journal);
    eventually(move || observed.lock().len() == 2).await;
    assert_eq!(
        *journal.lock(),
        vec!["init:Presence", "disconnect:Presence"]
    );
    assert!(hub.peers().is_empty());
}

// =============================================================================
// Client correlation
// =============================================================================

fn reply_sink() -> (
    impl FnOnce(Reply) + Send + 'static,
    UnboundedReceiver<Reply>,
) {
    let (tx, rx) = unbounded_channel();
    (
        move |reply| {
            let _ = tx.send(reply);
        },
        rx,
    )
}

async fn next_reply(rx: &mut UnboundedReceiver<Reply>) -> Reply {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for reply")
        .expect("reply stream closed")
}

#[tokio::test]
async fn test_publish_success_detaches_listeners() {
    let hub = InProcessServer::new();
    let server = server_over(&hub, echo_handlers());
    assert_ok!(server.listen(|| {}).await);

    let channel = Arc::new(hub.client());
    let client = TransportClient::new(channel.clone(), ClientOptions::default());
    assert_ok!(client.connect().await);

    let (on_result, mut replies) = reply_sink();
    let pending = client.publish("echo", json!({ "x": 1 }), on_result).await;

    assert_eq!(next_reply(&mut replies).await, Reply::Response(json!({ "x": 1 })));
    assert!(pending.is_settled());
    assert_eq!(channel.events().listener_count("echo"), 0);
    assert_eq!(channel.events().listener_count(events::ERROR), 0);

    channel.events().emit("echo", json!("spurious"), None);
    assert!(replies.try_recv().is_err());
}

#[tokio::test]
async fn test_publish_error_branch() {
    let hub = InProcessServer::new();
    hub.start().await.unwrap();

    let channel = Arc::new(hub.client());
    let client = TransportClient::new(channel.clone(), ClientOptions::default());
    assert_ok!(client.connect().await);

    let (on_result, mut replies) = reply_sink();
    let pending = client.publish("slow", Payload::Null, on_result).await;
    assert!(!pending.is_settled());

    channel.events().emit(events::ERROR, json!("boom"), None);
    let reply = next_reply(&mut replies).await;
    assert_eq!(reply.error(), Some(&json!("boom")));
    assert_eq!(reply.response(), None);

    channel.events().emit("slow", json!("late"), None);
    assert!(replies.try_recv().is_err());
    assert_eq!(channel.events().listener_count("slow"), 0);
}

#[tokio::test]
async fn test_cancelled_publish_never_calls_back() {
    let hub = InProcessServer::new();
    hub.start().await.unwrap();

    let channel = Arc::new(hub.client());
    let client = TransportClient::new(channel.clone(), ClientOptions::default());
    assert_ok!(client.connect().await);

    let (on_result, mut replies) = reply_sink();
    let pending = client.publish("slow", Payload::Null, on_result).await;
    pending.cancel();
    pending.cancel();

    channel.events().emit("slow", json!("late"), None);
    channel.events().emit(events::ERROR, json!("late"), None);
    assert!(replies.try_recv().is_err());
    assert_eq!(channel.events().listener_count("slow"), 0);
    assert_eq!(channel.events().listener_count(events::ERROR), 0);
}

#[tokio::test]
async fn test_single_flight_requests_share_first_response() {
    let hub = InProcessServer::new();
    hub.start().await.unwrap();

    let channel = Arc::new(hub.client());
    let client = TransportClient::new(channel.clone(), ClientOptions::default());
    assert_ok!(client.connect().await);

    let (first_cb, mut first) = reply_sink();
    let (second_cb, mut second) = reply_sink();
    client.publish("lookup", json!(1), first_cb).await;
    client.publish("lookup", json!(2), second_cb).await;

    let peer = hub.peers().pop().unwrap();
    hub.emit_to(&peer, "lookup", json!("answer")).await.unwrap();

    assert_eq!(next_reply(&mut first).await, Reply::Response(json!("answer")));
    assert_eq!(next_reply(&mut second).await, Reply::Response(json!("answer")));
}

#[tokio::test]
async fn test_request_id_mode_keeps_concurrent_requests_apart() {
    let hub = InProcessServer::new();
    let mut handlers = HandlerRegistry::new();
    handlers
        .subscribe("delay", |d: Payload| async move {
            let ms = d.as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept": ms }))
        })
        .unwrap();
    let server = TransportServer::new(
        Arc::new(hub.clone()),
        handlers,
        InstanceRegistry::new(),
        ServerOptions {
            correlation: CorrelationMode::RequestId,
            ..ServerOptions::default()
        },
    );
    assert_ok!(server.listen(|| {}).await);

    let client = TransportClient::new(
        Arc::new(hub.client()),
        ClientOptions {
            correlation: CorrelationMode::RequestId,
            request_timeout: Some(WAIT),
        },
    );
    assert_ok!(client.connect().await);

    let (slow, fast) = tokio::join!(
        client.request("delay", json!(80)),
        client.request("delay", json!(5)),
    );
    assert_eq!(slow.unwrap(), json!({ "slept": 80 }));
    assert_eq!(fast.unwrap(), json!({ "slept": 5 }));
}

#[tokio::test]
async fn test_request_times_out_and_cleans_up() {
    let hub = InProcessServer::new();
    hub.start().await.unwrap();

    let channel = Arc::new(hub.client());
    let client = TransportClient::new(
        channel.clone(),
        ClientOptions {
            request_timeout: Some(Duration::from_millis(30)),
            ..ClientOptions::default()
        },
    );
    assert_ok!(client.connect().await);

    let err = client.request("void", Payload::Null).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout { .. }));
    assert_eq!(channel.events().listener_count("void"), 0);
}

#[tokio::test]
async fn test_request_before_connect_fails_through_error_branch() {
    let hub = InProcessServer::new();
    let client = TransportClient::new(Arc::new(hub.client()), ClientOptions::default());

    let err = client.request("echo", Payload::Null).await.unwrap_err();
    assert!(matches!(err, ClientError::Remote { .. }));
}
