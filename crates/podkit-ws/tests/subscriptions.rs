//! End-to-end behaviour of `WsClient` over an in-memory socket.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use futures::channel::mpsc as duplex;
use futures::{FutureExt, SinkExt, StreamExt};
use podkit_core::policy::{ReconnectConfig, ReconnectPolicy};
use podkit_core::{Connector, FrameSink, FrameStream, Receipt, ReceiptFetcher, TransportError, TxHash};
use podkit_tx::PendingTransaction;
use podkit_ws::{Channel, ConnectionState, Decode, StreamEvent, SubscriptionStream, WsClient, WsConfig, WsError};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;

// ─── Helpers ──────────────────────────────────────────────────────────────────

/// The node's end of one in-memory socket. Dropping it closes the socket.
struct ServerConn {
    inbound: duplex::UnboundedReceiver<String>,
    outbound: duplex::UnboundedSender<Result<String, TransportError>>,
}

impl ServerConn {
    async fn recv(&mut self) -> Value {
        let text = self.inbound.next().await.expect("client closed the socket");
        serde_json::from_str(&text).unwrap()
    }

    fn try_recv(&mut self) -> Option<Value> {
        match self.inbound.try_next() {
            Ok(Some(text)) => Some(serde_json::from_str(&text).unwrap()),
            _ => None,
        }
    }

    fn send(&self, frame: Value) {
        self.outbound.unbounded_send(Ok(frame.to_string())).unwrap();
    }

    fn send_text(&self, text: &str) {
        self.outbound.unbounded_send(Ok(text.to_string())).unwrap();
    }

    fn push(&self, channel: &str, data: Value) {
        self.send(json!({ "channel": channel, "data": data }));
    }

    /// Read one request and acknowledge it.
    async fn ack(&mut self) -> Value {
        let frame = self.recv().await;
        self.send(json!({ "id": frame["id"], "result": true }));
        frame
    }
}

struct MemoryConnector {
    accepted: mpsc::UnboundedSender<ServerConn>,
    refuse: AtomicBool,
    /// The next socket accepts the connect but fails every write.
    break_writes: AtomicBool,
    connects: AtomicU32,
}

impl MemoryConnector {
    fn break_next_writes(&self) {
        self.break_writes.store(true, Ordering::SeqCst);
    }

    fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::NetworkUnavailable("connection refused".into()));
        }
        if self.break_writes.swap(false, Ordering::SeqCst) {
            let (dead_tx, _) = duplex::unbounded::<String>();
            let sink = dead_tx.sink_map_err(|_| TransportError::ConnectionLost);
            return Ok((Box::pin(sink), Box::pin(futures::stream::pending::<Result<String, TransportError>>())));
        }
        let (client_tx, server_rx) = duplex::unbounded::<String>();
        let (server_tx, client_rx) = duplex::unbounded::<Result<String, TransportError>>();
        let _ = self.accepted.send(ServerConn {
            inbound: server_rx,
            outbound: server_tx,
        });
        let sink = client_tx.sink_map_err(|_| TransportError::ConnectionLost);
        Ok((Box::pin(sink), Box::pin(client_rx)))
    }

    fn url(&self) -> &str {
        "memory://node"
    }
}

fn backoff(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy::ExponentialBackoff(ReconnectConfig {
        initial_delay_ms: 100,
        max_delay_ms: 1_000,
        multiplier: 2.0,
        max_attempts: Some(max_attempts),
        jitter: 0.0,
    })
}

fn config() -> WsConfig {
    WsConfig::new("memory://node").with_reconnect(backoff(3))
}

fn setup(config: WsConfig) -> (WsClient, Arc<MemoryConnector>, mpsc::UnboundedReceiver<ServerConn>) {
    let (accepted, accepted_rx) = mpsc::unbounded_channel();
    let connector = Arc::new(MemoryConnector {
        accepted,
        refuse: AtomicBool::new(false),
        break_writes: AtomicBool::new(false),
        connects: AtomicU32::new(0),
    });
    let client = WsClient::with_connector(connector.clone(), config);
    (client, connector, accepted_rx)
}

async fn accept(accepted: &mut mpsc::UnboundedReceiver<ServerConn>) -> ServerConn {
    accepted.recv().await.expect("connector dropped")
}

fn book(clob_id: &str) -> Value {
    json!({
        "clob_id": clob_id,
        "buys": { "1200": { "volume": "1", "minimum_expiry": 5 }, "1000": { "volume": "2", "minimum_expiry": 5 } },
        "sells": { "1300": { "volume": "3", "minimum_expiry": 5 } },
        "grouping_precision": "1",
        "timestamp": 1,
        "new_bids_count": 0
    })
}

fn bids(clob_id: &str) -> Value {
    json!({ "clob_id": clob_id, "bids": [], "timestamp": 2 })
}

async fn next_event<T: Decode>(stream: &mut SubscriptionStream<T>) -> StreamEvent<T> {
    stream.next().await.expect("stream ended").expect("stream error")
}

// ─── Subscribing ──────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn subscribe_sends_canonical_frame_and_delivers_pushes() {
    let (client, _connector, mut accepted) = setup(config());
    let mut server = accept(&mut accepted).await;

    let (stream, frame) = tokio::join!(client.subscribe_orderbook(["0xAB"], Some(5)), server.ack());
    let mut stream = stream.unwrap();

    assert_eq!(frame["method"], "subscribe");
    assert_eq!(frame["channel"], "orderbook");
    assert_eq!(frame["params"], json!({ "clob_ids": ["0xab"], "depth": 5 }));
    assert!(frame["id"].is_u64());
    assert_eq!(client.state(), ConnectionState::Open);

    server.push("orderbook", book("0xab"));
    match next_event(&mut stream).await {
        StreamEvent::Data(update) => {
            assert_eq!(update.best_bid(), Some(U256::from(1200)));
            assert_eq!(update.spread(), Some(U256::from(100)));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn request_ids_increase() {
    let (client, _connector, mut accepted) = setup(config());
    let mut server = accept(&mut accepted).await;

    let (_a, first) = tokio::join!(client.subscribe_bids(["0x01"]), server.ack());
    let (_b, second) = tokio::join!(client.subscribe_bids(["0x02"]), server.ack());
    assert!(second["id"].as_u64().unwrap() > first["id"].as_u64().unwrap());
}

#[tokio::test(start_paused = true)]
async fn hex_case_variants_share_one_server_subscription() {
    let (client, _connector, mut accepted) = setup(config());
    let mut server = accept(&mut accepted).await;

    let (a, _) = tokio::join!(client.subscribe_orderbook(["0xAB"], None), server.ack());
    let mut a = a.unwrap();
    let mut b = client.subscribe_orderbook(["0xab"], None).await.unwrap();

    assert_eq!(a.key(), b.key());
    assert_eq!(client.subscription_count(), 1);
    assert_eq!(client.consumer_count(), 2);
    assert!(server.try_recv().is_none(), "no second subscribe on the wire");

    server.push("orderbook", book("0xAB"));
    assert!(matches!(next_event(&mut a).await, StreamEvent::Data(_)));
    assert!(matches!(next_event(&mut b).await, StreamEvent::Data(_)));
}

#[tokio::test(start_paused = true)]
async fn concurrent_identical_subscribes_wait_on_one_ack() {
    let (client, _connector, mut accepted) = setup(config());
    let mut server = accept(&mut accepted).await;

    let (a, b, frame) = tokio::join!(
        client.subscribe_bids(["0x01"]),
        client.subscribe_bids(["0x01"]),
        server.ack()
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(frame["channel"], "bids");
    assert!(server.try_recv().is_none());
    assert_eq!(client.subscription_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn last_release_unsubscribes() {
    let (client, _connector, mut accepted) = setup(config());
    let mut server = accept(&mut accepted).await;

    let (a, _) = tokio::join!(client.subscribe_orderbook(["0xab"], None), server.ack());
    let a = a.unwrap();
    let mut b = client.subscribe_orderbook(["0xAB"], None).await.unwrap();

    drop(a);
    assert_eq!(client.subscription_count(), 1);
    assert_eq!(client.consumer_count(), 1);

    b.cancel();
    assert_eq!(client.subscription_count(), 0);
    assert!(b.next().await.is_none());

    let frame = server.recv().await;
    assert_eq!(frame["method"], "unsubscribe");
    assert_eq!(frame["channel"], "orderbook");
    assert_eq!(frame["params"], json!({ "clob_ids": ["0xab"], "depth": 10 }));
}

#[tokio::test(start_paused = true)]
async fn pushes_route_by_params() {
    let (client, _connector, mut accepted) = setup(config());
    let mut server = accept(&mut accepted).await;

    let (one, _) = tokio::join!(client.subscribe_bids(["0x01"]), server.ack());
    let (two, _) = tokio::join!(client.subscribe_bids(["0x02"]), server.ack());
    let (mut one, mut two) = (one.unwrap(), two.unwrap());

    server.push("bids", bids("0x02"));
    server.push("bids", bids("0x01"));

    match next_event(&mut one).await {
        StreamEvent::Data(ev) => assert_eq!(ev.clob_id, "0x01"),
        other => panic!("unexpected {other:?}"),
    }
    match next_event(&mut two).await {
        StreamEvent::Data(ev) => assert_eq!(ev.clob_id, "0x02"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn consumer_filters_run_before_yielding() {
    let (client, _connector, mut accepted) = setup(config());
    let mut server = accept(&mut accepted).await;

    let (stream, _) = tokio::join!(client.subscribe_bids(Vec::<String>::new()), server.ack());
    let mut stream = stream.unwrap().with_filter(|ev| ev.timestamp > 10);

    server.push("bids", json!({ "clob_id": "0x01", "bids": [], "timestamp": 3 }));
    server.push("bids", json!({ "clob_id": "0x01", "bids": [], "timestamp": 30 }));

    match next_event(&mut stream).await {
        StreamEvent::Data(ev) => assert_eq!(ev.timestamp, 30),
        other => panic!("unexpected {other:?}"),
    }
}

// ─── Rejections ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn subscription_limit_counts_distinct_handles() {
    let (client, _connector, mut accepted) = setup(WsConfig {
        max_subscriptions: 1,
        ..config()
    });
    let mut server = accept(&mut accepted).await;

    let (_a, _) = tokio::join!(client.subscribe_orderbook(["0xab"], None), server.ack());
    let err = client.subscribe_bids(["0x01"]).await.unwrap_err();
    assert!(matches!(err, WsError::SubscriptionLimit { max: 1 }));

    // Joining the existing handle is still allowed.
    assert!(client.subscribe_orderbook(["0xAB"], None).await.is_ok());
    assert_eq!(client.subscription_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_params_are_rejected_locally() {
    let (client, _connector, mut accepted) = setup(config());
    let mut server = accept(&mut accepted).await;

    let err = client
        .subscribe_raw(Channel::Orderbook, Some(json!({ "bogus": 1 })))
        .await
        .unwrap_err();
    assert!(matches!(err, WsError::InvalidParams { .. }));
    assert_eq!(client.subscription_count(), 0);
    assert!(server.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn server_error_fails_subscribe_and_frees_slot() {
    let (client, _connector, mut accepted) = setup(config());
    let mut server = accept(&mut accepted).await;

    let reject = async {
        let frame = server.recv().await;
        server.send(json!({ "id": frame["id"], "error": { "code": -32602, "message": "unknown clob" } }));
    };
    let (result, ()) = tokio::join!(client.subscribe_bids(["0x99"]), reject);

    match result {
        Err(WsError::Server { code, message }) => {
            assert_eq!(code, -32602);
            assert_eq!(message, "unknown clob");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_subscribe_times_out() {
    let (client, _connector, mut accepted) = setup(WsConfig {
        request_timeout: Duration::from_secs(1),
        ..config()
    });
    let mut server = accept(&mut accepted).await;

    let (result, _frame) = tokio::join!(client.subscribe_bids(["0x01"]), server.recv());
    assert!(matches!(
        result,
        Err(WsError::Transport(TransportError::Timeout { ms: 1_000 }))
    ));
    assert_eq!(client.subscription_count(), 0);
}

// ─── Frames ───────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unmatched_and_malformed_frames_are_discarded() {
    let (client, _connector, mut accepted) = setup(config());
    let mut server = accept(&mut accepted).await;

    let (stream, _) = tokio::join!(client.subscribe_orderbook(["0xab"], None), server.ack());
    let mut stream = stream.unwrap();

    server.send(json!({ "id": 999, "result": true }));
    server.send_text("not json");
    server.push("trades", json!({}));
    server.push("orderbook", json!({ "clob_id": "0xab" }));
    server.push("orderbook", book("0xab"));

    match next_event(&mut stream).await {
        StreamEvent::Data(update) => assert_eq!(update.clob_id, "0xab"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn slow_consumer_drops_instead_of_blocking() {
    let (client, _connector, mut accepted) = setup(WsConfig {
        buffer_size: 2,
        ..config()
    });
    let mut server = accept(&mut accepted).await;

    let (slow, _) = tokio::join!(client.subscribe_bids(["0x01"]), server.ack());
    let mut slow = slow.unwrap();
    for _ in 0..5 {
        server.push("bids", bids("0x01"));
    }

    // The reader is still live: a later subscribe round-trips behind the pushes.
    let (fast, _) = tokio::join!(client.subscribe_bids(["0x02"]), server.ack());
    let mut fast = fast.unwrap();
    server.push("bids", bids("0x02"));
    assert!(matches!(next_event(&mut fast).await, StreamEvent::Data(_)));

    assert!(matches!(next_event(&mut slow).await, StreamEvent::Data(_)));
    assert!(matches!(next_event(&mut slow).await, StreamEvent::Data(_)));
    assert!(slow.next().now_or_never().is_none(), "excess pushes were dropped");
}

// ─── Reconnect ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn reconnect_resubscribes_every_handle_before_reading() {
    let (client, connector, mut accepted) = setup(config());
    let mut server = accept(&mut accepted).await;

    let (book_stream, _) = tokio::join!(client.subscribe_orderbook(["0xab"], None), server.ack());
    let (bid_stream, _) = tokio::join!(client.subscribe_bids(["0x01"]), server.ack());
    let (mut book_stream, mut bid_stream) = (book_stream.unwrap(), bid_stream.unwrap());

    drop(server);
    assert_eq!(next_event(&mut book_stream).await, StreamEvent::Disconnected);
    assert_eq!(next_event(&mut bid_stream).await, StreamEvent::Disconnected);

    let mut server = accept(&mut accepted).await;
    assert_eq!(connector.connects(), 2);

    // Pushed before the server has read anything from the new socket.
    server.push("orderbook", book("0xab"));

    let resubscribed: HashSet<String> = [server.recv().await, server.recv().await]
        .iter()
        .inspect(|f| assert_eq!(f["method"], "subscribe"))
        .map(|f| f["channel"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(resubscribed, HashSet::from(["orderbook".to_string(), "bids".to_string()]));

    assert_eq!(next_event(&mut book_stream).await, StreamEvent::Reconnected);
    assert!(matches!(next_event(&mut book_stream).await, StreamEvent::Data(_)));
    assert_eq!(next_event(&mut bid_stream).await, StreamEvent::Reconnected);
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(client.subscription_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn subscribe_while_reconnecting_completes_after_connect() {
    let (client, connector, mut accepted) = setup(config());
    connector.refuse(true);

    // First connect fails; the client waits 100ms before attempt 1.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(client.state(), ConnectionState::Reconnecting { attempt: 1 });
    connector.refuse(false);

    let serve = async {
        let mut server = accept(&mut accepted).await;
        let frame = server.ack().await;
        (server, frame)
    };
    let (stream, (_server, frame)) = tokio::join!(client.subscribe_bids(["0x01"]), serve);
    assert!(stream.is_ok());
    assert_eq!(frame["channel"], "bids");
    assert_eq!(connector.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_resubscribe_write_keeps_waiting_subscribers() {
    let (client, connector, mut accepted) = setup(config());
    connector.refuse(true);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(client.state(), ConnectionState::Reconnecting { attempt: 1 });

    // Attempt 1 connects but its first write fails; attempt 2 is healthy.
    connector.refuse(false);
    connector.break_next_writes();

    let serve = async {
        let mut server = accept(&mut accepted).await;
        let frame = server.ack().await;
        (server, frame)
    };
    let (stream, (_server, frame)) = tokio::join!(client.subscribe_bids(["0x01"]), serve);
    assert!(stream.is_ok(), "got {:?}", stream.err());
    assert_eq!(frame["channel"], "bids");
    assert_eq!(connector.connects(), 3);
    assert_eq!(client.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn outstanding_subscribe_rejected_when_socket_drops() {
    let (client, _connector, mut accepted) = setup(WsConfig::new("memory://node").with_reconnect(ReconnectPolicy::Never));
    let mut server = accept(&mut accepted).await;

    let drop_after_read = async move {
        let frame = server.recv().await;
        drop(server);
        frame
    };
    let (result, _frame) = tokio::join!(client.subscribe_bids(["0x01"]), drop_after_read);
    assert!(matches!(
        result,
        Err(WsError::Transport(TransportError::ConnectionLost))
    ));

    let mut state = client.watch_state();
    state.wait_for(ConnectionState::is_closed).await.unwrap();
    let err = client.subscribe_bids(["0x01"]).await.unwrap_err();
    assert!(err.is_closed());
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_close_every_stream() {
    let (client, connector, mut accepted) = setup(WsConfig::new("memory://node").with_reconnect(backoff(2)));
    let mut server = accept(&mut accepted).await;

    let (stream, _) = tokio::join!(client.subscribe_orderbook(["0xab"], None), server.ack());
    let mut stream = stream.unwrap();

    connector.refuse(true);
    drop(server);

    assert_eq!(next_event(&mut stream).await, StreamEvent::Disconnected);
    match stream.next().await {
        Some(Err(e)) => assert!(e.is_closed()),
        other => panic!("expected ConnectionClosed, got {other:?}"),
    }
    assert!(stream.next().await.is_none());

    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(connector.connects(), 3, "initial connect plus two attempts");
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_streams_and_refuses_new_work() {
    let (client, _connector, mut accepted) = setup(config());
    let mut server = accept(&mut accepted).await;

    let (stream, _) = tokio::join!(client.subscribe_bids(["0x01"]), server.ack());
    let mut stream = stream.unwrap();

    client.shutdown().await;
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(stream.next().await, Some(Err(ref e)) if e.is_closed()));
    assert!(stream.next().await.is_none());
    assert!(client.subscribe_bids(["0x01"]).await.unwrap_err().is_closed());

    // Idempotent.
    client.shutdown().await;
}

// ─── Racing a pending transaction ─────────────────────────────────────────────

struct NeverMined;

#[async_trait]
impl ReceiptFetcher for NeverMined {
    async fn fetch(&self, _hash: TxHash) -> Result<Option<Receipt>, TransportError> {
        Ok(None)
    }
}

#[tokio::test(start_paused = true)]
async fn pushed_receipt_confirms_pending_transaction() {
    const HASH: TxHash = TxHash::repeat_byte(0x42);
    let (client, _connector, mut accepted) = setup(config());
    let mut server = accept(&mut accepted).await;

    let (receipts, frame) = tokio::join!(client.subscribe_receipts(None), server.ack());
    assert_eq!(frame["channel"], "receipts");
    assert!(frame.get("params").is_none());

    let tx = PendingTransaction::new(HASH, Arc::new(NeverMined));
    let push = async {
        sleep(Duration::from_millis(250)).await;
        server.push(
            "receipts",
            json!({
                "transactionHash": HASH.to_string(),
                "blockNumber": "0x2",
                "from": "0x00000000000000000000000000000000000000aa",
                "status": "0x1",
                "attested_tx": { "hash": HASH.to_string(), "committee_epoch": 3 },
                "signatures": { "0": "0xaa", "1": "0xbb" }
            }),
        );
    };

    let (outcome, ()) = tokio::join!(tx.wait_for_receipt_racing(receipts.unwrap().receipts()), push);
    let outcome = outcome.unwrap();
    assert!(outcome.is_confirmed());
    assert_eq!(outcome.receipt().signature_count(), 2);
}
