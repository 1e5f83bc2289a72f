// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end sink tests against an in-process ZeroBus endpoint and an
//! in-process OAuth2 token endpoint.

use std::collections::{BTreeMap, VecDeque};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use otb_repr::{Quality, Record, SourceProtocol, TagPath, Value};
use otb_secrets::{MasterSecret, SecretHandle, SecretStore};
use otb_spool::{BackpressureManager, SpoolConfig, SpoolMetrics};
use otb_zerobus::{
    decode, encode, AckResult, BreakerConfig, CircuitState, ClientMessage, ServerMessage, Sink,
    SinkConfig, SinkMetrics, TargetConfig, TokenProvider,
};

fn record(i: i64) -> Record {
    Record {
        source: "plant1_opcua".into(),
        protocol: SourceProtocol::OpcUa,
        raw_tag: "ns=2;s=bearing_temp".into(),
        path: TagPath::from_segments(
            ["plant1", "production", "line1", "plc1", "temperature", "bearing_temp"],
            "unspecified",
        ),
        value: Value::Float(70.0 + i as f64 * 0.5),
        unit: Some("degC".into()),
        quality: Quality::Good,
        source_ts_micros: 1_700_000_000_000_000 + i as u64 * 500_000,
        ingest_ts_micros: 1_700_000_000_000_100 + i as u64 * 500_000,
        meta: BTreeMap::new(),
    }
}

struct Harness {
    _state: TempDir,
    manager: Arc<BackpressureManager>,
    secret: SecretHandle,
    tokens: Arc<TokenProvider>,
}

fn harness(token_port: u16) -> Harness {
    let state = TempDir::new().unwrap();
    let master = MasterSecret::new(b"an adequately long master secret".to_vec()).unwrap();
    let store = SecretStore::open(state.path(), &master).unwrap();
    store.put("zerobus_client_secret", "hunter2").unwrap();
    let secret = store.get("zerobus_client_secret").unwrap();

    let spool = SpoolConfig::new(state.path().join("spool"), state.path().join("dlq"));
    let manager = Arc::new(
        BackpressureManager::open(spool, store.spool_key().unwrap(), SpoolMetrics::unregistered())
            .unwrap(),
    );

    let tokens = Arc::new(
        TokenProvider::new(&format!("127.0.0.1:{}", token_port), "svc-gateway", None, true)
            .unwrap(),
    );
    Harness {
        _state: state,
        manager,
        secret,
        tokens,
    }
}

/// Starts an in-process OAuth2 token endpoint that counts its hits.
fn start_token_endpoint(hits: Arc<AtomicU64>) -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    listener.set_nonblocking(true).unwrap();
    let make = make_service_fn(move |_conn| {
        let hits = Arc::clone(&hits);
        async move {
            Ok::<_, Infallible>(service_fn(move |_req| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(Response::new(Body::from(
                        r#"{"access_token":"test-token","expires_in":3600}"#,
                    )))
                }
            }))
        }
    });
    let server = hyper::Server::from_tcp(listener).unwrap().serve(make);
    tokio::spawn(async move {
        let _ = server.await;
    });
    port
}

#[derive(Default)]
struct MockZerobus {
    /// Scripted ack per received batch, in order; exhausted means `Ok`.
    batch_acks: Mutex<VecDeque<AckResult>>,
    /// Every `(seq, records)` the endpoint received, resends included.
    received: Mutex<Vec<(u64, Vec<Record>)>>,
    /// One entry per stream handshake.
    hellos: Mutex<Vec<String>>,
}

/// Starts an in-process ZeroBus endpoint speaking the framed stream
/// protocol, accepting any number of consecutive connections.
async fn start_zerobus(state: Arc<MockZerobus>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
                while let Some(Ok(frame)) = framed.next().await {
                    match decode::<ClientMessage>(&frame).unwrap() {
                        ClientMessage::Hello { token, .. } => {
                            state.hellos.lock().unwrap().push(token);
                            let ack = ServerMessage::HelloAck { result: AckResult::Ok };
                            if framed.send(encode(&ack)).await.is_err() {
                                return;
                            }
                        }
                        ClientMessage::Batch { seq, records } => {
                            state.received.lock().unwrap().push((seq, records));
                            let result = state
                                .batch_acks
                                .lock()
                                .unwrap()
                                .pop_front()
                                .unwrap_or(AckResult::Ok);
                            let ack = ServerMessage::BatchAck { seq, result };
                            if framed.send(encode(&ack)).await.is_err() {
                                return;
                            }
                        }
                        ClientMessage::Bye => return,
                    }
                }
            });
        }
    });
    port
}

fn target(zerobus_port: u16) -> TargetConfig {
    TargetConfig {
        workspace_host: "ignored-in-tests".into(),
        zerobus_endpoint: format!("127.0.0.1:{}", zerobus_port),
        table: "main.telemetry.readings".parse().unwrap(),
        client_id: "svc-gateway".into(),
        client_secret_name: "zerobus_client_secret".into(),
        tls: false,
        proxy: None,
    }
}

fn fast_config() -> SinkConfig {
    SinkConfig {
        batch_max_records: 1000,
        batch_max_wait: Duration::from_millis(200),
        backoff_base: Duration::from_millis(20),
        backoff_cap: Duration::from_millis(200),
        ack_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        breaker: BreakerConfig::default(),
    }
}

async fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) {
    let start = tokio::time::Instant::now();
    while !done() {
        assert!(start.elapsed() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn a_batch_flows_through_and_is_acked() {
    let hits = Arc::new(AtomicU64::new(0));
    let token_port = start_token_endpoint(Arc::clone(&hits));
    let h = harness(token_port);
    let zb = Arc::new(MockZerobus::default());
    let port = start_zerobus(Arc::clone(&zb)).await;

    for i in 0..10 {
        h.manager.enqueue(record(i)).unwrap();
    }
    let sink = Sink::spawn(
        target(port),
        fast_config(),
        Arc::clone(&h.manager),
        Arc::clone(&h.tokens),
        h.secret,
        SinkMetrics::unregistered(),
    );

    wait_until(Duration::from_secs(10), || {
        sink.status().records_sent == 10
    })
    .await;

    let status = sink.status();
    assert_eq!(status.batches_sent, 1);
    assert_eq!(status.records_dropped_dlq, 0);
    assert_eq!(status.circuit, CircuitState::Closed);
    assert!(status.last_ack_unix_ms.is_some());

    let received = zb.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    let (seq, records) = &received[0];
    assert_eq!(*seq, 0);
    assert_eq!(records.len(), 10);
    for (i, r) in records.iter().enumerate() {
        assert_eq!(r.value, Value::Float(70.0 + i as f64 * 0.5), "order broken at {}", i);
    }
    drop(received);

    sink.shutdown(Duration::from_secs(5)).await;
    assert!(h.manager.is_empty());
}

#[tokio::test]
async fn batches_preserve_dequeue_order_across_batches() {
    let token_port = start_token_endpoint(Arc::new(AtomicU64::new(0)));
    let h = harness(token_port);
    let zb = Arc::new(MockZerobus::default());
    let port = start_zerobus(Arc::clone(&zb)).await;

    let mut config = fast_config();
    config.batch_max_records = 16;
    let sink = Sink::spawn(
        target(port),
        config,
        Arc::clone(&h.manager),
        Arc::clone(&h.tokens),
        h.secret,
        SinkMetrics::unregistered(),
    );
    for i in 0..100 {
        h.manager.enqueue(record(i)).unwrap();
    }

    wait_until(Duration::from_secs(10), || {
        sink.status().records_sent == 100
    })
    .await;

    let received = zb.received.lock().unwrap();
    let mut seqs = Vec::new();
    let mut values = Vec::new();
    for (seq, records) in received.iter() {
        seqs.push(*seq);
        values.extend(records.iter().map(|r| r.value.clone()));
    }
    // No reordering and no gaps once acked.
    assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1), "seqs: {:?}", seqs);
    for (i, v) in values.iter().enumerate() {
        assert_eq!(*v, Value::Float(70.0 + i as f64 * 0.5));
    }
    drop(received);
    sink.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn transient_errors_retry_with_the_same_batch() {
    let token_port = start_token_endpoint(Arc::new(AtomicU64::new(0)));
    let h = harness(token_port);
    let zb = Arc::new(MockZerobus::default());
    zb.batch_acks.lock().unwrap().push_back(AckResult::Transient {
        reason: "storage flake".into(),
    });
    let port = start_zerobus(Arc::clone(&zb)).await;

    for i in 0..3 {
        h.manager.enqueue(record(i)).unwrap();
    }
    let sink = Sink::spawn(
        target(port),
        fast_config(),
        Arc::clone(&h.manager),
        Arc::clone(&h.tokens),
        h.secret,
        SinkMetrics::unregistered(),
    );

    wait_until(Duration::from_secs(10), || sink.status().records_sent == 3).await;

    let status = sink.status();
    assert!(status.retries >= 1);
    assert_eq!(status.batches_sent, 1);

    // The endpoint saw the same batch twice, same sequence number.
    let received = zb.received.lock().unwrap();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].0, received[1].0);
    assert_eq!(received[0].1.len(), 3);
    assert_eq!(received[1].1.len(), 3);
    drop(received);
    sink.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn a_401_forces_exactly_one_token_refresh_and_recovers() {
    let hits = Arc::new(AtomicU64::new(0));
    let token_port = start_token_endpoint(Arc::clone(&hits));
    let h = harness(token_port);
    let zb = Arc::new(MockZerobus::default());
    zb.batch_acks.lock().unwrap().push_back(AckResult::Unauthorized);
    let port = start_zerobus(Arc::clone(&zb)).await;

    for i in 0..5 {
        h.manager.enqueue(record(i)).unwrap();
    }
    let sink = Sink::spawn(
        target(port),
        fast_config(),
        Arc::clone(&h.manager),
        Arc::clone(&h.tokens),
        h.secret,
        SinkMetrics::unregistered(),
    );

    wait_until(Duration::from_secs(10), || sink.status().records_sent == 5).await;

    // One refresh to open the first stream, exactly one more for the 401.
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(sink.status().token_refreshes, 2);
    // The 401 tore the stream down; recovery opened a second one.
    assert_eq!(zb.hellos.lock().unwrap().len(), 2);
    assert_eq!(sink.status().circuit, CircuitState::Closed);
    sink.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn schema_violations_dead_letter_exactly_once_without_retry() {
    let token_port = start_token_endpoint(Arc::new(AtomicU64::new(0)));
    let h = harness(token_port);
    let zb = Arc::new(MockZerobus::default());
    zb.batch_acks
        .lock()
        .unwrap()
        .push_back(AckResult::SchemaViolation {
            reason: "value type mismatch for column temp".into(),
            records: vec![1],
        });
    let port = start_zerobus(Arc::clone(&zb)).await;

    for i in 0..3 {
        h.manager.enqueue(record(i)).unwrap();
    }
    let sink = Sink::spawn(
        target(port),
        fast_config(),
        Arc::clone(&h.manager),
        Arc::clone(&h.tokens),
        h.secret,
        SinkMetrics::unregistered(),
    );

    wait_until(Duration::from_secs(10), || {
        sink.status().records_dropped_dlq == 1
    })
    .await;

    let status = sink.status();
    assert_eq!(status.records_sent, 2);
    assert_eq!(status.batches_sent, 1);
    // Exactly one batch on the wire: schema refusals are not retried.
    assert_eq!(zb.received.lock().unwrap().len(), 1);
    // And exactly one DLQ entry, with accounting intact.
    let counts = h.manager.counts();
    assert_eq!(counts.dlq_moved, 1);
    assert_eq!(
        counts.received,
        counts.dequeued + counts.dropped_for_overflow + counts.dlq_moved + counts.in_flight
    );
    sink.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn concurrent_token_requests_share_one_refresh() {
    let hits = Arc::new(AtomicU64::new(0));
    let token_port = start_token_endpoint(Arc::clone(&hits));
    let provider = Arc::new(
        TokenProvider::new(&format!("127.0.0.1:{}", token_port), "svc-gateway", None, true)
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let provider = Arc::clone(&provider);
        tasks.push(tokio::spawn(async move {
            provider.token("hunter2").await.unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), "test-token");
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1, "single-flight violated");
    assert_eq!(provider.refreshes(), 1);
}

#[tokio::test]
async fn unreachable_endpoint_opens_the_circuit_and_probe_recovers() {
    let token_port = start_token_endpoint(Arc::new(AtomicU64::new(0)));
    let h = harness(token_port);

    // A port with nothing listening: connects fail fast.
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut config = fast_config();
    config.breaker = BreakerConfig {
        failure_threshold: 5,
        open_timeout: Duration::from_millis(400),
        half_open_probes: 1,
        max_open_timeout: Duration::from_secs(4),
    };
    h.manager.enqueue(record(0)).unwrap();
    let sink = Sink::spawn(
        target(dead_port),
        config,
        Arc::clone(&h.manager),
        Arc::clone(&h.tokens),
        h.secret,
        SinkMetrics::unregistered(),
    );

    wait_until(Duration::from_secs(10), || {
        sink.status().circuit == CircuitState::Open
    })
    .await;
    let status = sink.status();
    assert_eq!(status.records_sent, 0);
    assert!(status.circuit_opens >= 1);
    assert!(status.last_error.is_some());

    // Bring the endpoint up on the same port; the half-open probe after the
    // open timeout should close the circuit and deliver the record.
    let zb = Arc::new(MockZerobus::default());
    let listener = TcpListener::bind(("127.0.0.1", dead_port)).await.unwrap();
    let state = Arc::clone(&zb);
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
                while let Some(Ok(frame)) = framed.next().await {
                    match decode::<ClientMessage>(&frame).unwrap() {
                        ClientMessage::Hello { token, .. } => {
                            state.hellos.lock().unwrap().push(token);
                            let _ = framed
                                .send(encode(&ServerMessage::HelloAck { result: AckResult::Ok }))
                                .await;
                        }
                        ClientMessage::Batch { seq, records } => {
                            state.received.lock().unwrap().push((seq, records));
                            let _ = framed
                                .send(encode(&ServerMessage::BatchAck {
                                    seq,
                                    result: AckResult::Ok,
                                }))
                                .await;
                        }
                        ClientMessage::Bye => return,
                    }
                }
            });
        }
    });

    wait_until(Duration::from_secs(10), || sink.status().records_sent == 1).await;
    assert_eq!(sink.status().circuit, CircuitState::Closed);
    sink.shutdown(Duration::from_secs(5)).await;
}
