// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Control-surface and routing tests for the bridge.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use otb_bridge::{Bridge, BridgeConfig, BridgeError, BridgeHandle, SourceSpec, TargetConfigUpdate};
use otb_repr::{Quality, Record, SourceProtocol, TagPath, Value};
use otb_secrets::{MasterSecret, SecretStore};
use otb_storage::{
    ModbusSourceOptions, NormalizeContext, ProtocolOptions, SourceConfig, SourceState,
};
use otb_zerobus::{AckResult, ClientMessage, ServerMessage, TargetConfig};

fn master() -> MasterSecret {
    MasterSecret::new(b"an adequately long master secret".to_vec()).unwrap()
}

async fn bridge(state: &TempDir) -> (BridgeHandle, Arc<SecretStore>) {
    let secrets = Arc::new(SecretStore::open(state.path(), &master()).unwrap());
    let mut config = BridgeConfig::new(state.path().to_path_buf());
    config.source_stop_grace = Duration::from_secs(2);
    config.drain_deadline = Duration::from_secs(5);
    config.sink.batch_max_wait = Duration::from_millis(200);
    config.sink.backoff_base = Duration::from_millis(20);
    config.sink.backoff_cap = Duration::from_millis(200);
    let handle = Bridge::serve(config, Arc::clone(&secrets)).await.unwrap();
    (handle, secrets)
}

fn modbus_spec(name: &str, endpoint: &str, enabled: bool) -> SourceSpec {
    SourceSpec {
        source: SourceConfig {
            name: name.into(),
            endpoint: endpoint.into(),
            enabled,
            context: NormalizeContext {
                site: "plant1".into(),
                area: "production".into(),
                line: "line1".into(),
                equipment: "plc1".into(),
                default_segment: otb_repr::DEFAULT_SEGMENT.into(),
            },
            options: ProtocolOptions::Modbus(ModbusSourceOptions {
                unit_id: 1,
                poll_interval_ms: 100,
                heartbeat_interval_ms: 0,
                serial: None,
                registers: vec![serde_json::from_value(serde_json::json!({
                    "name": "bearing_temp",
                    "signal_type": "temperature",
                    "address": 16,
                    "register_type": "holding",
                    "data_type": "uint16",
                    "unit": "degC"
                }))
                .unwrap()],
            }),
        },
        target: None,
    }
}

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
        source_ts_micros: 1_700_000_000_000_000 + i as u64,
        ingest_ts_micros: 1_700_000_000_000_100 + i as u64,
        meta: BTreeMap::new(),
    }
}

fn start_token_endpoint() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    listener.set_nonblocking(true).unwrap();
    let hits = Arc::new(AtomicU64::new(0));
    let make = make_service_fn(move |_conn| {
        let hits = Arc::clone(&hits);
        async move {
            Ok::<_, Infallible>(service_fn(move |_req| {
                let _ = &hits;
                async move {
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

/// A ZeroBus endpoint that acks everything and records what it received.
async fn start_zerobus(received: Arc<Mutex<Vec<Record>>>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let received = Arc::clone(&received);
            tokio::spawn(async move {
                let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
                while let Some(Ok(frame)) = framed.next().await {
                    match otb_zerobus::decode::<ClientMessage>(&frame).unwrap() {
                        ClientMessage::Hello { .. } => {
                            let ack = ServerMessage::HelloAck { result: AckResult::Ok };
                            if framed.send(otb_zerobus::encode(&ack)).await.is_err() {
                                return;
                            }
                        }
                        ClientMessage::Batch { seq, records } => {
                            received.lock().unwrap().extend(records);
                            let ack = ServerMessage::BatchAck {
                                seq,
                                result: AckResult::Ok,
                            };
                            if framed.send(otb_zerobus::encode(&ack)).await.is_err() {
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

fn target(token_port: u16, zerobus_port: u16) -> TargetConfig {
    TargetConfig {
        workspace_host: format!("127.0.0.1:{}", token_port),
        zerobus_endpoint: format!("127.0.0.1:{}", zerobus_port),
        table: "main.telemetry.readings".parse().unwrap(),
        client_id: "svc-gateway".into(),
        client_secret_name: "zerobus_client_secret".into(),
        tls: false,
        proxy: None,
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
async fn source_crud_and_idempotent_lifecycle() {
    let state = TempDir::new().unwrap();
    let (bridge, _secrets) = bridge(&state).await;

    // A disabled source is registered but not started.
    let spec = modbus_spec("plc1", "modbus-tcp://127.0.0.1:1", false);
    bridge.add_source(spec.clone()).await.unwrap();
    assert!(matches!(
        bridge.add_source(spec).await,
        Err(BridgeError::DuplicateSource(_))
    ));
    let status = bridge.get_status().await;
    assert_eq!(status.sources.len(), 1);
    assert_eq!(status.sources[0].status.state, SourceState::Configured);
    assert!(!status.sources[0].enabled);

    // Start is idempotent.
    bridge.start_source("plc1").await.unwrap();
    bridge.start_source("plc1").await.unwrap();

    // Stop twice is fine too.
    bridge.stop_source("plc1").await.unwrap();
    bridge.stop_source("plc1").await.unwrap();
    let status = bridge.get_status().await;
    assert!(matches!(
        status.sources[0].status.state,
        SourceState::Configured | SourceState::Stopped
    ));

    assert!(matches!(
        bridge.start_source("ghost").await,
        Err(BridgeError::UnknownSource(_))
    ));

    bridge.delete_source("plc1").await.unwrap();
    assert!(matches!(
        bridge.delete_source("plc1").await,
        Err(BridgeError::UnknownSource(_))
    ));
    bridge.shutdown().await;
}

#[tokio::test]
async fn a_failing_source_reconnects_and_never_kills_the_bridge() {
    let state = TempDir::new().unwrap();
    let (bridge, _secrets) = bridge(&state).await;

    // Nothing listens on this endpoint; the source must cycle into
    // reconnecting with a recorded error.
    bridge
        .add_source(modbus_spec("plc1", "modbus-tcp://127.0.0.1:9", true))
        .await
        .unwrap();

    let mut saw_reconnecting = false;
    for _ in 0..100 {
        let status = bridge.get_status().await;
        let source = &status.sources[0].status;
        if source.state == SourceState::Reconnecting && source.last_error.is_some() {
            saw_reconnecting = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(saw_reconnecting, "source never reported reconnecting");

    // The bridge itself is alive and answering.
    let metrics = bridge.get_metrics().await;
    assert_eq!(metrics.records_sent, 0);
    let status = bridge.get_status().await;
    assert!(!status.healthy);
    bridge.shutdown().await;
}

#[tokio::test]
async fn target_config_round_trips_with_the_secret_sentinel() {
    let state = TempDir::new().unwrap();
    let (bridge, secrets) = bridge(&state).await;

    let view = bridge.get_target_config().await;
    assert!(view.config.is_none());
    assert_eq!(view.client_secret, "");

    let config = target(1, 2);
    bridge
        .save_target_config(TargetConfigUpdate {
            config: config.clone(),
            client_secret: Some("hunter2".into()),
        })
        .await
        .unwrap();

    let view = bridge.get_target_config().await;
    assert_eq!(view.config.as_ref(), Some(&config));
    assert_eq!(view.client_secret, "***");

    // Saving with the sentinel keeps the stored secret.
    bridge
        .save_target_config(TargetConfigUpdate {
            config: config.clone(),
            client_secret: Some("***".into()),
        })
        .await
        .unwrap();
    assert_eq!(secrets.get("zerobus_client_secret").unwrap().expose(), "hunter2");

    // Omitting the secret entirely also keeps it.
    bridge
        .save_target_config(TargetConfigUpdate {
            config: config.clone(),
            client_secret: None,
        })
        .await
        .unwrap();
    assert_eq!(secrets.get("zerobus_client_secret").unwrap().expose(), "hunter2");

    // A fresh name with no secret at all is refused, state unchanged.
    let mut other = config;
    other.client_secret_name = "absent".into();
    assert!(bridge
        .save_target_config(TargetConfigUpdate {
            config: other,
            client_secret: None,
        })
        .await
        .is_err());
    let view = bridge.get_target_config().await;
    assert_eq!(view.config.unwrap().client_secret_name, "zerobus_client_secret");
    bridge.shutdown().await;
}

#[tokio::test]
async fn records_route_through_the_default_target_to_the_sink() {
    let state = TempDir::new().unwrap();
    let (bridge, _secrets) = bridge(&state).await;

    let token_port = start_token_endpoint();
    let received = Arc::new(Mutex::new(Vec::new()));
    let zerobus_port = start_zerobus(Arc::clone(&received)).await;

    bridge
        .save_target_config(TargetConfigUpdate {
            config: target(token_port, zerobus_port),
            client_secret: Some("hunter2".into()),
        })
        .await
        .unwrap();

    for i in 0..10 {
        bridge.inject_record(record(i)).await;
    }

    wait_until(Duration::from_secs(10), || received.lock().unwrap().len() == 10).await;
    let got = received.lock().unwrap();
    for (i, r) in got.iter().enumerate() {
        assert_eq!(r.value, Value::Float(70.0 + i as f64 * 0.5), "order broken at {}", i);
        assert_eq!(
            r.path.as_str(),
            "plant1/production/line1/plc1/temperature/bearing_temp"
        );
    }
    drop(got);

    let metrics = bridge.get_metrics().await;
    assert_eq!(metrics.records_received, 10);
    assert_eq!(metrics.records_sent, 10);
    assert_eq!(metrics.records_dropped, 0);
    assert!(metrics.batches_sent >= 1);

    let diagnostics = bridge.get_pipeline_diagnostics().await;
    let stages = diagnostics.get("plant1_opcua").expect("source sampled");
    assert!(stages.values().all(|window| window.len() <= 32));

    bridge.shutdown().await;
}

#[tokio::test]
async fn sink_diagnostics_reflect_configuration_and_probe() {
    let state = TempDir::new().unwrap();
    let (bridge, _secrets) = bridge(&state).await;

    let diagnostics = bridge.sink_diagnostics(false).await;
    assert!(!diagnostics.configured);
    assert!(matches!(bridge.start_sink().await, Err(BridgeError::NoTarget)));

    let token_port = start_token_endpoint();
    let received = Arc::new(Mutex::new(Vec::new()));
    let zerobus_port = start_zerobus(received).await;
    bridge
        .save_target_config(TargetConfigUpdate {
            config: target(token_port, zerobus_port),
            client_secret: Some("hunter2".into()),
        })
        .await
        .unwrap();

    bridge.start_sink().await.unwrap();
    let diagnostics = bridge.sink_diagnostics(true).await;
    assert!(diagnostics.configured);
    assert!(diagnostics.running);
    assert_eq!(diagnostics.probe, Some(Ok(())));

    bridge.stop_sink().await.unwrap();
    let diagnostics = bridge.sink_diagnostics(false).await;
    assert!(!diagnostics.running);

    bridge.shutdown().await;
}

#[tokio::test]
async fn status_and_metrics_serialise_with_every_field_present() {
    let state = TempDir::new().unwrap();
    let (bridge, _secrets) = bridge(&state).await;

    let status = serde_json::to_value(bridge.get_status().await).unwrap();
    for key in ["healthy", "sources", "sinks"] {
        assert!(status.get(key).is_some(), "status missing {}", key);
    }

    let metrics = serde_json::to_value(bridge.get_metrics().await).unwrap();
    for key in [
        "records_received",
        "records_normalized",
        "records_enqueued",
        "records_dropped",
        "records_sent",
        "records_dlq",
        "queue_depth",
        "spool_bytes",
        "spool_errors",
        "reconnections",
        "batches_sent",
        "retries",
        "circuit_opens",
        "token_refreshes",
        "last_error",
    ] {
        assert!(metrics.get(key).is_some(), "metrics missing {}", key);
    }
    bridge.shutdown().await;
}
