// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The OPC-UA source client.
//!
//! The `opcua` crate's client is synchronous, so each source owns a
//! dedicated session thread; records cross into the async world through
//! the emission channel, and session failures come back over an event
//! channel that the supervisor turns into reconnects. Subscription mode
//! registers monitored items and lets the server sample; polling mode
//! reads the node values on a fixed period.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opcua::client::prelude::*;
use opcua::sync::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use otb_secrets::SecretStore;

use crate::normalize::{Normalizer, QualityHint, RawObservation, RawValue};
use crate::types::{OpcUaMode, OpcUaNode, OpcUaSecurity, OpcUaSourceOptions, RecordTx, SourceError};

pub struct OpcUaSourceClient {
    endpoint: String,
    options: OpcUaSourceOptions,
    normalizer: Normalizer,
    record_tx: RecordTx,
    secrets: Arc<SecretStore>,
    session: Option<Arc<RwLock<Session>>>,
    thread: Option<std::thread::JoinHandle<()>>,
    events: Option<mpsc::Receiver<String>>,
    stop_flag: Arc<AtomicBool>,
}

impl OpcUaSourceClient {
    pub fn new(
        endpoint: String,
        options: OpcUaSourceOptions,
        normalizer: Normalizer,
        record_tx: RecordTx,
        secrets: Arc<SecretStore>,
    ) -> OpcUaSourceClient {
        OpcUaSourceClient {
            endpoint,
            options,
            normalizer,
            record_tx,
            secrets,
            session: None,
            thread: None,
            events: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    fn identity_token(&self) -> Result<IdentityToken, SourceError> {
        match &self.options.auth {
            None => Ok(IdentityToken::Anonymous),
            Some(auth) => {
                let password = self
                    .secrets
                    .get(&auth.password_secret)
                    .map_err(|e| SourceError::Credentials(e.to_string()))?;
                // The library owns its copy of the password for the session
                // lifetime; our scoped handle is zeroised on return.
                Ok(IdentityToken::UserName(
                    auth.username.clone(),
                    password.expose().to_owned(),
                ))
            }
        }
    }
}

#[async_trait]
impl super::SourceClient for OpcUaSourceClient {
    async fn connect(&mut self) -> Result<(), SourceError> {
        self.stop_flag.store(false, Ordering::SeqCst);
        let (conn_tx, conn_rx) = std::sync::mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel(4);

        let params = SessionParams {
            endpoint: self.endpoint.clone(),
            options: self.options.clone(),
            identity: self.identity_token()?,
            normalizer: self.normalizer.clone(),
            record_tx: self.record_tx.clone(),
            stop_flag: Arc::clone(&self.stop_flag),
        };
        let thread = std::thread::Builder::new()
            .name("opcua-session".into())
            .spawn(move || session_thread(params, conn_tx, event_tx))
            .map_err(|e| SourceError::Connect(e.to_string()))?;

        // The handshake (endpoint discovery included) happens on the
        // session thread; wait for its verdict off the async runtime.
        let connected = tokio::task::spawn_blocking(move || {
            conn_rx.recv_timeout(Duration::from_secs(30))
        })
        .await
        .expect("connect wait task never panics");

        match connected {
            Ok(Ok(session)) => {
                self.session = Some(session);
                self.thread = Some(thread);
                self.events = Some(event_rx);
                Ok(())
            }
            Ok(Err(reason)) => {
                let _ = thread.join();
                Err(SourceError::Connect(reason))
            }
            Err(_) => Err(SourceError::Connect(
                "timed out waiting for the OPC-UA handshake".into(),
            )),
        }
    }

    async fn stream_until(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SourceError> {
        let events = self
            .events
            .as_mut()
            .ok_or_else(|| SourceError::Protocol("stream before connect".into()))?;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                event = events.recv() => {
                    let reason = event.unwrap_or_else(|| "session thread exited".into());
                    return Err(SourceError::Protocol(reason));
                }
            }
        }
    }

    async fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(session) = self.session.take() {
            let _ = tokio::task::spawn_blocking(move || {
                session.write().disconnect();
            })
            .await;
        }
        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || {
                let _ = thread.join();
            })
            .await;
        }
        self.events = None;
        debug!("opc-ua session stopped");
    }
}

struct SessionParams {
    endpoint: String,
    options: OpcUaSourceOptions,
    identity: IdentityToken,
    normalizer: Normalizer,
    record_tx: RecordTx,
    stop_flag: Arc<AtomicBool>,
}

type ConnectResult = Result<Arc<RwLock<Session>>, String>;

/// Owns the synchronous session for its whole life.
fn session_thread(
    params: SessionParams,
    conn_tx: std::sync::mpsc::Sender<ConnectResult>,
    event_tx: mpsc::Sender<String>,
) {
    let session = match establish_session(&params) {
        Ok(session) => session,
        Err(reason) => {
            let _ = conn_tx.send(Err(reason));
            return;
        }
    };
    let _ = conn_tx.send(Ok(Arc::clone(&session)));

    match params.options.mode {
        OpcUaMode::Subscription { .. } => {
            // Monitored items were registered during establishment; run
            // pumps publish responses into the data-change callback until
            // the session disconnects.
            Session::run(session);
            let _ = event_tx.blocking_send("opc-ua session ended".into());
        }
        OpcUaMode::Polling { period_ms } => {
            poll_loop(&params, session, Duration::from_millis(period_ms.max(50)), &event_tx);
        }
    }
}

fn establish_session(params: &SessionParams) -> Result<Arc<RwLock<Session>>, String> {
    let (policy, mode) = match params.options.security {
        OpcUaSecurity::None => ("None", MessageSecurityMode::None),
        OpcUaSecurity::Sign => ("Basic256Sha256", MessageSecurityMode::Sign),
        OpcUaSecurity::SignAndEncrypt => {
            ("Basic256Sha256", MessageSecurityMode::SignAndEncrypt)
        }
    };

    let mut builder = ClientBuilder::new()
        .application_name("otbridge")
        .application_uri("urn:otbridge")
        .product_uri("urn:otbridge")
        .trust_server_certs(true)
        .create_sample_keypair(true)
        .session_retry_limit(0);
    if let Some(cert) = &params.options.cert_path {
        builder = builder.certificate_path(cert.clone());
    }
    if let Some(key) = &params.options.key_path {
        builder = builder.private_key_path(key.clone());
    }
    let mut client = builder
        .client()
        .ok_or_else(|| "invalid OPC-UA client configuration".to_owned())?;

    let endpoint: EndpointDescription = (
        params.endpoint.as_str(),
        policy,
        mode,
        UserTokenPolicy::anonymous(),
    )
        .into();
    let session = client
        .connect_to_endpoint(endpoint, params.identity.clone())
        .map_err(|status| format!("connect failed: {}", status))?;

    if let OpcUaMode::Subscription {
        sampling_interval_ms,
        queue_size,
    } = params.options.mode
    {
        subscribe(
            &session,
            &params.options.nodes,
            sampling_interval_ms,
            queue_size,
            params.normalizer.clone(),
            params.record_tx.clone(),
        )
        .map_err(|status| format!("subscription failed: {}", status))?;
    }
    Ok(session)
}

/// Registers one subscription with a monitored item per configured node.
fn subscribe(
    session: &Arc<RwLock<Session>>,
    nodes: &[OpcUaNode],
    sampling_interval_ms: u64,
    queue_size: u32,
    normalizer: Normalizer,
    record_tx: RecordTx,
) -> Result<(), StatusCode> {
    let node_map: HashMap<String, OpcUaNode> = nodes
        .iter()
        .map(|n| (n.node_id.clone(), n.clone()))
        .collect();

    let session = session.read();
    let subscription_id = session.create_subscription(
        sampling_interval_ms as f64,
        10,
        30,
        0,
        0,
        true,
        DataChangeCallback::new(move |changed_monitored_items| {
            for item in changed_monitored_items.iter() {
                let node_id = item.item_to_monitor().node_id.to_string();
                let Some(node) = node_map.get(&node_id) else {
                    continue;
                };
                emit_data_value(&normalizer, &record_tx, node, item.last_value());
            }
        }),
    )?;

    let mut items_to_create = Vec::with_capacity(nodes.len());
    for node in nodes {
        let node_id = NodeId::from_str(&node.node_id)
            .map_err(|_| StatusCode::BadNodeIdInvalid)?;
        let mut request: MonitoredItemCreateRequest = node_id.into();
        request.requested_parameters.sampling_interval = sampling_interval_ms as f64;
        request.requested_parameters.queue_size = queue_size;
        items_to_create.push(request);
    }
    let results =
        session.create_monitored_items(subscription_id, TimestampsToReturn::Both, &items_to_create)?;
    for (node, result) in nodes.iter().zip(&results) {
        if !result.status_code.is_good() {
            warn!(
                node = %node.node_id,
                status = %result.status_code,
                "monitored item refused; its reads will be missing"
            );
        }
    }
    Ok(())
}

/// Fallback acquisition: read every configured node on a fixed period.
fn poll_loop(
    params: &SessionParams,
    session: Arc<RwLock<Session>>,
    period: Duration,
    event_tx: &mpsc::Sender<String>,
) {
    let mut read_ids = Vec::with_capacity(params.options.nodes.len());
    for node in &params.options.nodes {
        match NodeId::from_str(&node.node_id) {
            Ok(node_id) => read_ids.push(ReadValueId::from(node_id)),
            Err(_) => {
                let _ = event_tx.blocking_send(format!("invalid node id {:?}", node.node_id));
                return;
            }
        }
    }

    while !params.stop_flag.load(Ordering::SeqCst) {
        let read = {
            let session = session.read();
            session.read(&read_ids, TimestampsToReturn::Both, 0.0)
        };
        match read {
            Ok(values) => {
                for (node, value) in params.options.nodes.iter().zip(&values) {
                    emit_data_value(&params.normalizer, &params.record_tx, node, value);
                }
            }
            Err(status) => {
                let _ = event_tx.blocking_send(format!("poll read failed: {}", status));
                return;
            }
        }
        std::thread::park_timeout(period);
    }
}

/// Converts one `DataValue` into a record. Bad statuses become bad-quality
/// records, never drops; downstream analysis wants to see them.
fn emit_data_value(
    normalizer: &Normalizer,
    record_tx: &RecordTx,
    node: &OpcUaNode,
    data_value: &DataValue,
) {
    let status_bits = data_value.status.map(|s| s.bits()).unwrap_or(0);
    let mut meta = BTreeMap::new();
    meta.insert("opcua_status".to_owned(), format!("0x{:08x}", status_bits));
    if let Some(picoseconds) = data_value.server_picoseconds {
        meta.insert("opcua_server_picoseconds".to_owned(), picoseconds.to_string());
    }

    let value = match &data_value.value {
        Some(variant) => variant_to_raw(variant),
        None => RawValue::Text(String::new()),
    };
    let source_time_micros = data_value
        .source_timestamp
        .as_ref()
        .map(|dt| dt.as_chrono().timestamp_nanos() / 1_000)
        .filter(|&micros| micros >= 0)
        .map(|micros| micros as u64);

    let observation = RawObservation {
        raw_tag: node.node_id.clone(),
        equipment: None,
        signal_type: node.signal_type.clone(),
        tag: node.tag.clone(),
        value,
        unit: node.unit.clone(),
        quality: QualityHint::OpcStatus(status_bits),
        source_time_micros,
        meta,
    };
    record_tx.deliver_blocking(normalizer.normalize(observation));
}

fn variant_to_raw(variant: &Variant) -> RawValue {
    match variant {
        Variant::Boolean(b) => RawValue::Bool(*b),
        Variant::SByte(i) => RawValue::Signed(i64::from(*i)),
        Variant::Byte(u) => RawValue::Unsigned(u64::from(*u)),
        Variant::Int16(i) => RawValue::Signed(i64::from(*i)),
        Variant::UInt16(u) => RawValue::Unsigned(u64::from(*u)),
        Variant::Int32(i) => RawValue::Signed(i64::from(*i)),
        Variant::UInt32(u) => RawValue::Unsigned(u64::from(*u)),
        Variant::Int64(i) => RawValue::Signed(*i),
        Variant::UInt64(u) => RawValue::Unsigned(*u),
        Variant::Float(f) => RawValue::Float(f64::from(*f)),
        Variant::Double(f) => RawValue::Float(*f),
        Variant::String(s) => RawValue::Text(s.value().clone().unwrap_or_default()),
        Variant::ByteString(b) => RawValue::Bytes(b.value.clone().unwrap_or_default()),
        other => RawValue::Text(format!("{:?}", other)),
    }
}
