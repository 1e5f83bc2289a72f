// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-target sink: a batcher task and a sender task.
//!
//! The batcher consumes the target's backpressure manager and forms batches
//! bounded by record count and by wall-clock wait. The sender owns the
//! stream: it sends batches in order, reads one ack per batch, and handles
//! the failure taxonomy (backoff for transient errors, a forced token
//! refresh for 401, the DLQ for schema rejections) behind the target's
//! circuit breaker. A batch is held until it is acknowledged, so a stream
//! re-open resends it (the destination table is idempotent on the record's
//! natural key).

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use otb_repr::Record;
use otb_secrets::SecretHandle;
use otb_spool::BackpressureManager;

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::config::{SinkConfig, TargetConfig};
use crate::metrics::SinkMetrics;
use crate::protocol::AckResult;
use crate::stream::{StreamConfig, ZerobusStream};
use crate::token::TokenProvider;
use crate::SinkError;

/// Shared observable state for one sink.
struct SinkShared {
    breaker: CircuitBreaker,
    metrics: SinkMetrics,
    tokens: Arc<TokenProvider>,
    manager: Arc<BackpressureManager>,
    last_error: std::sync::Mutex<Option<String>>,
    /// Unix milliseconds of the last acknowledged batch; zero when none.
    last_ack_unix_ms: AtomicU64,
}

impl SinkShared {
    fn note_error(&self, error: impl ToString) {
        *self.last_error.lock().expect("last_error lock poisoned") = Some(error.to_string());
    }

    fn note_ack(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock after the epoch")
            .as_millis() as u64;
        self.last_ack_unix_ms.store(now, Ordering::Relaxed);
    }
}

/// Everything the control surface wants to know about one sink. Every
/// field is present even when zero.
#[derive(Debug, Clone, Serialize)]
pub struct SinkStatusSnapshot {
    pub target: String,
    pub circuit: CircuitState,
    pub last_error: Option<String>,
    pub last_ack_unix_ms: Option<u64>,
    pub records_sent: u64,
    pub batches_sent: u64,
    pub records_dropped_dlq: u64,
    pub retries: u64,
    pub circuit_opens: u64,
    pub token_refreshes: u64,
}

/// Constructor namespace for sinks.
pub struct Sink;

impl Sink {
    /// Spawns the batcher and sender tasks for `target` and returns the
    /// handle that owns them. The client secret moves into the sender task
    /// and is zeroised when that task ends, on every exit path.
    pub fn spawn(
        target: TargetConfig,
        config: SinkConfig,
        manager: Arc<BackpressureManager>,
        tokens: Arc<TokenProvider>,
        client_secret: SecretHandle,
        metrics: SinkMetrics,
    ) -> SinkHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<Record>>(1);

        let shared = Arc::new(SinkShared {
            breaker: CircuitBreaker::new(config.breaker.clone()),
            metrics,
            tokens,
            manager: Arc::clone(&manager),
            last_error: std::sync::Mutex::new(None),
            last_ack_unix_ms: AtomicU64::new(0),
        });

        let batcher = tokio::spawn(run_batcher(
            Arc::clone(&manager),
            config.clone(),
            batch_tx,
            shutdown_rx.clone(),
        ));
        let sender = tokio::spawn(run_sender(
            Arc::clone(&shared),
            config,
            target.clone(),
            client_secret,
            batch_rx,
            shutdown_rx,
        ));

        info!(target = %target.key(), "sink started");
        SinkHandle {
            target,
            shutdown_tx,
            batcher,
            sender,
            shared,
        }
    }
}

/// Owns a running sink's tasks.
pub struct SinkHandle {
    target: TargetConfig,
    shutdown_tx: watch::Sender<bool>,
    batcher: JoinHandle<()>,
    sender: JoinHandle<()>,
    shared: Arc<SinkShared>,
}

impl SinkHandle {
    pub fn target(&self) -> &TargetConfig {
        &self.target
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.shared.breaker.state()
    }

    pub fn status(&self) -> SinkStatusSnapshot {
        let last_ack = self.shared.last_ack_unix_ms.load(Ordering::Relaxed);
        SinkStatusSnapshot {
            target: self.target.key().to_string(),
            circuit: self.shared.breaker.state(),
            last_error: self
                .shared
                .last_error
                .lock()
                .expect("last_error lock poisoned")
                .clone(),
            last_ack_unix_ms: (last_ack > 0).then_some(last_ack),
            records_sent: self.shared.metrics.records_sent.get(),
            batches_sent: self.shared.metrics.batches_sent.get(),
            records_dropped_dlq: self.shared.metrics.records_dropped_dlq.get(),
            retries: self.shared.metrics.retries.get(),
            circuit_opens: self.shared.breaker.opens(),
            token_refreshes: self.shared.tokens.refreshes(),
        }
    }

    /// Signals shutdown and waits up to `deadline` for a clean drain; tasks
    /// still running at the deadline are aborted. Either way the batch in
    /// flight has been returned to the spool or acknowledged, and the
    /// credential handle inside the sender is dropped (and zeroised).
    pub async fn shutdown(self, deadline: Duration) {
        let _ = self.shutdown_tx.send(true);
        let target = self.target.key();
        let (batcher, sender) = (self.batcher, self.sender);
        let aborts = (batcher.abort_handle(), sender.abort_handle());
        let join_both = async move {
            let _ = batcher.await;
            let _ = sender.await;
        };
        if tokio::time::timeout(deadline, join_both).await.is_err() {
            warn!(target = %target, "sink drain deadline exceeded; aborting tasks");
            aborts.0.abort();
            aborts.1.abort();
        }
    }
}

/// Consumes the backpressure manager and forms batches.
async fn run_batcher(
    manager: Arc<BackpressureManager>,
    config: SinkConfig,
    batch_tx: mpsc::Sender<Vec<Record>>,
    shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let mut batch: Vec<Record> = Vec::new();
        let deadline = tokio::time::Instant::now() + config.batch_max_wait;
        while batch.len() < config.batch_max_records {
            let wait = if batch.is_empty() {
                config.batch_max_wait
            } else {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    break;
                }
                deadline - now
            };
            match manager.dequeue(wait).await {
                Ok(Some(record)) => batch.push(record),
                Ok(None) => break,
                Err(e) => {
                    warn!("batcher failed to dequeue: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    break;
                }
            }
        }
        if batch.is_empty() {
            if *shutdown_rx.borrow() && manager.is_empty() {
                debug!("batcher drained; stopping");
                return;
            }
            continue;
        }
        if batch_tx.send(batch).await.is_err() {
            // Sender is gone; its unsent batch went back to the spool.
            return;
        }
    }
}

/// Owns the stream and sends batches in order.
async fn run_sender(
    shared: Arc<SinkShared>,
    config: SinkConfig,
    target: TargetConfig,
    client_secret: SecretHandle,
    mut batch_rx: mpsc::Receiver<Vec<Record>>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let stream_config = StreamConfig {
        endpoint: target.zerobus_endpoint.clone(),
        tls: target.tls,
        connect_timeout: config.connect_timeout,
        ack_timeout: config.ack_timeout,
    };
    let mut stream: Option<ZerobusStream> = None;
    let mut seq: u64 = 0;

    while let Some(batch) = batch_rx.recv().await {
        let delivered = deliver_batch(
            &shared,
            &config,
            &stream_config,
            &target,
            &client_secret,
            &mut stream,
            seq,
            &batch,
            &shutdown_rx,
        )
        .await;
        if delivered {
            seq += 1;
        } else {
            // Shutdown overtook the retry loop: hand the batch back to the
            // spool so the drain deadline cannot lose it.
            for record in batch {
                if let Err(e) = shared.manager.enqueue(record) {
                    warn!("failed to return unsent record to the spool: {}", e);
                }
            }
            break;
        }
    }
    if let Some(stream) = stream.take() {
        stream.close().await;
    }
    debug!(target = %target.key(), "sender stopped");
    // `client_secret` drops here; the plaintext buffer is zeroised on every
    // exit path, panic unwinding included.
}

/// Drives one batch to an acknowledged outcome: acked, or refused as a
/// schema violation and dead-lettered. Returns `false` only when shutdown
/// interrupts the retry loop before an outcome.
#[allow(clippy::too_many_arguments)]
async fn deliver_batch(
    shared: &SinkShared,
    config: &SinkConfig,
    stream_config: &StreamConfig,
    target: &TargetConfig,
    client_secret: &SecretHandle,
    stream: &mut Option<ZerobusStream>,
    seq: u64,
    batch: &[Record],
    shutdown_rx: &watch::Receiver<bool>,
) -> bool {
    let mut backoff = config.backoff_base;
    let mut refreshed_for_401 = false;

    loop {
        if shared.breaker.check().is_err() {
            shared.note_error("circuit open");
            if *shutdown_rx.borrow() {
                return false;
            }
            // Poll for the half-open transition without hammering the lock.
            tokio::time::sleep(Duration::from_millis(250)).await;
            continue;
        }

        match attempt_send(shared, config, stream_config, target, client_secret, stream, seq, batch)
            .await
        {
            Ok(AckResult::Ok) => {
                shared.breaker.record_success();
                shared.metrics.records_sent.inc_by(batch.len() as u64);
                shared.metrics.batches_sent.inc();
                shared.note_ack();
                return true;
            }
            Ok(AckResult::SchemaViolation { reason, records }) => {
                // The stream survives a schema rejection; only the records
                // are refused, and they are refused permanently.
                shared.breaker.record_success();
                let offenders: BTreeSet<usize> = if records.is_empty() {
                    (0..batch.len()).collect()
                } else {
                    records.iter().map(|&i| i as usize).collect()
                };
                let mut accepted = 0u64;
                for (i, record) in batch.iter().enumerate() {
                    if offenders.contains(&i) {
                        let detail = format!("schema violation: {}", reason);
                        if let Err(e) = shared.manager.dead_letter(record.clone(), &detail) {
                            warn!("failed to dead-letter record: {}", e);
                        }
                        shared.metrics.records_dropped_dlq.inc();
                    } else {
                        accepted += 1;
                    }
                }
                warn!(
                    refused = offenders.len(),
                    accepted, reason, "batch partially refused by schema validation"
                );
                shared.metrics.records_sent.inc_by(accepted);
                shared.metrics.batches_sent.inc();
                shared.note_ack();
                shared.note_error(format!("schema violation: {}", reason));
                return true;
            }
            Ok(AckResult::Unauthorized) | Err(SinkError::Unauthorized) => {
                *stream = None;
                if !refreshed_for_401 {
                    // Force one token refresh and retry immediately.
                    refreshed_for_401 = true;
                    shared.tokens.invalidate().await;
                    debug!("401 from data plane; forcing token refresh");
                    continue;
                }
                shared.breaker.record_failure();
                shared.note_error("repeated 401 from data plane");
            }
            Ok(AckResult::Transient { reason }) => {
                shared.breaker.record_failure();
                shared.metrics.retries.inc();
                shared.note_error(format!("transient: {}", reason));
            }
            Ok(AckResult::FlowControl) => {
                shared.breaker.record_failure();
                shared.metrics.retries.inc();
                shared.note_error("flow control");
            }
            Err(SinkError::Token(e)) if !e.is_retryable() => {
                // Bad client credentials: no retry will fix this. Trip the
                // breaker and wait for its probe cadence.
                *stream = None;
                shared.breaker.trip();
                shared.note_error(e);
            }
            Err(e) => {
                *stream = None;
                shared.breaker.record_failure();
                shared.metrics.retries.inc();
                shared.note_error(&e);
            }
        }

        if *shutdown_rx.borrow() {
            return false;
        }
        // Back off, but wake immediately if shutdown arrives mid-sleep.
        let mut shutdown_changed = shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(jittered(backoff)) => {}
            _ = shutdown_changed.changed() => return false,
        }
        backoff = (backoff * 2).min(config.backoff_cap);
    }
}

/// One attempt: ensure a token and a stream, send the batch, read its ack.
#[allow(clippy::too_many_arguments)]
async fn attempt_send(
    shared: &SinkShared,
    config: &SinkConfig,
    stream_config: &StreamConfig,
    target: &TargetConfig,
    client_secret: &SecretHandle,
    stream: &mut Option<ZerobusStream>,
    seq: u64,
    batch: &[Record],
) -> Result<AckResult, SinkError> {
    if stream.is_none() {
        let token = shared.tokens.token(client_secret.expose()).await?;
        *stream = Some(ZerobusStream::open(stream_config, &target.table, &token).await?);
    }
    let open = stream.as_mut().expect("just ensured");
    open.send_batch(seq, batch).await?;
    let (ack_seq, result) = open.read_ack(config.ack_timeout).await?;
    if ack_seq != seq {
        return Err(SinkError::Protocol(format!(
            "ack for batch {} while awaiting {}",
            ack_seq, seq
        )));
    }
    Ok(result)
}

/// Opens and immediately closes a probe stream, for deep sink diagnostics.
pub async fn probe_stream(
    target: &TargetConfig,
    config: &SinkConfig,
    tokens: &TokenProvider,
    client_secret: &SecretHandle,
) -> Result<(), String> {
    let token = tokens
        .token(client_secret.expose())
        .await
        .map_err(|e| e.to_string())?;
    let stream_config = StreamConfig {
        endpoint: target.zerobus_endpoint.clone(),
        tls: target.tls,
        connect_timeout: config.connect_timeout,
        ack_timeout: config.ack_timeout,
    };
    let stream = ZerobusStream::open(&stream_config, &target.table, &token)
        .await
        .map_err(|e| e.to_string())?;
    stream.close().await;
    Ok(())
}

/// Exponential backoff with ±20 % jitter.
fn jittered(d: Duration) -> Duration {
    d.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
}
