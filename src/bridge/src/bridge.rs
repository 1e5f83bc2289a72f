// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The bridge proper: ownership, routing, lifecycle, control surface.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use prometheus::Registry;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use otb_repr::{Record, TargetKey};
use otb_secrets::{SecretStore, SECRET_SENTINEL};
use otb_spool::{BackpressureManager, DispatcherHandle, SpoolError, SpoolMetrics};
use otb_storage::{spawn_source, SourceState, SourceStatusSnapshot, SourceTask};
use otb_zerobus::{
    probe_stream, CircuitState, Sink, SinkHandle, SinkMetrics, SinkStatusSnapshot, TargetConfig,
    TokenProvider,
};

use crate::config::BridgeConfig;
use crate::diagnostics::{PipelineDiagnostics, PipelineStage, StageSample};
use crate::status::{
    MetricsSnapshot, SinkDiagnostics, SourceSpec, SourceStatusEntry, StatusSnapshot,
    TargetConfigUpdate, TargetConfigView,
};
use crate::BridgeError;

/// Inbound channel depth between sources and the router. The router's
/// enqueue path is non-blocking, so this only smooths bursts.
const INBOUND_DEPTH: usize = 1024;

struct SourceEntry {
    spec: SourceSpec,
    task: Option<SourceTask>,
}

/// Everything the bridge runs for one target.
struct TargetRuntime {
    config: TargetConfig,
    manager: Arc<BackpressureManager>,
    _dispatcher: DispatcherHandle,
    tokens: Arc<TokenProvider>,
    sink: Option<SinkHandle>,
    /// Why the sink refused to start (credentials missing/locked), if it
    /// did. Records keep accumulating in the tiers meanwhile.
    sink_error: Option<String>,
    sink_metrics: SinkMetrics,
}

struct Inner {
    sources: BTreeMap<String, SourceEntry>,
    default_target: Option<TargetConfig>,
    targets: BTreeMap<TargetKey, TargetRuntime>,
}

struct Shared {
    config: BridgeConfig,
    secrets: Arc<SecretStore>,
    registry: Registry,
    diagnostics: PipelineDiagnostics,
    inbound_tx: mpsc::Sender<Record>,
    inner: tokio::sync::Mutex<Inner>,
    /// Records that arrived at the router, normalised.
    records_received: AtomicU64,
    /// Records dropped before reaching any manager (no target, locked
    /// store).
    records_unroutable: AtomicU64,
    last_error: std::sync::Mutex<Option<String>>,
    /// Metric sets live as long as the registry; cached so a target that
    /// is torn down and re-created does not re-register.
    metric_cache: std::sync::Mutex<BTreeMap<String, (SpoolMetrics, SinkMetrics)>>,
}

impl Shared {
    fn note_error(&self, error: impl ToString) {
        *self.last_error.lock().expect("last_error lock poisoned") = Some(error.to_string());
    }

    fn metrics_for(&self, key: &TargetKey) -> (SpoolMetrics, SinkMetrics) {
        let mut cache = self.metric_cache.lock().expect("metric cache lock poisoned");
        cache
            .entry(key.to_string())
            .or_insert_with(|| {
                let label = key.to_string();
                (
                    SpoolMetrics::register_into(&self.registry, &label),
                    SinkMetrics::register_into(&self.registry, &label),
                )
            })
            .clone()
    }

    fn token_provider(&self, config: &TargetConfig) -> Result<Arc<TokenProvider>, BridgeError> {
        // One provider per workspace host would let distinct targets share
        // a cache, but tokens are per client id too; scope the provider to
        // the target instead.
        TokenProvider::new(
            &config.workspace_host,
            &config.client_id,
            config.proxy.as_deref(),
            !config.tls,
        )
        .map(Arc::new)
        .map_err(|e| BridgeError::Config(e.to_string()))
    }

    /// Creates the backpressure manager, dispatcher, and token provider
    /// for a target. The default target owns the stable `state/spool/`
    /// layout; override targets spool under a per-target subdirectory.
    fn create_target_runtime(
        &self,
        config: &TargetConfig,
        is_default: bool,
    ) -> Result<TargetRuntime, BridgeError> {
        let key = config.key();
        let (spool_metrics, sink_metrics) = self.metrics_for(&key);
        let (spool_dir, dlq_dir) = if is_default {
            (
                self.config.state_dir.join("spool"),
                self.config.state_dir.join("dlq"),
            )
        } else {
            let dir = key.dir_component();
            (
                self.config.state_dir.join("spool").join(&dir),
                self.config.state_dir.join("dlq").join(&dir),
            )
        };
        let spool_config = self.config.spool.to_spool_config(spool_dir, dlq_dir);
        let manager = Arc::new(BackpressureManager::open(
            spool_config,
            self.secrets.spool_key()?,
            spool_metrics,
        )?);
        let dispatcher = manager.start_dispatcher();
        let tokens = self.token_provider(config)?;
        info!(target = %key, "target runtime created");
        Ok(TargetRuntime {
            config: config.clone(),
            manager,
            _dispatcher: dispatcher,
            tokens,
            sink: None,
            sink_error: None,
            sink_metrics,
        })
    }

    /// Starts the sink for a runtime, fetching its client secret. A
    /// refusal (locked store, missing secret) is recorded on the runtime,
    /// not escalated; sibling targets are unaffected.
    fn start_sink(&self, runtime: &mut TargetRuntime) {
        if runtime.sink.is_some() {
            return;
        }
        match self.secrets.get(&runtime.config.client_secret_name) {
            Ok(secret) => {
                let handle = Sink::spawn(
                    runtime.config.clone(),
                    self.config.sink.clone(),
                    Arc::clone(&runtime.manager),
                    Arc::clone(&runtime.tokens),
                    secret,
                    runtime.sink_metrics.clone(),
                );
                runtime.sink = Some(handle);
                runtime.sink_error = None;
            }
            Err(e) => {
                let reason = format!(
                    "sink for {} cannot start: {}",
                    runtime.config.key(),
                    e
                );
                warn!("{}", reason);
                self.note_error(&reason);
                runtime.sink_error = Some(reason);
            }
        }
    }
}

/// Constructor namespace for the bridge.
pub struct Bridge;

impl Bridge {
    /// Starts a bridge: the router task plus empty source/target maps.
    /// Sources and the default target come in through the control surface
    /// (the daemon applies the configuration files through the same
    /// methods the UI uses).
    pub async fn serve(
        config: BridgeConfig,
        secrets: Arc<SecretStore>,
    ) -> Result<BridgeHandle, BridgeError> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_DEPTH);
        let (router_shutdown_tx, router_shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            secrets,
            registry: Registry::new(),
            diagnostics: PipelineDiagnostics::default(),
            inbound_tx,
            inner: tokio::sync::Mutex::new(Inner {
                sources: BTreeMap::new(),
                default_target: None,
                targets: BTreeMap::new(),
            }),
            records_received: AtomicU64::new(0),
            records_unroutable: AtomicU64::new(0),
            last_error: std::sync::Mutex::new(None),
            metric_cache: std::sync::Mutex::new(BTreeMap::new()),
        });
        let router = tokio::spawn(run_router(
            Arc::clone(&shared),
            inbound_rx,
            router_shutdown_rx,
        ));
        info!("bridge started");
        Ok(BridgeHandle {
            shared,
            router: Some(router),
            router_shutdown_tx,
        })
    }
}

/// The owning handle to a running bridge; also the control surface.
pub struct BridgeHandle {
    shared: Arc<Shared>,
    router: Option<JoinHandle<()>>,
    router_shutdown_tx: watch::Sender<bool>,
}

impl BridgeHandle {
    // -- source lifecycle ---------------------------------------------------

    /// Validates and registers a source. Does not start it unless enabled.
    pub async fn add_source(&self, spec: SourceSpec) -> Result<(), BridgeError> {
        spec.validate().map_err(BridgeError::Config)?;
        let name = spec.source.name.clone();
        let mut inner = self.shared.inner.lock().await;
        if inner.sources.contains_key(&name) {
            return Err(BridgeError::DuplicateSource(name));
        }
        let enabled = spec.source.enabled;
        inner.sources.insert(
            name.clone(),
            SourceEntry { spec, task: None },
        );
        if enabled {
            self.start_source_locked(&mut inner, &name)?;
        }
        info!(source = %name, "source added");
        Ok(())
    }

    /// Stops the running client (if any), replaces the configuration, and
    /// restarts if enabled. Records already enqueued are untouched.
    pub async fn update_source(&self, name: &str, spec: SourceSpec) -> Result<(), BridgeError> {
        spec.validate().map_err(BridgeError::Config)?;
        if spec.source.name != name {
            return Err(BridgeError::Config(format!(
                "source name {:?} does not match spec name {:?}",
                name, spec.source.name
            )));
        }
        let task = {
            let mut inner = self.shared.inner.lock().await;
            let entry = inner
                .sources
                .get_mut(name)
                .ok_or_else(|| BridgeError::UnknownSource(name.to_owned()))?;
            entry.spec = spec;
            entry.task.take()
        };
        if let Some(task) = task {
            task.stop(self.shared.config.source_stop_grace).await;
        }
        {
            let mut inner = self.shared.inner.lock().await;
            if let Some(entry) = inner.sources.get(name) {
                if entry.spec.source.enabled {
                    self.start_source_locked(&mut inner, name)?;
                }
            }
        }
        self.maybe_teardown_targets().await;
        info!(source = %name, "source updated");
        Ok(())
    }

    /// Stops the client and drops the entry. Records already in the
    /// backpressure tiers remain and will be delivered.
    pub async fn delete_source(&self, name: &str) -> Result<(), BridgeError> {
        let task = {
            let mut inner = self.shared.inner.lock().await;
            let entry = inner
                .sources
                .remove(name)
                .ok_or_else(|| BridgeError::UnknownSource(name.to_owned()))?;
            entry.task
        };
        if let Some(task) = task {
            task.stop(self.shared.config.source_stop_grace).await;
        }
        self.shared.diagnostics.forget_source(name);
        self.maybe_teardown_targets().await;
        info!(source = %name, "source deleted");
        Ok(())
    }

    /// Starts a source. Idempotent: a running source stays running.
    pub async fn start_source(&self, name: &str) -> Result<(), BridgeError> {
        let mut inner = self.shared.inner.lock().await;
        if !inner.sources.contains_key(name) {
            return Err(BridgeError::UnknownSource(name.to_owned()));
        }
        self.start_source_locked(&mut inner, name)
    }

    /// Stops a source with the configured grace period. Idempotent.
    pub async fn stop_source(&self, name: &str) -> Result<(), BridgeError> {
        let task = {
            let mut inner = self.shared.inner.lock().await;
            let entry = inner
                .sources
                .get_mut(name)
                .ok_or_else(|| BridgeError::UnknownSource(name.to_owned()))?;
            entry.task.take()
        };
        if let Some(task) = task {
            task.stop(self.shared.config.source_stop_grace).await;
        }
        Ok(())
    }

    pub async fn list_sources(&self) -> Vec<SourceSpec> {
        let inner = self.shared.inner.lock().await;
        inner.sources.values().map(|e| e.spec.clone()).collect()
    }

    fn start_source_locked(&self, inner: &mut Inner, name: &str) -> Result<(), BridgeError> {
        let entry = inner
            .sources
            .get_mut(name)
            .expect("caller checked existence");
        if let Some(task) = &entry.task {
            match task.shared().state() {
                SourceState::Stopped | SourceState::Errored => {}
                // Already running (or on its way); start is idempotent.
                _ => return Ok(()),
            }
        }
        let task = spawn_source(
            entry.spec.source.clone(),
            Arc::clone(&self.shared.secrets),
            self.shared.inbound_tx.clone(),
        )?;
        entry.task = Some(task);
        Ok(())
    }

    // -- target / sink lifecycle --------------------------------------------

    /// The default target with the secret replaced by presence sentinel.
    pub async fn get_target_config(&self) -> TargetConfigView {
        let inner = self.shared.inner.lock().await;
        let config = inner.default_target.clone();
        let client_secret = match &config {
            Some(target) if self.shared.secrets.contains(&target.client_secret_name) => {
                SECRET_SENTINEL.to_owned()
            }
            _ => String::new(),
        };
        TargetConfigView {
            config,
            client_secret,
        }
    }

    /// Replaces the default target. The update's secret may be omitted or
    /// the sentinel to retain the stored one. The sink for the previous
    /// default keeps draining what it owes and is torn down once idle.
    pub async fn save_target_config(&self, update: TargetConfigUpdate) -> Result<(), BridgeError> {
        update.config.validate().map_err(BridgeError::Config)?;
        match &update.client_secret {
            Some(secret) => {
                self.shared
                    .secrets
                    .put(&update.config.client_secret_name, secret)?;
            }
            None => {
                if !self
                    .shared
                    .secrets
                    .contains(&update.config.client_secret_name)
                {
                    return Err(BridgeError::Config(format!(
                        "no stored secret named {:?} and none supplied",
                        update.config.client_secret_name
                    )));
                }
            }
        }
        {
            let mut inner = self.shared.inner.lock().await;
            inner.default_target = Some(update.config);
        }
        self.maybe_teardown_targets().await;
        info!("target configuration saved");
        Ok(())
    }

    /// Ensures the default target's runtime and sink are up.
    pub async fn start_sink(&self) -> Result<(), BridgeError> {
        let mut inner = self.shared.inner.lock().await;
        let target = inner.default_target.clone().ok_or(BridgeError::NoTarget)?;
        let key = target.key();
        if !inner.targets.contains_key(&key) {
            let runtime = self.shared.create_target_runtime(&target, true)?;
            inner.targets.insert(key.clone(), runtime);
        }
        let runtime = inner.targets.get_mut(&key).expect("just ensured");
        runtime.sink_error = None;
        self.shared.start_sink(runtime);
        match &runtime.sink_error {
            None => Ok(()),
            Some(reason) => Err(BridgeError::Config(reason.clone())),
        }
    }

    /// Stops the default target's sink. Its backpressure tiers stay put.
    pub async fn stop_sink(&self) -> Result<(), BridgeError> {
        let sink = {
            let mut inner = self.shared.inner.lock().await;
            let target = inner.default_target.clone().ok_or(BridgeError::NoTarget)?;
            inner
                .targets
                .get_mut(&target.key())
                .and_then(|rt| rt.sink.take())
        };
        if let Some(sink) = sink {
            sink.shutdown(self.shared.config.drain_deadline).await;
        }
        Ok(())
    }

    /// Sink diagnostics for the default target; `deep` opens a probe
    /// stream.
    pub async fn sink_diagnostics(&self, deep: bool) -> SinkDiagnostics {
        let (target, running, circuit, queue_depth, spool_bytes) = {
            let inner = self.shared.inner.lock().await;
            match &inner.default_target {
                None => {
                    return SinkDiagnostics {
                        configured: false,
                        running: false,
                        circuit: None,
                        queue_depth: 0,
                        spool_bytes: 0,
                        probe: None,
                    }
                }
                Some(target) => {
                    let runtime = inner.targets.get(&target.key());
                    (
                        target.clone(),
                        runtime.map_or(false, |rt| rt.sink.is_some()),
                        runtime.and_then(|rt| rt.sink.as_ref().map(|s| s.circuit_state())),
                        runtime.map_or(0, |rt| rt.manager.depth()),
                        runtime.map_or(0, |rt| rt.manager.spool_bytes()),
                    )
                }
            }
        };
        let probe = if deep {
            Some(self.run_probe(&target).await)
        } else {
            None
        };
        SinkDiagnostics {
            configured: true,
            running,
            circuit,
            queue_depth,
            spool_bytes,
            probe,
        }
    }

    async fn run_probe(&self, target: &TargetConfig) -> Result<(), String> {
        let tokens = self
            .shared
            .token_provider(target)
            .map_err(|e| e.to_string())?;
        let secret = self
            .shared
            .secrets
            .get(&target.client_secret_name)
            .map_err(|e| e.to_string())?;
        probe_stream(target, &self.shared.config.sink, &tokens, &secret).await
    }

    /// Tears down sinks for targets that no configured source references
    /// (and that are not the default) once their tiers are empty. Idle
    /// runtimes are unlinked under the lock and drained after it is
    /// released; the router never waits out a sink drain.
    async fn maybe_teardown_targets(&self) {
        let idle = {
            let mut inner = self.shared.inner.lock().await;
            let default_key = inner.default_target.as_ref().map(|t| t.key());
            let referenced: Vec<TargetKey> = inner
                .sources
                .values()
                .filter_map(|e| e.spec.target.as_ref().map(|t| t.key()))
                .collect();
            let keys: Vec<TargetKey> = inner
                .targets
                .iter()
                .filter(|(key, runtime)| {
                    default_key.as_ref() != Some(*key)
                        && !referenced.contains(*key)
                        && runtime.manager.is_empty()
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| inner.targets.remove(&key).map(|runtime| (key, runtime)))
                .collect::<Vec<_>>()
        };
        for (key, mut runtime) in idle {
            if let Some(sink) = runtime.sink.take() {
                sink.shutdown(self.shared.config.drain_deadline).await;
            }
            if let Err(e) = runtime.manager.close() {
                warn!(target = %key, "closing drained manager: {}", e);
            }
            debug!(target = %key, "target runtime torn down");
        }
    }

    // -- observability ------------------------------------------------------

    /// Full status snapshot; every field present even when zero.
    pub async fn get_status(&self) -> StatusSnapshot {
        let inner = self.shared.inner.lock().await;
        let mut sources = Vec::with_capacity(inner.sources.len());
        for entry in inner.sources.values() {
            let status = match &entry.task {
                Some(task) => task.shared().snapshot(),
                None => SourceStatusSnapshot {
                    name: entry.spec.source.name.clone(),
                    protocol: entry.spec.source.protocol(),
                    state: SourceState::Configured,
                    last_error: None,
                    records_read: 0,
                    reconnects: 0,
                },
            };
            sources.push(SourceStatusEntry {
                status,
                enabled: entry.spec.source.enabled,
            });
        }

        let mut sinks = Vec::with_capacity(inner.targets.len());
        for (key, runtime) in &inner.targets {
            match (&runtime.sink, &runtime.sink_error) {
                (Some(sink), _) => sinks.push(sink.status()),
                (None, reason) => sinks.push(SinkStatusSnapshot {
                    target: key.to_string(),
                    circuit: CircuitState::Closed,
                    last_error: reason.clone(),
                    last_ack_unix_ms: None,
                    records_sent: runtime.sink_metrics.records_sent.get(),
                    batches_sent: runtime.sink_metrics.batches_sent.get(),
                    records_dropped_dlq: runtime.sink_metrics.records_dropped_dlq.get(),
                    retries: runtime.sink_metrics.retries.get(),
                    circuit_opens: 0,
                    token_refreshes: runtime.tokens.refreshes(),
                }),
            }
        }

        let sources_healthy = sources.iter().all(|s| {
            !s.enabled
                || matches!(
                    s.status.state,
                    SourceState::Running | SourceState::Connecting | SourceState::Configured
                )
        });
        let sinks_healthy = sinks.iter().all(|s| s.circuit == CircuitState::Closed)
            && inner.targets.values().all(|rt| rt.sink_error.is_none());
        StatusSnapshot {
            healthy: sources_healthy && sinks_healthy,
            sources,
            sinks,
        }
    }

    /// Aggregated counters and gauges.
    pub async fn get_metrics(&self) -> MetricsSnapshot {
        let inner = self.shared.inner.lock().await;
        let mut snapshot = MetricsSnapshot::default();
        let received = self.shared.records_received.load(Ordering::Relaxed);
        snapshot.records_received = received;
        snapshot.records_normalized = received;
        snapshot.records_dropped = self.shared.records_unroutable.load(Ordering::Relaxed);
        for runtime in inner.targets.values() {
            let counts = runtime.manager.counts();
            snapshot.records_enqueued += counts.received;
            snapshot.records_dropped += counts.dropped_for_overflow;
            snapshot.records_dlq += counts.dlq_moved;
            snapshot.spool_errors += counts.spool_errors;
            snapshot.queue_depth += runtime.manager.depth();
            snapshot.spool_bytes += runtime.manager.spool_bytes();
            snapshot.records_sent += runtime.sink_metrics.records_sent.get();
            snapshot.batches_sent += runtime.sink_metrics.batches_sent.get();
            snapshot.retries += runtime.sink_metrics.retries.get();
            if let Some(sink) = &runtime.sink {
                let status = sink.status();
                snapshot.circuit_opens += status.circuit_opens;
                snapshot.token_refreshes += status.token_refreshes;
            }
        }
        for entry in inner.sources.values() {
            if let Some(task) = &entry.task {
                snapshot.reconnections += task.shared().snapshot().reconnects;
            }
        }
        snapshot.last_error = self
            .shared
            .last_error
            .lock()
            .expect("last_error lock poisoned")
            .clone();
        snapshot
    }

    /// Injects a synthetic record into the pipeline exactly as if a source
    /// had emitted it. Part of the pipeline-diagnostics surface: operators
    /// push a known record through to see which stage loses it.
    pub async fn inject_record(&self, record: Record) {
        let _ = self.shared.inbound_tx.send(record).await;
    }

    /// Small per-stage sample windows per source.
    pub async fn get_pipeline_diagnostics(
        &self,
    ) -> BTreeMap<String, BTreeMap<PipelineStage, Vec<StageSample>>> {
        self.shared.diagnostics.snapshot()
    }

    /// The metrics registry, for collaborators that scrape it directly.
    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    // -- shutdown -----------------------------------------------------------

    /// Clean stop: sources first (bounded grace each), then the router
    /// drains, then each sink gets the drain deadline, and finally every
    /// manager flushes its memory tier to the spool and closes.
    pub async fn shutdown(mut self) {
        info!("bridge shutting down");
        let (tasks, sinks, managers) = {
            let mut inner = self.shared.inner.lock().await;
            let tasks: Vec<SourceTask> = inner
                .sources
                .values_mut()
                .filter_map(|e| e.task.take())
                .collect();
            let sinks: Vec<SinkHandle> = inner
                .targets
                .values_mut()
                .filter_map(|rt| rt.sink.take())
                .collect();
            let managers: Vec<Arc<BackpressureManager>> = inner
                .targets
                .values()
                .map(|rt| Arc::clone(&rt.manager))
                .collect();
            (tasks, sinks, managers)
        };

        let grace = self.shared.config.source_stop_grace;
        futures::future::join_all(tasks.into_iter().map(|t| t.stop(grace))).await;

        // Sources are quiet; tell the router to drain the channel and
        // exit, so everything emitted before the stop reaches a manager.
        let _ = self.router_shutdown_tx.send(true);
        if let Some(router) = self.router.take() {
            let _ = router.await;
        }

        let drain = self.shared.config.drain_deadline;
        futures::future::join_all(sinks.into_iter().map(|s| s.shutdown(drain))).await;

        // Whatever the sinks did not deliver inside the deadline is made
        // durable: close() flushes each memory tier into its spool.
        for manager in managers {
            match manager.close() {
                Ok(()) => {}
                Err(e) => warn!("closing backpressure manager: {}", e),
            }
        }
        info!("bridge stopped");
    }
}

/// Consumes the inbound record channel: resolve target, ensure runtime,
/// enqueue with the drop policy, sample diagnostics. On shutdown it drains
/// whatever the sources emitted before going quiet, then exits.
async fn run_router(
    shared: Arc<Shared>,
    mut inbound_rx: mpsc::Receiver<Record>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe = inbound_rx.recv() => match maybe {
                Some(record) => route_record(&shared, record).await,
                None => break,
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    while let Ok(record) = inbound_rx.try_recv() {
                        route_record(&shared, record).await;
                    }
                    break;
                }
            }
        }
    }
    debug!("router drained");
}

async fn route_record(shared: &Shared, record: Record) {
    shared.records_received.fetch_add(1, Ordering::Relaxed);
    shared
        .diagnostics
        .observe(PipelineStage::Normalized, &record);

    let mut inner = shared.inner.lock().await;
    let target = inner
        .sources
        .get(&record.source)
        .and_then(|e| e.spec.target.clone())
        .or_else(|| inner.default_target.clone());
    let Some(target) = target else {
        shared.records_unroutable.fetch_add(1, Ordering::Relaxed);
        shared.diagnostics.observe(PipelineStage::Dropped, &record);
        shared.note_error("record dropped: no target configured");
        return;
    };
    let is_default = inner.default_target.as_ref() == Some(&target);
    let key = target.key();

    if !inner.targets.contains_key(&key) {
        match shared.create_target_runtime(&target, is_default) {
            Ok(runtime) => {
                inner.targets.insert(key.clone(), runtime);
            }
            Err(e) => {
                shared.records_unroutable.fetch_add(1, Ordering::Relaxed);
                shared.diagnostics.observe(PipelineStage::Dropped, &record);
                shared.note_error(format!("target {} unavailable: {}", key, e));
                return;
            }
        }
    }
    let runtime = inner.targets.get_mut(&key).expect("just ensured");
    if runtime.sink.is_none() && runtime.sink_error.is_none() {
        // Lazy sink creation on the first record for this target.
        shared.start_sink(runtime);
    }
    match runtime.manager.enqueue(record.clone()) {
        Ok(()) => shared.diagnostics.observe(PipelineStage::Enqueued, &record),
        Err(SpoolError::Rejected) => {
            shared.records_unroutable.fetch_add(1, Ordering::Relaxed);
            shared.diagnostics.observe(PipelineStage::Dropped, &record);
        }
        Err(e) => {
            shared.records_unroutable.fetch_add(1, Ordering::Relaxed);
            shared.diagnostics.observe(PipelineStage::Dropped, &record);
            shared.note_error(format!("enqueue failed: {}", e));
        }
    }
}
