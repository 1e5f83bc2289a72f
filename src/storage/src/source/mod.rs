// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The source capability set and the supervisor that drives it.

mod modbus;
mod mqtt;
mod opcua;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use otb_repr::Record;
use otb_secrets::SecretStore;

use crate::normalize::Normalizer;
use crate::types::{
    ProtocolOptions, RecordTx, SourceConfig, SourceError, SourceShared, SourceState,
};

pub use modbus::ModbusSourceClient;
pub use mqtt::MqttSourceClient;
pub use opcua::OpcUaSourceClient;

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

/// The capability set every protocol client implements.
#[async_trait]
pub trait SourceClient: Send {
    /// Establishes the protocol session. Retried by the supervisor with
    /// backoff on failure.
    async fn connect(&mut self) -> Result<(), SourceError>;

    /// Streams records until shutdown fires (returns `Ok`) or the session
    /// breaks (returns `Err`, after which the supervisor reconnects).
    async fn stream_until(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SourceError>;

    /// Tears the session down. Must be safe to call at any point.
    async fn stop(&mut self);
}

/// A spawned source: the supervisor task plus its control handles.
pub struct SourceTask {
    shared: Arc<SourceShared>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

impl SourceTask {
    pub fn shared(&self) -> &Arc<SourceShared> {
        &self.shared
    }

    /// Signals shutdown and waits up to `grace` for a clean disconnect,
    /// then forces the task down. In-flight records already delivered to
    /// the bridge are unaffected.
    pub async fn stop(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let abort = self.supervisor.abort_handle();
        if tokio::time::timeout(grace, self.supervisor).await.is_err() {
            warn!(source = %self.shared.name, "grace period elapsed; aborting source task");
            abort.abort();
            self.shared.set_state(SourceState::Stopped);
        }
    }
}

/// Validates `config`, builds the protocol client, and spawns its
/// supervisor. The client is connected by the supervisor, not here; a
/// broken endpoint surfaces as `Reconnecting` with a recorded error, never
/// as a failure of the bridge.
pub fn spawn_source(
    config: SourceConfig,
    secrets: Arc<SecretStore>,
    inbound: mpsc::Sender<Record>,
) -> Result<SourceTask, SourceError> {
    config.validate()?;

    let shared = Arc::new(SourceShared::new(config.name.clone(), config.protocol()));
    let record_tx = RecordTx::new(inbound, Arc::clone(&shared));
    let normalizer = Normalizer::new(
        config.name.clone(),
        config.protocol(),
        config.context.clone(),
    );

    let client: Box<dyn SourceClient> = match &config.options {
        ProtocolOptions::OpcUa(options) => Box::new(OpcUaSourceClient::new(
            config.endpoint.clone(),
            options.clone(),
            normalizer,
            record_tx,
            Arc::clone(&secrets),
        )),
        ProtocolOptions::Mqtt(options) => Box::new(MqttSourceClient::new(
            config.name.clone(),
            config.endpoint.clone(),
            options.clone(),
            normalizer,
            record_tx,
            Arc::clone(&secrets),
        )?),
        ProtocolOptions::Modbus(options) => Box::new(ModbusSourceClient::new(
            config.endpoint.clone(),
            options.clone(),
            normalizer,
            record_tx,
        )?),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(run_supervisor(client, Arc::clone(&shared), shutdown_rx));
    info!(source = %config.name, protocol = %config.protocol(), "source spawned");

    Ok(SourceTask {
        shared,
        shutdown_tx,
        supervisor,
    })
}

/// Owns the connect → stream → reconnect loop for one client.
async fn run_supervisor(
    mut client: Box<dyn SourceClient>,
    shared: Arc<SourceShared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = RECONNECT_BASE;
    let mut first_attempt = true;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        shared.set_state(if first_attempt {
            SourceState::Connecting
        } else {
            SourceState::Reconnecting
        });

        match client.connect().await {
            Ok(()) => {
                shared.set_state(SourceState::Running);
                backoff = RECONNECT_BASE;
                debug!(source = %shared.name, "source connected");
                match client.stream_until(&mut shutdown_rx).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(source = %shared.name, "session broke: {}", e);
                        shared.note_error(&e);
                        shared.note_reconnect();
                    }
                }
            }
            Err(e) => {
                warn!(source = %shared.name, "connect failed: {}", e);
                shared.note_error(&e);
                shared.note_reconnect();
            }
        }
        first_attempt = false;

        if *shutdown_rx.borrow() {
            break;
        }
        let wait = backoff.mul_f64(rand::thread_rng().gen_range(0.8..1.2));
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown_rx.changed() => {}
        }
        backoff = (backoff * 2).min(RECONNECT_CAP);
    }

    shared.set_state(SourceState::Stopping);
    client.stop().await;
    shared.set_state(SourceState::Stopped);
    debug!(source = %shared.name, "source stopped");
}
