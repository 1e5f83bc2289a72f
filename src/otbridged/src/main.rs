// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The gateway daemon.
//!
//! Wires configuration, the credential store, the bridge, and the HTTP
//! control endpoint together, then runs until SIGINT/SIGTERM. Exit codes
//! are part of the contract with process supervisors:
//!
//! - `0`: clean stop
//! - `1`: configuration invalid
//! - `2`: credential store locked or corrupt (master secret included)
//! - `3`: unrecoverable internal error (state spool unreadable)

mod config;
mod http;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use otb_bridge::{Bridge, BridgeConfig, BridgeError, BridgeHandle, TargetConfigUpdate};
use otb_secrets::{MasterSecret, SecretsError};

use crate::config::GatewayConfig;

const MASTER_SECRET_ENV: &str = "OTBRIDGED_MASTER_SECRET";
const ZEROBUS_SECRET_ENV: &str = "OTBRIDGED_ZEROBUS_SECRET";

#[derive(Debug, Parser)]
#[clap(name = "otbridged", about = "OT-to-cloud data gateway.")]
struct Args {
    /// Directory holding the non-secret YAML configuration.
    #[clap(long, env = "OTBRIDGED_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,
    /// Directory holding durable state: credentials, spool, DLQ.
    #[clap(long, env = "OTBRIDGED_STATE_DIR", default_value = "state")]
    state_dir: PathBuf,
    /// Address for the JSON control endpoint.
    #[clap(long, env = "OTBRIDGED_LISTEN_ADDR", default_value = "127.0.0.1:8433")]
    listen_addr: SocketAddr,
    /// Read the master secret from this file instead of the environment.
    #[clap(long, env = "OTBRIDGED_MASTER_SECRET_FILE")]
    master_secret_file: Option<PathBuf>,
    /// Grace period for a source's clean disconnect on stop, in seconds.
    #[clap(long, default_value = "10")]
    source_stop_grace_secs: u64,
    /// Bound on draining sinks at shutdown, in seconds.
    #[clap(long, default_value = "30")]
    drain_deadline_secs: u64,
}

/// A startup failure, carrying the process exit code it maps to.
enum StartError {
    Config(String),
    Credentials(String),
    Internal(String),
}

impl StartError {
    fn code(&self) -> u8 {
        match self {
            StartError::Config(_) => 1,
            StartError::Credentials(_) => 2,
            StartError::Internal(_) => 3,
        }
    }

    fn message(&self) -> &str {
        match self {
            StartError::Config(m) | StartError::Credentials(m) | StartError::Internal(m) => m,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("OTBRIDGED_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("building the tokio runtime");
    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e.message());
            ExitCode::from(e.code())
        }
    }
}

async fn run(args: Args) -> Result<(), StartError> {
    // The master secret is the only input that must exist before anything
    // else; without it neither credentials nor the spool are readable.
    let master = match &args.master_secret_file {
        Some(path) => MasterSecret::from_file(path)
            .map_err(|e| StartError::Credentials(e.to_string()))?,
        None => MasterSecret::from_env(MASTER_SECRET_ENV)
            .map_err(|e| StartError::Credentials(e.to_string()))?
            .ok_or_else(|| {
                StartError::Credentials(format!(
                    "master secret missing: set {} or --master-secret-file",
                    MASTER_SECRET_ENV
                ))
            })?,
    };

    let secrets = Arc::new(
        otb_secrets::SecretStore::open(&args.state_dir, &master).map_err(|e| match e {
            SecretsError::Corrupt => {
                StartError::Credentials("credential store is corrupt".into())
            }
            other => StartError::Credentials(other.to_string()),
        })?,
    );

    let gateway_config = GatewayConfig::load(&args.config_dir).map_err(StartError::Config)?;

    let mut bridge_config = BridgeConfig::new(args.state_dir.clone());
    bridge_config.spool = gateway_config.backpressure.clone();
    gateway_config.batching.apply_to(&mut bridge_config.sink);
    bridge_config.source_stop_grace = Duration::from_secs(args.source_stop_grace_secs);
    bridge_config.drain_deadline = Duration::from_secs(args.drain_deadline_secs);

    let bridge = Bridge::serve(bridge_config, Arc::clone(&secrets))
        .await
        .map_err(|e| StartError::Internal(e.to_string()))?;

    apply_configuration(&bridge, &gateway_config).await?;

    let bridge = Arc::new(bridge);
    let app = http::router(http::AppState {
        bridge: Arc::clone(&bridge),
        config_dir: args.config_dir.clone(),
    });
    info!(addr = %args.listen_addr, "control endpoint listening");
    let server = axum::Server::try_bind(&args.listen_addr)
        .map_err(|e| StartError::Config(format!("binding {}: {}", args.listen_addr, e)))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal());
    server
        .await
        .map_err(|e| StartError::Internal(e.to_string()))?;

    info!("signal received; stopping");
    match Arc::try_unwrap(bridge) {
        Ok(bridge) => bridge.shutdown().await,
        Err(_) => warn!("control surface still referenced at shutdown; skipping clean drain"),
    }
    info!("clean stop");
    Ok(())
}

/// Applies the configuration file through the same control-surface
/// methods the console uses.
async fn apply_configuration(
    bridge: &BridgeHandle,
    config: &GatewayConfig,
) -> Result<(), StartError> {
    if let Some(target) = &config.target {
        // The client secret never lives in YAML: it is either already in
        // the credential store or supplied through the environment on
        // first start.
        let client_secret = std::env::var(ZEROBUS_SECRET_ENV).ok();
        let update = TargetConfigUpdate {
            config: target.clone(),
            client_secret,
        };
        match bridge.save_target_config(update).await {
            Ok(()) => match bridge.start_sink().await {
                Ok(()) => {}
                Err(BridgeError::Spool(e)) => {
                    return Err(StartError::Internal(format!("spool unrecoverable: {}", e)))
                }
                Err(BridgeError::Secrets(e)) => {
                    return Err(StartError::Credentials(e.to_string()))
                }
                Err(e) => warn!("sink not started: {}", e),
            },
            Err(BridgeError::Config(reason)) => {
                // Missing secret on first start is survivable: the operator
                // supplies it over the control surface and starts the sink.
                warn!("target not applied: {}", reason);
            }
            Err(BridgeError::Secrets(e)) => return Err(StartError::Credentials(e.to_string())),
            Err(e) => return Err(StartError::Config(e.to_string())),
        }
    }
    for spec in &config.sources {
        bridge
            .add_source(spec.clone())
            .await
            .map_err(|e| StartError::Config(e.to_string()))?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing the SIGINT handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing the SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
