// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The JSON control endpoint.
//!
//! A thin HTTP facade over the bridge's control surface, consumed by the
//! operations console and other collaborators. Mutating operations persist
//! the non-secret configuration back to `config/gateway.yaml` so a restart
//! reproduces the running setup.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::warn;

use otb_bridge::{
    BridgeError, BridgeHandle, PipelineStage, SinkDiagnostics, SourceSpec, StageSample,
    StatusSnapshot, TargetConfigUpdate, TargetConfigView,
};

use crate::config::GatewayConfig;

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<BridgeHandle>,
    pub config_dir: PathBuf,
}

impl AppState {
    /// Rewrites `gateway.yaml` from the bridge's current view. Best
    /// effort: a failed write is logged, never surfaced to the caller
    /// whose state change already happened.
    async fn persist(&self) {
        let config = GatewayConfig {
            sources: self.bridge.list_sources().await,
            target: self.bridge.get_target_config().await.config,
            ..GatewayConfig::default()
        };
        if let Err(e) = config.save(&self.config_dir) {
            warn!("persisting configuration: {}", e);
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/metrics", get(get_metrics))
        .route("/api/sources", get(list_sources).post(add_source))
        .route(
            "/api/sources/:name",
            axum::routing::put(update_source).delete(delete_source),
        )
        .route("/api/sources/:name/start", post(start_source))
        .route("/api/sources/:name/stop", post(stop_source))
        .route("/api/target", get(get_target).put(save_target))
        .route("/api/sink/start", post(start_sink))
        .route("/api/sink/stop", post(stop_sink))
        .route("/api/sink/diagnostics", get(sink_diagnostics))
        .route("/api/diagnostics/pipeline", get(pipeline_diagnostics))
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn map_err(e: BridgeError) -> ApiError {
    let status = match &e {
        BridgeError::Config(_) | BridgeError::NoTarget => StatusCode::BAD_REQUEST,
        BridgeError::UnknownSource(_) => StatusCode::NOT_FOUND,
        BridgeError::DuplicateSource(_) => StatusCode::CONFLICT,
        BridgeError::Secrets(_) | BridgeError::Source(_) | BridgeError::Spool(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string())
}

async fn get_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.bridge.get_status().await)
}

async fn get_metrics(State(state): State<AppState>) -> Json<otb_bridge::MetricsSnapshot> {
    Json(state.bridge.get_metrics().await)
}

async fn list_sources(State(state): State<AppState>) -> Json<Vec<SourceSpec>> {
    Json(state.bridge.list_sources().await)
}

async fn add_source(
    State(state): State<AppState>,
    Json(spec): Json<SourceSpec>,
) -> Result<StatusCode, ApiError> {
    state.bridge.add_source(spec).await.map_err(map_err)?;
    state.persist().await;
    Ok(StatusCode::CREATED)
}

async fn update_source(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(spec): Json<SourceSpec>,
) -> Result<StatusCode, ApiError> {
    state
        .bridge
        .update_source(&name, spec)
        .await
        .map_err(map_err)?;
    state.persist().await;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_source(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.bridge.delete_source(&name).await.map_err(map_err)?;
    state.persist().await;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_source(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.bridge.start_source(&name).await.map_err(map_err)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_source(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.bridge.stop_source(&name).await.map_err(map_err)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_target(State(state): State<AppState>) -> Json<TargetConfigView> {
    Json(state.bridge.get_target_config().await)
}

async fn save_target(
    State(state): State<AppState>,
    Json(update): Json<TargetConfigUpdate>,
) -> Result<StatusCode, ApiError> {
    state
        .bridge
        .save_target_config(update)
        .await
        .map_err(map_err)?;
    state.persist().await;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_sink(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.bridge.start_sink().await.map_err(map_err)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_sink(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.bridge.stop_sink().await.map_err(map_err)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct DiagnosticsParams {
    #[serde(default)]
    deep: bool,
}

async fn sink_diagnostics(
    State(state): State<AppState>,
    Query(params): Query<DiagnosticsParams>,
) -> Json<SinkDiagnostics> {
    Json(state.bridge.sink_diagnostics(params.deep).await)
}

async fn pipeline_diagnostics(
    State(state): State<AppState>,
) -> Json<BTreeMap<String, BTreeMap<PipelineStage, Vec<StageSample>>>> {
    Json(state.bridge.get_pipeline_diagnostics().await)
}
