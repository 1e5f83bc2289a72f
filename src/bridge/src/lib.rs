// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The bridge: the orchestrator at the centre of the gateway.
//!
//! The bridge exclusively owns sources and sinks. A router task consumes
//! the inbound record channel that every source emits into, resolves each
//! record's effective target (source override, else the default), and
//! applies the backpressure enqueue protocol on that target's manager.
//! Sinks are created lazily on the first record for their target and torn
//! down when no configured source references the target and its
//! backpressure tiers are empty.
//!
//! A failing source never brings the bridge down; it transitions to
//! `reconnecting` with backoff and records its last error. A failing sink
//! backs up its own manager only. The control surface exposed from
//! [`BridgeHandle`] is the entire outside interface: status, metrics,
//! source CRUD and lifecycle, target configuration, sink control, and
//! pipeline diagnostics.

mod bridge;
mod config;
mod diagnostics;
mod status;

pub use bridge::{Bridge, BridgeHandle};
pub use config::{BridgeConfig, SpoolSettings};
pub use diagnostics::{PipelineDiagnostics, PipelineStage, StageSample};
pub use status::{
    MetricsSnapshot, SinkDiagnostics, SourceSpec, SourceStatusEntry, StatusSnapshot,
    TargetConfigUpdate, TargetConfigView,
};

use thiserror::Error;

/// Errors surfaced across the control surface.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The operation's configuration is invalid; no state changed.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unknown source: {0}")]
    UnknownSource(String),
    #[error("a source named {0} already exists")]
    DuplicateSource(String),
    /// No target is configured for a record or operation that needs one.
    #[error("no target configured")]
    NoTarget,
    #[error("credential store: {0}")]
    Secrets(#[from] otb_secrets::SecretsError),
    #[error("source: {0}")]
    Source(#[from] otb_storage::SourceError),
    #[error("spool: {0}")]
    Spool(#[from] otb_spool::SpoolError),
}
