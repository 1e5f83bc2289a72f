// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Control-surface data shapes.

use serde::{Deserialize, Serialize};

use otb_storage::{SourceConfig, SourceStatusSnapshot};
use otb_zerobus::{CircuitState, SinkStatusSnapshot, TargetConfig};

/// A configured source as the control surface sees it: the protocol
/// configuration plus an optional per-source target override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    #[serde(flatten)]
    pub source: SourceConfig,
    /// Overrides the default target for this source's records.
    #[serde(default)]
    pub target: Option<TargetConfig>,
}

impl SourceSpec {
    pub fn validate(&self) -> Result<(), String> {
        self.source.validate().map_err(|e| e.to_string())?;
        if let Some(target) = &self.target {
            target.validate()?;
        }
        Ok(())
    }
}

/// Per-source status plus its configured intent.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatusEntry {
    #[serde(flatten)]
    pub status: SourceStatusSnapshot,
    pub enabled: bool,
}

/// The full status snapshot. Every field is present even when zero or
/// empty.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// False when any enabled source is reconnecting/errored or any
    /// circuit is not closed.
    pub healthy: bool,
    pub sources: Vec<SourceStatusEntry>,
    pub sinks: Vec<SinkStatusSnapshot>,
}

/// Counters and gauges for `get_metrics`. Every field present even when
/// zero.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub records_received: u64,
    pub records_normalized: u64,
    pub records_enqueued: u64,
    pub records_dropped: u64,
    pub records_sent: u64,
    pub records_dlq: u64,
    pub queue_depth: u64,
    pub spool_bytes: u64,
    pub spool_errors: u64,
    pub reconnections: u64,
    pub batches_sent: u64,
    pub retries: u64,
    pub circuit_opens: u64,
    pub token_refreshes: u64,
    pub last_error: Option<String>,
}

/// The default target as reported to callers. The secret itself never
/// crosses the surface; `client_secret` is the sentinel `"***"` when one
/// is stored and empty when not.
#[derive(Debug, Clone, Serialize)]
pub struct TargetConfigView {
    pub config: Option<TargetConfig>,
    pub client_secret: String,
}

/// A target update from a caller. `client_secret` may be omitted or set
/// to the sentinel `"***"` to retain the stored secret; any other value
/// replaces it.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfigUpdate {
    #[serde(flatten)]
    pub config: TargetConfig,
    #[serde(default)]
    pub client_secret: Option<String>,
}

/// `sink_diagnostics` result.
#[derive(Debug, Clone, Serialize)]
pub struct SinkDiagnostics {
    pub configured: bool,
    pub running: bool,
    pub circuit: Option<CircuitState>,
    pub queue_depth: u64,
    pub spool_bytes: u64,
    /// Deep-probe outcome: `None` when not requested, `Some(Ok)` when a
    /// probe stream opened and closed cleanly.
    pub probe: Option<Result<(), String>>,
}
