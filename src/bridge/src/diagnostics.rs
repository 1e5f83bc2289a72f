// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Pipeline diagnostics: small per-stage sample windows, for debugging
//! which stage of the pipeline a source's records stop at. Not a data
//! path; the windows are capped tightly and overwritten continuously.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use otb_repr::Record;

const WINDOW: usize = 32;

/// The observation points the router can see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Arrived from the source, already normalised.
    Normalized,
    /// Accepted by the backpressure manager.
    Enqueued,
    /// Discarded by the drop policy or a routing failure.
    Dropped,
}

/// One sampled record, reduced to what a debugging eye needs.
#[derive(Debug, Clone, Serialize)]
pub struct StageSample {
    pub path: String,
    pub value: String,
    pub quality: String,
    pub unix_ms: u64,
}

impl StageSample {
    fn of(record: &Record) -> StageSample {
        StageSample {
            path: record.path.to_string(),
            value: record.value.display_short(),
            quality: record.quality.to_string(),
            unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system clock after the epoch")
                .as_millis() as u64,
        }
    }
}

/// Per-source, per-stage ring buffers.
#[derive(Debug, Default)]
pub struct PipelineDiagnostics {
    windows: Mutex<BTreeMap<String, BTreeMap<PipelineStage, VecDeque<StageSample>>>>,
}

impl PipelineDiagnostics {
    pub fn observe(&self, stage: PipelineStage, record: &Record) {
        let mut windows = self.windows.lock().expect("diagnostics lock poisoned");
        let window = windows
            .entry(record.source.clone())
            .or_default()
            .entry(stage)
            .or_default();
        if window.len() == WINDOW {
            window.pop_front();
        }
        window.push_back(StageSample::of(record));
    }

    pub fn forget_source(&self, source: &str) {
        self.windows
            .lock()
            .expect("diagnostics lock poisoned")
            .remove(source);
    }

    /// A deep copy of every window, for the control surface.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<PipelineStage, Vec<StageSample>>> {
        let windows = self.windows.lock().expect("diagnostics lock poisoned");
        windows
            .iter()
            .map(|(source, stages)| {
                let stages = stages
                    .iter()
                    .map(|(stage, window)| (*stage, window.iter().cloned().collect()))
                    .collect();
                (source.clone(), stages)
            })
            .collect()
    }
}
