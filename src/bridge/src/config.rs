// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Bridge configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use otb_spool::{DropPolicy, SpoolConfig};
use otb_zerobus::SinkConfig;

/// Backpressure sizing, shared by every per-target manager the bridge
/// creates. Serialisable so the daemon can read it straight from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolSettings {
    pub memory_capacity: usize,
    pub max_spool_bytes: u64,
    pub max_segments: usize,
    pub segment_max_bytes: u64,
    pub segment_max_age_ms: u64,
    pub drop_policy: DropPolicy,
    pub fsync: bool,
}

impl Default for SpoolSettings {
    fn default() -> SpoolSettings {
        SpoolSettings {
            memory_capacity: 10_000,
            max_spool_bytes: 1 << 30,
            max_segments: 1024,
            segment_max_bytes: 8 << 20,
            segment_max_age_ms: 60_000,
            drop_policy: DropPolicy::Oldest,
            fsync: true,
        }
    }
}

impl SpoolSettings {
    /// Materialises the settings into a [`SpoolConfig`] rooted at the
    /// given tier directories.
    pub fn to_spool_config(&self, spool_dir: PathBuf, dlq_dir: PathBuf) -> SpoolConfig {
        let mut config = SpoolConfig::new(spool_dir, dlq_dir);
        config.memory_capacity = self.memory_capacity;
        config.max_spool_bytes = self.max_spool_bytes;
        config.max_segments = self.max_segments;
        config.segment_max_bytes = self.segment_max_bytes;
        config.segment_max_age = Duration::from_millis(self.segment_max_age_ms);
        config.drop_policy = self.drop_policy;
        config.fsync = self.fsync;
        config
    }
}

/// Configuration for one bridge instance.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Root of the durable state layout: `spool/`, `dlq/`,
    /// `credentials.enc`, `salt`.
    pub state_dir: PathBuf,
    pub spool: SpoolSettings,
    pub sink: SinkConfig,
    /// Grace period for a source's clean disconnect on stop.
    pub source_stop_grace: Duration,
    /// Bound on draining each sink at bridge shutdown.
    pub drain_deadline: Duration,
}

impl BridgeConfig {
    pub fn new(state_dir: PathBuf) -> BridgeConfig {
        BridgeConfig {
            state_dir,
            spool: SpoolSettings::default(),
            sink: SinkConfig::default(),
            source_stop_grace: Duration::from_secs(10),
            drain_deadline: Duration::from_secs(30),
        }
    }
}
