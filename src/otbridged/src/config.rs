// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! On-disk gateway configuration.
//!
//! `config/gateway.yaml` holds the non-secret configuration: sources, the
//! default target, and backpressure sizing. Secrets never appear in it;
//! targets and sources reference credential-store names, and the store's
//! ciphertext lives under the state directory. Control-surface mutations
//! are persisted back here so a restart reproduces the running setup.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use otb_bridge::{SourceSpec, SpoolSettings};
use otb_zerobus::{SinkConfig, TargetConfig};

const CONFIG_FILE: &str = "gateway.yaml";

/// Batching knobs for the sink, as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub max_records: usize,
    pub max_wait_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> BatchSettings {
        BatchSettings {
            max_records: 1000,
            max_wait_ms: 5000,
        }
    }
}

impl BatchSettings {
    pub fn apply_to(&self, sink: &mut SinkConfig) {
        sink.batch_max_records = self.max_records;
        sink.batch_max_wait = Duration::from_millis(self.max_wait_ms);
    }
}

/// The whole of `gateway.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub sources: Vec<SourceSpec>,
    pub target: Option<TargetConfig>,
    pub backpressure: SpoolSettings,
    pub batching: BatchSettings,
}

impl GatewayConfig {
    /// Loads the configuration, treating a missing file as empty defaults
    /// and anything else unreadable as a hard configuration error.
    pub fn load(config_dir: &Path) -> Result<GatewayConfig, String> {
        let path = config_dir.join(CONFIG_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(GatewayConfig::default())
            }
            Err(e) => return Err(format!("reading {}: {}", path.display(), e)),
        };
        let config: GatewayConfig = serde_yaml::from_slice(&bytes)
            .map_err(|e| format!("parsing {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut names = std::collections::BTreeSet::new();
        for spec in &self.sources {
            spec.validate()?;
            if !names.insert(&spec.source.name) {
                return Err(format!("duplicate source name {:?}", spec.source.name));
            }
        }
        if let Some(target) = &self.target {
            target.validate()?;
        }
        Ok(())
    }

    /// Writes the configuration back, atomically.
    pub fn save(&self, config_dir: &Path) -> Result<(), String> {
        fs::create_dir_all(config_dir).map_err(|e| e.to_string())?;
        let path = config_dir.join(CONFIG_FILE);
        let tmp = config_dir.join(format!("{}.tmp", CONFIG_FILE));
        let yaml = serde_yaml::to_string(self).map_err(|e| e.to_string())?;
        fs::write(&tmp, yaml).map_err(|e| e.to_string())?;
        fs::rename(&tmp, &path).map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::load(dir.path()).unwrap();
        assert!(config.sources.is_empty());
        assert!(config.target.is_none());
        assert_eq!(config.backpressure.memory_capacity, 10_000);
    }

    #[test]
    fn yaml_round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
target:
  workspace_host: adb-123.azuredatabricks.net
  zerobus_endpoint: zerobus.example.com:443
  table: main.telemetry.readings
  client_id: svc-gateway
  client_secret_name: zerobus_client_secret
backpressure:
  memory_capacity: 500
  drop_policy: newest
batching:
  max_records: 200
sources:
  - name: plant1_mqtt
    endpoint: mqtt://broker:1883
    context:
      site: plant1
      area: utilities
      line: pumps
    options:
      mqtt:
        topics:
          - filter: sensors/#
            decoding:
              json:
                path: v
                unit_path: u
"#;
        std::fs::write(dir.path().join(CONFIG_FILE), yaml).unwrap();
        let config = GatewayConfig::load(dir.path()).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.backpressure.memory_capacity, 500);
        assert_eq!(config.batching.max_records, 200);
        assert!(config.target.is_some());

        config.save(dir.path()).unwrap();
        let reloaded = GatewayConfig::load(dir.path()).unwrap();
        assert_eq!(reloaded.sources.len(), 1);
        assert_eq!(reloaded.sources[0].source.name, "plant1_mqtt");
    }

    #[test]
    fn duplicate_source_names_are_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
sources:
  - name: a
    endpoint: mqtt://broker:1883
    context: {site: s, area: a, line: l}
    options:
      mqtt:
        topics: [{filter: "x/#", decoding: raw}]
  - name: a
    endpoint: mqtt://broker:1883
    context: {site: s, area: a, line: l}
    options:
      mqtt:
        topics: [{filter: "y/#", decoding: raw}]
"#;
        std::fs::write(dir.path().join(CONFIG_FILE), yaml).unwrap();
        assert!(GatewayConfig::load(dir.path()).is_err());
    }

    #[test]
    fn malformed_yaml_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "sources: {not a list").unwrap();
        assert!(GatewayConfig::load(dir.path()).is_err());
    }
}
