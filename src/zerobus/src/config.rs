// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Target and sink configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use otb_repr::{TableName, TargetKey};

use crate::breaker::BreakerConfig;

/// A cloud destination: where tokens come from, where the stream goes, and
/// which Delta table receives the records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Workspace host used for OAuth2 token acquisition.
    pub workspace_host: String,
    /// ZeroBus ingestion endpoint, `host:port`.
    pub zerobus_endpoint: String,
    /// Fully-qualified destination table.
    pub table: TableName,
    /// OAuth2 client id.
    pub client_id: String,
    /// Name of the client secret in the credential store.
    pub client_secret_name: String,
    /// Whether the data plane uses TLS. Off only for loopback targets.
    #[serde(default = "default_tls")]
    pub tls: bool,
    /// Optional HTTP(S) proxy for the token endpoint. Environment hints
    /// (`HTTPS_PROXY`) apply when unset.
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_tls() -> bool {
    true
}

impl TargetConfig {
    /// The uniqueness key for this target.
    pub fn key(&self) -> TargetKey {
        TargetKey {
            workspace_host: self.workspace_host.clone(),
            zerobus_endpoint: self.zerobus_endpoint.clone(),
            table: self.table.clone(),
        }
    }

    /// Validates the non-secret fields. Returns a human-readable reason on
    /// failure; no state changes on error.
    pub fn validate(&self) -> Result<(), String> {
        if self.workspace_host.is_empty() {
            return Err("workspace_host must not be empty".into());
        }
        if self.zerobus_endpoint.is_empty() || !self.zerobus_endpoint.contains(':') {
            return Err(format!(
                "zerobus_endpoint must be host:port, got {:?}",
                self.zerobus_endpoint
            ));
        }
        if self.client_id.is_empty() {
            return Err("client_id must not be empty".into());
        }
        if self.client_secret_name.is_empty() {
            return Err("client_secret_name must not be empty".into());
        }
        Ok(())
    }
}

/// Batching, retry, and deadline tuning for one sink.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Send once a batch holds this many records.
    pub batch_max_records: usize,
    /// ... or once the oldest record in it has waited this long.
    pub batch_max_wait: Duration,
    /// Base of the exponential backoff for recoverable errors.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_cap: Duration,
    /// Deadline for the ack of one batch.
    pub ack_timeout: Duration,
    /// Deadline for TCP/TLS connect plus the stream handshake.
    pub connect_timeout: Duration,
    pub breaker: BreakerConfig,
}

impl Default for SinkConfig {
    fn default() -> SinkConfig {
        SinkConfig {
            batch_max_records: 1000,
            batch_max_wait: Duration::from_millis(5000),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
            ack_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            breaker: BreakerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TargetConfig {
        TargetConfig {
            workspace_host: "adb-123.azuredatabricks.net".into(),
            zerobus_endpoint: "zerobus.example.com:443".into(),
            table: "main.telemetry.readings".parse().unwrap(),
            client_id: "svc-gateway".into(),
            client_secret_name: "zerobus_client_secret".into(),
            tls: true,
            proxy: None,
        }
    }

    #[test]
    fn validation_catches_malformed_endpoints() {
        assert!(target().validate().is_ok());

        let mut bad = target();
        bad.zerobus_endpoint = "no-port".into();
        assert!(bad.validate().is_err());

        let mut bad = target();
        bad.client_id.clear();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn tls_defaults_on_when_omitted() {
        let yaml = r#"{"workspace_host":"h","zerobus_endpoint":"h:443","table":"a.b.c","client_id":"i","client_secret_name":"s"}"#;
        let cfg: TargetConfig = serde_json::from_str(yaml).unwrap();
        assert!(cfg.tls);
    }
}
