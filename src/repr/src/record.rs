// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The [`Record`] type and its constituent parts.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::path::TagPath;

/// The field protocol a record was read over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceProtocol {
    /// OPC Unified Architecture, subscription or polled reads.
    OpcUa,
    /// MQTT topic subscriptions.
    Mqtt,
    /// Modbus register polling, TCP or RTU.
    Modbus,
}

impl SourceProtocol {
    /// The lowercase name used in configuration and paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceProtocol::OpcUa => "opcua",
            SourceProtocol::Mqtt => "mqtt",
            SourceProtocol::Modbus => "modbus",
        }
    }
}

impl fmt::Display for SourceProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opcua" => Ok(SourceProtocol::OpcUa),
            "mqtt" => Ok(SourceProtocol::Mqtt),
            "modbus" => Ok(SourceProtocol::Modbus),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

/// The unified quality of an observation.
///
/// Protocol-specific status vocabularies (OPC-UA status codes, Modbus
/// exception responses, MQTT delivery failures) are collapsed into these
/// three values by the normaliser; the original vendor detail survives in
/// the record's metadata map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "good",
            Quality::Uncertain => "uncertain",
            Quality::Bad => "bad",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An observed value, as the smallest variant that holds it without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// The name of the variant, for error messages and diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
        }
    }

    /// Renders the value for human consumption. Bytes render as a length,
    /// not their contents.
    pub fn display_short(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
        }
    }
}

/// A single normalised sensor observation.
///
/// Records are value types: once emitted by the normaliser they are never
/// mutated, only moved between tiers and serialised. Two timestamps are
/// always present; `source_ts_micros` comes from the device when the
/// protocol provides one and from the gateway's ingest clock otherwise,
/// while `ingest_ts_micros` is always the gateway clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable name of the producing source.
    pub source: String,
    /// Protocol the observation was read over.
    pub protocol: SourceProtocol,
    /// The protocol-native address: node id, topic, or register coordinates.
    pub raw_tag: String,
    /// Normalised ISA-95 path; the stable identity of the signal.
    pub path: TagPath,
    /// The observed value.
    pub value: Value,
    /// Engineering unit, when known.
    pub unit: Option<String>,
    /// Unified quality.
    pub quality: Quality,
    /// Device timestamp in microseconds since the Unix epoch, or the ingest
    /// clock when the device supplied none.
    pub source_ts_micros: u64,
    /// Gateway ingest timestamp in microseconds since the Unix epoch.
    pub ingest_ts_micros: u64,
    /// Opaque vendor-specific detail (OPC-UA status code, MQTT QoS, Modbus
    /// exception code, and the like).
    pub meta: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_round_trips_through_str() {
        for p in [SourceProtocol::OpcUa, SourceProtocol::Mqtt, SourceProtocol::Modbus] {
            assert_eq!(p.as_str().parse::<SourceProtocol>().unwrap(), p);
        }
        assert!("profibus".parse::<SourceProtocol>().is_err());
    }

    #[test]
    fn record_serde_is_stable() {
        let record = Record {
            source: "plant1_opcua".into(),
            protocol: SourceProtocol::OpcUa,
            raw_tag: "ns=2;s=bearing_temp".into(),
            path: TagPath::from_segments(
                ["plant1", "production", "line1", "plc1", "temperature", "bearing_temp"],
                "unspecified",
            ),
            value: Value::Float(70.5),
            unit: Some("degC".into()),
            quality: Quality::Good,
            source_ts_micros: 1_700_000_000_000_000,
            ingest_ts_micros: 1_700_000_000_000_042,
            meta: BTreeMap::new(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert!(json.contains("\"quality\":\"good\""));
        assert!(json.contains("\"protocol\":\"opcua\""));
    }
}
