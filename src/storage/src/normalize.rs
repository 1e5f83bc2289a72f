// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The tag normaliser.
//!
//! Consumes protocol-native reads and emits canonical [`Record`]s: ISA-95
//! path assembly, unified quality classification, lossless value-type
//! selection, timestamp fill-in, and vendor metadata stamping. The
//! normaliser is stateless and safe to invoke concurrently; the same input
//! and context always produce the same path, in this process or any other.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use otb_repr::{Quality, Record, SourceProtocol, TagPath, Value};

use crate::types::NormalizeContext;

/// A protocol-native read, before normalisation.
#[derive(Debug, Clone)]
pub struct RawObservation {
    /// Protocol-native address: node id, topic, register coordinates.
    pub raw_tag: String,
    /// Overrides the context's equipment segment (MQTT derives equipment
    /// from the topic).
    pub equipment: Option<String>,
    pub signal_type: String,
    pub tag: String,
    pub value: RawValue,
    pub unit: Option<String>,
    pub quality: QualityHint,
    /// Device timestamp, when the protocol provides one.
    pub source_time_micros: Option<u64>,
    pub meta: BTreeMap<String, String>,
}

/// A raw value as the protocol delivered it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Bool(bool),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Protocol-specific quality evidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QualityHint {
    /// OPC-UA status code, classified by its severity byte: `0x00` good,
    /// `0x40`–`0x43` uncertain, `0x80` and above bad.
    OpcStatus(u32),
    /// The broker delivered the message intact.
    Delivered,
    /// The payload could not be decoded as configured.
    DecodeFailed,
    /// Modbus exception response.
    ModbusException(u8),
    Good,
}

/// The per-source normaliser.
#[derive(Debug, Clone)]
pub struct Normalizer {
    source: String,
    protocol: SourceProtocol,
    context: NormalizeContext,
}

impl Normalizer {
    pub fn new(source: String, protocol: SourceProtocol, context: NormalizeContext) -> Normalizer {
        Normalizer {
            source,
            protocol,
            context,
        }
    }

    pub fn context(&self) -> &NormalizeContext {
        &self.context
    }

    /// Builds the canonical record for one raw observation. The result
    /// always has a non-empty path, a resolved quality, and both
    /// timestamps.
    pub fn normalize(&self, raw: RawObservation) -> Record {
        let ingest_ts_micros = now_micros();
        let equipment = raw.equipment.as_deref().unwrap_or(&self.context.equipment);
        let path = TagPath::from_segments(
            [
                self.context.site.as_str(),
                self.context.area.as_str(),
                self.context.line.as_str(),
                equipment,
                raw.signal_type.as_str(),
                raw.tag.as_str(),
            ],
            &self.context.default_segment,
        );
        Record {
            source: self.source.clone(),
            protocol: self.protocol,
            raw_tag: raw.raw_tag,
            path,
            value: classify_value(raw.value),
            unit: raw.unit,
            quality: classify_quality(raw.quality),
            source_ts_micros: raw.source_time_micros.unwrap_or(ingest_ts_micros),
            ingest_ts_micros,
            meta: raw.meta,
        }
    }
}

/// Picks the canonical variant that holds the raw value without loss.
/// Integer widths collapse into `Int`; an unsigned value too large for
/// `i64` degrades to `Float` rather than failing. Float readings stay
/// `Float` even when integral, so a sampled tag keeps one value type
/// across its series.
fn classify_value(raw: RawValue) -> Value {
    match raw {
        RawValue::Bool(b) => Value::Bool(b),
        RawValue::Signed(i) => Value::Int(i),
        RawValue::Unsigned(u) => match i64::try_from(u) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Float(u as f64),
        },
        RawValue::Float(f) => Value::Float(f),
        RawValue::Text(s) => Value::Text(s),
        RawValue::Bytes(b) => Value::Bytes(b),
    }
}

fn classify_quality(hint: QualityHint) -> Quality {
    match hint {
        QualityHint::OpcStatus(code) => {
            let severity = code >> 24;
            if severity == 0 {
                Quality::Good
            } else if (0x40..=0x43).contains(&severity) {
                Quality::Uncertain
            } else if severity >= 0x80 {
                Quality::Bad
            } else {
                Quality::Uncertain
            }
        }
        QualityHint::Delivered | QualityHint::Good => Quality::Good,
        QualityHint::DecodeFailed => Quality::Bad,
        QualityHint::ModbusException(_) => Quality::Bad,
    }
}

pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock after the epoch")
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> NormalizeContext {
        NormalizeContext {
            site: "Plant1".into(),
            area: "Production".into(),
            line: "Line1".into(),
            equipment: "PLC1".into(),
            default_segment: otb_repr::DEFAULT_SEGMENT.into(),
        }
    }

    fn normalizer() -> Normalizer {
        Normalizer::new("plant1_opcua".into(), SourceProtocol::OpcUa, context())
    }

    fn raw(value: RawValue) -> RawObservation {
        RawObservation {
            raw_tag: "ns=2;s=bearing_temp".into(),
            equipment: None,
            signal_type: "Temperature".into(),
            tag: "Bearing Temp".into(),
            value,
            unit: Some("degC".into()),
            quality: QualityHint::OpcStatus(0),
            source_time_micros: Some(1_700_000_000_000_000),
            meta: BTreeMap::new(),
        }
    }

    #[test]
    fn paths_are_assembled_and_sanitised() {
        let record = normalizer().normalize(raw(RawValue::Float(70.5)));
        assert_eq!(
            record.path.as_str(),
            "plant1/production/line1/plc1/temperature/bearing_temp"
        );
        assert_eq!(record.unit.as_deref(), Some("degC"));
        assert_eq!(record.quality, Quality::Good);
        assert_eq!(record.value, Value::Float(70.5));
        assert_eq!(record.source_ts_micros, 1_700_000_000_000_000);
        assert!(record.ingest_ts_micros > 0);
    }

    #[test]
    fn paths_are_deterministic_across_normalisers() {
        let a = normalizer().normalize(raw(RawValue::Float(1.0)));
        let b = Normalizer::new("plant1_opcua".into(), SourceProtocol::OpcUa, context())
            .normalize(raw(RawValue::Float(2.0)));
        assert_eq!(a.path, b.path);
    }

    #[test]
    fn equipment_override_wins_over_context() {
        let mut observation = raw(RawValue::Float(12.3));
        observation.equipment = Some("pump1".into());
        observation.signal_type = "flow".into();
        observation.tag = "v".into();
        let normalizer = Normalizer::new(
            "plant1_mqtt".into(),
            SourceProtocol::Mqtt,
            NormalizeContext {
                site: "plant1".into(),
                area: "utilities".into(),
                line: "pumps".into(),
                equipment: String::new(),
                default_segment: otb_repr::DEFAULT_SEGMENT.into(),
            },
        );
        let record = normalizer.normalize(observation);
        assert_eq!(record.path.as_str(), "plant1/utilities/pumps/pump1/flow/v");
    }

    #[test]
    fn empty_segments_fall_back_to_the_default() {
        let normalizer = Normalizer::new(
            "s".into(),
            SourceProtocol::Mqtt,
            NormalizeContext {
                site: "plant1".into(),
                area: "utilities".into(),
                line: "pumps".into(),
                equipment: String::new(),
                default_segment: "unspecified".into(),
            },
        );
        let record = normalizer.normalize(raw(RawValue::Float(1.0)));
        assert_eq!(
            record.path.as_str(),
            "plant1/utilities/pumps/unspecified/temperature/bearing_temp"
        );
    }

    #[test]
    fn opc_status_severity_classifies_quality() {
        let q = |code| classify_quality(QualityHint::OpcStatus(code));
        assert_eq!(q(0x0000_0000), Quality::Good);
        // Uncertain_InitialValue and friends carry severity 0x40.
        assert_eq!(q(0x4092_0000), Quality::Uncertain);
        assert_eq!(q(0x4300_0000), Quality::Uncertain);
        // BadNodeIdUnknown and every other 0x80+ severity is bad.
        assert_eq!(q(0x8034_0000), Quality::Bad);
        assert_eq!(q(0xC000_0000), Quality::Bad);
    }

    #[test]
    fn protocol_quality_hints_map_to_the_unified_enum() {
        assert_eq!(classify_quality(QualityHint::Delivered), Quality::Good);
        assert_eq!(classify_quality(QualityHint::DecodeFailed), Quality::Bad);
        assert_eq!(classify_quality(QualityHint::ModbusException(2)), Quality::Bad);
    }

    #[test]
    fn values_take_the_smallest_lossless_variant() {
        let n = normalizer();
        assert_eq!(n.normalize(raw(RawValue::Bool(true))).value, Value::Bool(true));
        assert_eq!(n.normalize(raw(RawValue::Signed(-40))).value, Value::Int(-40));
        assert_eq!(n.normalize(raw(RawValue::Unsigned(7))).value, Value::Int(7));
        assert_eq!(
            n.normalize(raw(RawValue::Unsigned(u64::MAX))).value,
            Value::Float(u64::MAX as f64)
        );
        assert_eq!(n.normalize(raw(RawValue::Float(70.5))).value, Value::Float(70.5));
        assert_eq!(
            n.normalize(raw(RawValue::Text("run".into()))).value,
            Value::Text("run".into())
        );
    }

    #[test]
    fn integral_floats_are_not_collapsed_to_int() {
        // A sampled series like [70.0, 70.5, 71.0] must keep one value
        // type for the whole tag.
        let n = normalizer();
        assert_eq!(n.normalize(raw(RawValue::Float(70.0))).value, Value::Float(70.0));
        assert_eq!(n.normalize(raw(RawValue::Float(-0.0))).value, Value::Float(-0.0));
    }

    #[test]
    fn missing_device_timestamp_uses_the_ingest_clock() {
        let mut observation = raw(RawValue::Float(1.0));
        observation.source_time_micros = None;
        let record = normalizer().normalize(observation);
        assert_eq!(record.source_ts_micros, record.ingest_ts_micros);
    }
}
