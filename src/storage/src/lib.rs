// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Field-protocol ingestion.
//!
//! One source = one configured collector speaking OPC-UA, MQTT, or Modbus.
//! Every client implements the same small capability set (connect, stream,
//! stop) and is driven by a supervisor task that owns the
//! reconnect-with-backoff loop and the source's observable state. Clients
//! produce protocol-native reads; the [`normalize::Normalizer`] turns them
//! into canonical [`otb_repr::Record`]s which flow into the bridge through
//! a [`types::RecordTx`]. Emission never blocks on a full backpressure
//! tier: the bridge's router applies the enqueue protocol, and the channel
//! between them is drained continuously.

pub mod normalize;
pub mod source;
pub mod types;

pub use source::{spawn_source, SourceTask};
pub use types::{
    ModbusSourceOptions, MqttSourceOptions, NormalizeContext, OpcUaSourceOptions, ProtocolOptions,
    RecordTx, SourceConfig, SourceError, SourceShared, SourceState, SourceStatusSnapshot,
};
