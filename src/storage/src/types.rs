// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Source configuration and the shared observable state of a running
//! source.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use otb_repr::{Record, SourceProtocol};

/// Errors produced by source validation and source clients.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The configuration is invalid; nothing was changed.
    #[error("invalid source configuration: {0}")]
    Config(String),
    /// The endpoint refused or dropped the session.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The session broke mid-stream.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A referenced credential is missing or the store is locked/corrupt.
    #[error("credential error: {0}")]
    Credentials(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The ISA-95 context a source stamps onto every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeContext {
    pub site: String,
    pub area: String,
    pub line: String,
    #[serde(default)]
    pub equipment: String,
    /// Replacement for segments that normalise to nothing.
    #[serde(default = "default_segment")]
    pub default_segment: String,
}

fn default_segment() -> String {
    otb_repr::DEFAULT_SEGMENT.to_owned()
}

/// One configured collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique, stable name.
    pub name: String,
    /// Protocol endpoint URL: `opc.tcp://`, `mqtt://`/`mqtts://`,
    /// `modbus-tcp://`, or `modbus-rtu://` with a device path.
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub context: NormalizeContext,
    /// Protocol-specific options; the variant determines the protocol.
    pub options: ProtocolOptions,
}

fn default_true() -> bool {
    true
}

impl SourceConfig {
    pub fn protocol(&self) -> SourceProtocol {
        match &self.options {
            ProtocolOptions::OpcUa(_) => SourceProtocol::OpcUa,
            ProtocolOptions::Mqtt(_) => SourceProtocol::Mqtt,
            ProtocolOptions::Modbus(_) => SourceProtocol::Modbus,
        }
    }

    /// Validates the configuration. Returns an error to the caller and
    /// changes no state.
    pub fn validate(&self) -> Result<(), SourceError> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(SourceError::Config(format!(
                "source name must be non-empty alphanumeric/underscore/dash, got {:?}",
                self.name
            )));
        }
        let scheme_ok = match &self.options {
            ProtocolOptions::OpcUa(_) => self.endpoint.starts_with("opc.tcp://"),
            ProtocolOptions::Mqtt(_) => {
                self.endpoint.starts_with("mqtt://") || self.endpoint.starts_with("mqtts://")
            }
            ProtocolOptions::Modbus(_) => {
                self.endpoint.starts_with("modbus-tcp://")
                    || self.endpoint.starts_with("modbus-rtu://")
            }
        };
        if !scheme_ok {
            return Err(SourceError::Config(format!(
                "endpoint {:?} does not match protocol {}",
                self.endpoint,
                self.protocol()
            )));
        }
        match &self.options {
            ProtocolOptions::OpcUa(opts) => {
                if opts.nodes.is_empty() {
                    return Err(SourceError::Config("OPC-UA source has no nodes".into()));
                }
            }
            ProtocolOptions::Mqtt(opts) => {
                if opts.topics.is_empty() {
                    return Err(SourceError::Config("MQTT source has no topics".into()));
                }
            }
            ProtocolOptions::Modbus(opts) => {
                if opts.registers.is_empty() {
                    return Err(SourceError::Config("Modbus source has no registers".into()));
                }
                if self.endpoint.starts_with("modbus-rtu://") && opts.serial.is_none() {
                    return Err(SourceError::Config(
                        "modbus-rtu endpoint requires serial options".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Per-protocol options, externally tagged so configuration reads
/// `options: { opcua: ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolOptions {
    OpcUa(OpcUaSourceOptions),
    Mqtt(MqttSourceOptions),
    Modbus(ModbusSourceOptions),
}

// ---------------------------------------------------------------------------
// OPC-UA

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OpcUaSecurity {
    #[default]
    None,
    Sign,
    SignAndEncrypt,
}

/// User-token authentication for OPC-UA; the password is a credential
/// store reference, never an inline value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpcUaUserAuth {
    pub username: String,
    pub password_secret: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpcUaNode {
    /// e.g. `ns=2;s=bearing_temp`.
    pub node_id: String,
    pub signal_type: String,
    pub tag: String,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpcUaMode {
    /// Preferred: server-side sampling with monitored items.
    Subscription {
        sampling_interval_ms: u64,
        #[serde(default = "default_queue_size")]
        queue_size: u32,
    },
    /// Fallback: client-side reads on a fixed period.
    Polling { period_ms: u64 },
}

fn default_queue_size() -> u32 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpcUaSourceOptions {
    #[serde(default)]
    pub security: OpcUaSecurity,
    /// Client certificate/key for sign or sign-and-encrypt modes.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub auth: Option<OpcUaUserAuth>,
    pub mode: OpcUaMode,
    pub nodes: Vec<OpcUaNode>,
}

// ---------------------------------------------------------------------------
// MQTT

/// How a topic's payload becomes a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadDecoding {
    /// Bytes pass through untouched.
    Raw,
    /// UTF-8 text; invalid UTF-8 yields a bad-quality record.
    Utf8,
    /// JSON with a dotted path to the value field.
    Json {
        path: String,
        /// Optional sibling field carrying the engineering unit.
        #[serde(default)]
        unit_path: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttTopic {
    /// Topic filter; `+` and `#` wildcards allowed.
    pub filter: String,
    pub decoding: PayloadDecoding,
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Overrides the signal-type segment derived from the topic.
    #[serde(default)]
    pub signal_type: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

fn default_qos() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttTlsOptions {
    pub ca_path: PathBuf,
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttSourceOptions {
    pub topics: Vec<MqttTopic>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub username: Option<String>,
    /// Credential store reference.
    #[serde(default)]
    pub password_secret: Option<String>,
    #[serde(default)]
    pub tls: Option<MqttTlsOptions>,
}

fn default_keep_alive() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Modbus

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Holding,
    Input,
    Coil,
    Discrete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterDataType {
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    Bool,
}

impl RegisterDataType {
    /// How many 16-bit registers this type spans.
    pub fn register_count(&self) -> u16 {
        match self {
            RegisterDataType::Int16 | RegisterDataType::Uint16 | RegisterDataType::Bool => 1,
            RegisterDataType::Int32 | RegisterDataType::Uint32 | RegisterDataType::Float32 => 2,
            RegisterDataType::Float64 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WordOrder {
    /// Most significant word in the lowest register.
    #[default]
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    pub slope: f64,
    pub offset: f64,
}

/// Report-by-exception threshold for one register entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deadband {
    Absolute { value: f64 },
    /// Percent of the configured engineering span.
    Percent { percent: f64, span: f64 },
}

impl Deadband {
    pub fn threshold(&self) -> f64 {
        match *self {
            Deadband::Absolute { value } => value,
            Deadband::Percent { percent, span } => percent / 100.0 * span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterMapEntry {
    /// Tag name; the final path segment.
    pub name: String,
    pub signal_type: String,
    pub address: u16,
    pub register_type: RegisterType,
    pub data_type: RegisterDataType,
    #[serde(default)]
    pub word_order: WordOrder,
    /// Swap the two bytes within each register before decoding.
    #[serde(default)]
    pub byte_swap: bool,
    #[serde(default)]
    pub scale: Option<Scaling>,
    #[serde(default)]
    pub deadband: Option<Deadband>,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialOptions {
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity_even: bool,
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusSourceOptions {
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Emit every entry at this cadence even when unchanged. Zero disables
    /// the heartbeat.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_ms: u64,
    #[serde(default)]
    pub serial: Option<SerialOptions>,
    pub registers: Vec<RegisterMapEntry>,
}

fn default_unit_id() -> u8 {
    1
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_heartbeat() -> u64 {
    60_000
}

// ---------------------------------------------------------------------------
// Running-source state

/// Source lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Configured,
    Connecting,
    Running,
    Reconnecting,
    Stopping,
    Stopped,
    /// The source refused to start (for example, the credential store is
    /// locked); the rest of the bridge keeps running.
    Errored,
}

/// Observable state shared between a source's supervisor and the control
/// surface.
#[derive(Debug)]
pub struct SourceShared {
    pub name: String,
    pub protocol: SourceProtocol,
    state: Mutex<SourceState>,
    last_error: Mutex<Option<String>>,
    records_read: AtomicU64,
    reconnects: AtomicU64,
}

impl SourceShared {
    pub fn new(name: String, protocol: SourceProtocol) -> SourceShared {
        SourceShared {
            name,
            protocol,
            state: Mutex::new(SourceState::Configured),
            last_error: Mutex::new(None),
            records_read: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn set_state(&self, state: SourceState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    pub fn state(&self) -> SourceState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn note_error(&self, error: impl ToString) {
        *self.last_error.lock().expect("last_error lock poisoned") = Some(error.to_string());
    }

    pub fn note_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SourceStatusSnapshot {
        SourceStatusSnapshot {
            name: self.name.clone(),
            protocol: self.protocol,
            state: self.state(),
            last_error: self
                .last_error
                .lock()
                .expect("last_error lock poisoned")
                .clone(),
            records_read: self.records_read.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Per-source status for the control surface. Every field is present even
/// when zero.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatusSnapshot {
    pub name: String,
    pub protocol: SourceProtocol,
    pub state: SourceState,
    pub last_error: Option<String>,
    pub records_read: u64,
    pub reconnects: u64,
}

/// The emission handle a client pushes normalised records through.
///
/// Enforces the per-tag monotonic source-timestamp invariant: a device
/// clock that steps backwards has its timestamp lifted to the tag's
/// high-water mark. Delivery awaits the bridge's inbound channel, which the
/// router drains continuously; it never blocks on a full backpressure tier
/// (the enqueue protocol owns that decision).
#[derive(Clone)]
pub struct RecordTx {
    tx: mpsc::Sender<Record>,
    shared: Arc<SourceShared>,
    high_water: Arc<Mutex<HashMap<String, u64>>>,
}

impl RecordTx {
    pub fn new(tx: mpsc::Sender<Record>, shared: Arc<SourceShared>) -> RecordTx {
        RecordTx {
            tx,
            shared,
            high_water: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn clamp(&self, record: &mut Record) {
        let mut high_water = self.high_water.lock().expect("high-water lock poisoned");
        let entry = high_water
            .entry(record.path.as_str().to_owned())
            .or_insert(record.source_ts_micros);
        if record.source_ts_micros < *entry {
            record.source_ts_micros = *entry;
        } else {
            *entry = record.source_ts_micros;
        }
    }

    /// Delivers one record from async context.
    pub async fn deliver(&self, mut record: Record) {
        self.clamp(&mut record);
        if self.tx.send(record).await.is_ok() {
            self.shared.records_read.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Delivers one record from a dedicated (non-tokio) thread, such as the
    /// OPC-UA session thread.
    pub fn deliver_blocking(&self, mut record: Record) {
        self.clamp(&mut record);
        if self.tx.blocking_send(record).is_ok() {
            self.shared.records_read.fetch_add(1, Ordering::Relaxed);
        }
    }
}
