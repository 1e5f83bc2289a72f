// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Modbus source client: polled register access over TCP or RTU.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_modbus::client::{Context, Reader};
use tokio_modbus::slave::Slave;
use tracing::debug;

use crate::normalize::{Normalizer, QualityHint, RawObservation, RawValue};
use crate::types::{
    ModbusSourceOptions, RecordTx, RegisterDataType, RegisterMapEntry, RegisterType, SourceError,
    WordOrder,
};

pub struct ModbusSourceClient {
    endpoint: String,
    options: ModbusSourceOptions,
    normalizer: Normalizer,
    record_tx: RecordTx,
    ctx: Option<Context>,
    /// Last emitted numeric value per entry, for deadband suppression.
    last_emitted: HashMap<String, f64>,
    last_heartbeat: Option<tokio::time::Instant>,
}

impl ModbusSourceClient {
    pub fn new(
        endpoint: String,
        options: ModbusSourceOptions,
        normalizer: Normalizer,
        record_tx: RecordTx,
    ) -> Result<ModbusSourceClient, SourceError> {
        for entry in &options.registers {
            if entry.register_type_matches_data_type() {
                continue;
            }
            return Err(SourceError::Config(format!(
                "register {:?}: {:?} registers cannot carry {:?}",
                entry.name, entry.register_type, entry.data_type
            )));
        }
        Ok(ModbusSourceClient {
            endpoint,
            options,
            normalizer,
            record_tx,
            ctx: None,
            last_emitted: HashMap::new(),
            last_heartbeat: None,
        })
    }

    async fn poll_once(&mut self, heartbeat: bool) -> Result<(), SourceError> {
        // Entries are cloned out so the borrow of `self.ctx` inside the
        // loop does not conflict with emitting records.
        let entries = self.options.registers.clone();
        for entry in &entries {
            let read = self.read_entry(entry).await;
            match read {
                Ok(value) => self.emit_if_reportable(entry, value, heartbeat).await,
                Err(ReadError::Exception(detail)) => {
                    // An exception response is data about the tag, not a
                    // transport failure: emit a bad-quality record and keep
                    // polling.
                    self.emit_exception(entry, &detail).await;
                }
                Err(ReadError::Transport(e)) => {
                    return Err(SourceError::Protocol(format!(
                        "reading {:?}: {}",
                        entry.name, e
                    )));
                }
            }
        }
        Ok(())
    }

    async fn read_entry(&mut self, entry: &RegisterMapEntry) -> Result<DecodedValue, ReadError> {
        let ctx = self
            .ctx
            .as_mut()
            .expect("poll_once runs only after connect");
        let count = entry.data_type.register_count();
        let decoded = match entry.register_type {
            RegisterType::Holding => {
                let registers = ctx
                    .read_holding_registers(entry.address, count)
                    .await
                    .map_err(classify_error)?;
                decode_registers(entry, &registers).map_err(ReadError::Exception)?
            }
            RegisterType::Input => {
                let registers = ctx
                    .read_input_registers(entry.address, count)
                    .await
                    .map_err(classify_error)?;
                decode_registers(entry, &registers).map_err(ReadError::Exception)?
            }
            RegisterType::Coil => {
                let bits = ctx
                    .read_coils(entry.address, 1)
                    .await
                    .map_err(classify_error)?;
                DecodedValue::Bool(bits.first().copied().unwrap_or(false))
            }
            RegisterType::Discrete => {
                let bits = ctx
                    .read_discrete_inputs(entry.address, 1)
                    .await
                    .map_err(classify_error)?;
                DecodedValue::Bool(bits.first().copied().unwrap_or(false))
            }
        };
        Ok(decoded)
    }

    /// Applies deadband report-by-exception and emits the record when it
    /// clears the threshold (or when this pass is a heartbeat).
    async fn emit_if_reportable(
        &mut self,
        entry: &RegisterMapEntry,
        value: DecodedValue,
        heartbeat: bool,
    ) {
        let scaled = value.scaled(entry);
        let report = heartbeat || self.clears_deadband(entry, &scaled);
        if !report {
            return;
        }
        if let Some(numeric) = scaled.as_f64() {
            self.last_emitted.insert(entry.name.clone(), numeric);
        }

        let mut meta = BTreeMap::new();
        meta.insert(
            "modbus_register".to_owned(),
            format!("{:?}:{}", entry.register_type, entry.address).to_lowercase(),
        );
        if heartbeat {
            meta.insert("heartbeat".to_owned(), "true".to_owned());
        }
        let observation = RawObservation {
            raw_tag: format!("{:?}:{}", entry.register_type, entry.address).to_lowercase(),
            equipment: None,
            signal_type: entry.signal_type.clone(),
            tag: entry.name.clone(),
            value: scaled.into_raw(),
            unit: entry.unit.clone(),
            quality: QualityHint::Good,
            source_time_micros: None,
            meta,
        };
        let record = self.normalizer.normalize(observation);
        self.record_tx.deliver(record).await;
    }

    fn clears_deadband(&self, entry: &RegisterMapEntry, value: &DecodedValue) -> bool {
        let Some(deadband) = &entry.deadband else {
            return true;
        };
        let Some(new) = value.as_f64() else {
            return true;
        };
        match self.last_emitted.get(&entry.name) {
            Some(last) => (new - last).abs() >= deadband.threshold(),
            None => true,
        }
    }

    async fn emit_exception(&mut self, entry: &RegisterMapEntry, detail: &str) {
        let mut meta = BTreeMap::new();
        meta.insert("modbus_exception".to_owned(), detail.to_owned());
        let observation = RawObservation {
            raw_tag: format!("{:?}:{}", entry.register_type, entry.address).to_lowercase(),
            equipment: None,
            signal_type: entry.signal_type.clone(),
            tag: entry.name.clone(),
            value: RawValue::Bool(false),
            unit: entry.unit.clone(),
            quality: QualityHint::ModbusException(0),
            source_time_micros: None,
            meta,
        };
        let record = self.normalizer.normalize(observation);
        self.record_tx.deliver(record).await;
    }
}

#[async_trait]
impl super::SourceClient for ModbusSourceClient {
    async fn connect(&mut self) -> Result<(), SourceError> {
        let slave = Slave(self.options.unit_id);
        let ctx = if let Some(rest) = self.endpoint.strip_prefix("modbus-tcp://") {
            let mut addrs = tokio::net::lookup_host(rest)
                .await
                .map_err(|e| SourceError::Connect(format!("resolving {:?}: {}", rest, e)))?;
            let addr = addrs
                .next()
                .ok_or_else(|| SourceError::Connect(format!("{:?} resolved to nothing", rest)))?;
            tokio_modbus::client::tcp::connect_slave(addr, slave)
                .await
                .map_err(|e| SourceError::Connect(e.to_string()))?
        } else if let Some(device) = self.endpoint.strip_prefix("modbus-rtu://") {
            let serial = self
                .options
                .serial
                .ok_or_else(|| SourceError::Config("modbus-rtu requires serial options".into()))?;
            let builder = tokio_serial::new(device, serial.baud_rate)
                .data_bits(match serial.data_bits {
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                })
                .stop_bits(match serial.stop_bits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                })
                .parity(if serial.parity_even {
                    tokio_serial::Parity::Even
                } else {
                    tokio_serial::Parity::None
                });
            let port = tokio_serial::SerialStream::open(&builder)
                .map_err(|e| SourceError::Connect(e.to_string()))?;
            tokio_modbus::client::rtu::connect_slave(port, slave)
                .await
                .map_err(|e| SourceError::Connect(e.to_string()))?
        } else {
            return Err(SourceError::Config(format!(
                "unsupported Modbus endpoint {:?}",
                self.endpoint
            )));
        };
        self.ctx = Some(ctx);
        self.last_heartbeat = None;
        Ok(())
    }

    async fn stream_until(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SourceError> {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.options.poll_interval_ms.max(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let heartbeat_every = Duration::from_millis(self.options.heartbeat_interval_ms);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = interval.tick() => {
                    let now = tokio::time::Instant::now();
                    let heartbeat = self.options.heartbeat_interval_ms > 0
                        && self
                            .last_heartbeat
                            .map_or(true, |last| now.duration_since(last) >= heartbeat_every);
                    if heartbeat {
                        self.last_heartbeat = Some(now);
                    }
                    self.poll_once(heartbeat).await?;
                }
            }
        }
    }

    async fn stop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            drop(ctx);
            debug!("modbus connection closed");
        }
    }
}

enum ReadError {
    /// The device answered with an exception response.
    Exception(String),
    /// The transport failed; the session needs a reconnect.
    Transport(std::io::Error),
}

/// tokio-modbus surfaces both exception responses and transport failures
/// as `io::Error`; exception responses mention the Modbus function in
/// their message.
fn classify_error(e: std::io::Error) -> ReadError {
    let text = e.to_string();
    if text.contains("Modbus") || text.contains("exception") {
        ReadError::Exception(text)
    } else {
        ReadError::Transport(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecodedValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl DecodedValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            DecodedValue::Bool(_) => None,
            DecodedValue::Int(i) => Some(*i as f64),
            DecodedValue::Float(f) => Some(*f),
        }
    }

    /// Applies slope/offset scaling. Any scaled value becomes a float.
    fn scaled(self, entry: &RegisterMapEntry) -> DecodedValue {
        match (entry.scale, self) {
            (Some(scale), DecodedValue::Int(i)) => {
                DecodedValue::Float(i as f64 * scale.slope + scale.offset)
            }
            (Some(scale), DecodedValue::Float(f)) => {
                DecodedValue::Float(f * scale.slope + scale.offset)
            }
            (_, value) => value,
        }
    }

    fn into_raw(self) -> RawValue {
        match self {
            DecodedValue::Bool(b) => RawValue::Bool(b),
            DecodedValue::Int(i) => RawValue::Signed(i),
            DecodedValue::Float(f) => RawValue::Float(f),
        }
    }
}

impl RegisterMapEntry {
    fn register_type_matches_data_type(&self) -> bool {
        match self.register_type {
            RegisterType::Coil | RegisterType::Discrete => {
                self.data_type == RegisterDataType::Bool
            }
            RegisterType::Holding | RegisterType::Input => true,
        }
    }
}

/// Decodes raw registers into a typed value, honouring word order and the
/// per-register byte swap.
fn decode_registers(entry: &RegisterMapEntry, registers: &[u16]) -> Result<DecodedValue, String> {
    let needed = entry.data_type.register_count() as usize;
    if registers.len() < needed {
        return Err(format!(
            "device returned {} registers, needed {}",
            registers.len(),
            needed
        ));
    }
    let mut words: Vec<u16> = registers[..needed].to_vec();
    if entry.byte_swap {
        for word in &mut words {
            *word = word.swap_bytes();
        }
    }
    if entry.word_order == WordOrder::Little {
        words.reverse();
    }
    let value = match entry.data_type {
        RegisterDataType::Int16 => DecodedValue::Int(words[0] as i16 as i64),
        RegisterDataType::Uint16 => DecodedValue::Int(words[0] as i64),
        RegisterDataType::Bool => DecodedValue::Bool(words[0] != 0),
        RegisterDataType::Int32 => {
            let bits = (u32::from(words[0]) << 16) | u32::from(words[1]);
            DecodedValue::Int(bits as i32 as i64)
        }
        RegisterDataType::Uint32 => {
            let bits = (u32::from(words[0]) << 16) | u32::from(words[1]);
            DecodedValue::Int(i64::from(bits))
        }
        RegisterDataType::Float32 => {
            let bits = (u32::from(words[0]) << 16) | u32::from(words[1]);
            DecodedValue::Float(f64::from(f32::from_bits(bits)))
        }
        RegisterDataType::Float64 => {
            let bits = (u64::from(words[0]) << 48)
                | (u64::from(words[1]) << 32)
                | (u64::from(words[2]) << 16)
                | u64::from(words[3]);
            DecodedValue::Float(f64::from_bits(bits))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Deadband, Scaling};

    fn entry(data_type: RegisterDataType) -> RegisterMapEntry {
        RegisterMapEntry {
            name: "speed".into(),
            signal_type: "speed".into(),
            address: 0x10,
            register_type: RegisterType::Holding,
            data_type,
            word_order: WordOrder::Big,
            byte_swap: false,
            scale: None,
            deadband: None,
            unit: None,
        }
    }

    #[test]
    fn integer_widths_decode_with_sign() {
        assert_eq!(
            decode_registers(&entry(RegisterDataType::Int16), &[0xFFFE]).unwrap(),
            DecodedValue::Int(-2)
        );
        assert_eq!(
            decode_registers(&entry(RegisterDataType::Uint16), &[0xFFFE]).unwrap(),
            DecodedValue::Int(0xFFFE)
        );
        assert_eq!(
            decode_registers(&entry(RegisterDataType::Int32), &[0xFFFF, 0xFFFE]).unwrap(),
            DecodedValue::Int(-2)
        );
        assert_eq!(
            decode_registers(&entry(RegisterDataType::Uint32), &[0x0001, 0x0000]).unwrap(),
            DecodedValue::Int(65536)
        );
    }

    #[test]
    fn float32_decodes_by_word_order() {
        // 417.5f32 == 0x43D0C000: big word order puts 0x43D0 first.
        let registers = [0x43D0, 0xC000];
        assert_eq!(
            decode_registers(&entry(RegisterDataType::Float32), &registers).unwrap(),
            DecodedValue::Float(417.5)
        );
        let mut little = entry(RegisterDataType::Float32);
        little.word_order = WordOrder::Little;
        assert_eq!(
            decode_registers(&little, &[0xC000, 0x43D0]).unwrap(),
            DecodedValue::Float(417.5)
        );
    }

    #[test]
    fn byte_swap_applies_within_each_register() {
        let mut swapped = entry(RegisterDataType::Uint16);
        swapped.byte_swap = true;
        assert_eq!(
            decode_registers(&swapped, &[0x3412]).unwrap(),
            DecodedValue::Int(0x1234)
        );
    }

    #[test]
    fn float64_spans_four_registers() {
        let bits = 1234.5678f64.to_bits();
        let registers = [
            (bits >> 48) as u16,
            (bits >> 32) as u16,
            (bits >> 16) as u16,
            bits as u16,
        ];
        assert_eq!(
            decode_registers(&entry(RegisterDataType::Float64), &registers).unwrap(),
            DecodedValue::Float(1234.5678)
        );
    }

    #[test]
    fn scaling_turns_counts_into_engineering_units() {
        let mut scaled = entry(RegisterDataType::Uint16);
        scaled.scale = Some(Scaling {
            slope: 0.1,
            offset: -40.0,
        });
        let value = decode_registers(&scaled, &[500]).unwrap().scaled(&scaled);
        assert_eq!(value, DecodedValue::Float(500.0 * 0.1 - 40.0));
    }

    #[test]
    fn short_reads_are_rejected() {
        assert!(decode_registers(&entry(RegisterDataType::Float32), &[0x43D0]).is_err());
    }

    #[test]
    fn deadband_thresholds_compute_from_absolute_and_percent() {
        assert_eq!(Deadband::Absolute { value: 0.5 }.threshold(), 0.5);
        assert_eq!(
            Deadband::Percent {
                percent: 2.0,
                span: 200.0
            }
            .threshold(),
            4.0
        );
    }
}
