// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The MQTT source client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use otb_secrets::SecretStore;

use crate::normalize::{Normalizer, QualityHint, RawObservation, RawValue};
use crate::types::{MqttSourceOptions, PayloadDecoding, RecordTx, SourceError};

pub struct MqttSourceClient {
    name: String,
    endpoint: String,
    options: MqttSourceOptions,
    normalizer: Normalizer,
    record_tx: RecordTx,
    secrets: Arc<SecretStore>,
    client: Option<rumqttc::AsyncClient>,
    eventloop: Option<rumqttc::EventLoop>,
}

impl MqttSourceClient {
    pub fn new(
        name: String,
        endpoint: String,
        options: MqttSourceOptions,
        normalizer: Normalizer,
        record_tx: RecordTx,
        secrets: Arc<SecretStore>,
    ) -> Result<MqttSourceClient, SourceError> {
        // Fail fast on an unparseable URL; the supervisor handles the rest.
        parse_endpoint(&endpoint)?;
        Ok(MqttSourceClient {
            name,
            endpoint,
            options,
            normalizer,
            record_tx,
            secrets,
            client: None,
            eventloop: None,
        })
    }

    async fn handle_publish(&mut self, publish: rumqttc::Publish) {
        let topic = publish.topic.clone();
        let Some(topic_config) = self
            .options
            .topics
            .iter()
            .find(|t| topic_matches(&t.filter, &topic))
        else {
            debug!(source = %self.name, topic, "publish on unconfigured topic; ignoring");
            return;
        };

        let mut meta = BTreeMap::new();
        meta.insert("mqtt_qos".to_owned(), qos_level(publish.qos).to_string());
        meta.insert("mqtt_retain".to_owned(), publish.retain.to_string());

        let segments: Vec<&str> = topic.split('/').collect();
        let equipment = (segments.len() >= 2).then(|| segments[segments.len() - 2].to_owned());
        let last_segment = segments.last().copied().unwrap_or_default().to_owned();

        let observation = match decode_payload(&publish.payload, &topic_config.decoding) {
            Ok(decoded) => RawObservation {
                raw_tag: topic.clone(),
                equipment,
                signal_type: topic_config
                    .signal_type
                    .clone()
                    .unwrap_or_else(|| match &topic_config.decoding {
                        PayloadDecoding::Json { .. } => last_segment.clone(),
                        _ => "value".to_owned(),
                    }),
                tag: decoded.tag.unwrap_or(last_segment),
                value: decoded.value,
                unit: decoded.unit.or_else(|| topic_config.unit.clone()),
                quality: QualityHint::Delivered,
                source_time_micros: None,
                meta,
            },
            Err(reason) => {
                // Unknown payloads become bad-quality records with the raw
                // bytes preserved in metadata for downstream analysis.
                meta.insert("decode_error".to_owned(), reason);
                meta.insert("payload_hex".to_owned(), to_hex(&publish.payload));
                RawObservation {
                    raw_tag: topic.clone(),
                    equipment,
                    signal_type: topic_config
                        .signal_type
                        .clone()
                        .unwrap_or_else(|| "value".to_owned()),
                    tag: last_segment,
                    value: RawValue::Bytes(publish.payload.to_vec()),
                    unit: topic_config.unit.clone(),
                    quality: QualityHint::DecodeFailed,
                    source_time_micros: None,
                    meta,
                }
            }
        };

        let record = self.normalizer.normalize(observation);
        self.record_tx.deliver(record).await;
    }
}

#[async_trait]
impl super::SourceClient for MqttSourceClient {
    async fn connect(&mut self) -> Result<(), SourceError> {
        let (host, port, tls_scheme) = parse_endpoint(&self.endpoint)?;

        let client_id = self
            .options
            .client_id
            .clone()
            .unwrap_or_else(|| format!("otbridge-{}", self.name));
        let mut mqtt_options = rumqttc::MqttOptions::new(client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(self.options.keep_alive_secs));
        mqtt_options.set_clean_session(self.options.clean_session);

        if let Some(username) = &self.options.username {
            let secret_name = self.options.password_secret.as_deref().ok_or_else(|| {
                SourceError::Config("MQTT username set without password_secret".into())
            })?;
            let password = self
                .secrets
                .get(secret_name)
                .map_err(|e| SourceError::Credentials(e.to_string()))?;
            mqtt_options.set_credentials(username.clone(), password.expose().to_owned());
            // `password` drops here; the scoped buffer is zeroised.
        }

        if tls_scheme || self.options.tls.is_some() {
            let tls = self.options.tls.as_ref().ok_or_else(|| {
                SourceError::Config("mqtts endpoint requires tls options with a CA".into())
            })?;
            let ca = std::fs::read(&tls.ca_path)?;
            let client_auth = match (&tls.client_cert_path, &tls.client_key_path) {
                (Some(cert), Some(key)) => {
                    Some((std::fs::read(cert)?, rumqttc::Key::RSA(std::fs::read(key)?)))
                }
                (None, None) => None,
                _ => {
                    return Err(SourceError::Config(
                        "client_cert_path and client_key_path must be set together".into(),
                    ))
                }
            };
            mqtt_options.set_transport(rumqttc::Transport::Tls(
                rumqttc::TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth,
                },
            ));
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqtt_options, 64);
        for topic in &self.options.topics {
            client
                .subscribe(topic.filter.clone(), qos_from_level(topic.qos)?)
                .await
                .map_err(|e| SourceError::Connect(e.to_string()))?;
        }
        self.client = Some(client);
        self.eventloop = Some(eventloop);
        Ok(())
    }

    async fn stream_until(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SourceError> {
        loop {
            // The event loop cannot be polled while `self` is mutably
            // borrowed for `handle_publish`, so take the publish out first.
            let event = {
                let eventloop = self
                    .eventloop
                    .as_mut()
                    .ok_or_else(|| SourceError::Protocol("stream before connect".into()))?;
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                        continue;
                    }
                    event = eventloop.poll() => event,
                }
            };
            match event {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                    self.handle_publish(publish).await;
                }
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(ack))) => {
                    debug!(source = %self.name, session_present = ack.session_present, "mqtt connected");
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(SourceError::Protocol(e.to_string()));
                }
            }
        }
    }

    async fn stop(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                warn!(source = %self.name, "mqtt disconnect failed: {}", e);
            }
        }
        self.eventloop = None;
    }
}

struct DecodedPayload {
    value: RawValue,
    /// Tag override (the dotted-path leaf for JSON payloads).
    tag: Option<String>,
    unit: Option<String>,
}

fn decode_payload(
    payload: &[u8],
    decoding: &PayloadDecoding,
) -> Result<DecodedPayload, String> {
    match decoding {
        PayloadDecoding::Raw => Ok(DecodedPayload {
            value: RawValue::Bytes(payload.to_vec()),
            tag: None,
            unit: None,
        }),
        PayloadDecoding::Utf8 => {
            let text = std::str::from_utf8(payload).map_err(|e| e.to_string())?;
            Ok(DecodedPayload {
                value: RawValue::Text(text.to_owned()),
                tag: None,
                unit: None,
            })
        }
        PayloadDecoding::Json { path, unit_path } => {
            let root: serde_json::Value =
                serde_json::from_slice(payload).map_err(|e| e.to_string())?;
            let value = lookup_dotted(&root, path)
                .ok_or_else(|| format!("json path {:?} not found", path))?;
            let value = json_to_raw(value)?;
            let unit = unit_path
                .as_deref()
                .and_then(|p| lookup_dotted(&root, p))
                .and_then(|v| v.as_str().map(str::to_owned));
            let tag = path.rsplit('.').next().map(str::to_owned);
            Ok(DecodedPayload { value, tag, unit })
        }
    }
}

fn lookup_dotted<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = root;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn json_to_raw(value: &serde_json::Value) -> Result<RawValue, String> {
    match value {
        serde_json::Value::Bool(b) => Ok(RawValue::Bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(RawValue::Signed(i))
            } else if let Some(u) = n.as_u64() {
                Ok(RawValue::Unsigned(u))
            } else {
                Ok(RawValue::Float(n.as_f64().expect("number is f64")))
            }
        }
        serde_json::Value::String(s) => Ok(RawValue::Text(s.clone())),
        other => Err(format!("unsupported json value: {}", other)),
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards.
fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn qos_from_level(level: u8) -> Result<rumqttc::QoS, SourceError> {
    match level {
        0 => Ok(rumqttc::QoS::AtMostOnce),
        1 => Ok(rumqttc::QoS::AtLeastOnce),
        2 => Ok(rumqttc::QoS::ExactlyOnce),
        other => Err(SourceError::Config(format!("invalid MQTT QoS {}", other))),
    }
}

fn qos_level(qos: rumqttc::QoS) -> u8 {
    match qos {
        rumqttc::QoS::AtMostOnce => 0,
        rumqttc::QoS::AtLeastOnce => 1,
        rumqttc::QoS::ExactlyOnce => 2,
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Parses `mqtt://host:port` / `mqtts://host:port`. Returns
/// `(host, port, tls)`.
fn parse_endpoint(endpoint: &str) -> Result<(String, u16, bool), SourceError> {
    let url = url::Url::parse(endpoint)
        .map_err(|e| SourceError::Config(format!("malformed endpoint {:?}: {}", endpoint, e)))?;
    let tls = match url.scheme() {
        "mqtt" => false,
        "mqtts" => true,
        other => {
            return Err(SourceError::Config(format!(
                "unsupported MQTT scheme {:?}",
                other
            )))
        }
    };
    let host = url
        .host_str()
        .ok_or_else(|| SourceError::Config("endpoint is missing a host".into()))?
        .to_owned();
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });
    Ok((host, port, tls))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_wildcards_match_like_a_broker() {
        assert!(topic_matches("sensors/#", "sensors/pump1/flow"));
        assert!(topic_matches("sensors/+/flow", "sensors/pump1/flow"));
        assert!(topic_matches("sensors/pump1/flow", "sensors/pump1/flow"));
        assert!(!topic_matches("sensors/+/flow", "sensors/pump1/pressure"));
        assert!(!topic_matches("sensors/+", "sensors/pump1/flow"));
        assert!(!topic_matches("other/#", "sensors/pump1/flow"));
    }

    #[test]
    fn json_dotted_path_extracts_value_and_unit() {
        let decoded = decode_payload(
            br#"{"v":12.3,"u":"L/s"}"#,
            &PayloadDecoding::Json {
                path: "v".into(),
                unit_path: Some("u".into()),
            },
        )
        .unwrap();
        assert_eq!(decoded.value, RawValue::Float(12.3));
        assert_eq!(decoded.tag.as_deref(), Some("v"));
        assert_eq!(decoded.unit.as_deref(), Some("L/s"));
    }

    #[test]
    fn nested_dotted_paths_descend_objects() {
        let decoded = decode_payload(
            br#"{"telemetry":{"flow":{"value":7}}}"#,
            &PayloadDecoding::Json {
                path: "telemetry.flow.value".into(),
                unit_path: None,
            },
        )
        .unwrap();
        assert_eq!(decoded.value, RawValue::Signed(7));
        assert_eq!(decoded.tag.as_deref(), Some("value"));
    }

    #[test]
    fn undecodable_payloads_report_the_reason() {
        assert!(decode_payload(
            b"not json",
            &PayloadDecoding::Json {
                path: "v".into(),
                unit_path: None
            }
        )
        .is_err());
        assert!(decode_payload(&[0xff, 0xfe], &PayloadDecoding::Utf8).is_err());
        assert!(decode_payload(&[0xff, 0xfe], &PayloadDecoding::Raw).is_ok());
    }

    #[test]
    fn endpoint_parsing_defaults_ports_by_scheme() {
        assert_eq!(parse_endpoint("mqtt://broker").unwrap(), ("broker".into(), 1883, false));
        assert_eq!(
            parse_endpoint("mqtts://broker:9883").unwrap(),
            ("broker".into(), 9883, true)
        );
        assert!(parse_endpoint("http://broker").is_err());
    }
}
