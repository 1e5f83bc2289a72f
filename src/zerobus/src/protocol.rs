// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The ZeroBus stream protocol.
//!
//! A framed, authenticated, ordered record stream with one ack per batch.
//! Frames are length-delimited; each frame carries one bincode message.
//! The client authenticates the stream in its `Hello`, then sends batches
//! with strictly increasing sequence numbers; the server acks each batch in
//! order, so an ack of batch `n` implies every earlier batch on the stream
//! succeeded.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use otb_repr::Record;

use crate::SinkError;

pub const PROTOCOL_VERSION: u32 = 1;

/// Client-to-server messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Opens and authenticates the stream for one table.
    Hello {
        version: u32,
        token: String,
        table: String,
    },
    /// One ordered batch of records.
    Batch { seq: u64, records: Vec<Record> },
    /// Clean close.
    Bye,
}

/// Server-to-client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    HelloAck { result: AckResult },
    BatchAck { seq: u64, result: AckResult },
}

/// The outcome taxonomy for a handshake or batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckResult {
    /// Accepted and durable.
    Ok,
    /// The bearer token was rejected; refresh and retry.
    Unauthorized,
    /// A transient server-side failure; retry with backoff.
    Transient { reason: String },
    /// The server asks the client to slow down; retry with backoff.
    FlowControl,
    /// One or more records violate the table schema. `records` lists the
    /// offending indices within the batch; an empty list means the whole
    /// batch. These are never retried.
    SchemaViolation { reason: String, records: Vec<u32> },
}

pub fn encode<T: Serialize>(message: &T) -> Bytes {
    Bytes::from(bincode::serialize(message).expect("protocol messages serialise"))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, SinkError> {
    bincode::deserialize(frame).map_err(|e| SinkError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_round_trip() {
        let msg = ClientMessage::Hello {
            version: PROTOCOL_VERSION,
            token: "tok".into(),
            table: "main.telemetry.readings".into(),
        };
        let decoded: ClientMessage = decode(&encode(&msg)).unwrap();
        assert!(matches!(decoded, ClientMessage::Hello { version: 1, .. }));

        let ack = ServerMessage::BatchAck {
            seq: 7,
            result: AckResult::SchemaViolation {
                reason: "value type mismatch".into(),
                records: vec![3],
            },
        };
        let decoded: ServerMessage = decode(&encode(&ack)).unwrap();
        match decoded {
            ServerMessage::BatchAck { seq, result } => {
                assert_eq!(seq, 7);
                assert_eq!(
                    result,
                    AckResult::SchemaViolation {
                        reason: "value type mismatch".into(),
                        records: vec![3],
                    }
                );
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(decode::<ServerMessage>(&[0xff; 3]).is_err());
    }
}
