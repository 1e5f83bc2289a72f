// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The ZeroBus streaming sink.
//!
//! One [`Sink`] exists per cloud target. It pulls records from that target's
//! backpressure manager, forms batches (size- or time-bounded, whichever
//! trips first), and sends them over a framed, authenticated, ordered
//! stream to the ZeroBus ingestion endpoint, reading one ack per batch.
//! Recoverable failures retry with jittered exponential backoff behind a
//! per-target [`CircuitBreaker`]; schema rejections divert the offending
//! records to the dead-letter queue and the stream moves on. OAuth2
//! client-credentials tokens come from a cached, single-flight
//! [`TokenProvider`].

mod breaker;
mod config;
mod metrics;
mod protocol;
mod sink;
mod stream;
mod token;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitOpen, CircuitState};
pub use config::{SinkConfig, TargetConfig};
pub use metrics::SinkMetrics;
pub use protocol::{decode, encode, AckResult, ClientMessage, ServerMessage, PROTOCOL_VERSION};
pub use sink::{probe_stream, Sink, SinkHandle, SinkStatusSnapshot};
pub use stream::{StreamConfig, ZerobusStream};
pub use token::{TokenError, TokenProvider};

use thiserror::Error;

/// Errors produced while driving a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The per-target circuit breaker is open; the send was refused without
    /// touching the network.
    #[error("circuit open")]
    CircuitOpen(#[from] CircuitOpen),
    /// The server rejected our token.
    #[error("unauthorized")]
    Unauthorized,
    /// Token acquisition failed.
    #[error("token: {0}")]
    Token(#[from] TokenError),
    /// The peer spoke something other than the ZeroBus stream protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A network deadline elapsed.
    #[error("deadline exceeded: {0}")]
    Timeout(String),
    #[error("tls error: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("spool error: {0}")]
    Spool(#[from] otb_spool::SpoolError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SinkError {
    /// Whether the error is worth a retry with backoff, as opposed to one
    /// that needs intervention (credentials) or a record-level decision
    /// (schema).
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::CircuitOpen(_) => false,
            SinkError::Unauthorized => false,
            SinkError::Token(e) => e.is_retryable(),
            SinkError::Protocol(_) => true,
            SinkError::Timeout(_) => true,
            SinkError::Tls(_) => true,
            SinkError::Spool(_) => false,
            SinkError::Io(_) => true,
        }
    }
}
