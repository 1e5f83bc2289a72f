// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The client side of one ZeroBus stream.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use otb_repr::{Record, TableName};

use crate::protocol::{decode, encode, AckResult, ClientMessage, ServerMessage, PROTOCOL_VERSION};
use crate::SinkError;

const MAX_FRAME_LEN: usize = 64 << 20;

/// Connection parameters for one stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// `host:port` of the ZeroBus endpoint.
    pub endpoint: String,
    pub tls: bool,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
}

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// An open, authenticated stream to the ZeroBus endpoint for one table.
///
/// Owned by exactly one sender task; there are no cross-task reads on the
/// underlying socket.
pub struct ZerobusStream {
    framed: Framed<Box<dyn Io>, LengthDelimitedCodec>,
}

impl ZerobusStream {
    /// Connects, optionally wraps in TLS, and authenticates for `table`.
    /// The whole open, handshake included, runs under the connect deadline.
    pub async fn open(
        config: &StreamConfig,
        table: &TableName,
        token: &str,
    ) -> Result<ZerobusStream, SinkError> {
        timeout(config.connect_timeout, Self::open_inner(config, table, token))
            .await
            .map_err(|_| SinkError::Timeout(format!("connecting to {}", config.endpoint)))?
    }

    async fn open_inner(
        config: &StreamConfig,
        table: &TableName,
        token: &str,
    ) -> Result<ZerobusStream, SinkError> {
        let tcp = TcpStream::connect(&config.endpoint).await?;
        tcp.set_nodelay(true)?;

        let io: Box<dyn Io> = if config.tls {
            let domain = config
                .endpoint
                .rsplit_once(':')
                .map(|(host, _port)| host)
                .unwrap_or(config.endpoint.as_str());
            let connector = tokio_native_tls::TlsConnector::from(
                native_tls::TlsConnector::builder().build()?,
            );
            let tls = connector
                .connect(domain, tcp)
                .await
                .map_err(SinkError::Tls)?;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();
        let mut framed = Framed::new(io, codec);

        framed
            .send(encode(&ClientMessage::Hello {
                version: PROTOCOL_VERSION,
                token: token.to_owned(),
                table: table.to_string(),
            }))
            .await?;

        let frame = framed
            .next()
            .await
            .ok_or_else(|| SinkError::Protocol("stream closed during handshake".into()))??;
        match decode::<ServerMessage>(&frame)? {
            ServerMessage::HelloAck { result: AckResult::Ok } => {
                debug!(endpoint = %config.endpoint, table = %table, "zerobus stream open");
                Ok(ZerobusStream { framed })
            }
            ServerMessage::HelloAck {
                result: AckResult::Unauthorized,
            } => Err(SinkError::Unauthorized),
            ServerMessage::HelloAck { result } => Err(SinkError::Protocol(format!(
                "handshake refused: {:?}",
                result
            ))),
            other => Err(SinkError::Protocol(format!(
                "expected HelloAck, got {:?}",
                other
            ))),
        }
    }

    /// Sends one batch. Records go on the wire in the order given.
    pub async fn send_batch(&mut self, seq: u64, records: &[Record]) -> Result<(), SinkError> {
        self.framed
            .send(encode(&ClientMessage::Batch {
                seq,
                records: records.to_vec(),
            }))
            .await?;
        Ok(())
    }

    /// Reads the next batch ack, under `deadline`.
    pub async fn read_ack(&mut self, deadline: Duration) -> Result<(u64, AckResult), SinkError> {
        let frame = timeout(deadline, self.framed.next())
            .await
            .map_err(|_| SinkError::Timeout("waiting for batch ack".into()))?
            .ok_or_else(|| SinkError::Protocol("stream closed awaiting ack".into()))??;
        match decode::<ServerMessage>(&frame)? {
            ServerMessage::BatchAck { seq, result } => Ok((seq, result)),
            other => Err(SinkError::Protocol(format!(
                "expected BatchAck, got {:?}",
                other
            ))),
        }
    }

    /// Clean close: announce `Bye` and flush.
    pub async fn close(mut self) {
        let _ = self.framed.send(encode(&ClientMessage::Bye)).await;
        let _ = self.framed.flush().await;
    }
}
