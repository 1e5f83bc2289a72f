// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Three-tier bounded backpressure for the gateway data plane.
//!
//! Producers (protocol clients, via the bridge router) call the non-blocking
//! [`BackpressureManager::enqueue`]; the single consumer (a sink's batcher)
//! calls the deadline-blocking [`BackpressureManager::dequeue`]. Between them
//! sit three tiers:
//!
//! - **Tier A**, a bounded in-memory ring;
//! - **Tier B**, an append-only spool of AES-256-GCM encrypted segment files,
//!   capped by total bytes and segment count, replayed from its head after a
//!   restart;
//! - **Tier C**, a dead-letter queue in the same on-disk format, written by
//!   the sink for records the cloud refused permanently and never consumed
//!   automatically.
//!
//! The consumer view is globally FIFO: while the spool holds records, new
//! enqueues append behind them rather than jumping the queue through the
//! ring, and a dispatcher migrates spool-head records back into the ring as
//! it drains. Every record is accounted for (dequeued, counted as dropped
//! by policy, or moved to the DLQ); nothing is lost silently.

mod frame;
mod manager;
mod metrics;
mod segment;

pub use frame::FrameCrypto;
pub use manager::{
    BackpressureManager, DispatcherHandle, DropPolicy, SpoolConfig, SpoolCounts,
};
pub use metrics::SpoolMetrics;
pub use segment::DeadLetter;

use thiserror::Error;

/// Errors produced by the backpressure manager.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// All tiers are full and the drop policy is `reject`.
    #[error("backpressure full; record rejected")]
    Rejected,
    /// A spool segment could not be read back; the spool is unrecoverable
    /// beyond this point.
    #[error("spool corrupt: {0}")]
    Corrupt(String),
    /// A record image failed to (de)serialise.
    #[error("record codec error: {0}")]
    Codec(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
