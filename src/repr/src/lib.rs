// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The canonical representation of a field observation.
//!
//! Every protocol client in the gateway, whatever it speaks on the wire,
//! produces [`Record`]s: one immutable value per sensor observation, located
//! by an ISA-95 [`TagPath`] and destined for exactly one [`TargetKey`].
//! Everything downstream of the normaliser (spooling, batching, upload)
//! operates on this type and nothing else, so the definitions here are kept
//! deliberately small and dependency-free.

mod path;
mod record;
mod target;

pub use path::{sanitize_segment, PathError, TagPath, DEFAULT_SEGMENT};
pub use record::{Quality, Record, SourceProtocol, Value};
pub use target::{TableName, TableNameError, TargetKey};
