// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Scoped acquisition and release of sensitive values.
//!
//! The gateway holds exactly one long-lived secret: the process-wide
//! [`MasterSecret`], supplied at start and never persisted. Everything else
//! (OAuth2 client secrets, protocol passwords) lives encrypted at rest in
//! `state/credentials.enc` and is decrypted one entry at a time into a
//! [`SecretHandle`] whose buffer is zeroised on drop. The same master secret
//! also keys the disk spool; both keys are independent HKDF expansions over
//! the persisted salt, so rotating the salt rotates everything.

mod master;
mod store;

pub use master::{DerivedKey, MasterSecret, CREDENTIALS_CONTEXT, SPOOL_CONTEXT};
pub use store::{SecretHandle, SecretStore, SECRET_SENTINEL};

use thiserror::Error;

/// Errors produced by the credential store.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// No secret is stored under the requested name.
    #[error("unknown secret: {0}")]
    Unknown(String),
    /// The master secret has not been loaded; the store can list names but
    /// not decrypt values.
    #[error("credential store is locked")]
    Locked,
    /// Authentication of the stored ciphertext failed. The contents are
    /// reported as corrupt and never logged.
    #[error("credential store is corrupt")]
    Corrupt,
    /// The master secret is unusable (too short, or the env value is not
    /// valid UTF-8).
    #[error("invalid master secret: {0}")]
    InvalidMasterSecret(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
