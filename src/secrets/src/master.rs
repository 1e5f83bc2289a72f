// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The process-wide master secret and key derivation.

use std::path::Path;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::SecretsError;

/// HKDF info string for the credential-store key.
pub const CREDENTIALS_CONTEXT: &[u8] = b"otbridge/credentials/v1";
/// HKDF info string for the spool/DLQ frame key.
pub const SPOOL_CONTEXT: &[u8] = b"otbridge/spool/v1";

const MIN_MASTER_SECRET_LEN: usize = 16;

/// The master secret supplied at process start.
///
/// Never persisted and never cloned; the only singleton in the process. The
/// backing buffer is zeroised when the secret is dropped at shutdown.
pub struct MasterSecret {
    bytes: Zeroizing<Vec<u8>>,
}

impl MasterSecret {
    /// Wraps raw secret material. Rejects material shorter than 16 bytes.
    pub fn new(bytes: Vec<u8>) -> Result<MasterSecret, SecretsError> {
        if bytes.len() < MIN_MASTER_SECRET_LEN {
            return Err(SecretsError::InvalidMasterSecret(format!(
                "need at least {} bytes, got {}",
                MIN_MASTER_SECRET_LEN,
                bytes.len()
            )));
        }
        Ok(MasterSecret {
            bytes: Zeroizing::new(bytes),
        })
    }

    /// Reads the secret from an environment variable, if set.
    pub fn from_env(var: &str) -> Result<Option<MasterSecret>, SecretsError> {
        match std::env::var(var) {
            Ok(value) => MasterSecret::new(value.into_bytes()).map(Some),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretsError::InvalidMasterSecret(
                format!("{} is not valid UTF-8", var),
            )),
        }
    }

    /// Reads the secret from a file, trimming a single trailing newline.
    pub fn from_file(path: &Path) -> Result<MasterSecret, SecretsError> {
        let mut bytes = std::fs::read(path)?;
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        MasterSecret::new(bytes)
    }

    /// Derives a 256-bit key for the given context, bound to the persisted
    /// salt. Distinct contexts yield independent keys from the one secret.
    pub fn derive_key(&self, salt: &[u8], context: &[u8]) -> DerivedKey {
        let hk = Hkdf::<Sha256>::new(Some(salt), &self.bytes);
        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand(context, okm.as_mut())
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        DerivedKey { bytes: okm }
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("MasterSecret(<redacted>)")
    }
}

/// A derived symmetric key. Zeroised on drop.
pub struct DerivedKey {
    bytes: Zeroizing<[u8; 32]>,
}

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic_and_context_separated() {
        let master = MasterSecret::new(b"correct horse battery staple".to_vec()).unwrap();
        let salt = [7u8; 32];
        let a = master.derive_key(&salt, SPOOL_CONTEXT);
        let b = master.derive_key(&salt, SPOOL_CONTEXT);
        let c = master.derive_key(&salt, CREDENTIALS_CONTEXT);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());

        let other_salt = [8u8; 32];
        let d = master.derive_key(&other_salt, SPOOL_CONTEXT);
        assert_ne!(a.as_bytes(), d.as_bytes());
    }

    #[test]
    fn short_secrets_are_rejected() {
        assert!(MasterSecret::new(b"short".to_vec()).is_err());
    }

    #[test]
    fn debug_never_prints_material() {
        let master = MasterSecret::new(b"correct horse battery staple".to_vec()).unwrap();
        assert_eq!(format!("{:?}", master), "MasterSecret(<redacted>)");
    }
}
