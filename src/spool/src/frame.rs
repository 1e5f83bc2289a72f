// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Authenticated-encrypted record frames.
//!
//! Each spool and DLQ record is one frame:
//!
//! ```text
//! [4-byte big-endian length][12-byte nonce ‖ ciphertext][16-byte auth tag]
//! ```
//!
//! The length covers everything after the prefix. The GCM tag is the
//! integrity check: a torn or bit-flipped tail fails to authenticate, which
//! is how recovery finds the last valid frame. No plaintext ever reaches
//! the file.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use otb_secrets::DerivedKey;

use crate::SpoolError;

pub(crate) const LEN_PREFIX: usize = 4;
pub(crate) const NONCE_LEN: usize = 12;
pub(crate) const TAG_LEN: usize = 16;

/// An upper bound on a single frame body. A record is a few hundred bytes;
/// anything near this limit in a segment file is corruption, not data.
pub(crate) const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Seals and opens record frames with a key derived from the master secret.
pub struct FrameCrypto {
    cipher: Aes256Gcm,
}

impl FrameCrypto {
    pub fn new(key: &DerivedKey) -> FrameCrypto {
        FrameCrypto {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes())),
        }
    }

    /// Produces a complete frame, length prefix included.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .expect("AES-GCM encryption is infallible for in-memory buffers");
        let body_len = NONCE_LEN + ciphertext.len();
        let mut frame = Vec::with_capacity(LEN_PREFIX + body_len);
        frame.extend_from_slice(&u32::try_from(body_len).expect("frame fits in u32").to_be_bytes());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        frame
    }

    /// Opens a frame body (everything after the length prefix).
    pub fn open(&self, body: &[u8]) -> Result<Vec<u8>, SpoolError> {
        if body.len() < NONCE_LEN + TAG_LEN {
            return Err(SpoolError::Corrupt("frame body too short".into()));
        }
        let (nonce, ciphertext) = body.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SpoolError::Corrupt("frame failed to authenticate".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otb_secrets::{MasterSecret, SPOOL_CONTEXT};

    fn crypto() -> FrameCrypto {
        let master = MasterSecret::new(b"an adequately long master secret".to_vec()).unwrap();
        FrameCrypto::new(&master.derive_key(&[1u8; 32], SPOOL_CONTEXT))
    }

    #[test]
    fn seal_open_round_trip() {
        let crypto = crypto();
        let frame = crypto.seal(b"payload bytes");
        let body_len = u32::from_be_bytes(frame[..LEN_PREFIX].try_into().unwrap()) as usize;
        assert_eq!(body_len, frame.len() - LEN_PREFIX);
        assert_eq!(crypto.open(&frame[LEN_PREFIX..]).unwrap(), b"payload bytes");
    }

    #[test]
    fn tampered_frames_fail_to_authenticate() {
        let crypto = crypto();
        let mut frame = crypto.seal(b"payload bytes");
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(crypto.open(&frame[LEN_PREFIX..]).is_err());
    }

    #[test]
    fn plaintext_is_not_visible_in_the_frame() {
        let crypto = crypto();
        let frame = crypto.seal(b"very-recognisable-plaintext");
        assert!(!frame
            .windows(b"very-recognisable-plaintext".len())
            .any(|w| w == b"very-recognisable-plaintext"));
    }
}
