// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The filesystem credential store.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use crate::master::{DerivedKey, MasterSecret, CREDENTIALS_CONTEXT, SPOOL_CONTEXT};
use crate::SecretsError;

/// The sentinel a control-surface caller sends to mean "keep the secret that
/// is already stored".
pub const SECRET_SENTINEL: &str = "***";

const SALT_FILE: &str = "salt";
const STORE_FILE: &str = "credentials.enc";
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// A scoped, non-cloneable handle to one decrypted secret.
///
/// The plaintext lives only as long as the handle; dropping it zeroises the
/// buffer before the allocation is released.
pub struct SecretHandle {
    value: Vec<u8>,
}

impl SecretHandle {
    fn new(value: Vec<u8>) -> SecretHandle {
        SecretHandle { value }
    }

    /// Exposes the plaintext. The borrow cannot outlive the handle, which is
    /// what keeps the plaintext lifetime scoped to the owning component.
    pub fn expose(&self) -> &str {
        std::str::from_utf8(&self.value).expect("store only accepts UTF-8 secrets")
    }

    /// Zeroises the buffer in place. Drop does this too; the explicit form
    /// exists so release points can be audited (and tested).
    pub fn wipe(&mut self) {
        self.value.zeroize();
    }
}

impl Drop for SecretHandle {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

impl std::fmt::Debug for SecretHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("SecretHandle(<redacted>)")
    }
}

/// On-disk image: names in the clear (so a locked store can still list),
/// values encrypted independently with the name as associated data.
type StoreImage = BTreeMap<String, Vec<u8>>;

enum Keys {
    /// Master secret loaded; values can be decrypted.
    Unlocked { credentials: DerivedKey, spool: DerivedKey },
    /// No master secret. `list` works, everything else returns `Locked`.
    Locked,
}

/// The filesystem credential store.
///
/// Persists `state/credentials.enc` (bincode map of name to
/// nonce-prefixed AES-256-GCM ciphertext) and `state/salt`. Writes are
/// atomic: temp file, fsync, rename.
pub struct SecretStore {
    state_dir: PathBuf,
    keys: Keys,
    entries: Mutex<StoreImage>,
}

impl SecretStore {
    /// Opens (creating if necessary) the store under `state_dir` with the
    /// master secret loaded.
    pub fn open(state_dir: &Path, master: &MasterSecret) -> Result<SecretStore, SecretsError> {
        fs::create_dir_all(state_dir)?;
        let salt = read_or_create_salt(state_dir)?;
        let keys = Keys::Unlocked {
            credentials: master.derive_key(&salt, CREDENTIALS_CONTEXT),
            spool: master.derive_key(&salt, SPOOL_CONTEXT),
        };
        let entries = read_image(&state_dir.join(STORE_FILE))?;
        info!(secrets = entries.len(), "opened credential store");
        Ok(SecretStore {
            state_dir: state_dir.to_owned(),
            keys,
            entries: Mutex::new(entries),
        })
    }

    /// Opens the store without a master secret. Only `list` is usable; all
    /// value operations return [`SecretsError::Locked`].
    pub fn open_locked(state_dir: &Path) -> Result<SecretStore, SecretsError> {
        fs::create_dir_all(state_dir)?;
        let entries = read_image(&state_dir.join(STORE_FILE))?;
        Ok(SecretStore {
            state_dir: state_dir.to_owned(),
            keys: Keys::Locked,
            entries: Mutex::new(entries),
        })
    }

    /// Whether values can be decrypted.
    pub fn is_unlocked(&self) -> bool {
        matches!(self.keys, Keys::Unlocked { .. })
    }

    /// The key for spool/DLQ frame encryption, derived from the same master
    /// secret. Fails when the store is locked.
    pub fn spool_key(&self) -> Result<&DerivedKey, SecretsError> {
        match &self.keys {
            Keys::Unlocked { spool, .. } => Ok(spool),
            Keys::Locked => Err(SecretsError::Locked),
        }
    }

    /// Stores `plaintext` under `name`, replacing any existing value. The
    /// sentinel value `"***"` means "retain the stored secret": it succeeds
    /// without touching the entry if one exists and fails with `Unknown`
    /// otherwise.
    pub fn put(&self, name: &str, plaintext: &str) -> Result<(), SecretsError> {
        if plaintext == SECRET_SENTINEL {
            let entries = self.entries.lock().expect("store lock poisoned");
            return if entries.contains_key(name) {
                Ok(())
            } else {
                Err(SecretsError::Unknown(name.to_owned()))
            };
        }
        let key = self.credentials_key()?;
        let sealed = seal(key, name, plaintext.as_bytes())?;
        let mut entries = self.entries.lock().expect("store lock poisoned");
        entries.insert(name.to_owned(), sealed);
        self.persist(&entries)?;
        debug!(name, "stored credential");
        Ok(())
    }

    /// Decrypts the secret stored under `name` into a scoped handle.
    pub fn get(&self, name: &str) -> Result<SecretHandle, SecretsError> {
        let key = self.credentials_key()?;
        let entries = self.entries.lock().expect("store lock poisoned");
        let sealed = entries
            .get(name)
            .ok_or_else(|| SecretsError::Unknown(name.to_owned()))?;
        let plaintext = unseal(key, name, sealed)?;
        Ok(SecretHandle::new(plaintext))
    }

    /// Lists stored names. Works even when locked.
    pub fn list(&self) -> Vec<String> {
        let entries = self.entries.lock().expect("store lock poisoned");
        entries.keys().cloned().collect()
    }

    /// Whether a secret is stored under `name`. Works even when locked.
    pub fn contains(&self, name: &str) -> bool {
        let entries = self.entries.lock().expect("store lock poisoned");
        entries.contains_key(name)
    }

    /// Removes the secret stored under `name`.
    pub fn delete(&self, name: &str) -> Result<(), SecretsError> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        if entries.remove(name).is_none() {
            return Err(SecretsError::Unknown(name.to_owned()));
        }
        self.persist(&entries)?;
        debug!(name, "deleted credential");
        Ok(())
    }

    fn credentials_key(&self) -> Result<&DerivedKey, SecretsError> {
        match &self.keys {
            Keys::Unlocked { credentials, .. } => Ok(credentials),
            Keys::Locked => Err(SecretsError::Locked),
        }
    }

    fn persist(&self, entries: &StoreImage) -> Result<(), SecretsError> {
        let image = bincode::serialize(entries).expect("store image serialises");
        let path = self.state_dir.join(STORE_FILE);
        let tmp = self.state_dir.join(format!("{}.tmp", STORE_FILE));
        let mut file = File::create(&tmp)?;
        file.write_all(&image)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn read_or_create_salt(state_dir: &Path) -> Result<Vec<u8>, SecretsError> {
    let path = state_dir.join(SALT_FILE);
    match fs::read(&path) {
        Ok(salt) if salt.len() == SALT_LEN => Ok(salt),
        Ok(_) => Err(SecretsError::Corrupt),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut salt = vec![0u8; SALT_LEN];
            rand::thread_rng().fill_bytes(&mut salt);
            let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
            file.write_all(&salt)?;
            file.sync_all()?;
            info!("created credential store salt");
            Ok(salt)
        }
        Err(e) => Err(e.into()),
    }
}

fn read_image(path: &Path) -> Result<StoreImage, SecretsError> {
    match fs::read(path) {
        Ok(bytes) => bincode::deserialize(&bytes).map_err(|_| SecretsError::Corrupt),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreImage::new()),
        Err(e) => Err(e.into()),
    }
}

fn seal(key: &DerivedKey, name: &str, plaintext: &[u8]) -> Result<Vec<u8>, SecretsError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: name.as_bytes(),
            },
        )
        .map_err(|_| SecretsError::Corrupt)?;
    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn unseal(key: &DerivedKey, name: &str, sealed: &[u8]) -> Result<Vec<u8>, SecretsError> {
    if sealed.len() < NONCE_LEN {
        return Err(SecretsError::Corrupt);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: name.as_bytes(),
            },
        )
        .map_err(|_| SecretsError::Corrupt)?;
    let plaintext = Zeroizing::new(plaintext);
    // Secrets cross the control surface as strings; enforce that here so
    // `expose` cannot fail later.
    if std::str::from_utf8(&plaintext).is_err() {
        return Err(SecretsError::Corrupt);
    }
    Ok(plaintext.to_vec())
}
