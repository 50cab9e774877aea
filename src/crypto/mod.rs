//! Cryptography: a single AEAD primitive protects every
//! ciphertext byte the engine ever writes above the [`Backend`]
//! abstraction — blobs, pack headers, index files, snapshot files, and the
//! key file's wrapped master key.
//!
//! AES-256-CTR provides the keystream and Poly1305-AES authenticates it,
//! the same pairing restic uses (`aes256ctr_poly1305aes`, paired with
//! `scrypt` for key derivation and `sha2` for content addressing).

pub mod kdf;

use aes256ctr_poly1305aes::aead::generic_array::GenericArray;
use aes256ctr_poly1305aes::aead::{Aead as _, KeyInit as _};
use aes256ctr_poly1305aes::Aes256CtrPoly1305Aes;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, Result};

pub const MASTER_KEY_LEN: usize = 64;
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Bytes of nonce+tag overhead [`CryptConfig::encrypt`] adds on top of the
/// plaintext it is given; callers that need a plaintext-length estimate
/// from a ciphertext length without decrypting (e.g. pre-sizing a restore
/// target) subtract this.
pub const CIPHERTEXT_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// The repository master key: an encryption key plus a MAC key, 64 bytes
/// total, the same layout restic's `crypto.Key` uses and the unit this
/// crate's key file wraps.
#[derive(Clone)]
pub struct CryptoKey([u8; MASTER_KEY_LEN]);

impl CryptoKey {
    pub fn from_bytes(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        CryptoKey(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; MASTER_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        CryptoKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.0
    }
}

/// Every stored ciphertext passes through this single primitive. `n`
/// plaintext bytes become `n + 16 (nonce) + 16 (tag)` ciphertext bytes.
#[derive(Clone)]
pub struct CryptConfig {
    cipher: Aes256CtrPoly1305Aes,
}

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("authentication failed: ciphertext has been tampered with or the key is wrong")]
    Unauthentic,
}

impl CryptConfig {
    pub fn new(key: &CryptoKey) -> Self {
        let cipher = Aes256CtrPoly1305Aes::new(GenericArray::from_slice(&key.0));
        CryptConfig { cipher }
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = GenericArray::from_slice(&nonce_bytes);
        // the `aead` convention appends the authentication tag to the
        // returned ciphertext, matching every other RustCrypto AEAD crate
        let sealed = self
            .cipher
            .encrypt(nonce, plaintext)
            .expect("AEAD encryption of an in-memory buffer cannot fail");

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        out
    }

    /// Decrypt a `nonce || ciphertext || tag` blob produced by [`encrypt`].
    /// Returns [`CryptoError::Unauthentic`] on MAC mismatch; no partial or
    /// unauthenticated plaintext is ever returned.
    pub fn decrypt(&self, sealed: &[u8]) -> std::result::Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Unauthentic);
        }
        let (nonce_bytes, rest) = sealed.split_at(NONCE_LEN);
        let nonce = GenericArray::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, rest)
            .map_err(|_| CryptoError::Unauthentic)
    }

    /// Convenience wrapper returning the taxonomy-level error.
    pub fn decrypt_checked(&self, sealed: &[u8], what: &str) -> Result<Vec<u8>> {
        self.decrypt(sealed)
            .map_err(|_| RepositoryError::Unauthentic(what.to_string()))
    }
}

/// The key file as written to the backend's `keys/` folder.
/// Unencrypted outside of the `wrapped_key` field itself.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub kdf: String,
    #[serde(rename = "N")]
    pub n: u64,
    pub r: u32,
    pub p: u32,
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    pub created: String,
    pub username: String,
    pub hostname: String,
    /// AEAD(master_key) under the key derived from the user's password.
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl KeyFile {
    pub fn create(
        password: &[u8],
        master_key: &CryptoKey,
        username: &str,
        hostname: &str,
    ) -> Result<Self> {
        let kdf_params = kdf::KdfParams::calibrate()?;
        let user_key_bytes = kdf_params.derive(password)?;
        let user_key = CryptoKey::from_bytes(user_key_bytes);
        let wrapper = CryptConfig::new(&user_key);
        let data = wrapper.encrypt(master_key.as_bytes());

        Ok(KeyFile {
            kdf: "scrypt".to_string(),
            n: kdf_params.n,
            r: kdf_params.r,
            p: kdf_params.p,
            salt: kdf_params.salt,
            created: chrono::Utc::now().to_rfc3339(),
            username: username.to_string(),
            hostname: hostname.to_string(),
            data,
        })
    }

    /// Try to unwrap the master key with `password`. Returns
    /// `RepositoryError::Fatal` (wrong password) rather than `Unauthentic`
    /// so the repository facade's key-file search loop can try
    /// the next key file instead of treating this as repository corruption.
    pub fn unlock(&self, password: &[u8]) -> Result<CryptoKey> {
        if self.kdf != "scrypt" {
            return Err(RepositoryError::Fatal(format!(
                "unsupported kdf '{}'",
                self.kdf
            )));
        }
        let kdf_params = kdf::KdfParams {
            n: self.n,
            r: self.r,
            p: self.p,
            salt: self.salt.clone(),
        };
        let user_key_bytes = kdf_params.derive(password)?;
        let user_key = CryptoKey::from_bytes(user_key_bytes);
        let wrapper = CryptConfig::new(&user_key);
        let master_bytes = wrapper
            .decrypt(&self.data)
            .map_err(|_| RepositoryError::Fatal("wrong password".to_string()))?;
        if master_bytes.len() != MASTER_KEY_LEN {
            return Err(RepositoryError::Corrupt(
                "key file has wrong master key length".to_string(),
            ));
        }
        let mut out = [0u8; MASTER_KEY_LEN];
        out.copy_from_slice(&master_bytes);
        Ok(CryptoKey::from_bytes(out))
    }
}

/// Hex (de)serialization helper shared by [`KeyFile`] and [`kdf::KdfParams`].
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push_str(&format!("{:02x}", b));
        }
        s.serialize_str(&out)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        if s.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd-length hex string"));
        }
        let mut out = Vec::with_capacity(s.len() / 2);
        for i in (0..s.len()).step_by(2) {
            let byte = u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| serde::de::Error::custom("invalid hex digit"))?;
            out.push(byte);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = CryptoKey::random();
        let cfg = CryptConfig::new(&key);
        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let sealed = cfg.encrypt(plaintext);
        assert_eq!(sealed.len(), plaintext.len() + NONCE_LEN + TAG_LEN);
        let opened = cfg.decrypt(&sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn tampering_is_detected() {
        let key = CryptoKey::random();
        let cfg = CryptConfig::new(&key);
        let mut sealed = cfg.encrypt(b"authenticate me");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(cfg.decrypt(&sealed), Err(CryptoError::Unauthentic)));
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let cfg_a = CryptConfig::new(&CryptoKey::random());
        let cfg_b = CryptConfig::new(&CryptoKey::random());
        let sealed = cfg_a.encrypt(b"secret");
        assert!(cfg_b.decrypt(&sealed).is_err());
    }

    #[test]
    fn key_file_roundtrip_with_correct_password() {
        let master = CryptoKey::random();
        let key_file = KeyFile::create(b"correct horse", &master, "alice", "workstation").unwrap();
        let unlocked = key_file.unlock(b"correct horse").unwrap();
        assert_eq!(unlocked.as_bytes(), master.as_bytes());
    }

    #[test]
    fn key_file_rejects_wrong_password() {
        let master = CryptoKey::random();
        let key_file = KeyFile::create(b"correct horse", &master, "alice", "workstation").unwrap();
        assert!(key_file.unlock(b"wrong password").is_err());
    }
}
