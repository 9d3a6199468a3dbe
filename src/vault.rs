//! Credential Vault: envelope encryption of SSH passwords and private keys.
//!
//! One process-wide master key; each secret gets a fresh 16-byte salt and a
//! 256-bit data key derived with PBKDF2-HMAC-SHA256 (100k iterations), then
//! AES-256-GCM seals the plaintext under a random 12-byte nonce. The
//! algorithm tag is matched exactly on decrypt — there is no fallback to a
//! weaker scheme.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::errors::CredentialError;

/// The single supported algorithm tag.
pub const ALGORITHM_TAG: &str = "AES-256-GCM/PBKDF2-SHA256/100000";

const KDF_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// A ciphertext bundle at rest. Binary fields are base64 in serialized form
/// so the bundle can live in a TEXT column or a JSON body unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub algorithm: String,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    pub kdf_iterations: u32,
}

mod b64 {
    use super::{Engine, BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        BASE64.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Plaintext credential material. Holds the only copy outside the cipher
/// path; the buffer is overwritten on drop.
pub struct Plaintext(Vec<u8>);

impl Plaintext {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> Result<&str, CredentialError> {
        std::str::from_utf8(&self.0).map_err(|_| CredentialError::BadCiphertext)
    }
}

impl Drop for Plaintext {
    fn drop(&mut self) {
        for b in self.0.iter_mut() {
            // Volatile write so the wipe is not optimized away.
            unsafe { std::ptr::write_volatile(b, 0) };
        }
    }
}

// Plaintext must never leak through debug formatting.
impl std::fmt::Debug for Plaintext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Plaintext([{} bytes])", self.0.len())
    }
}

/// The process-wide vault. Construct once at startup from configuration.
pub struct CredentialVault {
    master_key: Option<Vec<u8>>,
}

impl CredentialVault {
    pub fn new(master_key: Option<String>) -> Self {
        Self {
            master_key: master_key.map(String::into_bytes),
        }
    }

    /// Encrypt `plaintext` into a self-describing bundle.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedSecret, CredentialError> {
        let master = self
            .master_key
            .as_deref()
            .ok_or(CredentialError::MasterKeyMissing)?;

        let mut salt = vec![0u8; SALT_LEN];
        let mut nonce = vec![0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut key = derive_key(master, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CredentialError::BadCiphertext)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CredentialError::BadCiphertext)?;
        wipe(&mut key);

        Ok(EncryptedSecret {
            algorithm: ALGORITHM_TAG.to_string(),
            salt,
            nonce,
            ciphertext,
            kdf_iterations: KDF_ITERATIONS,
        })
    }

    /// Decrypt a bundle. The algorithm tag must match exactly.
    pub fn decrypt(&self, bundle: &EncryptedSecret) -> Result<Plaintext, CredentialError> {
        let master = self
            .master_key
            .as_deref()
            .ok_or(CredentialError::MasterKeyMissing)?;

        if bundle.algorithm != ALGORITHM_TAG {
            return Err(CredentialError::UnknownAlgorithm {
                tag: bundle.algorithm.clone(),
            });
        }
        if bundle.nonce.len() != NONCE_LEN || bundle.salt.len() != SALT_LEN {
            return Err(CredentialError::BadCiphertext);
        }

        let mut key = derive_key_iter(master, &bundle.salt, bundle.kdf_iterations);
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CredentialError::BadCiphertext)?;
        let result = cipher
            .decrypt(Nonce::from_slice(&bundle.nonce), bundle.ciphertext.as_ref())
            .map_err(|_| CredentialError::BadCiphertext);
        wipe(&mut key);

        result.map(Plaintext::new)
    }

    /// Round-trip a probe value so a missing or wrong master key fails at
    /// startup instead of on the first session open.
    pub fn verify(&self) -> Result<(), CredentialError> {
        let probe = b"cwatcher-vault-probe";
        let bundle = self.encrypt(probe)?;
        let back = self.decrypt(&bundle)?;
        if back.as_bytes() == probe {
            Ok(())
        } else {
            Err(CredentialError::BadCiphertext)
        }
    }
}

fn derive_key(master: &[u8], salt: &[u8]) -> [u8; 32] {
    derive_key_iter(master, salt, KDF_ITERATIONS)
}

fn derive_key_iter(master: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(master, salt, iterations, &mut key);
    key
}

fn wipe(key: &mut [u8; 32]) {
    for b in key.iter_mut() {
        unsafe { std::ptr::write_volatile(b, 0) };
    }
}
