// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Symmetric secret vault for stored credentials (OAuth tokens).
//!
//! # Key model
//!
//! The vault is constructed with one **primary** key and zero or more
//! **retired** keys.  Encryption always uses the primary key; decryption
//! tries the key named in the ciphertext header first and then falls back to
//! every key in order, so secrets written under an old key stay readable
//! after rotation.  Each key carries a monotone **generation** number which
//! is embedded in the ciphertext and also persisted next to encrypted rows
//! (provider connections record the generation their tokens were written
//! with).
//!
//! Keys are opaque 32-byte values carried as url-safe base64 in
//! configuration (`FERNET_KEY` / `FERNET_KEYS` for compatibility with the
//! earlier deployment).
//!
//! # Wire format
//!
//! ```text
//! [ version: u8 = 1 ][ key generation: u32 BE ][ nonce: 12 bytes ][ AES-256-GCM ciphertext ]
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Nonce,
};
use base64::Engine;

const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 4 + 12;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Construction input was malformed (wrong length, bad base64).
    #[error("bad vault key: {0}")]
    BadKey(String),
    /// Ciphertext could not be decrypted under any configured key.
    #[error("bad ciphertext: {0}")]
    BadCiphertext(String),
}

struct VaultKey {
    generation: u32,
    cipher: Aes256Gcm,
}

/// Secret vault with overlapping key generations.
pub struct Vault {
    /// Ordered primary-first; decryption fallback walks this order.
    keys: Vec<VaultKey>,
}

impl Vault {
    /// Build a vault from the primary key and the retired key list.
    ///
    /// Generations are assigned so the primary is the highest: with two
    /// retired keys the primary is generation 3 and the retired keys are
    /// generations 2 and 1 (most recently retired first, matching how
    /// operators append to `FERNET_KEYS` on each rotation).
    pub fn new(primary_b64: &str, retired_b64: &[String]) -> Result<Self, VaultError> {
        let top = retired_b64.len() as u32 + 1;
        let mut keys = Vec::with_capacity(retired_b64.len() + 1);
        keys.push(VaultKey {
            generation: top,
            cipher: parse_key(primary_b64)?,
        });
        for (i, k) in retired_b64.iter().enumerate() {
            keys.push(VaultKey {
                generation: top - 1 - i as u32,
                cipher: parse_key(k)?,
            });
        }
        Ok(Self { keys })
    }

    /// Generation of the primary key (persisted alongside encrypted rows).
    pub fn primary_generation(&self) -> u32 {
        self.keys[0].generation
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Encrypt with the primary key.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, VaultError> {
        let key = &self.keys[0];
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ct = key
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::BadKey("encryption failed".into()))?;
        let mut out = Vec::with_capacity(HEADER_LEN + ct.len());
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&key.generation.to_be_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Decrypt, trying the generation named in the header first and then
    /// every key in order.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<String, VaultError> {
        if ciphertext.len() <= HEADER_LEN {
            return Err(VaultError::BadCiphertext("truncated".into()));
        }
        if ciphertext[0] != FORMAT_VERSION {
            return Err(VaultError::BadCiphertext(format!(
                "unknown format version {}",
                ciphertext[0]
            )));
        }
        let generation = u32::from_be_bytes(ciphertext[1..5].try_into().unwrap());
        let nonce = Nonce::from_slice(&ciphertext[5..17]);
        let body = &ciphertext[17..];

        let by_generation = self.keys.iter().find(|k| k.generation == generation);
        let ordered = by_generation
            .into_iter()
            .chain(self.keys.iter().filter(|k| k.generation != generation));
        for key in ordered {
            if let Ok(pt) = key.cipher.decrypt(nonce, body) {
                return String::from_utf8(pt)
                    .map_err(|_| VaultError::BadCiphertext("plaintext is not UTF-8".into()));
            }
        }
        Err(VaultError::BadCiphertext(format!(
            "no key among {} candidates decrypts this value",
            self.keys.len()
        )))
    }

    /// Decrypt under any key, re-encrypt under the primary.
    pub fn rotate(&self, old_ciphertext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let plaintext = self.decrypt(old_ciphertext)?;
        self.encrypt(&plaintext)
    }
}

/// Generate a fresh random key in the configuration encoding.
pub fn generate_key_b64() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn parse_key(b64: &str) -> Result<Aes256Gcm, VaultError> {
    // Accept both padded and unpadded url-safe base64.
    let trimmed = b64.trim().trim_end_matches('=');
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|e| VaultError::BadKey(format!("invalid base64: {e}")))?;
    if bytes.len() != 32 {
        return Err(VaultError::BadKey(format!(
            "expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(Aes256Gcm::new_from_slice(&bytes).expect("32-byte key"))
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let v = Vault::new(&generate_key_b64(), &[]).unwrap();
        let ct = v.encrypt("ntn_secret_token").unwrap();
        assert_eq!(v.decrypt(&ct).unwrap(), "ntn_secret_token");
    }

    #[test]
    fn ciphertexts_are_nondeterministic() {
        let v = Vault::new(&generate_key_b64(), &[]).unwrap();
        assert_ne!(v.encrypt("x").unwrap(), v.encrypt("x").unwrap());
    }

    #[test]
    fn bad_key_material_is_rejected() {
        assert!(matches!(
            Vault::new("not base64 !!!", &[]),
            Err(VaultError::BadKey(_))
        ));
        // Valid base64 but wrong length.
        let short = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode([0u8; 16]);
        assert!(matches!(Vault::new(&short, &[]), Err(VaultError::BadKey(_))));
    }

    #[test]
    fn retired_key_still_decrypts_after_rotation() {
        let old_key = generate_key_b64();
        let old_vault = Vault::new(&old_key, &[]).unwrap();
        let ct = old_vault.encrypt("legacy").unwrap();

        let new_vault = Vault::new(&generate_key_b64(), &[old_key]).unwrap();
        assert_eq!(new_vault.decrypt(&ct).unwrap(), "legacy");
    }

    #[test]
    fn rotate_reencrypts_under_primary_generation() {
        let old_key = generate_key_b64();
        let old_vault = Vault::new(&old_key, &[]).unwrap();
        let old_ct = old_vault.encrypt("secret").unwrap();

        let new_vault = Vault::new(&generate_key_b64(), &[old_key]).unwrap();
        let new_ct = new_vault.rotate(&old_ct).unwrap();
        assert_eq!(new_vault.decrypt(&new_ct).unwrap(), "secret");
        // Header carries the new primary generation.
        let gen = u32::from_be_bytes(new_ct[1..5].try_into().unwrap());
        assert_eq!(gen, new_vault.primary_generation());
        assert_eq!(gen, 2);
    }

    #[test]
    fn wrong_key_fails_with_bad_ciphertext() {
        let a = Vault::new(&generate_key_b64(), &[]).unwrap();
        let b = Vault::new(&generate_key_b64(), &[]).unwrap();
        let ct = a.encrypt("x").unwrap();
        assert!(matches!(b.decrypt(&ct), Err(VaultError::BadCiphertext(_))));
    }

    #[test]
    fn truncated_and_garbage_inputs_fail() {
        let v = Vault::new(&generate_key_b64(), &[]).unwrap();
        assert!(v.decrypt(&[]).is_err());
        assert!(v.decrypt(&[1, 2, 3]).is_err());
        assert!(v.decrypt(&[9; 64]).is_err());
    }

    #[test]
    fn generations_count_up_with_rotation_history() {
        let v = Vault::new(
            &generate_key_b64(),
            &[generate_key_b64(), generate_key_b64()],
        )
        .unwrap();
        assert_eq!(v.primary_generation(), 3);
        assert_eq!(v.key_count(), 3);
    }
}
