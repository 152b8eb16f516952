//! AES-256-GCM encryption of provider credentials at rest.
//!
//! Ciphertext is hex: a 12-byte random nonce followed by the sealed bytes.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Credential payload is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Nonce size for AES-256-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;

/// Encrypts and decrypts credential objects with one symmetric key.
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Builds a cipher from a 64-character hex key (32 bytes).
    pub fn from_hex_key(key_hex: &str) -> Result<Self, CryptoError> {
        let key_bytes = hex_decode(key_hex.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid hex key: {}", e)))?;

        if key_bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Key must be 32 bytes (64 hex chars), got {} bytes",
                key_bytes.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("Failed to create cipher: {}", e)))?;
        Ok(Self { cipher })
    }

    pub fn from_secret(key: &SecretString) -> Result<Self, CryptoError> {
        Self::from_hex_key(key.expose_secret())
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::fill(&mut nonce_bytes)
            .map_err(|e| CryptoError::Encryption(format!("Failed to generate nonce: {}", e)))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend(sealed);
        Ok(hex_encode(&combined))
    }

    pub fn decrypt(&self, ciphertext_hex: &str) -> Result<String, CryptoError> {
        let combined = hex_decode(ciphertext_hex)
            .map_err(|e| CryptoError::Decryption(format!("Invalid hex: {}", e)))?;
        if combined.len() < NONCE_SIZE {
            return Err(CryptoError::Decryption("Ciphertext too short".to_string()));
        }

        let (nonce_bytes, sealed) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::Decryption(format!("Invalid UTF-8: {}", e)))
    }

    /// Serializes `value` to JSON and encrypts it.
    pub fn encrypt_object<T: Serialize>(&self, value: &T) -> Result<String, CryptoError> {
        self.encrypt(&serde_json::to_string(value)?)
    }

    pub fn decrypt_object<T: DeserializeOwned>(&self, ciphertext_hex: &str) -> Result<T, CryptoError> {
        Ok(serde_json::from_str(&self.decrypt(ciphertext_hex)?)?)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut result = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        result.push(HEX_CHARS[(byte >> 4) as usize] as char);
        result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    result
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err("Hex string must have even length".to_string());
    }
    if !hex.is_ascii() {
        return Err("Hex string must be ASCII".to_string());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| format!("Invalid hex at position {}: {}", i, e))
        })
        .collect()
}
