use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// A mnemonic sealed with a password-derived key (Argon2id + AES-256-GCM).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMnemonic {
    salt: String,
    nonce: String,
    ciphertext: String,
}

fn derive_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let mut key_bytes = Zeroizing::new([0u8; 32]);
    argon2::Argon2::default()
        .hash_password_into(password.as_bytes(), salt, key_bytes.as_mut())
        .map_err(|e| Error::Crypto(e.to_string()))?;
    Ok(key_bytes)
}

impl EncryptedMnemonic {
    pub fn encrypt(mnemonic: &str, password: &str) -> Result<Self> {
        let salt: [u8; 16] = rand::random();
        let key_bytes = derive_key(password, &salt)?;

        let cipher = Aes256Gcm::new_from_slice(key_bytes.as_ref())
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, mnemonic.as_bytes())
            .map_err(|e| Error::Crypto(e.to_string()))?;

        Ok(Self {
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    /// Fails with [`Error::InvalidPassword`] when authentication fails.
    pub fn decrypt(&self, password: &str) -> Result<Zeroizing<String>> {
        let salt = BASE64
            .decode(&self.salt)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let key_bytes = derive_key(password, &salt)?;

        let cipher = Aes256Gcm::new_from_slice(key_bytes.as_ref())
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let nonce_bytes = BASE64
            .decode(&self.nonce)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(Error::Crypto(format!(
                "nonce must be 12 bytes, got {}",
                nonce_bytes.len()
            )));
        }
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .map_err(|e| Error::Crypto(e.to_string()))?;

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(nonce, ciphertext.as_ref())
                .map_err(|_| Error::InvalidPassword)?,
        );

        String::from_utf8(plaintext.to_vec())
            .map(Zeroizing::new)
            .map_err(|e| Error::Crypto(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn decrypts_with_right_password() {
        let sealed = EncryptedMnemonic::encrypt(MNEMONIC, "hunter2").unwrap();
        assert_eq!(sealed.decrypt("hunter2").unwrap().as_str(), MNEMONIC);
    }

    #[test]
    fn wrong_password_is_invalid_password() {
        let sealed = EncryptedMnemonic::encrypt(MNEMONIC, "hunter2").unwrap();
        assert!(matches!(sealed.decrypt("hunter3"), Err(Error::InvalidPassword)));
    }

    #[test]
    fn salt_and_nonce_are_fresh() {
        let a = EncryptedMnemonic::encrypt(MNEMONIC, "pw").unwrap();
        let b = EncryptedMnemonic::encrypt(MNEMONIC, "pw").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn serializes_as_base64_fields() {
        let sealed = EncryptedMnemonic::encrypt(MNEMONIC, "pw").unwrap();
        let json: serde_json::Value = serde_json::to_value(&sealed).unwrap();
        for field in ["salt", "nonce", "ciphertext"] {
            let s = json[field].as_str().unwrap();
            assert!(BASE64.decode(s).is_ok());
        }
    }
}
