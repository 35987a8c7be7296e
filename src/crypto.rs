use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{ApiError, ApiResult};

const NONCE_LEN: usize = 12;

/// AES-256-GCM wrapper around the process `ENCRYPTION_SECRET`. Everything
/// "encrypted" in the settings and subscription tables goes through this:
/// base64(nonce || ciphertext).
#[derive(Clone)]
pub struct SecretBox {
    key: [u8; 32],
}

impl SecretBox {
    pub fn new(secret: &str) -> Self {
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(secret.as_bytes()));
        SecretBox { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> ApiResult<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| ApiError::Internal("encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(B64.encode(blob))
    }

    pub fn decrypt(&self, encoded: &str) -> ApiResult<String> {
        let blob = B64
            .decode(encoded)
            .map_err(|_| ApiError::Internal("corrupt encrypted value".to_string()))?;
        if blob.len() <= NONCE_LEN {
            return Err(ApiError::Internal("corrupt encrypted value".to_string()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ApiError::Internal("decryption failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| ApiError::Internal("decrypted value is not UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let sb = SecretBox::new("a perfectly adequate secret");
        let ct = sb.encrypt("BNcRd...p256dh-key-material").unwrap();
        assert_ne!(ct, "BNcRd...p256dh-key-material");
        assert_eq!(sb.decrypt(&ct).unwrap(), "BNcRd...p256dh-key-material");
    }

    #[test]
    fn fresh_nonce_per_encryption() {
        let sb = SecretBox::new("secret");
        assert_ne!(sb.encrypt("same").unwrap(), sb.encrypt("same").unwrap());
    }

    #[test]
    fn wrong_key_fails() {
        let a = SecretBox::new("key-a");
        let b = SecretBox::new("key-b");
        let ct = a.encrypt("payload").unwrap();
        assert!(b.decrypt(&ct).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let sb = SecretBox::new("secret");
        assert!(sb.decrypt("not base64 at all!!!").is_err());
        assert!(sb.decrypt("AAAA").is_err());
    }
}
