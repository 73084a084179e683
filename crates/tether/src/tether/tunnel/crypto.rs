//! Sealing of the provisioning request.
//!
//! Wire form: `nonce (12B) ++ AES-256-GCM ciphertext+tag`, keyed by
//! `SHA-256(pre-shared key)`.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::tether::tunnel::message::{self, DataPortRequest, MessageError};

pub const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("invalid key")]
    Key,
    #[error("ciphertext too short")]
    Truncated,
    #[error("encrypt failed")]
    Seal,
    #[error("decrypt failed")]
    Open,
    #[error("request: {0}")]
    Payload(#[from] MessageError),
}

#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    pub fn new(key: &str) -> Result<Self, CipherError> {
        let digest = Sha256::digest(key.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&digest).map_err(|_| CipherError::Key)?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ct = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CipherError::Seal)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() <= NONCE_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce, ct) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|_| CipherError::Open)
    }

    pub fn seal_request(&self, req: &DataPortRequest) -> Result<Vec<u8>, CipherError> {
        let plain = message::encode_payload(req)?;
        self.encrypt(&plain)
    }

    pub fn open_request(&self, sealed: &[u8]) -> Result<DataPortRequest, CipherError> {
        let plain = self.decrypt(sealed)?;
        Ok(message::decode_payload(&plain)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> DataPortRequest {
        DataPortRequest {
            secret: "s3cret".into(),
            name: "web".into(),
            host: None,
            port: 9000,
        }
    }

    #[test]
    fn request_opens_with_same_key() {
        let c = SecretCipher::new("psk").unwrap();
        let sealed = c.seal_request(&req()).unwrap();
        assert_eq!(c.open_request(&sealed).unwrap(), req());
    }

    #[test]
    fn nonce_differs_per_seal() {
        let c = SecretCipher::new("psk").unwrap();
        let a = c.encrypt(b"same").unwrap();
        let b = c.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_or_tamper_fails() {
        let c = SecretCipher::new("psk").unwrap();
        let sealed = c.seal_request(&req()).unwrap();

        let other = SecretCipher::new("other").unwrap();
        assert!(matches!(other.open_request(&sealed), Err(CipherError::Open)));

        let mut bad = sealed.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        assert!(matches!(c.open_request(&bad), Err(CipherError::Open)));

        assert!(matches!(c.decrypt(&sealed[..NONCE_LEN]), Err(CipherError::Truncated)));
    }
}
