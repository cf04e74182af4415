use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use rand::Rng;
use thiserror::Error;

/// Length of the nonce prepended to every sealed payload.
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GcmError {
    #[error("Invalid key or nonce size for AES-GCM")]
    InvalidSize,
    #[error("AES-GCM cipher operation failed")]
    CipherError,
}

type Result<T> = std::result::Result<T, GcmError>;

fn prepare(secret_key: &[u8]) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(secret_key).map_err(|_| GcmError::InvalidSize)
}

/// Encrypts `plaintext` under a fresh random nonce. The output is the nonce
/// followed by the ciphertext and tag.
pub fn seal(secret_key: &[u8], plaintext: &[u8], additional_data: &[u8]) -> Result<Vec<u8>> {
    let cipher = prepare(secret_key)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill(&mut nonce);
    let payload = Payload {
        msg: plaintext,
        aad: additional_data,
    };
    let ciphertext = cipher
        .encrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
        .map_err(|_| GcmError::CipherError)?;
    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Reverses [`seal`].
pub fn open(secret_key: &[u8], sealed: &[u8], additional_data: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(GcmError::InvalidSize);
    }
    let cipher = prepare(secret_key)?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let payload = Payload {
        msg: ciphertext,
        aad: additional_data,
    };
    cipher
        .decrypt(aes_gcm::Nonce::from_slice(nonce), payload)
        .map_err(|_| GcmError::CipherError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_wrong_aad() {
        let key = [7u8; 32];
        let sealed = seal(&key, b"fingerprint", b"device-1").unwrap();
        assert_eq!(open(&key, &sealed, b"device-1").unwrap(), b"fingerprint");
        assert_eq!(
            open(&key, &sealed, b"device-2"),
            Err(GcmError::CipherError)
        );
    }

    #[test]
    fn test_nonces_differ() {
        let key = [1u8; 32];
        let a = seal(&key, b"same", b"").unwrap();
        let b = seal(&key, b"same", b"").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(open(&[0u8; 32], &[0u8; 4], b""), Err(GcmError::InvalidSize));
    }
}
