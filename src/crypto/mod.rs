//! # Cryptography Utilities
//!
//! Envelope encryption for DTLS fingerprints: an AES-256-GCM key is derived
//! with HKDF from the recipient device's identity key, and the recipient's
//! device id is bound as associated data.

pub mod gcm;
pub mod hkdf;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("key derivation failed: {0}")]
    Key(#[from] hkdf::HkdfError),
    #[error("cipher failed: {0}")]
    Cipher(#[from] gcm::GcmError),
}

/// Encrypt `plaintext` for the device owning `identity_key`.
pub fn seal_envelope(
    identity_key: &[u8],
    device_id: u32,
    plaintext: &[u8],
) -> Result<Vec<u8>, EnvelopeError> {
    let key = hkdf::envelope_key(identity_key, device_id)?;
    Ok(gcm::seal(&key, plaintext, &device_id.to_be_bytes())?)
}

/// Decrypt an envelope addressed to the device owning `identity_key`.
pub fn open_envelope(
    identity_key: &[u8],
    device_id: u32,
    sealed: &[u8],
) -> Result<Vec<u8>, EnvelopeError> {
    let key = hkdf::envelope_key(identity_key, device_id)?;
    Ok(gcm::open(&key, sealed, &device_id.to_be_bytes())?)
}
