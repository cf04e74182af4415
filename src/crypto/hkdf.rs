use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

const ENVELOPE_INFO: &[u8] = b"Jingle DTLS Fingerprint Envelope";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HkdfError {
    #[error("Invalid output length for HKDF expand")]
    InvalidLength,
}

/// Expands a key using HKDF-SHA256.
pub fn sha256(
    key: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    length: usize,
) -> Result<Vec<u8>, HkdfError> {
    let hk = Hkdf::<Sha256>::new(salt, key);
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm)
        .map_err(|_| HkdfError::InvalidLength)?;
    Ok(okm)
}

/// AES-256 key for envelopes addressed to `device_id`, derived from that
/// device's identity key.
pub fn envelope_key(identity_key: &[u8], device_id: u32) -> Result<Vec<u8>, HkdfError> {
    sha256(identity_key, Some(&device_id.to_be_bytes()), ENVELOPE_INFO, 32)
}
