//! Verified DTLS fingerprints.
//!
//! When the peer announced a device id, the fingerprints of session-initiate
//! and session-accept travel inside an envelope encrypted for that device.
//! Unwrapping an envelope yields the sender's [`Verification`], which is
//! bound to the session through its [`VerificationBinder`].

use super::error::CallError;
use async_trait::async_trait;
use jinglecore::address::Address;
use jinglecore::content::{ContentMap, ContentMapError};
use jinglecore::protocol::{EncryptedContentMap, RtpContents};
use jinglecore::verification::{Verification, VerificationBinder};
use log::debug;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("no session with device {0}")]
    NoSession(u32),
    #[error("failed to encrypt fingerprints: {0}")]
    Encrypt(String),
    #[error("failed to decrypt fingerprints: {0}")]
    Decrypt(String),
    #[error("untrusted identity for device {0}")]
    UntrustedIdentity(u32),
}

#[async_trait]
pub trait CryptoService: Send + Sync {
    /// Move the fingerprints of `contents` into an envelope for `device_id`.
    async fn encrypt(
        &self,
        contents: &ContentMap,
        peer: &Address,
        device_id: u32,
    ) -> Result<(Verification, EncryptedContentMap), CryptoError>;

    /// Restore the fingerprints of an envelope sent by `peer`.
    async fn decrypt(
        &self,
        contents: &EncryptedContentMap,
        peer: &Address,
    ) -> Result<(Verification, ContentMap), CryptoError>;
}

/// Wrap outgoing contents. Plain unless the binder knows a peer device.
pub async fn seal_contents(
    crypto: &dyn CryptoService,
    binder: &mut VerificationBinder,
    contents: &ContentMap,
    peer: &Address,
) -> Result<RtpContents, CallError> {
    let Some(device_id) = binder.device_id() else {
        return Ok(RtpContents::Plain(contents.clone()));
    };
    let (verification, encrypted) = crypto.encrypt(contents, peer, device_id).await?;
    binder.bind(&verification)?;
    debug!(
        "Encrypted fingerprints for {} device {} ({})",
        peer, verification.device_id, verification.identity_key
    );
    Ok(RtpContents::Encrypted(encrypted))
}

/// Unwrap incoming contents, binding the sender on the way.
///
/// With `expect_envelope` set, plain contents are refused once the binder
/// knows a peer device.
pub async fn open_contents(
    crypto: &dyn CryptoService,
    binder: &mut VerificationBinder,
    contents: &RtpContents,
    peer: &Address,
    expect_envelope: bool,
) -> Result<ContentMap, CallError> {
    match contents {
        RtpContents::Encrypted(encrypted) => {
            let (verification, map) = crypto.decrypt(encrypted, peer).await?;
            binder.bind(&verification)?;
            debug!(
                "Verified fingerprints from {} device {}",
                peer, verification.device_id
            );
            Ok(map)
        }
        RtpContents::Plain(map) => {
            if expect_envelope && binder.has_device() {
                return Err(ContentMapError::Security(
                    "fingerprints were not encrypted although expected".into(),
                )
                .into());
            }
            Ok(map.clone())
        }
    }
}
