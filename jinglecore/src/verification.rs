//! Binds a session to the peer device that encrypted its fingerprints.
//!
//! Both cells are write-once: the first non-empty value sticks and every
//! later value must match. A mismatch poisons the binder for the rest of the
//! session.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("device id changed from {bound} to {received}")]
    DeviceMismatch { bound: u32, received: u32 },
    #[error("identity key changed from {bound} to {received}")]
    IdentityMismatch {
        bound: IdentityKey,
        received: IdentityKey,
    },
    #[error("verification already failed for this session")]
    Failed,
}

/// Public identity key of a peer device.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey(pub Vec<u8>);

impl IdentityKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", hex::encode(&self.0))
    }
}

/// Outcome of decrypting or encrypting a content map: who it was bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub device_id: u32,
    pub identity_key: IdentityKey,
}

#[derive(Debug, Clone, Default)]
pub struct VerificationBinder {
    device_id: Option<u32>,
    identity_key: Option<IdentityKey>,
    failed: bool,
}

impl VerificationBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_id(&self) -> Option<u32> {
        self.device_id
    }

    pub fn identity_key(&self) -> Option<&IdentityKey> {
        self.identity_key.as_ref()
    }

    pub fn has_device(&self) -> bool {
        self.device_id.is_some()
    }

    pub fn has_identity(&self) -> bool {
        self.identity_key.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Bind the device id alone, as announced in a JMI proceed.
    pub fn set_device_id(&mut self, device_id: u32) -> Result<(), VerificationError> {
        self.check_device(device_id)?;
        self.device_id = Some(device_id);
        Ok(())
    }

    /// Bind device id and identity key together. Both are checked before
    /// either is written.
    pub fn bind(&mut self, verification: &Verification) -> Result<(), VerificationError> {
        self.check_device(verification.device_id)?;
        if let Some(bound) = &self.identity_key
            && *bound != verification.identity_key
        {
            self.failed = true;
            return Err(VerificationError::IdentityMismatch {
                bound: bound.clone(),
                received: verification.identity_key.clone(),
            });
        }
        self.device_id = Some(verification.device_id);
        self.identity_key = Some(verification.identity_key.clone());
        Ok(())
    }

    fn check_device(&mut self, device_id: u32) -> Result<(), VerificationError> {
        if self.failed {
            return Err(VerificationError::Failed);
        }
        match self.device_id {
            Some(bound) if bound != device_id => {
                self.failed = true;
                Err(VerificationError::DeviceMismatch {
                    bound,
                    received: device_id,
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verification(device_id: u32, key: &[u8]) -> Verification {
        Verification {
            device_id,
            identity_key: IdentityKey::new(key),
        }
    }

    #[test]
    fn test_first_bind_sticks() {
        let mut binder = VerificationBinder::new();
        binder.bind(&verification(7, b"key-a")).unwrap();
        binder.bind(&verification(7, b"key-a")).unwrap();
        assert_eq!(binder.device_id(), Some(7));
        assert_eq!(binder.identity_key(), Some(&IdentityKey::new(b"key-a".to_vec())));
    }

    #[test]
    fn test_device_id_then_matching_bind() {
        let mut binder = VerificationBinder::new();
        binder.set_device_id(3).unwrap();
        assert!(binder.has_device());
        assert!(!binder.has_identity());
        binder.bind(&verification(3, b"key")).unwrap();
        assert!(binder.has_identity());
    }

    #[test]
    fn test_mismatch_does_not_mutate_and_poisons() {
        let mut binder = VerificationBinder::new();
        binder.bind(&verification(1, b"key-a")).unwrap();

        let err = binder.bind(&verification(1, b"key-b")).unwrap_err();
        assert!(matches!(err, VerificationError::IdentityMismatch { .. }));
        assert_eq!(binder.identity_key(), Some(&IdentityKey::new(b"key-a".to_vec())));

        // even the originally bound values are refused now
        assert_eq!(
            binder.bind(&verification(1, b"key-a")),
            Err(VerificationError::Failed)
        );
    }

    #[test]
    fn test_device_mismatch_leaves_identity_untouched() {
        let mut binder = VerificationBinder::new();
        binder.set_device_id(1).unwrap();
        assert_eq!(
            binder.bind(&verification(2, b"key")),
            Err(VerificationError::DeviceMismatch {
                bound: 1,
                received: 2
            })
        );
        assert!(!binder.has_identity());
        assert_eq!(binder.device_id(), Some(1));
        assert!(binder.is_failed());
    }

    #[test]
    fn test_identity_key_display_is_hex() {
        assert_eq!(IdentityKey::new(vec![0xde, 0xad]).to_string(), "dead");
    }
}
