//! Call-related error types.

use super::encryption::CryptoError;
use super::media::MediaError;
use jinglecore::content::ContentMapError;
use jinglecore::state::{InvalidTransition, Reason};
use jinglecore::verification::VerificationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call not found: {0}")]
    NotFound(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("busy with another call")]
    Busy,

    #[error("no pending content addition")]
    NoPendingContentAddition,

    #[error("content addition does not match the pending one")]
    ContentAdditionMismatch,

    #[error("content error: {0}")]
    ContentMap(#[from] ContentMapError),

    #[error("verification error: {0}")]
    Verification(#[from] VerificationError),

    #[error("media engine error: {0}")]
    Media(#[from] MediaError),

    #[error("encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CallError {
    /// True for failures that must end the session with `security-error`.
    pub fn is_security(&self) -> bool {
        match self {
            Self::ContentMap(e) => e.is_security(),
            Self::Verification(_) | Self::Crypto(_) => true,
            _ => false,
        }
    }
}

/// Termination reason for a failure while processing a session.
pub fn reason_of(error: &CallError) -> Reason {
    if error.is_security() {
        Reason::SecurityError
    } else {
        Reason::FailedApplication
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_of_security_failures() {
        let missing = CallError::from(ContentMapError::Security("no fingerprint".into()));
        assert_eq!(reason_of(&missing), Reason::SecurityError);

        let mismatch = CallError::from(VerificationError::Failed);
        assert_eq!(reason_of(&mismatch), Reason::SecurityError);
    }

    #[test]
    fn test_reason_of_everything_else() {
        let malformed = CallError::from(ContentMapError::Malformed("no contents".into()));
        assert_eq!(reason_of(&malformed), Reason::FailedApplication);
        assert_eq!(
            reason_of(&CallError::Media(MediaError::Closed)),
            Reason::FailedApplication
        );
    }
}
