//! Wire-level model of Jingle IQs, Jingle Message Initiation (JMI) messages
//! and IQ responses.
//!
//! Serialisation to XML belongs to the transport; this module only defines
//! what travels.

use crate::address::Address;
use crate::content::ContentMap;
use crate::media::MediaSet;
use crate::state::Reason;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque session identifier shared by JMI messages and the Jingle session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JingleAction {
    SessionInitiate,
    SessionAccept,
    SessionTerminate,
    TransportInfo,
    ContentAdd,
    ContentAccept,
    ContentReject,
    ContentRemove,
}

impl JingleAction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SessionInitiate => "session-initiate",
            Self::SessionAccept => "session-accept",
            Self::SessionTerminate => "session-terminate",
            Self::TransportInfo => "transport-info",
            Self::ContentAdd => "content-add",
            Self::ContentAccept => "content-accept",
            Self::ContentReject => "content-reject",
            Self::ContentRemove => "content-remove",
        }
    }
}

impl FromStr for JingleAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session-initiate" => Ok(Self::SessionInitiate),
            "session-accept" => Ok(Self::SessionAccept),
            "session-terminate" => Ok(Self::SessionTerminate),
            "transport-info" => Ok(Self::TransportInfo),
            "content-add" => Ok(Self::ContentAdd),
            "content-accept" => Ok(Self::ContentAccept),
            "content-reject" => Ok(Self::ContentReject),
            "content-remove" => Ok(Self::ContentRemove),
            other => Err(format!("unsupported jingle action: {other}")),
        }
    }
}

impl fmt::Display for JingleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content map whose DTLS fingerprints were moved into an encrypted
/// envelope addressed to one peer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedContentMap {
    /// The contents with fingerprints removed.
    pub contents: ContentMap,
    pub sender_device_id: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RtpContents {
    Plain(ContentMap),
    Encrypted(EncryptedContentMap),
}

impl RtpContents {
    /// The visible content map, fingerprints excluded when encrypted.
    pub fn visible(&self) -> &ContentMap {
        match self {
            Self::Plain(map) => map,
            Self::Encrypted(enc) => &enc.contents,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonElement {
    pub reason: Reason,
    pub text: Option<String>,
}

/// A Jingle IQ payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JinglePacket {
    pub action: JingleAction,
    pub session_id: SessionId,
    pub initiator: Option<Address>,
    pub responder: Option<Address>,
    pub contents: Option<RtpContents>,
    pub reason: Option<ReasonElement>,
}

impl JinglePacket {
    pub fn new(action: JingleAction, session_id: SessionId) -> Self {
        Self {
            action,
            session_id,
            initiator: None,
            responder: None,
            contents: None,
            reason: None,
        }
    }

    pub fn with_initiator(mut self, initiator: Address) -> Self {
        self.initiator = Some(initiator);
        self
    }

    pub fn with_responder(mut self, responder: Address) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn with_contents(mut self, contents: RtpContents) -> Self {
        self.contents = Some(contents);
        self
    }

    pub fn with_plain_contents(self, contents: ContentMap) -> Self {
        self.with_contents(RtpContents::Plain(contents))
    }

    pub fn with_reason(mut self, reason: Reason, text: Option<String>) -> Self {
        self.reason = Some(ReasonElement { reason, text });
        self
    }

    pub fn reason(&self) -> Option<Reason> {
        self.reason.as_ref().map(|r| r.reason)
    }
}

/// Jingle Message Initiation (XEP-0353) messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JingleMessage {
    Propose {
        session_id: SessionId,
        media: MediaSet,
    },
    Ringing {
        session_id: SessionId,
    },
    Proceed {
        session_id: SessionId,
        device_id: Option<u32>,
    },
    Accept {
        session_id: SessionId,
    },
    Reject {
        session_id: SessionId,
        reason: Option<Reason>,
    },
    Retract {
        session_id: SessionId,
        reason: Option<Reason>,
    },
}

impl JingleMessage {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Propose { session_id, .. }
            | Self::Ringing { session_id }
            | Self::Proceed { session_id, .. }
            | Self::Accept { session_id }
            | Self::Reject { session_id, .. }
            | Self::Retract { session_id, .. } => session_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Propose { .. } => "propose",
            Self::Ringing { .. } => "ringing",
            Self::Proceed { .. } => "proceed",
            Self::Accept { .. } => "accept",
            Self::Reject { .. } => "reject",
            Self::Retract { .. } => "retract",
        }
    }
}

/// Stanza error conditions, including the Jingle-specific ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCondition {
    TieBreak,
    OutOfOrder,
    UnknownSession,
    ServiceUnavailable,
    RecipientUnavailable,
    RemoteServerNotFound,
    RemoteServerTimeout,
    FeatureNotImplemented,
    BadRequest,
    ItemNotFound,
    Other(String),
}

impl ErrorCondition {
    pub fn is_tie_break(&self) -> bool {
        matches!(self, Self::TieBreak)
    }

    /// Conditions meaning the peer cannot be reached at all.
    pub fn is_remote_unavailable(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable
                | Self::RecipientUnavailable
                | Self::RemoteServerNotFound
                | Self::RemoteServerTimeout
        )
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TieBreak => f.write_str("tie-break"),
            Self::OutOfOrder => f.write_str("out-of-order"),
            Self::UnknownSession => f.write_str("unknown-session"),
            Self::ServiceUnavailable => f.write_str("service-unavailable"),
            Self::RecipientUnavailable => f.write_str("recipient-unavailable"),
            Self::RemoteServerNotFound => f.write_str("remote-server-not-found"),
            Self::RemoteServerTimeout => f.write_str("remote-server-timeout"),
            Self::FeatureNotImplemented => f.write_str("feature-not-implemented"),
            Self::BadRequest => f.write_str("bad-request"),
            Self::ItemNotFound => f.write_str("item-not-found"),
            Self::Other(other) => f.write_str(other),
        }
    }
}

/// Outcome of an IQ we sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IqResponse {
    Result,
    Error(ErrorCondition),
    Timeout,
}

/// Reply we give to an IQ we received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IqReply {
    Result,
    Error(ErrorCondition),
}

/// A Jingle IQ as received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundIq {
    pub id: String,
    pub from: Address,
    pub packet: JinglePacket,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;

    #[test]
    fn test_action_names() {
        for action in [
            JingleAction::SessionInitiate,
            JingleAction::SessionAccept,
            JingleAction::SessionTerminate,
            JingleAction::TransportInfo,
            JingleAction::ContentAdd,
            JingleAction::ContentAccept,
            JingleAction::ContentReject,
            JingleAction::ContentRemove,
        ] {
            assert_eq!(action.as_str().parse::<JingleAction>(), Ok(action));
        }
        assert!("description-info".parse::<JingleAction>().is_err());
    }

    #[test]
    fn test_remote_unavailable_conditions() {
        assert!(ErrorCondition::RemoteServerTimeout.is_remote_unavailable());
        assert!(ErrorCondition::ServiceUnavailable.is_remote_unavailable());
        assert!(!ErrorCondition::TieBreak.is_remote_unavailable());
        assert!(!ErrorCondition::Other("conflict".into()).is_remote_unavailable());
    }

    #[test]
    fn test_jingle_message_serializes() {
        let message = JingleMessage::Propose {
            session_id: "abc".into(),
            media: MediaKind::set_of(&[MediaKind::Audio]),
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"audio\""));
        let back: JingleMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_id().as_str(), "abc");
        assert_eq!(back.name(), "propose");
    }
}
