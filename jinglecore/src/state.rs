//! Session state machine: states, the transition table and reason mapping.

use crate::content::ContentDirection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// State of one RTP session (JMI pre-call handshake plus Jingle session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SessionState {
    #[default]
    Null,
    /// A JMI proposal was sent or received.
    Proposed,
    /// Accepted on another device of our own account.
    Accepted,
    /// The callee agreed to the proposal; session-initiate is expected next.
    Proceed,
    Rejected,
    /// Rejected after proceed had already been sent.
    RejectedRaced,
    Retracted,
    /// Retracted after proceed had already been sent.
    RetractedRaced,
    SessionInitialized,
    /// session-initiate following a JMI proceed, so no user approval needed.
    SessionInitializedPreApproved,
    SessionAccepted,
    TerminatedSuccess,
    TerminatedDeclinedOrBusy,
    TerminatedConnectivityError,
    TerminatedCancelOrTimeout,
    TerminatedApplicationFailure,
    TerminatedSecurityError,
}

use SessionState::*;

const FROM_NULL: &[SessionState] = &[
    Proposed,
    SessionInitialized,
    TerminatedApplicationFailure,
    TerminatedSecurityError,
];

const FROM_PROPOSED: &[SessionState] = &[
    Accepted,
    Proceed,
    Rejected,
    Retracted,
    TerminatedApplicationFailure,
    TerminatedSecurityError,
    TerminatedConnectivityError,
];

const FROM_PROCEED: &[SessionState] = &[
    RejectedRaced,
    RetractedRaced,
    SessionInitializedPreApproved,
    TerminatedSuccess,
    TerminatedDeclinedOrBusy,
    TerminatedCancelOrTimeout,
    TerminatedApplicationFailure,
    TerminatedSecurityError,
    TerminatedConnectivityError,
];

const FROM_SESSION_INITIALIZED: &[SessionState] = &[
    SessionAccepted,
    TerminatedSuccess,
    TerminatedDeclinedOrBusy,
    TerminatedConnectivityError,
    TerminatedCancelOrTimeout,
    TerminatedApplicationFailure,
    TerminatedSecurityError,
];

const FROM_SESSION_ACCEPTED: &[SessionState] = &[
    TerminatedSuccess,
    TerminatedDeclinedOrBusy,
    TerminatedConnectivityError,
    TerminatedCancelOrTimeout,
    TerminatedApplicationFailure,
    TerminatedSecurityError,
];

/// Legal successors of `state`. Terminal states have none.
pub const fn legal_successors(state: SessionState) -> &'static [SessionState] {
    match state {
        Null => FROM_NULL,
        Proposed => FROM_PROPOSED,
        Proceed => FROM_PROCEED,
        SessionInitialized | SessionInitializedPreApproved => FROM_SESSION_INITIALIZED,
        SessionAccepted => FROM_SESSION_ACCEPTED,
        Accepted
        | Rejected
        | RejectedRaced
        | Retracted
        | RetractedRaced
        | TerminatedSuccess
        | TerminatedDeclinedOrBusy
        | TerminatedConnectivityError
        | TerminatedCancelOrTimeout
        | TerminatedApplicationFailure
        | TerminatedSecurityError => &[],
    }
}

impl SessionState {
    pub const ALL: [SessionState; 17] = [
        Null,
        Proposed,
        Accepted,
        Proceed,
        Rejected,
        RejectedRaced,
        Retracted,
        RetractedRaced,
        SessionInitialized,
        SessionInitializedPreApproved,
        SessionAccepted,
        TerminatedSuccess,
        TerminatedDeclinedOrBusy,
        TerminatedConnectivityError,
        TerminatedCancelOrTimeout,
        TerminatedApplicationFailure,
        TerminatedSecurityError,
    ];

    pub fn can_transition_to(self, target: SessionState) -> bool {
        legal_successors(self).contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Accepted
                | Rejected
                | RejectedRaced
                | Retracted
                | RetractedRaced
                | TerminatedSuccess
                | TerminatedDeclinedOrBusy
                | TerminatedConnectivityError
                | TerminatedCancelOrTimeout
                | TerminatedApplicationFailure
                | TerminatedSecurityError
        )
    }

    /// States in which a Jingle session (not just a JMI proposal) exists.
    pub fn is_session_established(self) -> bool {
        matches!(
            self,
            SessionInitialized | SessionInitializedPreApproved | SessionAccepted
        )
    }

    /// Apply a transition in place. On failure nothing is changed.
    pub fn transition(&mut self, target: SessionState) -> Result<(), InvalidTransition> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(InvalidTransition {
                current: *self,
                attempted: target,
            })
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current: SessionState,
    pub attempted: SessionState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition to {} in state {}",
            self.attempted, self.current
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Jingle `<reason/>` conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    Success,
    Decline,
    Busy,
    Cancel,
    Timeout,
    ConnectivityError,
    FailedTransport,
    FailedApplication,
    SecurityError,
    UnsupportedTransports,
    UnsupportedApplications,
    IncompatibleParameters,
    GeneralError,
    Gone,
    Unknown,
}

impl Reason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Decline => "decline",
            Self::Busy => "busy",
            Self::Cancel => "cancel",
            Self::Timeout => "timeout",
            Self::ConnectivityError => "connectivity-error",
            Self::FailedTransport => "failed-transport",
            Self::FailedApplication => "failed-application",
            Self::SecurityError => "security-error",
            Self::UnsupportedTransports => "unsupported-transports",
            Self::UnsupportedApplications => "unsupported-applications",
            Self::IncompatibleParameters => "incompatible-parameters",
            Self::GeneralError => "general-error",
            Self::Gone => "gone",
            Self::Unknown => "unknown",
        }
    }

    /// Terminal state a session moves into when terminated for this reason.
    pub const fn to_state(self) -> SessionState {
        match self {
            Self::Success => TerminatedSuccess,
            Self::Decline | Self::Busy => TerminatedDeclinedOrBusy,
            Self::Cancel | Self::Timeout => TerminatedCancelOrTimeout,
            Self::SecurityError => TerminatedSecurityError,
            Self::FailedApplication
            | Self::UnsupportedTransports
            | Self::UnsupportedApplications => TerminatedApplicationFailure,
            _ => TerminatedConnectivityError,
        }
    }
}

impl FromStr for Reason {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "success" => Self::Success,
            "decline" => Self::Decline,
            "busy" => Self::Busy,
            "cancel" => Self::Cancel,
            "timeout" => Self::Timeout,
            "connectivity-error" => Self::ConnectivityError,
            "failed-transport" => Self::FailedTransport,
            "failed-application" => Self::FailedApplication,
            "security-error" => Self::SecurityError,
            "unsupported-transports" => Self::UnsupportedTransports,
            "unsupported-applications" => Self::UnsupportedApplications,
            "incompatible-parameters" => Self::IncompatibleParameters,
            "general-error" => Self::GeneralError,
            "gone" => Self::Gone,
            _ => Self::Unknown,
        })
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state reported by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PeerConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Offer/answer state of the media engine's local description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Coarse call state presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndUserState {
    FindingDevice,
    Ringing,
    IncomingCall,
    AcceptingCall,
    Connecting,
    Connected,
    Reconnecting,
    IncomingContentAdd,
    OutgoingContentAdd,
    AcceptedOnOtherDevice,
    Retracted,
    DeclinedOrBusy,
    Ended,
    ConnectivityError,
    ConnectivityLostError,
    ApplicationError,
    SecurityError,
}

/// Everything [`EndUserState::derive`] looks at.
#[derive(Debug, Clone, Copy)]
pub struct EndUserInputs {
    pub state: SessionState,
    pub is_initiator: bool,
    pub peer_connection: PeerConnectionState,
    pub pending_content: Option<ContentDirection>,
    /// Media was connected at least once during this session.
    pub was_connected: bool,
}

impl EndUserState {
    pub fn derive(inputs: EndUserInputs) -> Self {
        let EndUserInputs {
            state,
            is_initiator,
            peer_connection,
            pending_content,
            was_connected,
        } = inputs;
        match state {
            Null => Self::Connecting,
            Proposed | SessionInitialized => {
                if is_initiator {
                    Self::Ringing
                } else {
                    Self::IncomingCall
                }
            }
            Proceed => {
                if is_initiator {
                    Self::Ringing
                } else {
                    Self::AcceptingCall
                }
            }
            SessionInitializedPreApproved => {
                if is_initiator {
                    Self::Connecting
                } else {
                    Self::AcceptingCall
                }
            }
            SessionAccepted => match pending_content {
                Some(ContentDirection::Incoming) => Self::IncomingContentAdd,
                Some(ContentDirection::Outgoing) => Self::OutgoingContentAdd,
                None => match peer_connection {
                    PeerConnectionState::Connected => Self::Connected,
                    PeerConnectionState::New | PeerConnectionState::Connecting => {
                        if was_connected {
                            Self::Reconnecting
                        } else {
                            Self::Connecting
                        }
                    }
                    PeerConnectionState::Disconnected => Self::Reconnecting,
                    PeerConnectionState::Closed => Self::Ended,
                    PeerConnectionState::Failed => Self::ConnectivityLostError,
                },
            },
            Accepted => Self::AcceptedOnOtherDevice,
            Rejected | RejectedRaced | TerminatedDeclinedOrBusy => {
                if is_initiator {
                    Self::DeclinedOrBusy
                } else {
                    Self::Ended
                }
            }
            RetractedRaced => {
                if is_initiator {
                    Self::Ended
                } else {
                    Self::Retracted
                }
            }
            Retracted | TerminatedSuccess | TerminatedCancelOrTimeout => Self::Ended,
            TerminatedConnectivityError => {
                if was_connected {
                    Self::ConnectivityLostError
                } else {
                    Self::ConnectivityError
                }
            }
            TerminatedApplicationFailure => Self::ApplicationError,
            TerminatedSecurityError => Self::SecurityError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every transition succeeds exactly when the table lists it.
    #[test]
    fn test_transition_table_is_exact() {
        for from in SessionState::ALL {
            for to in SessionState::ALL {
                let mut state = from;
                let result = state.transition(to);
                if legal_successors(from).contains(&to) {
                    assert!(result.is_ok(), "{from} -> {to} should be legal");
                    assert_eq!(state, to);
                } else {
                    assert!(result.is_err(), "{from} -> {to} should be illegal");
                    assert_eq!(state, from, "failed transition must not mutate");
                }
            }
        }
    }

    #[test]
    fn test_terminal_states_are_fixed_points() {
        for state in SessionState::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(legal_successors(state).is_empty(), "{state} has successors");
        }
        for state in SessionState::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(!legal_successors(state).is_empty(), "{state} is a dead end");
        }
    }

    #[test]
    fn test_reason_to_state() {
        assert_eq!(Reason::Success.to_state(), TerminatedSuccess);
        assert_eq!(Reason::Decline.to_state(), TerminatedDeclinedOrBusy);
        assert_eq!(Reason::Busy.to_state(), TerminatedDeclinedOrBusy);
        assert_eq!(Reason::Cancel.to_state(), TerminatedCancelOrTimeout);
        assert_eq!(Reason::Timeout.to_state(), TerminatedCancelOrTimeout);
        assert_eq!(Reason::SecurityError.to_state(), TerminatedSecurityError);
        assert_eq!(
            Reason::UnsupportedTransports.to_state(),
            TerminatedApplicationFailure
        );
        assert_eq!(
            Reason::UnsupportedApplications.to_state(),
            TerminatedApplicationFailure
        );
        assert_eq!(
            Reason::FailedApplication.to_state(),
            TerminatedApplicationFailure
        );
        assert_eq!(Reason::Gone.to_state(), TerminatedConnectivityError);
        assert_eq!(Reason::Unknown.to_state(), TerminatedConnectivityError);
    }

    #[test]
    fn test_reason_parsing_roundtrip_and_unknown() {
        assert_eq!("failed-application".parse(), Ok(Reason::FailedApplication));
        assert_eq!("no-such-reason".parse(), Ok(Reason::Unknown));
    }

    #[test]
    fn test_end_user_state_for_incoming_and_outgoing() {
        let mut inputs = EndUserInputs {
            state: Proposed,
            is_initiator: false,
            peer_connection: PeerConnectionState::New,
            pending_content: None,
            was_connected: false,
        };
        assert_eq!(EndUserState::derive(inputs), EndUserState::IncomingCall);

        inputs.is_initiator = true;
        assert_eq!(EndUserState::derive(inputs), EndUserState::Ringing);

        inputs.state = SessionAccepted;
        inputs.peer_connection = PeerConnectionState::Connected;
        assert_eq!(EndUserState::derive(inputs), EndUserState::Connected);

        inputs.pending_content = Some(ContentDirection::Incoming);
        assert_eq!(
            EndUserState::derive(inputs),
            EndUserState::IncomingContentAdd
        );
    }

    #[test]
    fn test_connectivity_error_depends_on_prior_connection() {
        let mut inputs = EndUserInputs {
            state: TerminatedConnectivityError,
            is_initiator: true,
            peer_connection: PeerConnectionState::Closed,
            pending_content: None,
            was_connected: false,
        };
        assert_eq!(
            EndUserState::derive(inputs),
            EndUserState::ConnectivityError
        );
        inputs.was_connected = true;
        assert_eq!(
            EndUserState::derive(inputs),
            EndUserState::ConnectivityLostError
        );
    }
}
