//! Outgoing call proposals (JMI) and their arbitration.

use jinglecore::address::Address;
use jinglecore::media::MediaSet;
use jinglecore::protocol::SessionId;
use jinglecore::state::EndUserState;
use rand::Rng;
use rand::distr::Alphanumeric;
use std::cmp::Ordering;

const SESSION_ID_LENGTH: usize = 16;

/// Generate a random session id.
pub fn generate_session_id() -> SessionId {
    let id: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LENGTH)
        .map(char::from)
        .collect();
    SessionId(id)
}

/// Progress of a proposal towards a device of the callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceDiscoveryState {
    Searching,
    /// The server accepted the propose message.
    SearchingAcknowledged,
    /// A device of the callee is ringing.
    Discovered,
    Failed,
}

impl DeviceDiscoveryState {
    /// Open proposals count towards busy and take part in tie-breaks.
    pub fn is_open(self) -> bool {
        !matches!(self, Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Searching => 0,
            Self::SearchingAcknowledged => 1,
            Self::Discovered => 2,
            Self::Failed => 3,
        }
    }

    /// The state after observing `next`, or `None` when `next` would move
    /// the proposal backwards. Failed proposals stay failed.
    pub fn advance(self, next: Self) -> Option<Self> {
        if self == Self::Failed || next.rank() <= self.rank() {
            None
        } else {
            Some(next)
        }
    }

    pub fn to_end_user_state(self) -> EndUserState {
        match self {
            Self::Searching | Self::SearchingAcknowledged => EndUserState::FindingDevice,
            Self::Discovered => EndUserState::Ringing,
            Self::Failed => EndUserState::ConnectivityError,
        }
    }
}

/// A call we offered before any device of the callee answered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Proposal {
    /// Bare address of the callee.
    pub peer: Address,
    pub session_id: SessionId,
    pub media: MediaSet,
}

impl Proposal {
    pub fn new(peer: &Address, media: MediaSet) -> Self {
        Self {
            peer: peer.bare(),
            session_id: generate_session_id(),
            media,
        }
    }

    /// True when an incoming propose from `from` for `media` collides with
    /// this proposal.
    pub fn matches(&self, from: &Address, media: &MediaSet) -> bool {
        self.peer == from.bare() && self.media == *media
    }
}

/// Order two colliding proposals by `(session id, address)`.
pub fn compare_proposals(
    ours: (&SessionId, &Address),
    theirs: (&SessionId, &Address),
) -> Ordering {
    ours.0
        .cmp(theirs.0)
        .then_with(|| ours.1.to_string().cmp(&theirs.1.to_string()))
}

/// True when our proposal loses a collision and we have to take theirs.
pub fn loses_tie_break(ours: (&SessionId, &Address), theirs: (&SessionId, &Address)) -> bool {
    compare_proposals(ours, theirs) == Ordering::Greater
}
