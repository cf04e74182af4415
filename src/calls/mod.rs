//! Call signaling for XMPP audio/video calls.
//!
//! Implements Jingle RTP sessions (XEP-0166/0167/0176/0320) preceded by the
//! Jingle Message Initiation handshake (XEP-0353). The module only does
//! signaling: media is delegated to a [`MediaEngine`], stanzas to a
//! [`StanzaTransport`].
//!
//! # Architecture
//!
//! - [`CallManager`]: Routes inbound stanzas, owns the session registry and
//!   arbitrates colliding proposals
//! - [`JingleSession`]: One call, from the JMI proposal to session-terminate
//! - [`CallEventBus`]: Broadcast channels for UI layers
//! - [`CryptoService`]: Optional encrypted envelopes for DTLS fingerprints
//!
//! # Protocol Overview
//!
//! A caller proposes a call with a JMI `<propose/>` message to all devices of
//! the callee. The device that accepts answers with `<proceed/>`, after which
//! the caller sends session-initiate and the callee session-accept. ICE
//! candidates follow in transport-info IQs. An accepted audio call can be
//! upgraded to video with content-add.

mod collaborators;
mod encryption;
mod error;
mod events;
mod manager;
mod media;
mod proposal;
mod renegotiation;
mod session;
mod transport;

pub use collaborators::{CallDirection, CallLog, CallLogEntry, CallOutcome, Roster};
pub use encryption::{CryptoError, CryptoService, open_contents, seal_contents};
pub use error::{CallError, reason_of};
pub use events::{CallEventBus, ContentAdditionChanged, EndUserStateChanged, ProposalUpdated};
pub use manager::{CallManager, CallManagerConfig, CallServices, TerminatedSessionRecord};
pub use media::{MediaEngine, MediaEngineFactory, MediaError, MediaEvent, MediaEventSender};
pub use proposal::{
    DeviceDiscoveryState, Proposal, compare_proposals, generate_session_id, loses_tie_break,
};
pub use session::{JingleSession, PendingContentChange, SessionKey};
pub use transport::{PendingIq, StanzaTransport, await_response};
