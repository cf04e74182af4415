//! Stanza transport used by the call engine.
//!
//! The transport owns the XMPP stream. It serialises [`JinglePacket`]s into
//! IQs and [`JingleMessage`]s into message stanzas, correlates IQ responses
//! and hands inbound stanzas to [`CallManager::handle_iq`] and
//! [`CallManager::handle_message`].
//!
//! Implementations must not call back into the manager from inside these
//! methods; inbound delivery happens from the transport's own task.
//!
//! [`CallManager::handle_iq`]: super::CallManager::handle_iq
//! [`CallManager::handle_message`]: super::CallManager::handle_message

use super::error::CallError;
use async_trait::async_trait;
use jinglecore::address::Address;
use jinglecore::protocol::{InboundIq, IqReply, IqResponse, JingleMessage, JinglePacket};
use tokio::sync::oneshot;

/// Receiver for the response to an IQ that has been written to the stream.
pub type PendingIq = oneshot::Receiver<IqResponse>;

#[async_trait]
pub trait StanzaTransport: Send + Sync {
    /// The full address the stream is currently bound to.
    fn bound_address(&self) -> Address;

    /// Write a Jingle IQ. Returns once the stanza is queued on the stream, so
    /// IQs are sent in call order; the receiver resolves with the response.
    async fn send_iq(&self, to: &Address, packet: JinglePacket) -> PendingIq;

    /// Send a JMI message. `Ok` means the server acknowledged delivery.
    async fn send_message(&self, to: &Address, message: JingleMessage) -> Result<(), CallError>;

    /// Reply to an IQ we received.
    async fn respond(&self, iq: &InboundIq, reply: IqReply);
}

/// Wait for the response of a sent IQ. A dropped responder counts as a
/// timeout.
pub async fn await_response(pending: PendingIq) -> IqResponse {
    pending.await.unwrap_or(IqResponse::Timeout)
}
