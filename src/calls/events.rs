//! Call events for UI layers.

use super::proposal::DeviceDiscoveryState;
use jinglecore::address::Address;
use jinglecore::content::ContentAddition;
use jinglecore::protocol::SessionId;
use jinglecore::state::EndUserState;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndUserStateChanged {
    pub peer: Address,
    pub session_id: SessionId,
    pub state: EndUserState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalUpdated {
    /// Bare address of the callee.
    pub peer: Address,
    pub session_id: SessionId,
    pub state: DeviceDiscoveryState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentAdditionChanged {
    pub peer: Address,
    pub session_id: SessionId,
    /// `None` once the addition was accepted, rejected or retracted.
    pub addition: Option<ContentAddition>,
}

macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with one broadcast channel per event type.
        #[derive(Debug)]
        pub struct CallEventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl CallEventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (end_user_state, Arc<EndUserStateChanged>),
    (proposal, Arc<ProposalUpdated>),
    (content_addition, Arc<ContentAdditionChanged>),
}

impl Default for CallEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CallEventBus {
    // Sending fails only when nobody subscribed.
    pub(crate) fn emit_end_user_state(&self, event: EndUserStateChanged) {
        let _ = self.end_user_state.send(Arc::new(event));
    }

    pub(crate) fn emit_proposal(&self, event: ProposalUpdated) {
        let _ = self.proposal.send(Arc::new(event));
    }

    pub(crate) fn emit_content_addition(&self, event: ContentAdditionChanged) {
        let _ = self.content_addition.send(Arc::new(event));
    }
}
