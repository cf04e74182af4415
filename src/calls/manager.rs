//! Call manager: routes stanzas to sessions and arbitrates proposals.

use super::collaborators::{CallDirection, CallLog, CallLogEntry, CallOutcome, Roster};
use super::encryption::CryptoService;
use super::error::CallError;
use super::events::{CallEventBus, EndUserStateChanged, ProposalUpdated};
use super::media::MediaEngineFactory;
use super::proposal::{DeviceDiscoveryState, Proposal, loses_tie_break};
use super::session::{JingleSession, SessionKey, ended_session_reply};
use super::transport::StanzaTransport;
use chrono::Utc;
use jinglecore::address::Address;
use jinglecore::media::MediaSet;
use jinglecore::protocol::{
    ErrorCondition, InboundIq, IqReply, JingleAction, JingleMessage, JinglePacket, SessionId,
};
use jinglecore::state::{EndUserState, Reason};
use log::{debug, info, warn};
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;

/// Collaborators shared by the manager and every session.
pub struct CallServices {
    pub transport: Arc<dyn StanzaTransport>,
    pub media: Arc<dyn MediaEngineFactory>,
    pub crypto: Arc<dyn CryptoService>,
    pub roster: Arc<dyn Roster>,
    pub call_log: Arc<dyn CallLog>,
}

/// Configuration for the call manager.
#[derive(Clone)]
pub struct CallManagerConfig {
    /// How long an unanswered incoming call rings before it is rejected.
    pub ring_timeout: Duration,
    /// How long the final state of an ended session stays queryable.
    pub terminated_session_ttl: Duration,
    pub terminated_session_capacity: u64,
    /// Ring for calls from contacts not in the roster.
    pub notify_strangers: bool,
    /// Exchange DTLS fingerprints in encrypted envelopes when possible.
    pub verification_enabled: bool,
    /// Our device id, announced in proceed when verification is enabled.
    pub own_device_id: Option<u32>,
}

impl std::fmt::Debug for CallManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManagerConfig")
            .field("ring_timeout", &self.ring_timeout)
            .field("terminated_session_ttl", &self.terminated_session_ttl)
            .field(
                "terminated_session_capacity",
                &self.terminated_session_capacity,
            )
            .field("notify_strangers", &self.notify_strangers)
            .field("verification_enabled", &self.verification_enabled)
            .field("own_device_id", &self.own_device_id.is_some())
            .finish()
    }
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            terminated_session_ttl: Duration::from_secs(24 * 60 * 60),
            terminated_session_capacity: 1024,
            notify_strangers: false,
            verification_enabled: true,
            own_device_id: None,
        }
    }
}

/// What remains of a session once it ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminatedSessionRecord {
    pub end_user_state: EndUserState,
    pub media: MediaSet,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionKey, Arc<JingleSession>>,
    proposals: HashMap<Proposal, DeviceDiscoveryState>,
}

impl Registry {
    /// A live session or an open proposal occupies the line.
    fn is_busy(&self) -> bool {
        self.sessions.values().any(|s| !s.is_terminated())
            || self.proposals.values().any(|s| s.is_open())
    }

    fn find_proposal(&self, peer: &Address, session_id: &SessionId) -> Option<Proposal> {
        self.proposals
            .keys()
            .find(|p| p.peer == peer.bare() && p.session_id == *session_id)
            .cloned()
    }
}

/// Owns every session of one account.
///
/// Lock order: a session's lock may be held while taking the registry lock,
/// never the other way around.
pub struct CallManager {
    services: Arc<CallServices>,
    config: CallManagerConfig,
    events: Arc<CallEventBus>,
    registry: Mutex<Registry>,
    terminated: Cache<(Address, SessionId), TerminatedSessionRecord>,
    weak_self: Weak<CallManager>,
}

impl CallManager {
    pub fn new(services: CallServices, config: CallManagerConfig) -> Arc<Self> {
        let terminated = Cache::builder()
            .time_to_live(config.terminated_session_ttl)
            .max_capacity(config.terminated_session_capacity)
            .build();
        Arc::new_cyclic(|weak_self| Self {
            services: Arc::new(services),
            config,
            events: Arc::new(CallEventBus::new()),
            registry: Mutex::new(Registry::default()),
            terminated,
            weak_self: weak_self.clone(),
        })
    }

    pub fn events(&self) -> &Arc<CallEventBus> {
        &self.events
    }

    pub fn config(&self) -> &CallManagerConfig {
        &self.config
    }

    pub async fn session(&self, key: &SessionKey) -> Option<Arc<JingleSession>> {
        self.registry.lock().await.sessions.get(key).cloned()
    }

    /// The live session with `session_id`, whoever the peer is.
    pub async fn find_session(&self, session_id: &SessionId) -> Option<Arc<JingleSession>> {
        self.registry
            .lock()
            .await
            .sessions
            .values()
            .find(|s| s.session_id() == session_id)
            .cloned()
    }

    pub async fn active_sessions(&self) -> Vec<Arc<JingleSession>> {
        self.registry
            .lock()
            .await
            .sessions
            .values()
            .cloned()
            .collect()
    }

    pub async fn is_busy(&self) -> bool {
        self.registry.lock().await.is_busy()
    }

    pub async fn proposal_state(
        &self,
        peer: &Address,
        session_id: &SessionId,
    ) -> Option<DeviceDiscoveryState> {
        let registry = self.registry.lock().await;
        let proposal = registry.find_proposal(peer, session_id)?;
        registry.proposals.get(&proposal).copied()
    }

    /// Final state of a session that ended recently.
    pub async fn terminal_session_state(
        &self,
        peer: &Address,
        session_id: &SessionId,
    ) -> Option<TerminatedSessionRecord> {
        self.terminated
            .get(&(peer.bare(), session_id.clone()))
            .await
    }

    fn create_session(&self, key: SessionKey, initiator: Address) -> Arc<JingleSession> {
        JingleSession::new(
            key,
            initiator,
            self.services.clone(),
            self.events.clone(),
            self.config.clone(),
            self.weak_self.clone(),
        )
    }

    /// Called by a session once it reached a terminal state.
    pub(super) async fn finish_session(&self, key: &SessionKey, record: TerminatedSessionRecord) {
        debug!("Session {} finished as {:?}", key, record.end_user_state);
        // recorded first so that no IQ finds the session in neither place
        self.terminated
            .insert((key.peer.bare(), key.session_id.clone()), record)
            .await;
        self.registry.lock().await.sessions.remove(key);
    }

    async fn record_ended_proposal(&self, proposal: &Proposal, state: EndUserState) {
        let record = TerminatedSessionRecord {
            end_user_state: state,
            media: proposal.media.clone(),
        };
        self.terminated
            .insert((proposal.peer.clone(), proposal.session_id.clone()), record)
            .await;
        self.events.emit_end_user_state(EndUserStateChanged {
            peer: proposal.peer.clone(),
            session_id: proposal.session_id.clone(),
            state,
        });
    }

    async fn log_missed(&self, peer: &Address, session_id: &SessionId, direction: CallDirection) {
        self.services
            .call_log
            .record(CallLogEntry {
                peer: peer.bare(),
                session_id: session_id.clone(),
                direction,
                outcome: CallOutcome::Missed,
                recorded_at: Utc::now(),
            })
            .await;
    }

    async fn is_stranger(&self, peer: &Address) -> bool {
        !self.config.notify_strangers && !self.services.roster.is_trusted(&peer.bare()).await
    }

    // Inbound

    /// Entry point for every inbound Jingle IQ.
    pub async fn handle_iq(&self, iq: InboundIq) {
        let key = SessionKey::new(iq.from.clone(), iq.packet.session_id.clone());
        let existing = self.session(&key).await;
        if let Some(session) = existing {
            session.handle_iq(iq).await;
            return;
        }
        let ended = self
            .terminal_session_state(&iq.from, &iq.packet.session_id)
            .await
            .is_some();
        if iq.packet.action != JingleAction::SessionInitiate {
            let reply = if ended {
                debug!("Received {} for ended session {}", iq.packet.action, key);
                ended_session_reply(iq.packet.action)
            } else {
                debug!("Received {} for unknown session {}", iq.packet.action, key);
                IqReply::Error(ErrorCondition::UnknownSession)
            };
            self.services.transport.respond(&iq, reply).await;
            return;
        }
        let stranger = self.is_stranger(&iq.from).await;
        let session = {
            let mut registry = self.registry.lock().await;
            if ended || stranger || registry.is_busy() {
                None
            } else {
                let session = self.create_session(key.clone(), iq.from.clone());
                registry.sessions.insert(key.clone(), session.clone());
                Some(session)
            }
        };
        match session {
            Some(session) => session.handle_iq(iq).await,
            None => {
                info!(
                    "Refusing session-initiate {} (ended: {}, stranger: {})",
                    key, ended, stranger
                );
                self.services.transport.respond(&iq, IqReply::Result).await;
                let terminate = JinglePacket::new(
                    JingleAction::SessionTerminate,
                    iq.packet.session_id.clone(),
                )
                .with_reason(Reason::Busy, None);
                // nobody is left to care about the response
                drop(self.services.transport.send_iq(&iq.from, terminate).await);
            }
        }
    }

    /// Entry point for every inbound JMI message.
    pub async fn handle_message(&self, from: &Address, message: JingleMessage) {
        let own = self.services.transport.bound_address();
        if from.is_same_account(&own) {
            match self.find_session(message.session_id()).await {
                Some(session) => session.handle_message(from, message).await,
                None => debug!(
                    "Dropping {} from own device {} for unknown session",
                    message.name(),
                    from
                ),
            }
            return;
        }
        let key = SessionKey::new(from.clone(), message.session_id().clone());
        if let Some(session) = self.session(&key).await {
            session.handle_message(from, message).await;
            return;
        }
        match message {
            JingleMessage::Propose { session_id, media } => {
                self.receive_propose(from, session_id, media).await
            }
            JingleMessage::Proceed { .. } => self.receive_proceed(from, message).await,
            JingleMessage::Reject { session_id, .. } => {
                self.receive_reject(from, &session_id).await
            }
            JingleMessage::Ringing { session_id } => {
                self.update_proposal(from, &session_id, DeviceDiscoveryState::Discovered)
                    .await
            }
            message => debug!(
                "Dropping {} from {} for unknown session {}",
                message.name(),
                from,
                message.session_id()
            ),
        }
    }

    async fn receive_propose(&self, from: &Address, session_id: SessionId, media: MediaSet) {
        let own = self.services.transport.bound_address();
        let mut registry = self.registry.lock().await;
        let colliding = registry
            .proposals
            .iter()
            .find(|(p, state)| state.is_open() && p.matches(from, &media))
            .map(|(p, _)| p.clone());
        if let Some(ours) = colliding {
            if !loses_tie_break((&ours.session_id, &own), (&session_id, from)) {
                info!(
                    "Proposal {} from {} collides with ours ({}), we win",
                    session_id, from, ours.session_id
                );
                return;
            }
            info!(
                "Proposal {} from {} collides with ours ({}), taking theirs",
                session_id, from, ours.session_id
            );
            registry.proposals.remove(&ours);
            let key = SessionKey::new(from.clone(), session_id.clone());
            let session = self.create_session(key.clone(), from.clone());
            registry.sessions.insert(key, session.clone());
            drop(registry);
            let retract = JingleMessage::Retract {
                session_id: ours.session_id.clone(),
                reason: Some(Reason::Cancel),
            };
            if let Err(e) = self.services.transport.send_message(&ours.peer, retract).await {
                warn!("Failed to retract proposal {}: {}", ours.session_id, e);
            }
            self.log_missed(&ours.peer, &ours.session_id, CallDirection::Outgoing)
                .await;
            self.record_ended_proposal(&ours, EndUserState::Ended).await;
            session
                .handle_message(from, JingleMessage::Propose { session_id, media })
                .await;
            return;
        }
        let busy = registry.is_busy();
        drop(registry);

        if self.is_stranger(from).await {
            debug!("Ignoring proposal from stranger {}", from);
            self.log_missed(from, &session_id, CallDirection::Incoming)
                .await;
            return;
        }
        if busy {
            info!("Busy, not ringing for proposal {} from {}", session_id, from);
            self.log_missed(from, &session_id, CallDirection::Incoming)
                .await;
            // another device of ours may still pick it up
            if self.services.roster.own_devices_with_call_support().await == 0 {
                let reject = JingleMessage::Reject {
                    session_id,
                    reason: Some(Reason::Busy),
                };
                if let Err(e) = self.services.transport.send_message(from, reject).await {
                    warn!("Failed to reject proposal from {}: {}", from, e);
                }
            }
            return;
        }
        let key = SessionKey::new(from.clone(), session_id.clone());
        let session = {
            let mut registry = self.registry.lock().await;
            registry
                .sessions
                .entry(key.clone())
                .or_insert_with(|| self.create_session(key, from.clone()))
                .clone()
        };
        session
            .handle_message(from, JingleMessage::Propose { session_id, media })
            .await;
    }

    async fn receive_proceed(&self, from: &Address, message: JingleMessage) {
        let own = self.services.transport.bound_address();
        let session = {
            let mut registry = self.registry.lock().await;
            let Some(proposal) = registry.find_proposal(from, message.session_id()) else {
                debug!(
                    "Proceed from {} for unknown proposal {}",
                    from,
                    message.session_id()
                );
                return;
            };
            registry.proposals.remove(&proposal);
            let key = SessionKey::new(from.clone(), proposal.session_id.clone());
            let session = self.create_session(key.clone(), own);
            registry.sessions.insert(key, session.clone());
            (session, proposal.media)
        };
        let (session, media) = session;
        info!("{} accepted proposal {}", from, session.session_id());
        session.adopt_proposal(media).await;
        session.handle_message(from, message).await;
    }

    async fn receive_reject(&self, from: &Address, session_id: &SessionId) {
        let proposal = {
            let mut registry = self.registry.lock().await;
            let proposal = registry.find_proposal(from, session_id);
            if let Some(proposal) = &proposal {
                registry.proposals.remove(proposal);
            }
            proposal
        };
        let Some(proposal) = proposal else {
            debug!("Reject from {} for unknown proposal {}", from, session_id);
            return;
        };
        info!("{} rejected proposal {}", from, session_id);
        self.log_missed(&proposal.peer, session_id, CallDirection::Outgoing)
            .await;
        self.record_ended_proposal(&proposal, EndUserState::DeclinedOrBusy)
            .await;
    }

    async fn update_proposal(
        &self,
        peer: &Address,
        session_id: &SessionId,
        next: DeviceDiscoveryState,
    ) {
        let mut registry = self.registry.lock().await;
        let Some(proposal) = registry.find_proposal(peer, session_id) else {
            debug!("No proposal {} to {} to update", session_id, peer);
            return;
        };
        let Some(state) = registry.proposals.get_mut(&proposal) else {
            return;
        };
        let Some(advanced) = state.advance(next) else {
            return;
        };
        *state = advanced;
        debug!("Proposal {} is now {:?}", session_id, advanced);
        self.events.emit_proposal(ProposalUpdated {
            peer: proposal.peer,
            session_id: proposal.session_id,
            state: advanced,
        });
    }

    // Outbound

    /// Propose a call to every device of `peer`.
    pub async fn propose(&self, peer: &Address, media: MediaSet) -> Result<SessionId, CallError> {
        if media.is_empty() {
            return Err(CallError::InvalidArgument("no media to propose".into()));
        }
        let peer = peer.bare();
        let proposal = {
            let mut registry = self.registry.lock().await;
            let existing = registry
                .proposals
                .iter()
                .find(|(p, state)| state.is_open() && p.peer == peer && p.media == media)
                .map(|(p, state)| (p.clone(), *state));
            if let Some((proposal, state)) = existing {
                debug!("Proposal {} to {} already exists", proposal.session_id, peer);
                self.events.emit_proposal(ProposalUpdated {
                    peer: proposal.peer,
                    session_id: proposal.session_id.clone(),
                    state,
                });
                return Ok(proposal.session_id);
            }
            if registry.is_busy() {
                return Err(CallError::Busy);
            }
            registry
                .proposals
                .retain(|p, state| state.is_open() || p.peer != peer);
            let proposal = Proposal::new(&peer, media.clone());
            registry
                .proposals
                .insert(proposal.clone(), DeviceDiscoveryState::Searching);
            proposal
        };
        info!("Proposing {:?} call {} to {}", media, proposal.session_id, peer);
        self.events.emit_proposal(ProposalUpdated {
            peer: peer.clone(),
            session_id: proposal.session_id.clone(),
            state: DeviceDiscoveryState::Searching,
        });
        let message = JingleMessage::Propose {
            session_id: proposal.session_id.clone(),
            media,
        };
        let next = match self.services.transport.send_message(&peer, message).await {
            Ok(()) => DeviceDiscoveryState::SearchingAcknowledged,
            Err(e) => {
                warn!("Failed to send proposal to {}: {}", peer, e);
                DeviceDiscoveryState::Failed
            }
        };
        self.update_proposal(&peer, &proposal.session_id, next).await;
        Ok(proposal.session_id)
    }

    /// Withdraw our proposal to `peer` before it was answered.
    pub async fn retract_proposal(&self, peer: &Address) -> Result<(), CallError> {
        let peer = peer.bare();
        let proposal = {
            let mut registry = self.registry.lock().await;
            let proposal = registry.proposals.keys().find(|p| p.peer == peer).cloned();
            if let Some(proposal) = &proposal {
                registry.proposals.remove(proposal);
            }
            proposal
        };
        let Some(proposal) = proposal else {
            return Err(CallError::NotFound(format!("no proposal to {peer}")));
        };
        info!("Retracting proposal {} to {}", proposal.session_id, peer);
        self.log_missed(&peer, &proposal.session_id, CallDirection::Outgoing)
            .await;
        let retract = JingleMessage::Retract {
            session_id: proposal.session_id.clone(),
            reason: Some(Reason::Cancel),
        };
        if let Err(e) = self.services.transport.send_message(&peer, retract).await {
            warn!("Failed to send retract to {}: {}", peer, e);
        }
        self.record_ended_proposal(&proposal, EndUserState::Ended).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CallManagerConfig::default();
        assert_eq!(config.ring_timeout, Duration::from_secs(30));
        assert!(config.verification_enabled);
        assert!(!config.notify_strangers);
    }

    #[test]
    fn test_config_debug_hides_device_id() {
        let config = CallManagerConfig {
            own_device_id: Some(4242),
            ..Default::default()
        };
        let debug = format!("{config:?}");
        assert!(debug.contains("own_device_id: true"));
        assert!(!debug.contains("4242"));
    }
}
