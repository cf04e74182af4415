//! One RTP session: the JMI pre-call handshake followed by the Jingle session.
//!
//! A [`JingleSession`] is a single logical actor. Inbound stanzas, user
//! actions, media events, IQ responses and the ringing timer all go through
//! the same lock on [`SessionInner`]. IQ round-trips are detached: the IQ is
//! written while the lock is held, and the response is handled by a task
//! that re-acquires the lock.
//!
//! Content renegotiation and ICE restarts live in
//! [`renegotiation`](super::renegotiation).

use super::collaborators::{CallDirection, CallLogEntry, CallOutcome};
use super::encryption::{open_contents, seal_contents};
use super::error::{CallError, reason_of};
use super::events::{CallEventBus, ContentAdditionChanged, EndUserStateChanged};
use super::manager::{CallManager, CallManagerConfig, CallServices, TerminatedSessionRecord};
use super::media::{MediaEngine, MediaError, MediaEvent};
use super::transport::{PendingIq, await_response};
use chrono::{DateTime, Utc};
use jinglecore::address::Address;
use jinglecore::content::{
    ContentAddition, ContentDirection, ContentMap, ContentMapError, DtlsSetup, IceCandidate,
};
use jinglecore::media::MediaSet;
use jinglecore::protocol::{
    ErrorCondition, InboundIq, IqReply, IqResponse, JingleAction, JingleMessage, JinglePacket,
    RtpContents, SessionId,
};
use jinglecore::state::{
    EndUserInputs, EndUserState, InvalidTransition, PeerConnectionState, Reason, SessionState,
};
use jinglecore::verification::VerificationBinder;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// Registry key of a session: the peer's full address and the session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub peer: Address,
    pub session_id: SessionId,
}

impl SessionKey {
    pub fn new(peer: Address, session_id: SessionId) -> Self {
        Self { peer, session_id }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.peer, self.session_id)
    }
}

/// The single outstanding content modification of a session.
#[derive(Debug, Clone, Default)]
pub enum PendingContentChange {
    #[default]
    None,
    /// Offered by the peer, waiting for a local decision.
    Incoming(ContentMap),
    /// Offered by us, waiting for content-accept or content-reject.
    Outgoing(ContentMap),
}

impl PendingContentChange {
    pub fn direction(&self) -> Option<ContentDirection> {
        match self {
            Self::None => None,
            Self::Incoming(_) => Some(ContentDirection::Incoming),
            Self::Outgoing(_) => Some(ContentDirection::Outgoing),
        }
    }

    pub fn addition(&self) -> Option<ContentAddition> {
        match self {
            Self::None => None,
            Self::Incoming(map) => Some(ContentAddition::of(ContentDirection::Incoming, map)),
            Self::Outgoing(map) => Some(ContentAddition::of(ContentDirection::Outgoing, map)),
        }
    }
}

/// Reply to a Jingle IQ for a session that already ended. Late candidates
/// and a crossing session-terminate are acknowledged.
pub(super) fn ended_session_reply(action: JingleAction) -> IqReply {
    match action {
        JingleAction::SessionTerminate | JingleAction::TransportInfo => IqReply::Result,
        _ => IqReply::Error(ErrorCondition::OutOfOrder),
    }
}

/// What an outgoing IQ was for, so its response can be interpreted.
#[derive(Debug, Clone)]
pub(super) enum IqPurpose {
    Plain,
    /// transport-info with local candidates. Errors are not fatal.
    Candidates,
    ContentAdd,
    /// Our ICE restart offer; becomes the local content map once acked.
    IceRestart(ContentMap),
}

pub(super) struct SessionInner {
    pub state: SessionState,
    /// Nominal initiator. Compared against the bound address on every use.
    pub initiator: Address,
    pub proposed_media: Option<MediaSet>,
    pub initiator_contents: Option<ContentMap>,
    pub responder_contents: Option<ContentMap>,
    pub pending_content: PendingContentChange,
    pub binder: VerificationBinder,
    pub peer_dtls_setup: Option<DtlsSetup>,
    pub media: Option<Arc<dyn MediaEngine>>,
    /// Remote candidates that arrived before they could be applied.
    pub pending_remote_candidates: Vec<(String, IceCandidate)>,
    /// Local candidates gathered before the peer may receive them.
    pub buffered_local_candidates: Vec<(String, IceCandidate)>,
    pub ready_for_local_candidates: bool,
    pub peer_connection: PeerConnectionState,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub was_accepted: bool,
    pub ringing_generation: u64,
    pub ringing_task: Option<JoinHandle<()>>,
    pub last_end_user_state: Option<EndUserState>,
}

impl SessionInner {
    fn new(initiator: Address) -> Self {
        Self {
            state: SessionState::Null,
            initiator,
            proposed_media: None,
            initiator_contents: None,
            responder_contents: None,
            pending_content: PendingContentChange::None,
            binder: VerificationBinder::new(),
            peer_dtls_setup: None,
            media: None,
            pending_remote_candidates: Vec::new(),
            buffered_local_candidates: Vec::new(),
            ready_for_local_candidates: false,
            peer_connection: PeerConnectionState::New,
            connected_at: None,
            ended_at: None,
            was_accepted: false,
            ringing_generation: 0,
            ringing_task: None,
            last_end_user_state: None,
        }
    }

    pub fn local_contents(&self, is_initiator: bool) -> Option<&ContentMap> {
        if is_initiator {
            self.initiator_contents.as_ref()
        } else {
            self.responder_contents.as_ref()
        }
    }

    pub fn remote_contents(&self, is_initiator: bool) -> Option<&ContentMap> {
        if is_initiator {
            self.responder_contents.as_ref()
        } else {
            self.initiator_contents.as_ref()
        }
    }

    pub fn set_local_contents(&mut self, is_initiator: bool, contents: ContentMap) {
        if is_initiator {
            self.initiator_contents = Some(contents);
        } else {
            self.responder_contents = Some(contents);
        }
    }

    pub fn set_remote_contents(&mut self, is_initiator: bool, contents: ContentMap) {
        if is_initiator {
            self.responder_contents = Some(contents);
        } else {
            self.initiator_contents = Some(contents);
        }
    }

    /// Negotiated media, or the proposed media before negotiation.
    pub fn media_set(&self) -> MediaSet {
        match &self.initiator_contents {
            Some(contents) => contents.media(),
            None => self.proposed_media.clone().unwrap_or_default(),
        }
    }

    fn call_duration(&self) -> Duration {
        let Some(started) = self.connected_at else {
            return Duration::ZERO;
        };
        let ended = self.ended_at.unwrap_or_else(Utc::now);
        ended
            .signed_duration_since(started)
            .to_std()
            .unwrap_or_default()
    }
}

pub struct JingleSession {
    key: SessionKey,
    services: Arc<CallServices>,
    events: Arc<CallEventBus>,
    config: CallManagerConfig,
    manager: Weak<CallManager>,
    weak_self: Weak<JingleSession>,
    terminated: AtomicBool,
    pub(super) inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for JingleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JingleSession")
            .field("key", &self.key)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl JingleSession {
    pub(super) fn new(
        key: SessionKey,
        initiator: Address,
        services: Arc<CallServices>,
        events: Arc<CallEventBus>,
        config: CallManagerConfig,
        manager: Weak<CallManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            key,
            services,
            events,
            config,
            manager,
            weak_self: weak_self.clone(),
            terminated: AtomicBool::new(false),
            inner: Mutex::new(SessionInner::new(initiator)),
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn peer(&self) -> &Address {
        &self.key.peer
    }

    pub fn session_id(&self) -> &SessionId {
        &self.key.session_id
    }

    /// Set once the session reached a terminal state and left the registry.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn is_initiator(&self) -> bool {
        let inner = self.inner.lock().await;
        self.initiator(&inner)
    }

    pub async fn end_user_state(&self) -> EndUserState {
        let inner = self.inner.lock().await;
        self.derive_end_user_state(&inner)
    }

    pub async fn pending_content_addition(&self) -> Option<ContentAddition> {
        self.inner.lock().await.pending_content.addition()
    }

    pub async fn media(&self) -> MediaSet {
        self.inner.lock().await.media_set()
    }

    /// Time since media first connected, frozen once the session ended.
    pub async fn call_duration(&self) -> Duration {
        self.inner.lock().await.call_duration()
    }

    pub(super) fn initiator(&self, inner: &SessionInner) -> bool {
        inner.initiator == self.services.transport.bound_address()
    }

    fn derive_end_user_state(&self, inner: &SessionInner) -> EndUserState {
        EndUserState::derive(EndUserInputs {
            state: inner.state,
            is_initiator: self.initiator(inner),
            peer_connection: inner.peer_connection,
            pending_content: inner.pending_content.direction(),
            was_connected: inner.connected_at.is_some(),
        })
    }

    /// Publish the end-user state if it changed.
    pub(super) fn notify(&self, inner: &mut SessionInner) {
        let state = self.derive_end_user_state(inner);
        if inner.last_end_user_state == Some(state) {
            return;
        }
        inner.last_end_user_state = Some(state);
        self.events.emit_end_user_state(EndUserStateChanged {
            peer: self.key.peer.clone(),
            session_id: self.key.session_id.clone(),
            state,
        });
    }

    pub(super) fn set_pending_content(&self, inner: &mut SessionInner, change: PendingContentChange) {
        inner.pending_content = change;
        self.events.emit_content_addition(ContentAdditionChanged {
            peer: self.key.peer.clone(),
            session_id: self.key.session_id.clone(),
            addition: inner.pending_content.addition(),
        });
        self.notify(inner);
    }

    /// Apply a transition if the table allows it. Returns false, with nothing
    /// changed, otherwise.
    pub(super) fn try_transition(&self, inner: &mut SessionInner, target: SessionState) -> bool {
        match inner.state.transition(target) {
            Ok(()) => {
                debug!("[{}] {} -> state {}", self.key, self.key.session_id, target);
                if target == SessionState::SessionAccepted {
                    inner.was_accepted = true;
                }
                self.notify(inner);
                true
            }
            Err(e) => {
                debug!("[{}] {}", self.key, e);
                false
            }
        }
    }

    fn transition_or_fail(
        &self,
        inner: &mut SessionInner,
        target: SessionState,
    ) -> Result<(), CallError> {
        if self.try_transition(inner, target) {
            Ok(())
        } else {
            Err(InvalidTransition {
                current: inner.state,
                attempted: target,
            }
            .into())
        }
    }

    // Outbound plumbing

    pub(super) async fn respond(&self, iq: &InboundIq, reply: IqReply) {
        self.services.transport.respond(iq, reply).await;
    }

    pub(super) async fn respond_ok(&self, iq: &InboundIq) {
        self.respond(iq, IqReply::Result).await;
    }

    /// Write an IQ and handle its response on a detached task.
    pub(super) async fn send_iq(&self, packet: JinglePacket, purpose: IqPurpose) {
        let action = packet.action;
        let pending = self
            .services
            .transport
            .send_iq(&self.key.peer, packet)
            .await;
        self.spawn_iq_response(action, purpose, pending);
    }

    fn spawn_iq_response(&self, action: JingleAction, purpose: IqPurpose, pending: PendingIq) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            let response = await_response(pending).await;
            if let Some(session) = weak.upgrade() {
                session.on_iq_response(action, purpose, response).await;
            }
        });
    }

    async fn send_message(&self, to: &Address, message: JingleMessage) {
        let name = message.name();
        if let Err(e) = self.services.transport.send_message(to, message).await {
            warn!("[{}] Failed to send {} to {}: {}", self.key, name, to, e);
        }
    }

    pub(super) fn packet(&self, action: JingleAction) -> JinglePacket {
        JinglePacket::new(action, self.key.session_id.clone())
    }

    async fn on_iq_response(&self, action: JingleAction, purpose: IqPurpose, response: IqResponse) {
        let mut inner = self.inner.lock().await;
        match response {
            IqResponse::Result => {
                debug!("[{}] {} acknowledged", self.key, action);
                if let IqPurpose::IceRestart(offer) = purpose {
                    self.ice_restart_acknowledged(&mut inner, offer).await;
                }
            }
            IqResponse::Error(condition) => {
                if condition.is_tie_break() {
                    match purpose {
                        IqPurpose::ContentAdd => {
                            info!("[{}] Our content-add lost a tie-break", self.key);
                            if matches!(inner.pending_content, PendingContentChange::Outgoing(_)) {
                                self.set_pending_content(&mut inner, PendingContentChange::None);
                            }
                            return;
                        }
                        IqPurpose::IceRestart(_) => {
                            info!("[{}] Our ICE restart lost a tie-break", self.key);
                            return;
                        }
                        IqPurpose::Plain | IqPurpose::Candidates => {}
                    }
                }
                if matches!(purpose, IqPurpose::Candidates) {
                    debug!("[{}] Peer refused candidates with {}", self.key, condition);
                    return;
                }
                self.handle_iq_error(&mut inner, action, condition).await;
            }
            IqResponse::Timeout => {
                if inner.state.is_terminal() {
                    return;
                }
                warn!("[{}] {} timed out", self.key, action);
                self.close_and_finish(&mut inner, SessionState::TerminatedConnectivityError)
                    .await;
            }
        }
    }

    async fn handle_iq_error(
        &self,
        inner: &mut SessionInner,
        action: JingleAction,
        condition: ErrorCondition,
    ) {
        if inner.state.is_terminal() {
            debug!(
                "[{}] Ignoring {} error for {} after termination",
                self.key, condition, action
            );
            return;
        }
        warn!("[{}] Peer answered {} with {}", self.key, action, condition);
        let target = if condition.is_remote_unavailable() {
            SessionState::TerminatedConnectivityError
        } else {
            SessionState::TerminatedApplicationFailure
        };
        self.close_and_finish(inner, target).await;
    }

    // Media

    pub(super) fn setup_media(
        &self,
        inner: &mut SessionInner,
        media: &MediaSet,
    ) -> Result<Arc<dyn MediaEngine>, CallError> {
        if let Some(engine) = &inner.media {
            return Ok(engine.clone());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = self.services.media.create(media, tx)?;
        inner.media = Some(engine.clone());
        self.spawn_media_pump(rx);
        Ok(engine)
    }

    pub(super) fn engine(inner: &SessionInner) -> Result<Arc<dyn MediaEngine>, CallError> {
        inner.media.clone().ok_or(CallError::Media(MediaError::Closed))
    }

    fn spawn_media_pump(&self, mut rx: mpsc::UnboundedReceiver<MediaEvent>) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                if session.is_terminated() {
                    break;
                }
                session.on_media_event(event).await;
            }
        });
    }

    async fn on_media_event(&self, event: MediaEvent) {
        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            return;
        }
        match event {
            MediaEvent::IceCandidate { content, candidate } => {
                if inner.ready_for_local_candidates {
                    self.send_transport_info(&mut inner, vec![(content, candidate)])
                        .await;
                } else {
                    inner.buffered_local_candidates.push((content, candidate));
                }
            }
            MediaEvent::ConnectionStateChanged(state) => {
                debug!("[{}] Peer connection {:?}", self.key, state);
                inner.peer_connection = state;
                if state == PeerConnectionState::Connected && inner.connected_at.is_none() {
                    inner.connected_at = Some(Utc::now());
                }
                self.notify(&mut inner);
                if state == PeerConnectionState::Failed {
                    self.on_connection_failed(&mut inner).await;
                }
            }
            MediaEvent::RenegotiationNeeded => {
                if inner.state == SessionState::SessionAccepted {
                    self.renegotiate(&mut inner).await;
                } else {
                    debug!(
                        "[{}] Ignoring renegotiation request in state {}",
                        self.key, inner.state
                    );
                }
            }
        }
    }

    /// Send local candidates as one transport-info.
    pub(super) async fn send_transport_info(
        &self,
        inner: &mut SessionInner,
        candidates: Vec<(String, IceCandidate)>,
    ) {
        let is_initiator = self.initiator(inner);
        let Some(local) = inner.local_contents(is_initiator) else {
            warn!("[{}] No local contents to send candidates for", self.key);
            return;
        };
        let (known, unknown): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|(name, _)| local.get(name).is_some());
        for (name, _) in &unknown {
            warn!("[{}] Dropping candidate for unknown content {}", self.key, name);
        }
        if known.is_empty() {
            return;
        }
        let payload = local.transport_info_with_candidates(&known);
        let packet = self
            .packet(JingleAction::TransportInfo)
            .with_plain_contents(payload);
        self.send_iq(packet, IqPurpose::Candidates).await;
    }

    /// Allow local candidates to flow and send everything buffered so far.
    pub(super) async fn release_local_candidates(&self, inner: &mut SessionInner) {
        inner.ready_for_local_candidates = true;
        let buffered = std::mem::take(&mut inner.buffered_local_candidates);
        if !buffered.is_empty() {
            self.send_transport_info(inner, buffered).await;
        }
    }

    /// Feed backlogged remote candidates matching the current remote
    /// credentials to the media engine.
    pub(super) async fn apply_pending_remote_candidates(
        &self,
        inner: &mut SessionInner,
        engine: &Arc<dyn MediaEngine>,
    ) {
        let is_initiator = self.initiator(inner);
        let pending = std::mem::take(&mut inner.pending_remote_candidates);
        let Some(remote) = inner.remote_contents(is_initiator) else {
            inner.pending_remote_candidates = pending;
            return;
        };
        let credentials = remote.credentials_by_content();
        let mut applicable = Vec::new();
        for (name, candidate) in pending {
            let Some(current) = credentials.get(&name) else {
                debug!("[{}] Dropping candidate for unknown content {}", self.key, name);
                continue;
            };
            if candidate
                .username_fragment
                .as_ref()
                .is_some_and(|ufrag| *ufrag != current.ufrag)
            {
                debug!("[{}] Dropping candidate with stale ufrag", self.key);
                continue;
            }
            applicable.push((name, candidate));
        }
        self.add_remote_candidates(engine, applicable).await;
    }

    pub(super) async fn add_remote_candidates(
        &self,
        engine: &Arc<dyn MediaEngine>,
        candidates: Vec<(String, IceCandidate)>,
    ) {
        for (name, candidate) in candidates {
            if let Err(e) = engine.add_ice_candidate(&name, &candidate).await {
                warn!("[{}] Failed to add candidate to {}: {}", self.key, name, e);
            }
        }
    }

    /// Close the media engine. Safe to call repeatedly; the engine is closed
    /// at most once.
    pub(super) async fn close_media(&self, inner: &mut SessionInner) {
        if let Some(engine) = inner.media.take() {
            engine.close().await;
        }
        if inner.ended_at.is_none() {
            inner.ended_at = Some(Utc::now());
        }
    }

    // Termination

    /// Send session-terminate. Every local termination of a Jingle session
    /// goes through here.
    ///
    /// # Panics
    ///
    /// If the reason's terminal state is not a legal successor of the current
    /// state. Callers only terminate live sessions.
    pub(super) async fn terminate(&self, inner: &mut SessionInner, reason: Reason, text: Option<String>) {
        let previous = inner.state;
        let target = reason.to_state();
        self.close_media(inner).await;
        if let Err(e) = inner.state.transition(target) {
            panic!("[{}] session-terminate({reason}) is impossible: {e}", self.key);
        }
        info!(
            "[{}] Terminating session: {} {}",
            self.key,
            reason,
            text.as_deref().unwrap_or_default()
        );
        self.notify(inner);
        if previous != SessionState::Null {
            self.write_log(inner, target).await;
        }
        let packet = self
            .packet(JingleAction::SessionTerminate)
            .with_reason(reason, text);
        self.send_iq(packet, IqPurpose::Plain).await;
        self.finish(inner).await;
    }

    /// End the session locally without notifying the peer.
    pub(super) async fn close_and_finish(&self, inner: &mut SessionInner, target: SessionState) {
        let previous = inner.state;
        self.close_media(inner).await;
        if !self.try_transition(inner, target) {
            warn!(
                "[{}] Cannot end session in {} from {}",
                self.key, target, previous
            );
            return;
        }
        if previous != SessionState::Null {
            self.write_log(inner, target).await;
        }
        self.finish(inner).await;
    }

    /// Reply out-of-order and end a live session with an application failure.
    pub(super) async fn terminate_with_out_of_order(&self, inner: &mut SessionInner, iq: &InboundIq) {
        if inner.state.is_terminal() {
            self.respond(iq, IqReply::Error(ErrorCondition::OutOfOrder))
                .await;
            return;
        }
        info!(
            "[{}] Terminating with out-of-order after {} in {}",
            self.key, iq.packet.action, inner.state
        );
        let previous = inner.state;
        self.close_media(inner).await;
        let transitioned = self.try_transition(inner, SessionState::TerminatedApplicationFailure);
        self.respond(iq, IqReply::Error(ErrorCondition::OutOfOrder))
            .await;
        if transitioned {
            if previous != SessionState::Null {
                self.write_log(inner, SessionState::TerminatedApplicationFailure)
                    .await;
            }
            self.finish(inner).await;
        }
    }

    /// Close media and terminate with the reason matching `error`.
    pub(super) async fn fail(&self, inner: &mut SessionInner, error: CallError) {
        if inner.state.is_terminal() {
            debug!("[{}] Ignoring failure after termination: {}", self.key, error);
            return;
        }
        warn!("[{}] Session failed: {}", self.key, error);
        let reason = reason_of(&error);
        self.terminate(inner, reason, Some(error.to_string())).await;
    }

    fn outcome(&self, inner: &SessionInner, target: SessionState) -> CallOutcome {
        match target {
            SessionState::Accepted => CallOutcome::Success {
                duration: Duration::ZERO,
            },
            SessionState::TerminatedSuccess => CallOutcome::Success {
                duration: inner.call_duration(),
            },
            SessionState::TerminatedConnectivityError if inner.was_accepted => {
                CallOutcome::Success {
                    duration: inner.call_duration(),
                }
            }
            _ => CallOutcome::Missed,
        }
    }

    async fn write_log(&self, inner: &SessionInner, target: SessionState) {
        let entry = CallLogEntry {
            peer: self.key.peer.bare(),
            session_id: self.key.session_id.clone(),
            direction: if self.initiator(inner) {
                CallDirection::Outgoing
            } else {
                CallDirection::Incoming
            },
            outcome: self.outcome(inner, target),
            recorded_at: Utc::now(),
        };
        self.services.call_log.record(entry).await;
    }

    /// Leave the registry. The session is terminal from here on.
    async fn finish(&self, inner: &mut SessionInner) {
        self.cancel_ringing(inner);
        self.close_media(inner).await;
        inner.pending_content = PendingContentChange::None;
        inner.buffered_local_candidates.clear();
        inner.pending_remote_candidates.clear();
        self.terminated.store(true, Ordering::Release);
        let record = TerminatedSessionRecord {
            end_user_state: self.derive_end_user_state(inner),
            media: inner.media_set(),
        };
        if let Some(manager) = self.manager.upgrade() {
            manager.finish_session(&self.key, record).await;
        }
    }

    // Ringing

    fn start_ringing(&self, inner: &mut SessionInner) {
        self.cancel_ringing(inner);
        let generation = inner.ringing_generation;
        let timeout = self.config.ring_timeout;
        let weak = self.weak_self.clone();
        inner.ringing_task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = weak.upgrade() {
                session.ringing_timeout(generation).await;
            }
        }));
    }

    fn cancel_ringing(&self, inner: &mut SessionInner) {
        inner.ringing_generation += 1;
        if let Some(task) = inner.ringing_task.take() {
            task.abort();
        }
    }

    async fn ringing_timeout(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.ringing_generation != generation {
            return;
        }
        // this task is the ringing task; it must not abort itself
        inner.ringing_task = None;
        match inner.state {
            SessionState::Proposed => {
                info!("[{}] Ringing timed out", self.key);
                self.reject_from_proposed(&mut inner).await;
            }
            SessionState::SessionInitialized => {
                info!("[{}] Ringing timed out", self.key);
                self.terminate(&mut inner, Reason::Decline, None).await;
            }
            _ => {}
        }
    }

    // Inbound Jingle

    pub(super) async fn handle_iq(&self, iq: InboundIq) {
        let mut inner = self.inner.lock().await;
        debug!(
            "[{}] Received {} in state {}",
            self.key, iq.packet.action, inner.state
        );
        // routed here while the session was finishing
        if inner.state.is_terminal() {
            debug!("[{}] Received {} after termination", self.key, iq.packet.action);
            self.respond(&iq, ended_session_reply(iq.packet.action)).await;
            return;
        }
        match iq.packet.action {
            JingleAction::SessionInitiate => self.receive_session_initiate(&mut inner, &iq).await,
            JingleAction::SessionAccept => self.receive_session_accept(&mut inner, &iq).await,
            JingleAction::SessionTerminate => self.receive_session_terminate(&mut inner, &iq).await,
            JingleAction::TransportInfo => self.receive_transport_info(&mut inner, &iq).await,
            JingleAction::ContentAdd => self.receive_content_add(&mut inner, &iq).await,
            JingleAction::ContentAccept => self.receive_content_accept(&mut inner, &iq).await,
            JingleAction::ContentReject => self.receive_content_reject(&mut inner, &iq).await,
            JingleAction::ContentRemove => self.receive_content_remove(&mut inner, &iq).await,
        }
    }

    /// Unwrap the contents of a packet, binding the sender's verification.
    pub(super) async fn obtain_contents(
        &self,
        inner: &mut SessionInner,
        packet: &JinglePacket,
        expect_envelope: bool,
    ) -> Result<ContentMap, CallError> {
        let contents = packet
            .contents
            .as_ref()
            .ok_or_else(|| ContentMapError::Malformed(format!("{} without contents", packet.action)))?;
        open_contents(
            self.services.crypto.as_ref(),
            &mut inner.binder,
            contents,
            &self.key.peer,
            expect_envelope,
        )
        .await
    }

    /// Wrap outgoing contents for the peer, encrypting the fingerprints once
    /// the peer's device is known.
    pub(super) async fn seal(
        &self,
        inner: &mut SessionInner,
        contents: &ContentMap,
    ) -> Result<RtpContents, CallError> {
        seal_contents(
            self.services.crypto.as_ref(),
            &mut inner.binder,
            contents,
            &self.key.peer,
        )
        .await
    }

    async fn receive_session_initiate(&self, inner: &mut SessionInner, iq: &InboundIq) {
        if self.initiator(inner) {
            warn!("[{}] Received session-initiate as initiator", self.key);
            self.terminate_with_out_of_order(inner, iq).await;
            return;
        }
        let contents = match self.obtain_contents(inner, &iq.packet, true).await {
            Ok(contents) => contents,
            Err(e) => {
                self.respond_ok(iq).await;
                self.fail(inner, e).await;
                return;
            }
        };
        let validated = contents
            .require_content_descriptions()
            .and_then(|()| contents.require_dtls_fingerprint(true));
        if let Err(e) = validated {
            self.respond_ok(iq).await;
            self.fail(inner, e.into()).await;
            return;
        }
        let target = if inner.state == SessionState::Proceed {
            SessionState::SessionInitializedPreApproved
        } else {
            SessionState::SessionInitialized
        };
        if !inner.state.can_transition_to(target) {
            self.terminate_with_out_of_order(inner, iq).await;
            return;
        }
        let candidates = contents.candidates();
        inner.initiator_contents = Some(contents);
        self.try_transition(inner, target);
        self.respond_ok(iq).await;
        inner.pending_remote_candidates.extend(candidates);
        if target == SessionState::SessionInitializedPreApproved {
            self.send_session_accept(inner).await;
        } else {
            self.start_ringing(inner);
        }
    }

    /// Answer the initiator's offer.
    async fn send_session_accept(&self, inner: &mut SessionInner) {
        let Some(offer) = inner.initiator_contents.clone() else {
            self.fail(inner, ContentMapError::Malformed("no offer to accept".into()).into())
                .await;
            return;
        };
        let offered = offer.media();
        if let Some(proposed) = &inner.proposed_media
            && *proposed != offered
        {
            let text = format!(
                "proposal included media {proposed:?} but session-initiate offered {offered:?}"
            );
            self.terminate(inner, Reason::SecurityError, Some(text)).await;
            return;
        }
        let packet = match self.prepare_session_accept(inner, &offer).await {
            Ok(packet) => packet,
            Err(e) => {
                self.fail(inner, e).await;
                return;
            }
        };
        if !self.try_transition(inner, SessionState::SessionAccepted) {
            return;
        }
        self.send_iq(packet, IqPurpose::Plain).await;
        self.release_local_candidates(inner).await;
    }

    async fn prepare_session_accept(
        &self,
        inner: &mut SessionInner,
        offer: &ContentMap,
    ) -> Result<JinglePacket, CallError> {
        let engine = self.setup_media(inner, &offer.media())?;
        engine.apply_remote_offer(offer).await?;
        self.apply_pending_remote_candidates(inner, &engine).await;
        let answer = engine.apply_local_answer().await?;
        inner.peer_dtls_setup = Some(answer.dtls_setup()?.flip()?);
        inner.responder_contents = Some(answer.clone());
        let contents = self.seal(inner, &answer).await?;
        Ok(self
            .packet(JingleAction::SessionAccept)
            .with_initiator(inner.initiator.clone())
            .with_responder(self.services.transport.bound_address())
            .with_contents(contents))
    }

    async fn receive_session_accept(&self, inner: &mut SessionInner, iq: &InboundIq) {
        if !self.initiator(inner) {
            warn!("[{}] Received session-accept as responder", self.key);
            self.terminate_with_out_of_order(inner, iq).await;
            return;
        }
        let contents = match self.obtain_contents(inner, &iq.packet, true).await {
            Ok(contents) => contents,
            Err(e) => {
                self.respond_ok(iq).await;
                self.fail(inner, e).await;
                return;
            }
        };
        let validated = contents
            .require_content_descriptions()
            .and_then(|()| contents.require_dtls_fingerprint(false));
        if let Err(e) = validated {
            self.respond_ok(iq).await;
            self.fail(inner, e.into()).await;
            return;
        }
        let offered = inner
            .initiator_contents
            .as_ref()
            .map(ContentMap::media)
            .unwrap_or_default();
        if offered != contents.media() {
            self.respond_ok(iq).await;
            let text = format!(
                "session-accept answered media {:?} to an offer of {:?}",
                contents.media(),
                offered
            );
            self.terminate(inner, Reason::SecurityError, Some(text)).await;
            return;
        }
        if !inner.state.can_transition_to(SessionState::SessionAccepted) {
            self.terminate_with_out_of_order(inner, iq).await;
            return;
        }
        let candidates = contents.candidates();
        inner.peer_dtls_setup = contents.dtls_setup().ok();
        inner.responder_contents = Some(contents.clone());
        self.try_transition(inner, SessionState::SessionAccepted);
        self.respond_ok(iq).await;
        inner.pending_remote_candidates.extend(candidates);
        let applied = async {
            let engine = Self::engine(inner)?;
            engine.apply_remote_answer(&contents).await?;
            Ok::<_, CallError>(engine)
        }
        .await;
        match applied {
            Ok(engine) => self.apply_pending_remote_candidates(inner, &engine).await,
            Err(e) => {
                warn!("[{}] Unable to apply session-accept: {}", self.key, e);
                self.terminate(inner, Reason::FailedApplication, Some(e.to_string()))
                    .await;
            }
        }
    }

    async fn receive_session_terminate(&self, inner: &mut SessionInner, iq: &InboundIq) {
        self.respond_ok(iq).await;
        let previous = inner.state;
        let reason = iq.packet.reason().unwrap_or(Reason::Unknown);
        info!("[{}] Peer terminated the session: {}", self.key, reason);
        self.close_media(inner).await;
        let mut target = reason.to_state();
        if !self.try_transition(inner, target) {
            warn!(
                "[{}] session-terminate({}) not expected in {}",
                self.key, reason, previous
            );
            target = SessionState::TerminatedApplicationFailure;
            if !self.try_transition(inner, target) {
                return;
            }
        }
        if previous != SessionState::Null {
            self.write_log(inner, target).await;
        }
        self.finish(inner).await;
    }

    // Inbound JMI

    pub(super) async fn handle_message(&self, from: &Address, message: JingleMessage) {
        let mut inner = self.inner.lock().await;
        debug!(
            "[{}] Received {} from {} in state {}",
            self.key,
            message.name(),
            from,
            inner.state
        );
        match message {
            JingleMessage::Propose { media, .. } => {
                self.receive_propose(&mut inner, from, media).await
            }
            JingleMessage::Proceed { device_id, .. } => {
                self.receive_proceed(&mut inner, from, device_id).await
            }
            JingleMessage::Accept { .. } => self.receive_accept(&mut inner, from).await,
            JingleMessage::Reject { .. } => self.receive_reject(&mut inner, from).await,
            JingleMessage::Retract { .. } => self.receive_retract(&mut inner, from).await,
            JingleMessage::Ringing { .. } => {
                debug!("[{}] Ignoring ringing for a live session", self.key);
            }
        }
    }

    fn from_own_account(&self, from: &Address) -> bool {
        from.is_same_account(&self.services.transport.bound_address())
    }

    async fn receive_propose(&self, inner: &mut SessionInner, from: &Address, media: MediaSet) {
        if self.from_own_account(from) {
            debug!("[{}] Saw proposal from myself, ignoring", self.key);
            return;
        }
        if !inner.state.can_transition_to(SessionState::Proposed) {
            debug!(
                "[{}] Ignoring proposal, already in {}",
                self.key, inner.state
            );
            return;
        }
        inner.proposed_media = Some(media);
        self.try_transition(inner, SessionState::Proposed);
        self.start_ringing(inner);
        if self.services.roster.is_trusted(&from.bare()).await {
            let ringing = JingleMessage::Ringing {
                session_id: self.key.session_id.clone(),
            };
            self.send_message(from, ringing).await;
        }
    }

    /// Turn an accepted proposal of ours into a session.
    pub(super) async fn adopt_proposal(&self, media: MediaSet) {
        let mut inner = self.inner.lock().await;
        inner.proposed_media = Some(media);
        self.try_transition(&mut inner, SessionState::Proposed);
    }

    async fn receive_proceed(&self, inner: &mut SessionInner, from: &Address, device_id: Option<u32>) {
        if *from == self.key.peer {
            if !self.initiator(inner) {
                debug!("[{}] Ignoring proceed, we did not initiate", self.key);
                return;
            }
            if !self.try_transition(inner, SessionState::Proceed) {
                debug!("[{}] Ignoring proceed in state {}", self.key, inner.state);
                return;
            }
            match device_id {
                Some(id) if self.config.verification_enabled => {
                    if let Err(e) = inner.binder.set_device_id(id) {
                        self.fail(inner, e.into()).await;
                        return;
                    }
                }
                Some(_) => debug!(
                    "[{}] Peer offered fingerprint verification but it is disabled",
                    self.key
                ),
                None => {}
            }
            self.send_session_initiate(inner).await;
        } else if self.from_own_account(from) {
            if inner.state.can_transition_to(SessionState::Accepted) {
                info!("[{}] Call was answered on another device", self.key);
                self.close_and_finish(inner, SessionState::Accepted).await;
            }
        } else {
            debug!("[{}] Ignoring proceed from {}", self.key, from);
        }
    }

    async fn send_session_initiate(&self, inner: &mut SessionInner) {
        let media = inner.proposed_media.clone().unwrap_or_default();
        match self.prepare_session_initiate(inner, &media).await {
            Ok(packet) => {
                if !self.try_transition(inner, SessionState::SessionInitializedPreApproved) {
                    return;
                }
                self.send_iq(packet, IqPurpose::Plain).await;
                self.release_local_candidates(inner).await;
            }
            Err(e) => {
                warn!("[{}] Unable to send session-initiate: {}", self.key, e);
                let retract = JingleMessage::Retract {
                    session_id: self.key.session_id.clone(),
                    reason: Some(reason_of(&e)),
                };
                self.send_message(&self.key.peer, retract).await;
                self.close_and_finish(inner, reason_of(&e).to_state()).await;
            }
        }
    }

    async fn prepare_session_initiate(
        &self,
        inner: &mut SessionInner,
        media: &MediaSet,
    ) -> Result<JinglePacket, CallError> {
        if media.is_empty() {
            return Err(CallError::InvalidArgument("no media proposed".into()));
        }
        let engine = self.setup_media(inner, media)?;
        let offer = engine.apply_local_offer().await?;
        inner.initiator_contents = Some(offer.clone());
        let contents = self.seal(inner, &offer).await?;
        Ok(self
            .packet(JingleAction::SessionInitiate)
            .with_initiator(self.services.transport.bound_address())
            .with_contents(contents))
    }

    async fn receive_accept(&self, inner: &mut SessionInner, from: &Address) {
        if !self.from_own_account(from) {
            debug!("[{}] Ignoring accept from {}", self.key, from);
            return;
        }
        if inner.state == SessionState::Proposed {
            info!("[{}] Call was accepted on another device", self.key);
            self.close_and_finish(inner, SessionState::Accepted).await;
        } else {
            debug!("[{}] Unable to accept in state {}", self.key, inner.state);
        }
    }

    async fn receive_reject(&self, inner: &mut SessionInner, from: &Address) {
        if self.from_own_account(from) {
            if inner.state == SessionState::Proposed {
                info!("[{}] Call was rejected on another device", self.key);
                self.close_and_finish(inner, SessionState::Rejected).await;
            } else {
                debug!("[{}] Unable to reject in state {}", self.key, inner.state);
            }
            return;
        }
        if !self.initiator(inner) || *from != self.key.peer {
            debug!("[{}] Ignoring reject from {}", self.key, from);
            return;
        }
        match inner.state {
            SessionState::Proceed => {
                info!("[{}] Callee reconsidered after proceed", self.key);
                self.close_and_finish(inner, SessionState::RejectedRaced).await;
            }
            SessionState::SessionInitializedPreApproved => {
                info!("[{}] Callee reconsidered before session-initiate", self.key);
                self.close_and_finish(inner, SessionState::TerminatedDeclinedOrBusy)
                    .await;
            }
            state => debug!("[{}] Ignoring reject in state {}", self.key, state),
        }
    }

    async fn receive_retract(&self, inner: &mut SessionInner, from: &Address) {
        if *from != self.key.peer {
            debug!("[{}] Ignoring retract from {}", self.key, from);
            return;
        }
        let target = if inner.state == SessionState::Proceed {
            SessionState::RetractedRaced
        } else {
            SessionState::Retracted
        };
        if inner.state.can_transition_to(target) {
            info!("[{}] Caller retracted the call", self.key);
            self.close_and_finish(inner, target).await;
        } else {
            debug!("[{}] Ignoring retract in state {}", self.key, inner.state);
        }
    }

    // User actions

    /// Answer an incoming call.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if self.initiator(&inner) {
            return Err(CallError::InvalidArgument(
                "cannot accept an outgoing call".into(),
            ));
        }
        match inner.state {
            SessionState::Proposed => {
                self.cancel_ringing(&mut inner);
                self.transition_or_fail(&mut inner, SessionState::Proceed)?;
                let own = self.services.transport.bound_address().bare();
                let accept = JingleMessage::Accept {
                    session_id: self.key.session_id.clone(),
                };
                self.send_message(&own, accept).await;
                let device_id = if self.config.verification_enabled {
                    self.config.own_device_id
                } else {
                    None
                };
                let proceed = JingleMessage::Proceed {
                    session_id: self.key.session_id.clone(),
                    device_id,
                };
                self.send_message(&self.key.peer, proceed).await;
                Ok(())
            }
            SessionState::SessionInitialized => {
                self.cancel_ringing(&mut inner);
                self.send_session_accept(&mut inner).await;
                Ok(())
            }
            current => Err(InvalidTransition {
                current,
                attempted: SessionState::SessionAccepted,
            }
            .into()),
        }
    }

    /// Decline an incoming call. A no-op once the session ended.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            state if state.is_terminal() => {
                debug!("[{}] Reject after termination, nothing to do", self.key);
                Ok(())
            }
            SessionState::Proposed if !self.initiator(&inner) => {
                self.reject_from_proposed(&mut inner).await;
                Ok(())
            }
            SessionState::SessionInitialized if !self.initiator(&inner) => {
                self.terminate(&mut inner, Reason::Decline, None).await;
                Ok(())
            }
            current => Err(InvalidTransition {
                current,
                attempted: SessionState::Rejected,
            }
            .into()),
        }
    }

    async fn reject_from_proposed(&self, inner: &mut SessionInner) {
        let reject = JingleMessage::Reject {
            session_id: self.key.session_id.clone(),
            reason: Some(Reason::Decline),
        };
        self.close_and_finish(inner, SessionState::Rejected).await;
        self.send_message(&self.key.peer, reject).await;
    }

    /// Hang up, whatever the call is doing. A no-op once the session ended.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        let is_initiator = self.initiator(&inner);
        match inner.state {
            state if state.is_terminal() => {
                debug!("[{}] End after termination, nothing to do", self.key);
            }
            SessionState::Proposed if !is_initiator => {
                self.reject_from_proposed(&mut inner).await;
            }
            SessionState::Proceed => {
                let (message, target) = if is_initiator {
                    (
                        JingleMessage::Retract {
                            session_id: self.key.session_id.clone(),
                            reason: Some(Reason::Cancel),
                        },
                        SessionState::RetractedRaced,
                    )
                } else {
                    (
                        JingleMessage::Reject {
                            session_id: self.key.session_id.clone(),
                            reason: Some(Reason::Decline),
                        },
                        SessionState::RejectedRaced,
                    )
                };
                self.send_message(&self.key.peer, message).await;
                self.close_and_finish(&mut inner, target).await;
            }
            SessionState::SessionInitialized | SessionState::SessionInitializedPreApproved
                if is_initiator =>
            {
                self.terminate(&mut inner, Reason::Cancel, None).await;
            }
            SessionState::SessionInitialized => {
                self.terminate(&mut inner, Reason::Decline, None).await;
            }
            SessionState::SessionInitializedPreApproved | SessionState::SessionAccepted => {
                self.terminate(&mut inner, Reason::Success, None).await;
            }
            current => {
                return Err(InvalidTransition {
                    current,
                    attempted: SessionState::TerminatedSuccess,
                }
                .into());
            }
        }
        Ok(())
    }
}
