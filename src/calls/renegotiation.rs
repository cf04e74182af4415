//! Mid-call changes: transport-info, ICE restarts and content modifications.

use super::error::CallError;
use super::session::{IqPurpose, JingleSession, PendingContentChange, SessionInner};
use jinglecore::content::{ContentAdditionSummary, ContentMap, ContentMapError, DtlsSetup};
use jinglecore::media::MediaKind;
use jinglecore::protocol::{ErrorCondition, InboundIq, IqReply, JingleAction, RtpContents};
use jinglecore::state::{Reason, SessionState, SignalingState};
use log::{debug, info, warn};

impl JingleSession {
    // transport-info and ICE restarts

    pub(super) async fn receive_transport_info(&self, inner: &mut SessionInner, iq: &InboundIq) {
        let contents = match self.obtain_contents(inner, &iq.packet, false).await {
            Ok(contents) => contents,
            Err(e) => {
                self.respond_ok(iq).await;
                self.fail(inner, e).await;
                return;
            }
        };
        if !inner.state.is_session_established() {
            debug!(
                "[{}] transport-info before session-initiate, state {}",
                self.key(),
                inner.state
            );
            self.respond(iq, IqReply::Error(ErrorCondition::OutOfOrder))
                .await;
            return;
        }
        let is_initiator = self.initiator(inner);
        let known = inner
            .remote_contents(is_initiator)
            .map(ContentMap::names)
            .unwrap_or_default();
        if known.is_disjoint(&contents.names()) || inner.state != SessionState::SessionAccepted {
            self.respond_ok(iq).await;
            inner.pending_remote_candidates.extend(contents.candidates());
            return;
        }
        if self.check_for_ice_restart(inner, iq, &contents).await {
            return;
        }
        self.respond_ok(iq).await;
        inner.pending_remote_candidates.extend(contents.candidates());
        if let Ok(engine) = Self::engine(inner) {
            self.apply_pending_remote_candidates(inner, &engine).await;
        }
    }

    /// Handle a transport-info carrying new credentials. Returns true when
    /// the IQ has been answered.
    async fn check_for_ice_restart(
        &self,
        inner: &mut SessionInner,
        iq: &InboundIq,
        contents: &ContentMap,
    ) -> bool {
        let is_initiator = self.initiator(inner);
        let Some(remote) = inner.remote_contents(is_initiator).cloned() else {
            return false;
        };
        let offered = contents.credentials();
        let Some(credentials) = offered.first() else {
            return false;
        };
        if offered.len() != 1 || remote.credentials().contains(credentials) {
            return false;
        }
        let is_offer = contents.has_empty_candidates();
        info!(
            "[{}] Peer sent ICE restart {} (ufrag {})",
            self.key(),
            if is_offer { "offer" } else { "answer" },
            credentials.ufrag
        );
        let restart = self
            .restart_setup(inner, is_initiator, is_offer)
            .and_then(|setup| Ok(remote.modified_credentials(contents, setup)?));
        let result = match restart {
            Ok(restart) => self.apply_ice_restart(inner, iq, is_offer, restart).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(handled) => handled,
            Err(e) => {
                warn!("[{}] Unable to apply ICE restart: {}", self.key(), e);
                self.respond_ok(iq).await;
                self.close_media(inner).await;
                self.fail(inner, e).await;
                true
            }
        }
    }

    fn restart_setup(
        &self,
        inner: &SessionInner,
        is_initiator: bool,
        is_offer: bool,
    ) -> Result<DtlsSetup, CallError> {
        if is_offer {
            return Ok(DtlsSetup::ActPass);
        }
        let local = inner
            .local_contents(is_initiator)
            .and_then(|local| local.dtls_setup().ok());
        match local {
            Some(setup @ (DtlsSetup::Active | DtlsSetup::Passive)) => Ok(setup.flip()?),
            _ => inner.peer_dtls_setup.ok_or_else(|| {
                ContentMapError::InvalidSetup("peer DTLS setup is unknown".into()).into()
            }),
        }
    }

    async fn apply_ice_restart(
        &self,
        inner: &mut SessionInner,
        iq: &InboundIq,
        is_offer: bool,
        restart: ContentMap,
    ) -> Result<bool, CallError> {
        let is_initiator = self.initiator(inner);
        let engine = Self::engine(inner)?;
        if !is_offer {
            engine.apply_remote_answer(&restart).await?;
            inner.peer_dtls_setup = restart.dtls_setup().ok();
            inner.set_remote_contents(is_initiator, restart);
            return Ok(false);
        }
        if is_initiator && engine.signaling_state() != SignalingState::Stable {
            info!("[{}] ICE restart collision, we win as initiator", self.key());
            self.respond(iq, IqReply::Error(ErrorCondition::TieBreak))
                .await;
            return Ok(true);
        }
        if !inner.ready_for_local_candidates {
            // gathered for our own restart, which the peer's offer supersedes
            inner.buffered_local_candidates.clear();
        }
        engine.apply_remote_offer(&restart).await?;
        inner.set_remote_contents(is_initiator, restart);
        let answer = engine.apply_local_answer().await?;
        inner.set_local_contents(is_initiator, answer);
        self.respond_ok(iq).await;
        self.release_local_candidates(inner).await;
        Ok(true)
    }

    /// Our restart offer was acknowledged and is now the local description.
    pub(super) async fn ice_restart_acknowledged(&self, inner: &mut SessionInner, offer: ContentMap) {
        if inner.state != SessionState::SessionAccepted {
            return;
        }
        let is_initiator = self.initiator(inner);
        inner.set_local_contents(is_initiator, offer);
        self.release_local_candidates(inner).await;
    }

    /// The initiator restarts ICE when the connection fails.
    pub(super) async fn on_connection_failed(&self, inner: &mut SessionInner) {
        if inner.state != SessionState::SessionAccepted || !self.initiator(inner) {
            return;
        }
        let Ok(engine) = Self::engine(inner) else {
            return;
        };
        if engine.signaling_state() != SignalingState::Stable {
            debug!("[{}] Connection failed during negotiation", self.key());
            return;
        }
        info!("[{}] Connection failed, restarting ICE", self.key());
        match engine.restart_ice().await {
            Ok(()) => self.renegotiate(inner).await,
            Err(e) => self.fail(inner, e.into()).await,
        }
    }

    /// Offer the engine's current local configuration to the peer.
    pub(super) async fn renegotiate(&self, inner: &mut SessionInner) {
        let is_initiator = self.initiator(inner);
        let Some(local) = inner.local_contents(is_initiator).cloned() else {
            return;
        };
        let offer = match Self::engine(inner) {
            Ok(engine) => engine.apply_local_offer().await,
            Err(e) => {
                self.fail(inner, e).await;
                return;
            }
        };
        let offer = match offer {
            Ok(offer) => offer,
            Err(e) => {
                self.fail(inner, e.into()).await;
                return;
            }
        };
        let diff = local.diff(&offer);
        let ice_restart = local.credentials() != offer.credentials();
        debug!(
            "[{}] Renegotiating: added {:?} modified {:?} ice restart {}",
            self.key(),
            diff.added,
            diff.modified,
            ice_restart
        );
        if diff.has_modifications() && ice_restart {
            self.terminate(
                inner,
                Reason::FailedApplication,
                Some("ICE restart combined with sender changes".into()),
            )
            .await;
            return;
        }
        if ice_restart {
            inner.ready_for_local_candidates = false;
            let packet = self
                .packet(JingleAction::TransportInfo)
                .with_plain_contents(offer.transport_info());
            self.send_iq(packet, IqPurpose::IceRestart(offer.clone()))
                .await;
        }
        if !diff.added.is_empty() {
            let modification = offer.to_content_modification(&diff.added);
            inner.set_local_contents(is_initiator, offer.active_contents());
            self.send_content_add(inner, modification).await;
        }
    }

    // Content modifications

    async fn send_content_add(&self, inner: &mut SessionInner, modification: ContentMap) {
        info!(
            "[{}] Proposing content-add {}",
            self.key(),
            ContentAdditionSummary::of(&modification)
        );
        let contents = match self.seal(inner, &modification).await {
            Ok(contents) => contents,
            Err(e) => {
                self.fail(inner, e).await;
                return;
            }
        };
        self.set_pending_content(inner, PendingContentChange::Outgoing(modification));
        let packet = self
            .packet(JingleAction::ContentAdd)
            .with_contents(contents);
        self.send_iq(packet, IqPurpose::ContentAdd).await;
    }

    async fn send_content_reject(&self, modification: &ContentMap) {
        let packet = self
            .packet(JingleAction::ContentReject)
            .with_plain_contents(modification.to_stub());
        self.send_iq(packet, IqPurpose::Plain).await;
    }

    /// Parse a content-* payload, requiring descriptions. Payloads carrying
    /// fingerprints must be encrypted once the peer's device is bound.
    async fn obtain_modification(
        &self,
        inner: &mut SessionInner,
        iq: &InboundIq,
        carries_fingerprints: bool,
    ) -> Result<ContentMap, CallError> {
        let modification = self
            .obtain_contents(inner, &iq.packet, carries_fingerprints)
            .await?;
        modification.require_content_descriptions()?;
        Ok(modification)
    }

    pub(super) async fn receive_content_add(&self, inner: &mut SessionInner, iq: &InboundIq) {
        let modification = match self.obtain_modification(inner, iq, true).await {
            Ok(modification) => modification,
            Err(e) => {
                self.respond_ok(iq).await;
                self.close_media(inner).await;
                self.fail(inner, e).await;
                return;
            }
        };
        if inner.state != SessionState::SessionAccepted {
            self.terminate_with_out_of_order(inner, iq).await;
            return;
        }
        let is_initiator = self.initiator(inner);
        let remote = inner
            .remote_contents(is_initiator)
            .cloned()
            .unwrap_or_default();
        if !remote.names().is_disjoint(&modification.names()) {
            self.respond_ok(iq).await;
            self.terminate(
                inner,
                Reason::FailedApplication,
                Some("content-add reuses an existing content name".into()),
            )
            .await;
            return;
        }
        let summary = ContentAdditionSummary::of(&modification);
        match &inner.pending_content {
            PendingContentChange::None => {}
            PendingContentChange::Outgoing(ours) if ContentAdditionSummary::of(ours) == summary => {
                if is_initiator {
                    info!("[{}] content-add collision, we win as initiator", self.key());
                    self.respond(iq, IqReply::Error(ErrorCondition::TieBreak))
                        .await;
                } else {
                    info!("[{}] content-add collision, taking the peer's", self.key());
                    self.respond_ok(iq).await;
                    self.set_pending_content(inner, PendingContentChange::None);
                    self.accept_content_addition(inner, modification).await;
                }
                return;
            }
            _ => {
                debug!(
                    "[{}] Rejecting content-add {} while another is pending",
                    self.key(),
                    summary
                );
                self.respond_ok(iq).await;
                self.send_content_reject(&modification).await;
                return;
            }
        }
        self.respond_ok(iq).await;
        if MediaKind::audio_only(&remote.media()) && MediaKind::video_only(&modification.media()) {
            info!("[{}] Peer wants to add {}", self.key(), summary);
            self.set_pending_content(inner, PendingContentChange::Incoming(modification));
        } else {
            debug!("[{}] Rejecting unsupported content-add {}", self.key(), summary);
            self.send_content_reject(&modification).await;
        }
    }

    async fn accept_content_addition(&self, inner: &mut SessionInner, modification: ContentMap) {
        match self.apply_content_addition(inner, &modification).await {
            Ok(accepted) => {
                let packet = self
                    .packet(JingleAction::ContentAccept)
                    .with_contents(accepted);
                self.send_iq(packet, IqPurpose::Plain).await;
                self.release_local_candidates(inner).await;
                self.notify(inner);
            }
            Err(e) => {
                warn!("[{}] Unable to accept content-add: {}", self.key(), e);
                self.close_media(inner).await;
                self.terminate(inner, Reason::FailedApplication, Some(e.to_string()))
                    .await;
            }
        }
    }

    /// Apply the peer's content-add and return our content-accept payload.
    async fn apply_content_addition(
        &self,
        inner: &mut SessionInner,
        modification: &ContentMap,
    ) -> Result<RtpContents, CallError> {
        let is_initiator = self.initiator(inner);
        let remote = inner
            .remote_contents(is_initiator)
            .ok_or_else(|| ContentMapError::Malformed("no remote contents".into()))?
            .add_content(modification, inner.peer_dtls_setup)?;
        let engine = Self::engine(inner)?;
        engine.apply_remote_offer(&remote).await?;
        inner.set_remote_contents(is_initiator, remote);
        let answer = engine.apply_local_answer().await?;
        inner.set_local_contents(is_initiator, answer.active_contents());
        self.seal(inner, &answer.to_content_modification(&modification.names()))
            .await
    }

    pub(super) async fn receive_content_accept(&self, inner: &mut SessionInner, iq: &InboundIq) {
        let accepted = match self.obtain_modification(inner, iq, true).await {
            Ok(accepted) => accepted,
            Err(e) => {
                self.respond_ok(iq).await;
                self.fail(inner, e).await;
                return;
            }
        };
        let matches = matches!(
            &inner.pending_content,
            PendingContentChange::Outgoing(ours)
                if ContentAdditionSummary::of(ours) == ContentAdditionSummary::of(&accepted)
        );
        if !matches {
            debug!("[{}] content-accept without matching content-add", self.key());
            self.terminate_with_out_of_order(inner, iq).await;
            return;
        }
        self.set_pending_content(inner, PendingContentChange::None);
        self.respond_ok(iq).await;
        info!(
            "[{}] Peer accepted content-add {}",
            self.key(),
            ContentAdditionSummary::of(&accepted)
        );
        if let Err(e) = self.apply_content_accept(inner, &accepted).await {
            warn!("[{}] Unable to apply content-accept: {}", self.key(), e);
            self.terminate(inner, Reason::FailedApplication, Some(e.to_string()))
                .await;
        }
    }

    async fn apply_content_accept(
        &self,
        inner: &mut SessionInner,
        accepted: &ContentMap,
    ) -> Result<(), CallError> {
        let is_initiator = self.initiator(inner);
        let remote = inner
            .remote_contents(is_initiator)
            .ok_or_else(|| ContentMapError::Malformed("no remote contents".into()))?
            .add_content(accepted, inner.peer_dtls_setup)?;
        let engine = Self::engine(inner)?;
        engine.apply_remote_answer(&remote).await?;
        inner.set_remote_contents(is_initiator, remote);
        inner.pending_remote_candidates.extend(accepted.candidates());
        self.apply_pending_remote_candidates(inner, &engine).await;
        Ok(())
    }

    pub(super) async fn receive_content_reject(&self, inner: &mut SessionInner, iq: &InboundIq) {
        let rejected = match self.obtain_modification(inner, iq, false).await {
            Ok(rejected) => rejected,
            Err(e) => {
                self.respond_ok(iq).await;
                self.fail(inner, e).await;
                return;
            }
        };
        let summary = ContentAdditionSummary::of(&rejected);
        let matches = matches!(
            &inner.pending_content,
            PendingContentChange::Outgoing(ours) if ContentAdditionSummary::of(ours) == summary
        );
        if !matches {
            debug!("[{}] content-reject without matching content-add", self.key());
            self.terminate_with_out_of_order(inner, iq).await;
            return;
        }
        self.set_pending_content(inner, PendingContentChange::None);
        self.respond_ok(iq).await;
        info!("[{}] Peer rejected content-add {}", self.key(), summary);
        self.withdraw_content_addition(inner, &summary).await;
    }

    pub(super) async fn receive_content_remove(&self, inner: &mut SessionInner, iq: &InboundIq) {
        let removed = match self.obtain_modification(inner, iq, false).await {
            Ok(removed) => removed,
            Err(e) => {
                self.respond_ok(iq).await;
                self.fail(inner, e).await;
                return;
            }
        };
        self.respond_ok(iq).await;
        let summary = ContentAdditionSummary::of(&removed);
        let matches = matches!(
            &inner.pending_content,
            PendingContentChange::Incoming(theirs) if ContentAdditionSummary::of(theirs) == summary
        );
        if matches {
            info!("[{}] Peer retracted content-add {}", self.key(), summary);
            self.set_pending_content(inner, PendingContentChange::None);
        } else {
            warn!("[{}] content-remove {} is not supported", self.key(), summary);
            self.close_media(inner).await;
            self.terminate(
                inner,
                Reason::FailedApplication,
                Some("content-remove is only supported for pending content-add".into()),
            )
            .await;
        }
    }

    /// Remove the tracks of a content-add the peer never accepted and bring
    /// the media engine back to a stable state. Terminates the session and
    /// returns false if that fails.
    async fn withdraw_content_addition(
        &self,
        inner: &mut SessionInner,
        summary: &ContentAdditionSummary,
    ) -> bool {
        match self.rollback_content_addition(inner, summary).await {
            Ok(()) => true,
            Err(e) => {
                warn!("[{}] Unable to roll back content-add: {}", self.key(), e);
                self.terminate(inner, Reason::FailedApplication, Some(e.to_string()))
                    .await;
                false
            }
        }
    }

    async fn rollback_content_addition(
        &self,
        inner: &mut SessionInner,
        summary: &ContentAdditionSummary,
    ) -> Result<(), CallError> {
        let is_initiator = self.initiator(inner);
        let engine = Self::engine(inner)?;
        for kind in summary.media() {
            engine.remove_track(kind).await?;
        }
        let offer = engine.apply_local_offer().await?;
        let remote = inner
            .remote_contents(is_initiator)
            .ok_or_else(|| ContentMapError::Malformed("no remote contents".into()))?;
        let answer = remote.rollback_answer(&offer, inner.peer_dtls_setup)?;
        engine.apply_remote_answer(&answer).await?;
        inner.set_local_contents(is_initiator, offer.active_contents());
        Ok(())
    }

    // User actions

    /// Add video to an accepted audio call.
    pub async fn add_media(&self, kind: MediaKind) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::SessionAccepted {
            return Err(CallError::InvalidArgument(format!(
                "cannot add media in state {}",
                inner.state
            )));
        }
        if inner.pending_content.direction().is_some() {
            return Err(CallError::InvalidArgument(
                "a content addition is already pending".into(),
            ));
        }
        if kind != MediaKind::Video || !MediaKind::audio_only(&inner.media_set()) {
            return Err(CallError::InvalidArgument(format!(
                "cannot add {kind} to a call with {:?}",
                inner.media_set()
            )));
        }
        let engine = Self::engine(&inner)?;
        engine.add_track(kind).await?;
        self.renegotiate(&mut inner).await;
        Ok(())
    }

    /// Accept the peer's pending content-add, which must match `summary`.
    pub async fn accept_content_add(&self, summary: &ContentAdditionSummary) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        let PendingContentChange::Incoming(modification) = inner.pending_content.clone() else {
            return Err(CallError::NoPendingContentAddition);
        };
        if ContentAdditionSummary::of(&modification) != *summary {
            return Err(CallError::ContentAdditionMismatch);
        }
        self.set_pending_content(&mut inner, PendingContentChange::None);
        self.accept_content_addition(&mut inner, modification).await;
        Ok(())
    }

    pub async fn reject_content_add(&self) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        let PendingContentChange::Incoming(modification) = inner.pending_content.clone() else {
            return Err(CallError::NoPendingContentAddition);
        };
        self.set_pending_content(&mut inner, PendingContentChange::None);
        self.send_content_reject(&modification).await;
        Ok(())
    }

    /// Withdraw our own pending content-add.
    pub async fn retract_content_add(&self) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        let PendingContentChange::Outgoing(modification) = inner.pending_content.clone() else {
            return Err(CallError::NoPendingContentAddition);
        };
        self.set_pending_content(&mut inner, PendingContentChange::None);
        let summary = ContentAdditionSummary::of(&modification);
        if self.withdraw_content_addition(&mut inner, &summary).await {
            let packet = self
                .packet(JingleAction::ContentRemove)
                .with_plain_contents(modification.to_stub());
            self.send_iq(packet, IqPurpose::Plain).await;
        }
        Ok(())
    }

    /// Ask the engine for fresh ICE credentials and offer them to the peer.
    pub async fn restart_ice(&self) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::SessionAccepted {
            return Err(CallError::InvalidArgument(format!(
                "cannot restart ICE in state {}",
                inner.state
            )));
        }
        let engine = Self::engine(&inner)?;
        engine.restart_ice().await?;
        self.renegotiate(&mut inner).await;
        Ok(())
    }
}
