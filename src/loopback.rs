//! In-process collaborators for tests and the demo binary.
//!
//! - [`ScriptedTransport`] records outbound stanzas and answers IQs from a
//!   script.
//! - [`Switchboard`] connects several [`CallManager`]s so that they can call
//!   each other without a server.
//! - [`FakeMediaFactory`] produces media engines that negotiate content maps
//!   without moving any media.
//! - [`LoopbackCrypto`], [`StaticRoster`] and [`MemoryCallLog`] complete the
//!   set of [`CallServices`].

use crate::calls::{
    CallError, CallLog, CallLogEntry, CallManager, CallServices, CryptoError, CryptoService,
    MediaEngine, MediaEngineFactory, MediaError, MediaEvent, MediaEventSender, PendingIq, Roster,
    StanzaTransport,
};
use crate::crypto::{open_envelope, seal_envelope};
use async_trait::async_trait;
use jinglecore::address::Address;
use jinglecore::content::{
    Content, ContentMap, DtlsFingerprint, DtlsSetup, Group, IceCandidate, IceCredentials,
    IceUdpTransport, PayloadType, RtpDescription, Senders,
};
use jinglecore::media::{MediaKind, MediaSet};
use jinglecore::protocol::{
    EncryptedContentMap, ErrorCondition, InboundIq, IqReply, IqResponse, JingleAction,
    JingleMessage, JinglePacket,
};
use jinglecore::state::{PeerConnectionState, SignalingState};
use jinglecore::verification::{IdentityKey, Verification};
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn response_of(reply: IqReply) -> IqResponse {
    match reply {
        IqReply::Result => IqResponse::Result,
        IqReply::Error(condition) => IqResponse::Error(condition),
    }
}

// Scripted transport

/// Transport that records everything and answers IQs from a script.
///
/// IQs without a scripted response are answered with a result.
pub struct ScriptedTransport {
    address: Address,
    iqs: Mutex<Vec<(Address, JinglePacket)>>,
    messages: Mutex<Vec<(Address, JingleMessage)>>,
    replies: Mutex<Vec<(InboundIq, IqReply)>>,
    script: Mutex<HashMap<JingleAction, VecDeque<IqResponse>>>,
    fail_messages: AtomicBool,
}

impl ScriptedTransport {
    pub fn new(address: Address) -> Arc<Self> {
        Arc::new(Self {
            address,
            iqs: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            replies: Mutex::new(Vec::new()),
            script: Mutex::new(HashMap::new()),
            fail_messages: AtomicBool::new(false),
        })
    }

    /// Answer the next IQ with `action` with `response`.
    pub fn script(&self, action: JingleAction, response: IqResponse) {
        lock(&self.script)
            .entry(action)
            .or_default()
            .push_back(response);
    }

    /// Make every message send fail as if the server bounced it.
    pub fn fail_messages(&self, fail: bool) {
        self.fail_messages.store(fail, Ordering::Release);
    }

    pub fn sent_iqs(&self) -> Vec<(Address, JinglePacket)> {
        lock(&self.iqs).clone()
    }

    pub fn sent_actions(&self) -> Vec<JingleAction> {
        lock(&self.iqs).iter().map(|(_, p)| p.action).collect()
    }

    /// The last IQ sent with `action`.
    pub fn last_iq(&self, action: JingleAction) -> Option<JinglePacket> {
        lock(&self.iqs)
            .iter()
            .rev()
            .find(|(_, p)| p.action == action)
            .map(|(_, p)| p.clone())
    }

    pub fn sent_messages(&self) -> Vec<(Address, JingleMessage)> {
        lock(&self.messages).clone()
    }

    pub fn replies(&self) -> Vec<(InboundIq, IqReply)> {
        lock(&self.replies).clone()
    }

    /// The reply given to the IQ with `id`.
    pub fn reply_to(&self, id: &str) -> Option<IqReply> {
        lock(&self.replies)
            .iter()
            .find(|(iq, _)| iq.id == id)
            .map(|(_, reply)| reply.clone())
    }
}

#[async_trait]
impl StanzaTransport for ScriptedTransport {
    fn bound_address(&self) -> Address {
        self.address.clone()
    }

    async fn send_iq(&self, to: &Address, packet: JinglePacket) -> PendingIq {
        let response = lock(&self.script)
            .get_mut(&packet.action)
            .and_then(VecDeque::pop_front)
            .unwrap_or(IqResponse::Result);
        lock(&self.iqs).push((to.clone(), packet));
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(response);
        rx
    }

    async fn send_message(&self, to: &Address, message: JingleMessage) -> Result<(), CallError> {
        lock(&self.messages).push((to.clone(), message));
        if self.fail_messages.load(Ordering::Acquire) {
            return Err(CallError::Transport("service-unavailable".into()));
        }
        Ok(())
    }

    async fn respond(&self, iq: &InboundIq, reply: IqReply) {
        lock(&self.replies).push((iq.clone(), reply));
    }
}

// Switchboard

enum Delivery {
    Iq(InboundIq),
    Message(Address, JingleMessage),
}

/// Connects call managers in one process. Stanzas to each endpoint are
/// delivered in order by a dedicated task.
pub struct Switchboard {
    endpoints: Mutex<HashMap<Address, mpsc::UnboundedSender<Delivery>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<IqResponse>>>,
    sent: Mutex<Vec<(Address, JinglePacket)>>,
    next_id: AtomicU64,
    response_timeout: Duration,
}

impl Switchboard {
    pub fn new(response_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            response_timeout,
        })
    }

    /// A transport bound to the full address `address`.
    pub fn transport(self: &Arc<Self>, address: Address) -> Arc<SwitchboardTransport> {
        Arc::new(SwitchboardTransport {
            address,
            board: self.clone(),
        })
    }

    /// Start delivering stanzas for `address` to `manager`.
    pub fn attach(&self, address: &Address, manager: &Arc<CallManager>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        lock(&self.endpoints).insert(address.clone(), tx);
        let manager: Weak<CallManager> = Arc::downgrade(manager);
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match delivery {
                    Delivery::Iq(iq) => manager.handle_iq(iq).await,
                    Delivery::Message(from, message) => {
                        manager.handle_message(&from, message).await
                    }
                }
            }
        });
    }

    /// Every `action` IQ sent by `from`, in order.
    pub fn sent_iqs(&self, from: &Address, action: JingleAction) -> Vec<JinglePacket> {
        lock(&self.sent)
            .iter()
            .filter(|(sender, packet)| sender == from && packet.action == action)
            .map(|(_, packet)| packet.clone())
            .collect()
    }

    /// Stop delivering to `address`, as if the device went offline.
    pub fn detach(&self, address: &Address) {
        lock(&self.endpoints).remove(address);
    }

    /// Endpoints reached by a stanza to `to` from `from`. A bare address
    /// reaches every device of the account except the sender.
    fn route(&self, from: &Address, to: &Address) -> Vec<mpsc::UnboundedSender<Delivery>> {
        lock(&self.endpoints)
            .iter()
            .filter(|(address, _)| {
                if to.is_bare() {
                    address.is_same_account(to) && *address != from
                } else {
                    *address == to
                }
            })
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    fn complete(&self, id: &str, response: IqResponse) {
        if let Some(tx) = lock(&self.pending).remove(id) {
            let _ = tx.send(response);
        }
    }
}

pub struct SwitchboardTransport {
    address: Address,
    board: Arc<Switchboard>,
}

#[async_trait]
impl StanzaTransport for SwitchboardTransport {
    fn bound_address(&self) -> Address {
        self.address.clone()
    }

    async fn send_iq(&self, to: &Address, packet: JinglePacket) -> PendingIq {
        let id = format!("iq-{}", self.board.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.board.sent).push((self.address.clone(), packet.clone()));
        let (tx, rx) = oneshot::channel();
        lock(&self.board.pending).insert(id.clone(), tx);
        let Some(endpoint) = self.board.route(&self.address, to).into_iter().next() else {
            debug!("{} is not connected", to);
            self.board.complete(
                &id,
                IqResponse::Error(ErrorCondition::RecipientUnavailable),
            );
            return rx;
        };
        let iq = InboundIq {
            id: id.clone(),
            from: self.address.clone(),
            packet,
        };
        if endpoint.send(Delivery::Iq(iq)).is_err() {
            self.board.complete(
                &id,
                IqResponse::Error(ErrorCondition::RecipientUnavailable),
            );
            return rx;
        }
        let board = Arc::downgrade(&self.board);
        let timeout = self.board.response_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(board) = board.upgrade() {
                board.complete(&id, IqResponse::Timeout);
            }
        });
        rx
    }

    async fn send_message(&self, to: &Address, message: JingleMessage) -> Result<(), CallError> {
        let endpoints = self.board.route(&self.address, to);
        if endpoints.is_empty() && !to.is_same_account(&self.address) {
            return Err(CallError::Transport(format!("{to} is unavailable")));
        }
        for endpoint in endpoints {
            let delivery = Delivery::Message(self.address.clone(), message.clone());
            if endpoint.send(delivery).is_err() {
                warn!("Dropped {} to {}", message.name(), to);
            }
        }
        Ok(())
    }

    async fn respond(&self, iq: &InboundIq, reply: IqReply) {
        self.board.complete(&iq.id, response_of(reply));
    }
}

// Media

/// Behaviour of the engines a [`FakeMediaFactory`] creates.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeMediaOptions {
    /// Emit one host candidate per content for every local description.
    pub emit_candidates: bool,
    /// Report the connection as established once negotiation completes.
    pub auto_connect: bool,
    /// Refuse to create engines.
    pub fail_creation: bool,
}

#[derive(Debug, Clone)]
struct Transceiver {
    name: String,
    kind: MediaKind,
    senders: Senders,
}

#[derive(Debug, Default)]
struct FakeEngineState {
    transceivers: Vec<Transceiver>,
    ice_generation: u32,
    announced_generation: Option<u32>,
    signaling: SignalingState,
    remote: Option<ContentMap>,
    local: Option<ContentMap>,
    remote_candidates: Vec<(String, IceCandidate)>,
    closed: bool,
}

/// Media engine that negotiates descriptions but moves no media.
pub struct FakeMediaEngine {
    id: u64,
    options: FakeMediaOptions,
    events: MediaEventSender,
    state: Mutex<FakeEngineState>,
    close_count: AtomicUsize,
}

impl FakeMediaEngine {
    fn new(id: u64, media: &MediaSet, options: FakeMediaOptions, events: MediaEventSender) -> Self {
        let transceivers = media
            .iter()
            .enumerate()
            .map(|(index, kind)| Transceiver {
                name: index.to_string(),
                kind: *kind,
                senders: Senders::Both,
            })
            .collect();
        Self {
            id,
            options,
            events,
            state: Mutex::new(FakeEngineState {
                transceivers,
                ..Default::default()
            }),
            close_count: AtomicUsize::new(0),
        }
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn remote_candidates(&self) -> Vec<(String, IceCandidate)> {
        lock(&self.state).remote_candidates.clone()
    }

    pub fn local_description(&self) -> Option<ContentMap> {
        lock(&self.state).local.clone()
    }

    pub fn remote_description(&self) -> Option<ContentMap> {
        lock(&self.state).remote.clone()
    }

    /// Kinds with a sending transceiver.
    pub fn active_media(&self) -> MediaSet {
        lock(&self.state)
            .transceivers
            .iter()
            .filter(|t| t.senders != Senders::None)
            .map(|t| t.kind)
            .collect()
    }

    /// Inject an event as if the engine raised it.
    pub fn emit(&self, event: MediaEvent) {
        let _ = self.events.send(event);
    }

    fn credentials(&self, generation: u32) -> IceCredentials {
        IceCredentials::new(
            format!("e{}g{}", self.id, generation),
            format!("pwd{:04}{:020}", self.id, generation),
        )
    }

    fn description(&self, state: &FakeEngineState, setup: DtlsSetup, only: Option<&ContentMap>) -> ContentMap {
        let credentials = self.credentials(state.ice_generation);
        let fingerprint = DtlsFingerprint {
            hash: "sha-256".into(),
            value: format!("{:02X}:{:02X}:{:02X}", self.id, self.id + 1, self.id + 2),
            setup,
        };
        let mut map = ContentMap::new();
        for transceiver in &state.transceivers {
            if only.is_some_and(|remote| remote.get(&transceiver.name).is_none()) {
                continue;
            }
            let payload = match transceiver.kind {
                MediaKind::Audio => PayloadType::new(111, "opus", 48000, 2),
                MediaKind::Video => PayloadType::new(96, "VP8", 90000, 0),
            };
            let content = Content::new(
                transceiver.senders,
                RtpDescription::new(transceiver.kind, vec![payload]),
                IceUdpTransport::new(credentials.clone(), Some(fingerprint.clone())),
            );
            map = map.with_content(transceiver.name.clone(), content);
        }
        let names: Vec<String> = map.contents.keys().cloned().collect();
        map.with_group(Group::bundle(names))
    }

    /// Announce candidates once per ICE generation.
    fn gather(&self, state: &mut FakeEngineState) {
        if !self.options.emit_candidates || state.announced_generation == Some(state.ice_generation) {
            return;
        }
        state.announced_generation = Some(state.ice_generation);
        let ufrag = self.credentials(state.ice_generation).ufrag;
        for (index, transceiver) in state.transceivers.iter().enumerate() {
            let candidate = IceCandidate::new(format!(
                "candidate:1 1 udp 2122260223 192.0.2.{} {} typ host",
                self.id,
                50000 + index
            ))
            .with_sdp_mid(transceiver.name.clone())
            .with_username_fragment(ufrag.clone());
            self.emit(MediaEvent::IceCandidate {
                content: transceiver.name.clone(),
                candidate,
            });
        }
    }

    fn negotiated(&self) {
        if self.options.auto_connect {
            self.emit(MediaEvent::ConnectionStateChanged(PeerConnectionState::Connected));
        }
    }

    fn ensure_open(state: &FakeEngineState) -> Result<(), MediaError> {
        if state.closed {
            Err(MediaError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn add_track(&self, kind: MediaKind) -> Result<(), MediaError> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        if let Some(transceiver) = state.transceivers.iter_mut().find(|t| t.kind == kind) {
            transceiver.senders = Senders::Both;
        } else {
            let name = state.transceivers.len().to_string();
            state.transceivers.push(Transceiver {
                name,
                kind,
                senders: Senders::Both,
            });
        }
        Ok(())
    }

    async fn remove_track(&self, kind: MediaKind) -> Result<(), MediaError> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        for transceiver in state.transceivers.iter_mut().filter(|t| t.kind == kind) {
            transceiver.senders = Senders::None;
        }
        Ok(())
    }

    async fn apply_local_offer(&self) -> Result<ContentMap, MediaError> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        if state.signaling == SignalingState::HaveRemoteOffer {
            return Err(MediaError::Description(
                "cannot offer with a pending remote offer".into(),
            ));
        }
        let offer = self.description(&state, DtlsSetup::ActPass, None);
        state.local = Some(offer.clone());
        state.signaling = SignalingState::HaveLocalOffer;
        self.gather(&mut state);
        Ok(offer)
    }

    async fn apply_local_answer(&self) -> Result<ContentMap, MediaError> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(MediaError::Description("no remote offer to answer".into()));
        }
        let remote = state.remote.clone().unwrap_or_default();
        let answer = self.description(&state, DtlsSetup::Active, Some(&remote));
        state.local = Some(answer.clone());
        state.signaling = SignalingState::Stable;
        self.gather(&mut state);
        drop(state);
        self.negotiated();
        Ok(answer)
    }

    async fn apply_remote_offer(&self, offer: &ContentMap) -> Result<(), MediaError> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        if state.signaling == SignalingState::HaveLocalOffer {
            debug!("Engine {} rolls back its local offer", self.id);
        }
        for (name, content) in &offer.contents {
            let Some(kind) = content.media() else {
                return Err(MediaError::Description(format!("content {name} has no media")));
            };
            match state.transceivers.iter_mut().find(|t| t.name == *name) {
                Some(transceiver) if content.senders == Senders::None => {
                    transceiver.senders = Senders::None;
                }
                Some(_) => {}
                None => state.transceivers.push(Transceiver {
                    name: name.clone(),
                    kind,
                    senders: content.senders,
                }),
            }
        }
        if offer
            .credentials()
            .iter()
            .any(|c| state.remote.as_ref().is_some_and(|r| !r.credentials().contains(c)))
        {
            // the peer restarted ICE, so do we
            state.ice_generation += 1;
        }
        state.remote = Some(offer.clone());
        state.signaling = SignalingState::HaveRemoteOffer;
        Ok(())
    }

    async fn apply_remote_answer(&self, answer: &ContentMap) -> Result<(), MediaError> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        if state.signaling != SignalingState::HaveLocalOffer {
            return Err(MediaError::Description("no local offer to complete".into()));
        }
        state.remote = Some(answer.clone());
        state.signaling = SignalingState::Stable;
        drop(state);
        self.negotiated();
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        content: &str,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        if !state.transceivers.iter().any(|t| t.name == content) {
            return Err(MediaError::Candidate(format!("unknown content {content}")));
        }
        state
            .remote_candidates
            .push((content.to_string(), candidate.clone()));
        Ok(())
    }

    async fn restart_ice(&self) -> Result<(), MediaError> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        state.ice_generation += 1;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    async fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.signaling = SignalingState::Closed;
        self.close_count.fetch_add(1, Ordering::AcqRel);
    }
}

// Engine ids are unique per process so that ICE credentials never collide.
static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Creates [`FakeMediaEngine`]s and keeps them for inspection.
#[derive(Default)]
pub struct FakeMediaFactory {
    options: FakeMediaOptions,
    engines: Mutex<Vec<Arc<FakeMediaEngine>>>,
}

impl FakeMediaFactory {
    pub fn new(options: FakeMediaOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            engines: Mutex::new(Vec::new()),
        })
    }

    pub fn engines(&self) -> Vec<Arc<FakeMediaEngine>> {
        lock(&self.engines).clone()
    }

    pub fn last_engine(&self) -> Option<Arc<FakeMediaEngine>> {
        lock(&self.engines).last().cloned()
    }
}

impl MediaEngineFactory for FakeMediaFactory {
    fn create(
        &self,
        media: &MediaSet,
        events: MediaEventSender,
    ) -> Result<Arc<dyn MediaEngine>, MediaError> {
        if self.options.fail_creation {
            return Err(MediaError::Initialization("no media devices".into()));
        }
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        let engine = Arc::new(FakeMediaEngine::new(id, media, self.options, events));
        lock(&self.engines).push(engine.clone());
        Ok(engine)
    }
}

// Crypto, roster and call log

/// Identity keys of every device taking part in a loopback setup.
#[derive(Debug, Default)]
pub struct KeyDirectory {
    devices: Mutex<HashMap<Address, (u32, IdentityKey)>>,
}

impl KeyDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the device of the account `account` (a bare address).
    pub fn register(&self, account: &Address, device_id: u32, identity_key: IdentityKey) {
        lock(&self.devices).insert(account.bare(), (device_id, identity_key));
    }

    fn device(&self, account: &Address) -> Option<(u32, IdentityKey)> {
        lock(&self.devices).get(&account.bare()).cloned()
    }
}

/// Fingerprint envelopes over AES-GCM with keys derived from the
/// recipient's identity key.
pub struct LoopbackCrypto {
    own: Address,
    directory: Arc<KeyDirectory>,
}

impl LoopbackCrypto {
    pub fn new(own: &Address, directory: Arc<KeyDirectory>) -> Arc<Self> {
        Arc::new(Self {
            own: own.bare(),
            directory,
        })
    }
}

#[async_trait]
impl CryptoService for LoopbackCrypto {
    async fn encrypt(
        &self,
        contents: &ContentMap,
        peer: &Address,
        device_id: u32,
    ) -> Result<(Verification, EncryptedContentMap), CryptoError> {
        let (peer_device, identity_key) = self
            .directory
            .device(peer)
            .filter(|(id, _)| *id == device_id)
            .ok_or(CryptoError::NoSession(device_id))?;
        let (own_device, _) = self
            .directory
            .device(&self.own)
            .ok_or_else(|| CryptoError::Encrypt(format!("no device for {}", self.own)))?;
        let mut visible = contents.clone();
        let mut fingerprints = BTreeMap::new();
        for (name, content) in visible.contents.iter_mut() {
            if let Some(fingerprint) = content.transport.fingerprint.take() {
                fingerprints.insert(name.clone(), fingerprint);
            }
        }
        let plaintext =
            serde_json::to_vec(&fingerprints).map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        let payload = seal_envelope(identity_key.as_bytes(), peer_device, &plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        let verification = Verification {
            device_id: peer_device,
            identity_key,
        };
        Ok((
            verification,
            EncryptedContentMap {
                contents: visible,
                sender_device_id: own_device,
                payload,
            },
        ))
    }

    async fn decrypt(
        &self,
        contents: &EncryptedContentMap,
        peer: &Address,
    ) -> Result<(Verification, ContentMap), CryptoError> {
        let (sender_device, sender_key) = self
            .directory
            .device(peer)
            .filter(|(id, _)| *id == contents.sender_device_id)
            .ok_or(CryptoError::UntrustedIdentity(contents.sender_device_id))?;
        let (own_device, own_key) = self
            .directory
            .device(&self.own)
            .ok_or_else(|| CryptoError::Decrypt(format!("no device for {}", self.own)))?;
        let plaintext = open_envelope(own_key.as_bytes(), own_device, &contents.payload)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        let fingerprints: BTreeMap<String, DtlsFingerprint> =
            serde_json::from_slice(&plaintext).map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        let mut map = contents.contents.clone();
        for (name, fingerprint) in fingerprints {
            if let Some(content) = map.contents.get_mut(&name) {
                content.transport.fingerprint = Some(fingerprint);
            }
        }
        let verification = Verification {
            device_id: sender_device,
            identity_key: sender_key,
        };
        Ok((verification, map))
    }
}

/// Roster with a fixed set of contacts.
#[derive(Debug, Default)]
pub struct StaticRoster {
    trusted: HashSet<Address>,
    own_devices_with_call_support: usize,
}

impl StaticRoster {
    pub fn new(trusted: impl IntoIterator<Item = Address>) -> Arc<Self> {
        Arc::new(Self {
            trusted: trusted.into_iter().map(|a| a.bare()).collect(),
            own_devices_with_call_support: 0,
        })
    }

    pub fn with_other_devices(trusted: impl IntoIterator<Item = Address>, devices: usize) -> Arc<Self> {
        Arc::new(Self {
            trusted: trusted.into_iter().map(|a| a.bare()).collect(),
            own_devices_with_call_support: devices,
        })
    }
}

#[async_trait]
impl Roster for StaticRoster {
    async fn is_trusted(&self, peer: &Address) -> bool {
        self.trusted.contains(&peer.bare())
    }

    async fn own_devices_with_call_support(&self) -> usize {
        self.own_devices_with_call_support
    }
}

/// Call log kept in memory.
#[derive(Debug, Default)]
pub struct MemoryCallLog {
    entries: Mutex<Vec<CallLogEntry>>,
}

impl MemoryCallLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> Vec<CallLogEntry> {
        lock(&self.entries).clone()
    }
}

#[async_trait]
impl CallLog for MemoryCallLog {
    async fn record(&self, entry: CallLogEntry) {
        debug!(
            "Call log: {:?} {} {:?}",
            entry.direction, entry.peer, entry.outcome
        );
        lock(&self.entries).push(entry);
    }
}

/// The services of one loopback endpoint.
pub struct LoopbackEndpoint {
    pub media: Arc<FakeMediaFactory>,
    pub call_log: Arc<MemoryCallLog>,
}

impl LoopbackEndpoint {
    /// Assemble services around `transport`.
    pub fn services(
        transport: Arc<dyn StanzaTransport>,
        roster: Arc<dyn Roster>,
        crypto: Arc<dyn CryptoService>,
        options: FakeMediaOptions,
    ) -> (CallServices, Self) {
        let media = FakeMediaFactory::new(options);
        let call_log = MemoryCallLog::new();
        let services = CallServices {
            transport,
            media: media.clone(),
            crypto,
            roster,
            call_log: call_log.clone(),
        };
        (services, Self { media, call_log })
    }
}
