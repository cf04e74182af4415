//! Negotiated media contents of a session.
//!
//! A [`ContentMap`] is the protocol-level equivalent of a session
//! description: an ordered set of named contents, each carrying an RTP
//! description, an ICE-UDP transport and the senders attribute, plus the
//! optional BUNDLE group. Content maps are treated as immutable values; every
//! modification returns a new revision.
//!
//! # Renegotiation helpers
//!
//! - [`ContentMap::diff`] compares two revisions by name and senders.
//! - [`ContentMap::to_content_modification`] extracts the subset of contents
//!   sent in content-add/content-accept.
//! - [`ContentMap::to_stub`] builds the description-less form used in
//!   content-reject and content-remove.
//! - [`ContentMap::rollback_answer`] builds the synthetic remote answer used
//!   to roll back a content-add that was never accepted.

use crate::media::{MediaKind, MediaSet};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContentMapError {
    #[error("malformed content: {0}")]
    Malformed(String),
    #[error("security violation: {0}")]
    Security(String),
    #[error("content {0} already exists")]
    DuplicateContent(String),
    #[error("{0} is not uniform across contents")]
    NonUniform(&'static str),
    #[error("invalid DTLS setup: {0}")]
    InvalidSetup(String),
    #[error("content {0} has no ICE credentials")]
    MissingCredentials(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl ContentMapError {
    pub fn is_security(&self) -> bool {
        matches!(self, Self::Security(_))
    }
}

/// Which party sends media on a content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Senders {
    Both,
    Initiator,
    Responder,
    None,
}

impl Senders {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Both => "both",
            Self::Initiator => "initiator",
            Self::Responder => "responder",
            Self::None => "none",
        }
    }
}

impl FromStr for Senders {
    type Err = ContentMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "both" => Ok(Self::Both),
            "initiator" => Ok(Self::Initiator),
            "responder" => Ok(Self::Responder),
            "none" => Ok(Self::None),
            other => Err(ContentMapError::Malformed(format!(
                "unknown senders value {other}"
            ))),
        }
    }
}

/// DTLS `setup` attribute (RFC 4145 roles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsSetup {
    Active,
    Passive,
    ActPass,
}

impl DtlsSetup {
    /// The complementary role. `actpass` has none.
    pub fn flip(self) -> Result<Self, ContentMapError> {
        match self {
            Self::Active => Ok(Self::Passive),
            Self::Passive => Ok(Self::Active),
            Self::ActPass => Err(ContentMapError::InvalidSetup(
                "actpass has no complementary role".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub hash: String,
    pub value: String,
    pub setup: DtlsSetup,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn new(ufrag: impl Into<String>, pwd: impl Into<String>) -> Self {
        Self {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
        }
    }
}

/// ICE candidate type (RFC 8445).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }
}

impl FromStr for CandidateType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            _ => Err(()),
        }
    }
}

/// An ICE candidate exchanged in transport-info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The candidate line, e.g. `candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host`.
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }

    /// The `typ` field of the candidate line.
    pub fn candidate_type(&self) -> Option<CandidateType> {
        let mut parts = self.candidate.split_whitespace();
        parts.find(|p| *p == "typ")?;
        parts.next()?.parse().ok()
    }
}

/// ICE-UDP transport of one content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceUdpTransport {
    pub credentials: Option<IceCredentials>,
    pub fingerprint: Option<DtlsFingerprint>,
    pub candidates: Vec<IceCandidate>,
}

impl IceUdpTransport {
    pub fn new(credentials: IceCredentials, fingerprint: Option<DtlsFingerprint>) -> Self {
        Self {
            credentials: Some(credentials),
            fingerprint,
            candidates: Vec::new(),
        }
    }

    pub fn with_candidate(mut self, candidate: IceCandidate) -> Self {
        self.candidates.push(candidate);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadType {
    pub id: u8,
    pub name: String,
    pub clock_rate: u32,
    pub channels: u8,
}

impl PayloadType {
    pub fn new(id: u8, name: impl Into<String>, clock_rate: u32, channels: u8) -> Self {
        Self {
            id,
            name: name.into(),
            clock_rate,
            channels,
        }
    }
}

/// RTP application description. A description without payload types is a
/// stub that only names the media kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpDescription {
    pub media: MediaKind,
    pub payload_types: Vec<PayloadType>,
}

impl RtpDescription {
    pub fn new(media: MediaKind, payload_types: Vec<PayloadType>) -> Self {
        Self {
            media,
            payload_types,
        }
    }

    pub fn stub(media: MediaKind) -> Self {
        Self {
            media,
            payload_types: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub senders: Senders,
    /// Absent in transport-info payloads.
    pub description: Option<RtpDescription>,
    pub transport: IceUdpTransport,
}

impl Content {
    pub fn new(senders: Senders, description: RtpDescription, transport: IceUdpTransport) -> Self {
        Self {
            senders,
            description: Some(description),
            transport,
        }
    }

    pub fn transport_only(senders: Senders, transport: IceUdpTransport) -> Self {
        Self {
            senders,
            description: None,
            transport,
        }
    }

    pub fn media(&self) -> Option<MediaKind> {
        self.description.as_ref().map(|d| d.media)
    }
}

/// Content grouping (`a=group:BUNDLE`), used for media-line indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub semantics: String,
    pub identification_tags: Vec<String>,
}

impl Group {
    pub fn bundle(tags: impl IntoIterator<Item = String>) -> Self {
        Self {
            semantics: "BUNDLE".into(),
            identification_tags: tags.into_iter().collect(),
        }
    }
}

/// Result of comparing two content maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentDiff {
    /// Names present only in the newer map.
    pub added: BTreeSet<String>,
    /// Names present only in the older map.
    pub removed: BTreeSet<String>,
    /// Names present in both with identical senders.
    pub unchanged: BTreeSet<String>,
    /// Names present in both whose senders differ.
    pub modified: BTreeSet<String>,
}

impl ContentDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn has_modifications(&self) -> bool {
        !self.modified.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMap {
    pub contents: IndexMap<String, Content>,
    pub group: Option<Group>,
}

impl ContentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(mut self, name: impl Into<String>, content: Content) -> Self {
        self.contents.insert(name.into(), content);
        self
    }

    pub fn with_group(mut self, group: Group) -> Self {
        self.group = Some(group);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn get(&self, name: &str) -> Option<&Content> {
        self.contents.get(name)
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.contents.keys().cloned().collect()
    }

    pub fn media(&self) -> MediaSet {
        self.contents.values().filter_map(Content::media).collect()
    }

    pub fn senders(&self) -> BTreeSet<Senders> {
        self.contents.values().map(|c| c.senders).collect()
    }

    /// Identification tags in media-line order: the group if present,
    /// otherwise the content order.
    pub fn identification_tags(&self) -> Vec<String> {
        match &self.group {
            Some(group) => group.identification_tags.clone(),
            None => self.contents.keys().cloned().collect(),
        }
    }

    /// Every content must carry an RTP description.
    pub fn require_content_descriptions(&self) -> Result<(), ContentMapError> {
        if self.contents.is_empty() {
            return Err(ContentMapError::Malformed("no contents available".into()));
        }
        for (name, content) in &self.contents {
            if content.description.is_none() {
                return Err(ContentMapError::Malformed(format!(
                    "content {name} is missing a description"
                )));
            }
        }
        Ok(())
    }

    /// Every content must carry a DTLS fingerprint. An offer must use
    /// `actpass`; an answer must pick `active` or `passive`.
    pub fn require_dtls_fingerprint(&self, is_offer: bool) -> Result<(), ContentMapError> {
        if self.contents.is_empty() {
            return Err(ContentMapError::Malformed("no contents available".into()));
        }
        for (name, content) in &self.contents {
            let Some(fingerprint) = &content.transport.fingerprint else {
                return Err(ContentMapError::Security(format!(
                    "content {name} has no DTLS fingerprint"
                )));
            };
            if fingerprint.value.is_empty() || fingerprint.hash.is_empty() {
                return Err(ContentMapError::Security(format!(
                    "content {name} has an empty DTLS fingerprint"
                )));
            }
            let is_actpass = fingerprint.setup == DtlsSetup::ActPass;
            if is_offer != is_actpass {
                return Err(ContentMapError::InvalidSetup(format!(
                    "content {name} uses setup {:?} in an {}",
                    fingerprint.setup,
                    if is_offer { "offer" } else { "answer" }
                )));
            }
        }
        Ok(())
    }

    /// The DTLS setup shared by all contents.
    pub fn dtls_setup(&self) -> Result<DtlsSetup, ContentMapError> {
        let mut setups = self
            .contents
            .values()
            .filter_map(|c| c.transport.fingerprint.as_ref().map(|f| f.setup));
        let Some(first) = setups.next() else {
            return Err(ContentMapError::Security(
                "no DTLS fingerprint in any content".into(),
            ));
        };
        if setups.all(|s| s == first) {
            Ok(first)
        } else {
            Err(ContentMapError::NonUniform("DTLS setup"))
        }
    }

    /// ICE credentials per content name. Contents without credentials are
    /// skipped.
    pub fn credentials_by_content(&self) -> BTreeMap<String, IceCredentials> {
        self.contents
            .iter()
            .filter_map(|(name, c)| c.transport.credentials.clone().map(|cr| (name.clone(), cr)))
            .collect()
    }

    /// The distinct ICE credentials used across all contents.
    pub fn credentials(&self) -> BTreeSet<IceCredentials> {
        self.credentials_by_content().into_values().collect()
    }

    /// True when every content has credentials and all contents share them.
    pub fn has_uniform_credentials(&self) -> bool {
        self.credentials_by_content().len() == self.contents.len() && self.credentials().len() == 1
    }

    pub fn has_empty_candidates(&self) -> bool {
        self.contents
            .values()
            .all(|c| c.transport.candidates.is_empty())
    }

    /// All candidates by content name. Candidates without a username
    /// fragment take the one of their transport.
    pub fn candidates(&self) -> Vec<(String, IceCandidate)> {
        self.contents
            .iter()
            .flat_map(|(name, c)| {
                let ufrag = c.transport.credentials.as_ref().map(|cr| cr.ufrag.clone());
                c.transport.candidates.iter().map(move |cand| {
                    let mut cand = cand.clone();
                    if cand.username_fragment.is_none() {
                        cand.username_fragment = ufrag.clone();
                    }
                    (name.clone(), cand)
                })
            })
            .collect()
    }

    /// Contents that still send or receive media.
    pub fn active_contents(&self) -> ContentMap {
        let contents: IndexMap<String, Content> = self
            .contents
            .iter()
            .filter(|(_, c)| c.senders != Senders::None)
            .map(|(name, c)| (name.clone(), c.clone()))
            .collect();
        let group = self.group.as_ref().map(|g| Group {
            semantics: g.semantics.clone(),
            identification_tags: g
                .identification_tags
                .iter()
                .filter(|tag| contents.contains_key(*tag))
                .cloned()
                .collect(),
        });
        ContentMap { contents, group }
    }

    /// Compare `self` (older) against `other` (newer).
    pub fn diff(&self, other: &ContentMap) -> ContentDiff {
        let mut diff = ContentDiff::default();
        for (name, content) in &self.contents {
            match other.contents.get(name) {
                None => {
                    diff.removed.insert(name.clone());
                }
                Some(newer) if newer.senders == content.senders => {
                    diff.unchanged.insert(name.clone());
                }
                Some(_) => {
                    diff.modified.insert(name.clone());
                }
            }
        }
        for name in other.contents.keys() {
            if !self.contents.contains_key(name) {
                diff.added.insert(name.clone());
            }
        }
        diff
    }

    /// The named contents only, without group. Used as the payload of
    /// content-add and content-accept.
    pub fn to_content_modification<'a>(
        &self,
        names: impl IntoIterator<Item = &'a String>,
    ) -> ContentMap {
        let names: BTreeSet<&String> = names.into_iter().collect();
        ContentMap {
            contents: self
                .contents
                .iter()
                .filter(|(name, _)| names.contains(name))
                .map(|(name, c)| (name.clone(), c.clone()))
                .collect(),
            group: None,
        }
    }

    /// Contents reduced to name, senders and media kind.
    pub fn to_stub(&self) -> ContentMap {
        ContentMap {
            contents: self
                .contents
                .iter()
                .map(|(name, c)| {
                    (
                        name.clone(),
                        Content {
                            senders: c.senders,
                            description: c.media().map(RtpDescription::stub),
                            transport: IceUdpTransport::default(),
                        },
                    )
                })
                .collect(),
            group: None,
        }
    }

    /// Credentials of every content without candidates or descriptions: the
    /// payload of an ICE restart offer.
    pub fn transport_info(&self) -> ContentMap {
        self.transport_info_with_candidates(&[])
    }

    /// A transport-info payload carrying the given candidates.
    pub fn transport_info_with_candidates(&self, candidates: &[(String, IceCandidate)]) -> ContentMap {
        let contents = self
            .contents
            .iter()
            .filter(|(name, _)| candidates.is_empty() || candidates.iter().any(|(n, _)| n == *name))
            .map(|(name, c)| {
                let transport = IceUdpTransport {
                    credentials: c.transport.credentials.clone(),
                    fingerprint: None,
                    candidates: candidates
                        .iter()
                        .filter(|(n, _)| n == name)
                        .map(|(_, cand)| cand.clone())
                        .collect(),
                };
                (name.clone(), Content::transport_only(c.senders, transport))
            })
            .collect();
        ContentMap {
            contents,
            group: None,
        }
    }

    /// A copy with ICE credentials and candidates taken from `update`
    /// (a transport-info payload) and the DTLS setup replaced by `setup`.
    pub fn modified_credentials(
        &self,
        update: &ContentMap,
        setup: DtlsSetup,
    ) -> Result<ContentMap, ContentMapError> {
        let uniform = if update.has_uniform_credentials() {
            update.credentials().into_iter().next()
        } else {
            None
        };
        let mut contents = IndexMap::with_capacity(self.contents.len());
        for (name, content) in &self.contents {
            let updated = update.contents.get(name);
            let credentials = updated
                .and_then(|u| u.transport.credentials.clone())
                .or_else(|| uniform.clone())
                .ok_or_else(|| ContentMapError::MissingCredentials(name.clone()))?;
            let mut content = content.clone();
            content.transport.credentials = Some(credentials);
            content.transport.candidates = updated
                .map(|u| u.transport.candidates.clone())
                .unwrap_or_default();
            if let Some(fingerprint) = content.transport.fingerprint.as_mut() {
                fingerprint.setup = setup;
            }
            contents.insert(name.clone(), content);
        }
        Ok(ContentMap {
            contents,
            group: self.group.clone(),
        })
    }

    /// A copy with every content's senders replaced.
    pub fn modified_senders(&self, senders: Senders) -> ContentMap {
        let mut modified = self.clone();
        for content in modified.contents.values_mut() {
            content.senders = senders;
        }
        modified
    }

    /// Merge the contents of `modification` into a new revision. Names must
    /// not collide. When `setup` is given the added transports take it.
    pub fn add_content(
        &self,
        modification: &ContentMap,
        setup: Option<DtlsSetup>,
    ) -> Result<ContentMap, ContentMapError> {
        if let Some(name) = modification
            .contents
            .keys()
            .find(|n| self.contents.contains_key(*n))
        {
            return Err(ContentMapError::DuplicateContent(name.clone()));
        }
        let mut merged = self.clone();
        for (name, content) in &modification.contents {
            let mut content = content.clone();
            if let (Some(setup), Some(fingerprint)) = (setup, content.transport.fingerprint.as_mut())
            {
                fingerprint.setup = setup;
            }
            merged.contents.insert(name.clone(), content);
        }
        if let Some(group) = merged.group.as_mut() {
            for name in modification.contents.keys() {
                if !group.identification_tags.contains(name) {
                    group.identification_tags.push(name.clone());
                }
            }
        }
        Ok(merged)
    }

    /// Build the synthetic remote answer that rolls back a content-add the
    /// peer never accepted.
    ///
    /// `self` is the peer's last-known content map and `local` the freshly
    /// generated local offer in which the retracted contents no longer send.
    /// The contents only present locally are patched into the remote map with
    /// senders `none`.
    pub fn rollback_answer(
        &self,
        local: &ContentMap,
        peer_setup: Option<DtlsSetup>,
    ) -> Result<ContentMap, ContentMapError> {
        let diff = self.diff(local);
        if diff.is_empty() {
            return Err(ContentMapError::InvariantViolation(
                "no difference between local and remote content".into(),
            ));
        }
        let patch = local.to_content_modification(&diff.added);
        if patch.is_empty() || patch.senders() != BTreeSet::from([Senders::None]) {
            return Err(ContentMapError::InvariantViolation(format!(
                "rolled back senders were not uniformly none: {:?}",
                patch.senders()
            )));
        }
        self.add_content(&patch.modified_senders(Senders::None), peer_setup)
    }
}

/// Direction of a content addition relative to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentDirection {
    Incoming,
    Outgoing,
}

/// `(name, media)` pairs of a content addition. Only names and media kinds
/// take part in equality; transports and codecs do not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentAdditionSummary(pub BTreeSet<(String, MediaKind)>);

impl ContentAdditionSummary {
    pub fn of(contents: &ContentMap) -> Self {
        Self(
            contents
                .contents
                .iter()
                .filter_map(|(name, c)| c.media().map(|m| (name.clone(), m)))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn media(&self) -> MediaSet {
        self.0.iter().map(|(_, m)| *m).collect()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.0.iter().map(|(n, _)| n.clone()).collect()
    }
}

impl fmt::Display for ContentAdditionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(n, m)| format!("{n}:{m}")).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// A content addition awaiting a decision, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentAddition {
    pub direction: ContentDirection,
    pub summary: ContentAdditionSummary,
}

impl ContentAddition {
    pub fn of(direction: ContentDirection, contents: &ContentMap) -> Self {
        Self {
            direction,
            summary: ContentAdditionSummary::of(contents),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn opus() -> PayloadType {
        PayloadType::new(111, "opus", 48000, 2)
    }

    pub fn vp8() -> PayloadType {
        PayloadType::new(96, "VP8", 90000, 0)
    }

    pub fn content(media: MediaKind, ufrag: &str, setup: DtlsSetup) -> Content {
        let payload = match media {
            MediaKind::Audio => opus(),
            MediaKind::Video => vp8(),
        };
        Content::new(
            Senders::Both,
            RtpDescription::new(media, vec![payload]),
            IceUdpTransport::new(
                IceCredentials::new(ufrag, format!("{ufrag}-pwd")),
                Some(DtlsFingerprint {
                    hash: "sha-256".into(),
                    value: "AB:CD:EF".into(),
                    setup,
                }),
            ),
        )
    }

    pub fn audio_map(ufrag: &str, setup: DtlsSetup) -> ContentMap {
        ContentMap::new()
            .with_content("0", content(MediaKind::Audio, ufrag, setup))
            .with_group(Group::bundle(["0".to_string()]))
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_diff_of_identical_maps_is_empty() {
        let map = audio_map("u1", DtlsSetup::ActPass);
        let diff = map.diff(&map);
        assert!(diff.is_empty());
        assert_eq!(diff.unchanged, BTreeSet::from(["0".to_string()]));
    }

    #[test]
    fn test_diff_reports_added_contents() {
        let map = audio_map("u1", DtlsSetup::ActPass);
        let video = ContentMap::new().with_content("1", content(MediaKind::Video, "u1", DtlsSetup::ActPass));
        let merged = map.add_content(&video, None).unwrap();

        let diff = map.diff(&merged);
        assert_eq!(diff.added, BTreeSet::from(["1".to_string()]));
        assert!(diff.removed.is_empty());
        assert!(!diff.has_modifications());
        assert_eq!(
            merged.group.unwrap().identification_tags,
            vec!["0".to_string(), "1".to_string()]
        );
    }

    #[test]
    fn test_diff_reports_modified_senders() {
        let map = audio_map("u1", DtlsSetup::ActPass);
        let diff = map.diff(&map.modified_senders(Senders::Initiator));
        assert_eq!(diff.modified, BTreeSet::from(["0".to_string()]));
        assert!(diff.added.is_empty());
    }

    #[test]
    fn test_add_content_rejects_duplicate_names() {
        let map = audio_map("u1", DtlsSetup::ActPass);
        assert_eq!(
            map.add_content(&map, None),
            Err(ContentMapError::DuplicateContent("0".into()))
        );
    }

    #[test]
    fn test_require_content_descriptions() {
        let map = audio_map("u1", DtlsSetup::ActPass);
        assert!(map.require_content_descriptions().is_ok());
        assert!(map.to_stub().require_content_descriptions().is_ok());
        assert!(map.transport_info().require_content_descriptions().is_err());
        assert!(ContentMap::new().require_content_descriptions().is_err());
    }

    #[test]
    fn test_missing_fingerprint_is_a_security_error() {
        let mut map = audio_map("u1", DtlsSetup::ActPass);
        map.contents[0].transport.fingerprint = None;
        let err = map.require_dtls_fingerprint(true).unwrap_err();
        assert!(err.is_security());
    }

    #[test]
    fn test_offer_must_use_actpass() {
        let offer = audio_map("u1", DtlsSetup::ActPass);
        let answer = audio_map("u2", DtlsSetup::Active);
        assert!(offer.require_dtls_fingerprint(true).is_ok());
        assert!(answer.require_dtls_fingerprint(false).is_ok());
        assert!(matches!(
            answer.require_dtls_fingerprint(true),
            Err(ContentMapError::InvalidSetup(_))
        ));
    }

    #[test]
    fn test_dtls_setup_flip() {
        assert_eq!(DtlsSetup::Active.flip(), Ok(DtlsSetup::Passive));
        assert_eq!(DtlsSetup::Passive.flip(), Ok(DtlsSetup::Active));
        assert!(DtlsSetup::ActPass.flip().is_err());
    }

    #[test]
    fn test_credentials_and_transport_info() {
        let map = audio_map("u1", DtlsSetup::ActPass)
            .add_content(
                &ContentMap::new().with_content("1", content(MediaKind::Video, "u1", DtlsSetup::ActPass)),
                None,
            )
            .unwrap();
        assert!(map.has_uniform_credentials());
        assert_eq!(map.credentials().len(), 1);

        let info = map.transport_info();
        assert!(info.has_empty_candidates());
        assert_eq!(info.credentials(), map.credentials());
        assert!(info.contents.values().all(|c| c.transport.fingerprint.is_none()));
    }

    #[test]
    fn test_modified_credentials_replaces_setup_and_credentials() {
        let existing = audio_map("old", DtlsSetup::Active);
        let restart = audio_map("new", DtlsSetup::ActPass).transport_info();

        let modified = existing
            .modified_credentials(&restart, DtlsSetup::Passive)
            .unwrap();
        assert_eq!(
            modified.credentials(),
            BTreeSet::from([IceCredentials::new("new", "new-pwd")])
        );
        assert_eq!(modified.dtls_setup(), Ok(DtlsSetup::Passive));
    }

    #[test]
    fn test_candidate_type_from_line() {
        let candidate = IceCandidate::new("candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0);
        assert_eq!(candidate.candidate_type(), Some(CandidateType::Host));
        assert_eq!(IceCandidate::new("garbage").candidate_type(), None);
    }

    #[test]
    fn test_summary_ignores_transport_differences() {
        let ours = ContentMap::new().with_content("1", content(MediaKind::Video, "aaa", DtlsSetup::ActPass));
        let theirs = ContentMap::new().with_content("1", content(MediaKind::Video, "zzz", DtlsSetup::Active));
        let a = ContentAdditionSummary::of(&ours);
        let b = ContentAdditionSummary::of(&theirs);
        assert_eq!(a, b);
        assert_eq!(b, a);
        assert_eq!(a, ContentAdditionSummary::of(&theirs.to_stub()));
    }

    #[test]
    fn test_rollback_answer_patches_inactive_contents() {
        let remote = audio_map("r", DtlsSetup::Active);
        let mut video = content(MediaKind::Video, "l", DtlsSetup::ActPass);
        video.senders = Senders::None;
        let local = audio_map("l", DtlsSetup::ActPass).with_content("1", video);

        let answer = remote
            .rollback_answer(&local, Some(DtlsSetup::Active))
            .unwrap();
        assert_eq!(answer.names(), BTreeSet::from(["0".into(), "1".into()]));
        assert_eq!(answer.get("1").unwrap().senders, Senders::None);
        assert_eq!(answer.dtls_setup(), Ok(DtlsSetup::Active));
    }

    #[test]
    fn test_rollback_answer_fails_loudly() {
        let remote = audio_map("r", DtlsSetup::Active);
        assert!(matches!(
            remote.rollback_answer(&remote, None),
            Err(ContentMapError::InvariantViolation(_))
        ));

        let local = audio_map("l", DtlsSetup::ActPass)
            .with_content("1", content(MediaKind::Video, "l", DtlsSetup::ActPass));
        assert!(matches!(
            remote.rollback_answer(&local, None),
            Err(ContentMapError::InvariantViolation(_))
        ));
    }
}
