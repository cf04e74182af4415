//! Media kinds negotiated in an RTP session.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// The set of media kinds carried by a session, proposal or content map.
pub type MediaSet = BTreeSet<MediaKind>;

impl MediaKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    /// True when the set contains audio and nothing else.
    pub fn audio_only(media: &MediaSet) -> bool {
        media.len() == 1 && media.contains(&Self::Audio)
    }

    /// True when the set contains video and nothing else.
    pub fn video_only(media: &MediaSet) -> bool {
        media.len() == 1 && media.contains(&Self::Video)
    }

    pub fn set_of(kinds: &[MediaKind]) -> MediaSet {
        kinds.iter().copied().collect()
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown media kind: {other}")),
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_and_video_only() {
        let audio = MediaKind::set_of(&[MediaKind::Audio]);
        let video = MediaKind::set_of(&[MediaKind::Video]);
        let both = MediaKind::set_of(&[MediaKind::Audio, MediaKind::Video]);

        assert!(MediaKind::audio_only(&audio));
        assert!(!MediaKind::audio_only(&both));
        assert!(MediaKind::video_only(&video));
        assert!(!MediaKind::video_only(&MediaSet::new()));
    }

    #[test]
    fn test_media_kind_parsing() {
        assert_eq!("AUDIO".parse(), Ok(MediaKind::Audio));
        assert_eq!("video".parse(), Ok(MediaKind::Video));
        assert!("application".parse::<MediaKind>().is_err());
    }
}
