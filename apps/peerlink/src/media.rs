//! Boundary with the capture subsystem: tracks handed to an endpoint before
//! it creates an offer or answer are listed in its session description.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl MediaTrack {
    pub fn audio(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Audio,
        }
    }

    pub fn video(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Video,
        }
    }
}
