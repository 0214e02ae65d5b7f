//! Companion audio-asset side channel.
//!
//! The packaged audio bundle is served by an external HTTP collaborator;
//! this system only carries the "bundle ready, hash=H, url=U" fact and
//! turns it into an [`AssetAnnounce`] for viewers when a session's
//! first frame goes out.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::VidmapError;
use crate::protocol::AssetAnnounce;

/// A ready-to-fetch audio bundle: where it lives and what it contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioBundle {
    /// URL the external side-channel serves the bundle from.
    pub url: String,
    /// blake3 content hash (hex) viewers compare before re-fetching.
    pub hash: String,
}

impl AudioBundle {
    /// Describe a bundle from its packaged bytes.
    pub fn from_bytes(url: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            url: url.into(),
            hash: blake3::hash(bytes).to_hex().to_string(),
        }
    }

    /// Describe a bundle from a packaged file on disk.
    pub fn from_file(url: impl Into<String>, path: &Path) -> Result<Self, VidmapError> {
        let bytes = std::fs::read(path)?;
        Ok(Self::from_bytes(url, &bytes))
    }

    /// The wire message announcing this bundle to a viewer.
    pub fn announcement(&self) -> AssetAnnounce {
        AssetAnnounce {
            url: self.url.clone(),
            hash: self.hash.clone(),
            required: false,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_tracks_content() {
        let a = AudioBundle::from_bytes("http://host/pack", b"music");
        let b = AudioBundle::from_bytes("http://host/pack", b"music");
        let c = AudioBundle::from_bytes("http://host/pack", b"other");
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn announcement_carries_url_and_hash() {
        let bundle = AudioBundle::from_bytes("http://host/pack", b"music");
        let announce = bundle.announcement();
        assert_eq!(announce.url, bundle.url);
        assert_eq!(announce.hash, bundle.hash);
        assert!(!announce.required);
    }
}
