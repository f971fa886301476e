//! Multivariant manifest synthesis
//!
//! The permitted part of a resolved ladder is rendered as an HLS master
//! playlist and published under a transient `blob:` handle. At most one
//! handle per synthesizer is live: creating a new one revokes the previous,
//! and dropping a handle revokes it.

pub mod hls;

use crate::{error::Error, permissions::ResolvedLadder, types::*, Result};
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Playlist version written in the header
const HLS_VERSION: u8 = 3;

/// Variant playlist URL: `{base}/{mediaId}/{qualityName}.{ext}`
pub fn variant_url(base: &str, media_id: &str, quality: &str, extension: &str) -> String {
    format!(
        "{}/{}/{}.{}",
        base.trim_end_matches('/'),
        media_id,
        quality,
        extension
    )
}

/// Rendered multivariant playlist
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestDocument {
    pub media_id: String,
    /// Permitted variants, descending by bandwidth
    pub variants: Vec<QualityVariant>,
    pub text: String,
}

impl ManifestDocument {
    /// Render permitted variants; an empty set is an error, never a silent
    /// empty playlist.
    pub fn render(
        media_id: &str,
        mut variants: Vec<QualityVariant>,
        base: &str,
        extension: &str,
    ) -> Result<Self> {
        if variants.is_empty() {
            return Err(Error::NoPermittedQualities {
                media_id: media_id.to_string(),
            });
        }

        // The engine starts on the first entry
        variants.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));

        let mut text = String::new();
        let _ = write!(text, "#EXTM3U\n#EXT-X-VERSION:{}\n\n", HLS_VERSION);
        for variant in &variants {
            let _ = write!(
                text,
                "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}\n{}\n\n",
                variant.bandwidth,
                variant.resolution,
                variant_url(base, media_id, &variant.name, extension)
            );
        }

        Ok(Self {
            media_id: media_id.to_string(),
            variants,
            text,
        })
    }

    /// Name of the variant the engine picks by default
    pub fn initial_quality(&self) -> Option<&str> {
        self.variants.first().map(|v| v.name.as_str())
    }
}

/// Backing store for manifest handles
#[derive(Debug, Clone, Default)]
pub struct ManifestRegistry {
    entries: Arc<Mutex<HashMap<Uuid, Arc<str>>>>,
}

impl ManifestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<str>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish playlist text under a fresh handle
    pub fn create(&self, text: &str) -> ManifestHandle {
        let id = Uuid::new_v4();
        self.lock().insert(id, Arc::from(text));
        ManifestHandle {
            id,
            registry: self.clone(),
        }
    }

    /// Resolve a `blob:` URI to its playlist text while it is live
    pub fn resolve(&self, uri: &str) -> Option<Arc<str>> {
        let id = uri.strip_prefix(ManifestHandle::SCHEME)?;
        let id = Uuid::parse_str(id).ok()?;
        self.lock().get(&id).cloned()
    }

    fn revoke(&self, id: Uuid) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Handles not yet revoked
    pub fn live_count(&self) -> usize {
        self.lock().len()
    }
}

/// Transient handle to a published manifest, revoked on drop
#[derive(Debug)]
pub struct ManifestHandle {
    id: Uuid,
    registry: ManifestRegistry,
}

impl ManifestHandle {
    const SCHEME: &'static str = "blob:rewatch/";

    pub fn uri(&self) -> String {
        format!("{}{}", Self::SCHEME, self.id)
    }

    /// Playlist text, `None` once revoked
    pub fn text(&self) -> Option<Arc<str>> {
        self.registry.lock().get(&self.id).cloned()
    }

    pub fn is_live(&self) -> bool {
        self.registry.lock().contains_key(&self.id)
    }

    /// Release the backing text; idempotent
    pub fn revoke(&self) {
        if self.registry.revoke(self.id) {
            debug!(handle = %self.id, "Manifest handle revoked");
        }
    }
}

impl Drop for ManifestHandle {
    fn drop(&mut self) {
        self.revoke();
    }
}

/// A rendered manifest together with its handle and the ladder it came from
#[derive(Debug)]
pub struct SynthesizedManifest {
    pub handle: ManifestHandle,
    pub document: ManifestDocument,
    pub ladder: ResolvedLadder,
}

/// Renders resolved ladders into published manifests
pub struct ManifestSynthesizer {
    registry: ManifestRegistry,
    variant_base: String,
    variant_extension: String,
    current: Option<Uuid>,
}

impl ManifestSynthesizer {
    pub fn new(registry: ManifestRegistry, config: &PlaybackConfig) -> Self {
        Self {
            registry,
            variant_base: config.variant_base_url.clone(),
            variant_extension: config.variant_extension.clone(),
            current: None,
        }
    }

    pub fn registry(&self) -> &ManifestRegistry {
        &self.registry
    }

    /// Render the permitted variants of `ladder` and publish them, revoking
    /// the previously published handle first.
    #[instrument(skip(self, ladder), fields(media_id = %ladder.media_id))]
    pub fn synthesize(&mut self, ladder: ResolvedLadder) -> Result<SynthesizedManifest> {
        self.revoke_current();

        let document = ManifestDocument::render(
            &ladder.media_id,
            ladder.permitted(),
            &self.variant_base,
            &self.variant_extension,
        )?;
        let handle = self.registry.create(&document.text);
        self.current = Some(handle.id);

        info!(
            handle = %handle.uri(),
            variants = document.variants.len(),
            initial = document.initial_quality().unwrap_or_default(),
            "Manifest synthesized"
        );

        Ok(SynthesizedManifest {
            handle,
            document,
            ladder,
        })
    }

    /// Revoke the most recently published handle, if still live
    pub fn revoke_current(&mut self) {
        if let Some(id) = self.current.take() {
            if self.registry.revoke(id) {
                debug!(handle = %id, "Previous manifest handle revoked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::QualityResolver;

    fn config() -> PlaybackConfig {
        PlaybackConfig {
            variant_base_url: "https://cdn.example.com/videos/".to_string(),
            ..Default::default()
        }
    }

    fn allow(names: &[&str]) -> ResolvedLadder {
        QualityResolver::default().resolve_with_list(
            &ContentRef::standalone("m1"),
            names
                .iter()
                .map(|n| QualityPermission::new(*n, PermissionStatus::Allow))
                .collect(),
        )
    }

    #[test]
    fn renders_descending_blank_line_separated_entries() {
        let ladder = allow(&["360p", "1080p"]);
        let document = ManifestDocument::render(
            "m1",
            ladder.permitted(),
            "https://cdn.example.com/videos",
            "m3u8",
        )
        .unwrap();

        assert_eq!(
            document.text,
            "#EXTM3U\n#EXT-X-VERSION:3\n\n\
             #EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080\n\
             https://cdn.example.com/videos/m1/1080p.m3u8\n\n\
             #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\n\
             https://cdn.example.com/videos/m1/360p.m3u8\n\n"
        );
        assert_eq!(document.initial_quality(), Some("1080p"));
    }

    #[test]
    fn unordered_input_is_sorted_by_bandwidth() {
        let variants = vec![
            QualityVariant::new("low", 100, Resolution::SD_360P),
            QualityVariant::new("high", 300, Resolution::FHD_1080P),
            QualityVariant::new("mid", 200, Resolution::HD_720P),
        ];
        let document = ManifestDocument::render("m1", variants, "/v", "mpd").unwrap();
        let order: Vec<_> = document.variants.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(order, ["high", "mid", "low"]);
        assert!(document.text.contains("/v/m1/high.mpd\n"));
    }

    #[test]
    fn empty_variant_set_is_an_error() {
        let result = ManifestDocument::render("m1", Vec::new(), "/v", "m3u8");
        assert!(matches!(result, Err(Error::NoPermittedQualities { .. })));
    }

    #[test]
    fn rendered_text_reads_back_as_master_playlist() {
        let mut synthesizer = ManifestSynthesizer::new(ManifestRegistry::new(), &config());
        let manifest = synthesizer.synthesize(allow(&["720p", "480p"])).unwrap();

        let entries = hls::read_master(&manifest.handle.text().unwrap()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.quality_name().to_string()).collect();
        assert_eq!(names, ["720p", "480p"]);
        assert_eq!(entries[0].uri, "https://cdn.example.com/videos/m1/720p.m3u8");
    }

    #[test]
    fn new_synthesis_revokes_previous_handle() {
        let registry = ManifestRegistry::new();
        let mut synthesizer = ManifestSynthesizer::new(registry.clone(), &config());

        let first = synthesizer.synthesize(allow(&["720p"])).unwrap();
        let first_uri = first.handle.uri();
        assert!(registry.resolve(&first_uri).is_some());

        let second = synthesizer.synthesize(allow(&["360p"])).unwrap();
        assert!(!first.handle.is_live());
        assert!(registry.resolve(&first_uri).is_none());
        assert!(second.handle.is_live());
        assert_eq!(registry.live_count(), 1);
    }

    #[test]
    fn dropping_handle_revokes_it() {
        let registry = ManifestRegistry::new();
        let handle = registry.create("#EXTM3U\n");
        let uri = handle.uri();
        assert_eq!(registry.live_count(), 1);

        drop(handle);
        assert_eq!(registry.live_count(), 0);
        assert!(registry.resolve(&uri).is_none());
    }
}
