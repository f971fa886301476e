//! Core types for Rewatch

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Unique identifier for a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Common resolutions
    pub const SD_360P: Resolution = Resolution { width: 640, height: 360 };
    pub const SD_480P: Resolution = Resolution { width: 854, height: 480 };
    pub const HD_720P: Resolution = Resolution { width: 1280, height: 720 };
    pub const FHD_1080P: Resolution = Resolution { width: 1920, height: 1080 };
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Per-quality permission as stored by the backend
///
/// Anything the backend sends that is not one of the known statuses
/// deserializes as `Unset`, which is treated as a deny for non-owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionStatus {
    Allow,
    Deny,
    RequireLogin,
    #[default]
    #[serde(other)]
    Unset,
}

impl std::fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionStatus::Allow => write!(f, "allow"),
            PermissionStatus::Deny => write!(f, "deny"),
            PermissionStatus::RequireLogin => write!(f, "require_login"),
            PermissionStatus::Unset => write!(f, "unset"),
        }
    }
}

/// One rendition of the candidate quality ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVariant {
    /// Rendition name, also the variant file stem ("720p")
    pub name: String,
    /// Bandwidth in bits per second
    pub bandwidth: u64,
    /// Video resolution
    pub resolution: Resolution,
    /// Permission resolved for the current viewer
    #[serde(default)]
    pub permission: PermissionStatus,
}

impl QualityVariant {
    pub fn new(name: impl Into<String>, bandwidth: u64, resolution: Resolution) -> Self {
        Self {
            name: name.into(),
            bandwidth,
            resolution,
            permission: PermissionStatus::Unset,
        }
    }

    /// Case-insensitive rendition name comparison
    pub fn matches_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// The fixed 1080p/720p/480p/360p candidate ladder, descending by bandwidth
pub fn default_ladder() -> Vec<QualityVariant> {
    vec![
        QualityVariant::new("1080p", 5_000_000, Resolution::FHD_1080P),
        QualityVariant::new("720p", 2_800_000, Resolution::HD_720P),
        QualityVariant::new("480p", 1_400_000, Resolution::SD_480P),
        QualityVariant::new("360p", 800_000, Resolution::SD_360P),
    ]
}

/// Entry of a per-content permission list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityPermission {
    pub quality_name: String,
    pub status: PermissionStatus,
}

impl QualityPermission {
    pub fn new(quality_name: impl Into<String>, status: PermissionStatus) -> Self {
        Self {
            quality_name: quality_name.into(),
            status,
        }
    }
}

/// Identifies what is being watched
///
/// For non-episodic content the episode id is the content id itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRef {
    pub media_id: String,
    pub episode_id: String,
}

impl ContentRef {
    pub fn new(media_id: impl Into<String>, episode_id: impl Into<String>) -> Self {
        Self {
            media_id: media_id.into(),
            episode_id: episode_id.into(),
        }
    }

    /// Content without episodes, keyed by its own id
    pub fn standalone(media_id: impl Into<String>) -> Self {
        let media_id = media_id.into();
        Self {
            episode_id: media_id.clone(),
            media_id,
        }
    }
}

impl std::fmt::Display for ContentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.media_id == self.episode_id {
            write!(f, "{}", self.media_id)
        } else {
            write!(f, "{}/{}", self.media_id, self.episode_id)
        }
    }
}

/// Last persisted watch position for a piece of content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchCheckpoint {
    pub media_id: String,
    pub episode_id: String,
    pub progress_seconds: f64,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub watch_time_seconds: u64,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl WatchCheckpoint {
    pub fn at(content: &ContentRef, progress_seconds: f64) -> Self {
        Self {
            media_id: content.media_id.clone(),
            episode_id: content.episode_id.clone(),
            progress_seconds,
            duration_seconds: 0.0,
            watch_time_seconds: 0,
            source: String::new(),
            updated_at: None,
        }
    }
}

/// Watch-session payload flushed to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchSession {
    pub media_id: String,
    pub episode_id: String,
    /// Real elapsed seconds spent playing since the previous flush
    pub watch_time_seconds: u64,
    /// Offset-corrected content duration
    pub duration_seconds: f64,
    /// Playhead at flush time
    pub progress_seconds: f64,
    pub source: String,
}

/// Playback session states
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PlaybackState {
    /// No source attached
    Idle,
    /// Resolving the source and constructing the engine
    Initializing,
    /// Engine attached, waiting for the manifest to parse
    ManifestLoading,
    /// Manifest parsed, not yet playing
    ReadyPaused,
    Playing,
    Paused,
    Ended,
    /// Fatal engine error; a new attach is required
    Error { reason: String },
    /// Terminal, engine and manifest handle released
    Disposed,
}

impl PlaybackState {
    /// Check if transition to target state is valid
    pub fn can_transition_to(&self, target: &PlaybackState) -> bool {
        use PlaybackState::*;
        match (self, target) {
            (Disposed, _) => false,
            (_, Disposed) => true,
            // Releasing the current source always returns to Idle
            (Idle, Idle) => false,
            (_, Idle) => true,
            (Error { .. }, Error { .. }) => false,
            (Idle, Error { .. }) => false,
            (_, Error { .. }) => true,
            (Idle, Initializing)
            | (Initializing, ManifestLoading)
            | (ManifestLoading, ReadyPaused)
            | (ReadyPaused, Playing)
            | (Playing, Paused)
            | (Playing, Ended)
            | (Paused, Playing)
            | (Paused, Ended)
            | (Ended, Playing) => true,
            _ => false,
        }
    }

    /// Quality switches are only accepted once the manifest is parsed
    pub fn accepts_quality_switch(&self) -> bool {
        matches!(
            self,
            PlaybackState::ReadyPaused | PlaybackState::Playing | PlaybackState::Paused
        )
    }

    /// Seeks need an attached, parsed manifest
    pub fn accepts_seek(&self) -> bool {
        self.accepts_quality_switch() || matches!(self, PlaybackState::Ended)
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, PlaybackState::Disposed)
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Idle => write!(f, "idle"),
            PlaybackState::Initializing => write!(f, "initializing"),
            PlaybackState::ManifestLoading => write!(f, "manifest_loading"),
            PlaybackState::ReadyPaused => write!(f, "ready_paused"),
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Paused => write!(f, "paused"),
            PlaybackState::Ended => write!(f, "ended"),
            PlaybackState::Error { .. } => write!(f, "error"),
            PlaybackState::Disposed => write!(f, "disposed"),
        }
    }
}

/// Playback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Base URL of the playback/watch-history API
    pub api_base_url: Url,
    /// Prefix of variant playlist URLs (`{base}/{mediaId}/{quality}.{ext}`)
    pub variant_base_url: String,
    /// Variant playlist extension
    pub variant_extension: String,
    /// Candidate ladder, strictly descending by bandwidth
    pub ladder: Vec<QualityVariant>,
    /// Watch-time tick interval in milliseconds
    pub watch_tick_ms: u64,
    /// Request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Attempt playback as soon as the manifest is parsed
    pub autoplay: bool,
    /// Source tag attached to recorded watch sessions
    pub source: String,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            api_base_url: Url::parse("http://localhost:8080/api/")
                .expect("default API URL is valid"),
            variant_base_url: "http://localhost:8080/videos".to_string(),
            variant_extension: "m3u8".to_string(),
            ladder: default_ladder(),
            watch_tick_ms: 1000,
            request_timeout_ms: 10000,
            autoplay: true,
            source: "web".to_string(),
        }
    }
}

impl PlaybackConfig {
    /// Reject configurations the subsystem cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.ladder.is_empty() {
            return Err(Error::InvalidConfig("quality ladder is empty".into()));
        }
        if self
            .ladder
            .windows(2)
            .any(|pair| pair[0].bandwidth <= pair[1].bandwidth)
        {
            return Err(Error::InvalidConfig(
                "quality ladder must be strictly descending by bandwidth".into(),
            ));
        }
        if self.watch_tick_ms == 0 {
            return Err(Error::InvalidConfig("watch_tick_ms must be > 0".into()));
        }
        if self.variant_extension.is_empty() {
            return Err(Error::InvalidConfig("variant_extension is empty".into()));
        }
        Ok(())
    }

    pub fn watch_tick(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.watch_tick_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ladder_is_descending() {
        let ladder = default_ladder();
        let names: Vec<_> = ladder.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, ["1080p", "720p", "480p", "360p"]);
        assert!(PlaybackConfig::default().validate().is_ok());
    }

    #[test]
    fn ascending_ladder_is_rejected() {
        let mut config = PlaybackConfig::default();
        config.ladder.reverse();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn unknown_permission_status_deserializes_as_unset() {
        let entry: QualityPermission =
            serde_json::from_str(r#"{"qualityName":"720p","status":"MAYBE"}"#).unwrap();
        assert_eq!(entry.status, PermissionStatus::Unset);

        let entry: QualityPermission =
            serde_json::from_str(r#"{"qualityName":"720p","status":"REQUIRE_LOGIN"}"#).unwrap();
        assert_eq!(entry.status, PermissionStatus::RequireLogin);
    }

    #[test]
    fn state_transitions() {
        use PlaybackState::*;
        assert!(Idle.can_transition_to(&Initializing));
        assert!(Initializing.can_transition_to(&ManifestLoading));
        assert!(ManifestLoading.can_transition_to(&ReadyPaused));
        assert!(ReadyPaused.can_transition_to(&Playing));
        assert!(Playing.can_transition_to(&Paused));
        assert!(Paused.can_transition_to(&Playing));
        assert!(Playing.can_transition_to(&Ended));
        assert!(Playing.can_transition_to(&Error { reason: "drm".into() }));
        assert!(Ended.can_transition_to(&Idle));

        assert!(!Idle.can_transition_to(&Playing));
        assert!(!ReadyPaused.can_transition_to(&Ended));
        assert!(!Disposed.can_transition_to(&Idle));
        assert!(!Disposed.can_transition_to(&Disposed));
    }

    #[test]
    fn config_round_trips_through_json_with_defaults() {
        let config: PlaybackConfig =
            serde_json::from_str(r#"{"source":"tv","watch_tick_ms":500}"#).unwrap();
        assert_eq!(config.source, "tv");
        assert_eq!(config.watch_tick_ms, 500);
        assert_eq!(config.ladder.len(), 4);
        assert_eq!(config.variant_extension, "m3u8");
    }
}
