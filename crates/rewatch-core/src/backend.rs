//! Backend contracts consumed by the playback core
//!
//! Four operations cross the boundary:
//! - quality existence probe (only used when no permission list exists)
//! - per-content permission list
//! - last watch checkpoint
//! - watch-session recording (errors ignored by callers)

use crate::{
    error::Error,
    manifest::{hls, variant_url},
    types::*,
    Result,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use url::Url;

/// Playback and watch-history services
#[async_trait]
pub trait PlaybackBackend: Send + Sync {
    /// Existence probe for one variant; `None` when the rendition does not exist
    async fn resolve_quality_variant_url(&self, media_id: &str, quality: &str) -> Result<Option<Url>>;

    /// Ordered permission list for a piece of content, possibly empty
    async fn fetch_permission_list(&self, content_id: &str) -> Result<Vec<QualityPermission>>;

    /// Last persisted position, `None` if the viewer never watched it
    async fn fetch_last_watch_checkpoint(
        &self,
        media_id: &str,
        episode_id: &str,
    ) -> Result<Option<WatchCheckpoint>>;

    /// Persist accumulated watch time and progress
    async fn record_watch_session(&self, session: &WatchSession) -> Result<()>;
}

/// HTTP implementation of [`PlaybackBackend`]
pub struct HttpBackend {
    client: Client,
    api_base: Url,
    variant_base: String,
    variant_extension: String,
}

impl HttpBackend {
    /// Create a new HTTP backend from configuration
    pub fn new(config: &PlaybackConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &PlaybackConfig) -> Self {
        Self {
            client,
            api_base: config.api_base_url.clone(),
            variant_base: config.variant_base_url.clone(),
            variant_extension: config.variant_extension.clone(),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.api_base.join(path)?)
    }
}

#[async_trait]
impl PlaybackBackend for HttpBackend {
    #[instrument(skip(self))]
    async fn resolve_quality_variant_url(&self, media_id: &str, quality: &str) -> Result<Option<Url>> {
        let url = Url::parse(&variant_url(
            &self.variant_base,
            media_id,
            quality,
            &self.variant_extension,
        ))?;

        let response = self.client.get(url.clone()).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => return Ok(None),
            status if !status.is_success() => {
                return Err(Error::BackendStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                })
            }
            _ => {}
        }

        // A rendition exists only if its playlist actually parses
        let body = response.bytes().await?;
        match hls::parse_media_playlist(&body) {
            Ok(segments) => {
                debug!(segments, "Variant playlist found");
                Ok(Some(url))
            }
            Err(e) => {
                debug!(error = %e, "Variant playlist unusable");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self))]
    async fn fetch_permission_list(&self, content_id: &str) -> Result<Vec<QualityPermission>> {
        let url = self.endpoint(&format!("media/{}/quality-permissions", content_id))?;
        let response = self.client.get(url.clone()).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => Ok(response.json().await?),
            status => Err(Error::BackendStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }

    #[instrument(skip(self))]
    async fn fetch_last_watch_checkpoint(
        &self,
        media_id: &str,
        episode_id: &str,
    ) -> Result<Option<WatchCheckpoint>> {
        let url = self.endpoint(&format!(
            "media/{}/episodes/{}/checkpoint",
            media_id, episode_id
        ))?;
        let response = self.client.get(url.clone()).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(Error::BackendStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }

    #[instrument(skip(self, session), fields(media_id = %session.media_id, watch_time = session.watch_time_seconds))]
    async fn record_watch_session(&self, session: &WatchSession) -> Result<()> {
        let url = self.endpoint("watch-sessions")?;
        let response = self.client.post(url.clone()).json(session).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::BackendStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

/// Seed data for a [`MemoryBackend`]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MemoryFixture {
    /// Permission lists keyed by content id
    pub permissions: HashMap<String, Vec<QualityPermission>>,
    /// Existing rendition names keyed by media id
    pub available: HashMap<String, Vec<String>>,
    pub checkpoints: Vec<WatchCheckpoint>,
}

/// In-memory backend
///
/// Recorded sessions also advance the stored checkpoint, so a later session
/// for the same content resumes where the previous one stopped.
pub struct MemoryBackend {
    variant_base: String,
    permissions: RwLock<HashMap<String, Vec<QualityPermission>>>,
    available: RwLock<HashMap<String, HashSet<String>>>,
    checkpoints: RwLock<HashMap<(String, String), WatchCheckpoint>>,
    recorded: RwLock<Vec<WatchSession>>,
    fail_permissions: AtomicBool,
    fail_checkpoints: AtomicBool,
    fail_records: AtomicBool,
    probe_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            variant_base: "memory://variants".to_string(),
            permissions: RwLock::new(HashMap::new()),
            available: RwLock::new(HashMap::new()),
            checkpoints: RwLock::new(HashMap::new()),
            recorded: RwLock::new(Vec::new()),
            fail_permissions: AtomicBool::new(false),
            fail_checkpoints: AtomicBool::new(false),
            fail_records: AtomicBool::new(false),
            probe_calls: AtomicUsize::new(0),
        }
    }

    pub fn from_fixture(fixture: MemoryFixture) -> Self {
        let mut backend = Self::new();
        for (content_id, list) in fixture.permissions {
            backend = backend.with_permissions(content_id, list);
        }
        for (media_id, names) in fixture.available {
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            backend = backend.with_available(media_id, &names);
        }
        for checkpoint in fixture.checkpoints {
            backend = backend.with_checkpoint(checkpoint);
        }
        backend
    }

    pub fn with_permissions(mut self, content_id: impl Into<String>, list: Vec<QualityPermission>) -> Self {
        self.permissions.get_mut().insert(content_id.into(), list);
        self
    }

    pub fn with_available(mut self, media_id: impl Into<String>, qualities: &[&str]) -> Self {
        self.available.get_mut().insert(
            media_id.into(),
            qualities.iter().map(|q| q.to_ascii_lowercase()).collect(),
        );
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: WatchCheckpoint) -> Self {
        self.checkpoints.get_mut().insert(
            (checkpoint.media_id.clone(), checkpoint.episode_id.clone()),
            checkpoint,
        );
        self
    }

    /// Make permission-list fetches fail
    pub fn fail_permissions(&self, fail: bool) {
        self.fail_permissions.store(fail, Ordering::SeqCst);
    }

    /// Make checkpoint fetches fail
    pub fn fail_checkpoints(&self, fail: bool) {
        self.fail_checkpoints.store(fail, Ordering::SeqCst);
    }

    /// Make watch-session recording fail
    pub fn fail_records(&self, fail: bool) {
        self.fail_records.store(fail, Ordering::SeqCst);
    }

    /// Sessions accepted so far, in arrival order
    pub async fn recorded_sessions(&self) -> Vec<WatchSession> {
        self.recorded.read().await.clone()
    }

    pub async fn checkpoint(&self, content: &ContentRef) -> Option<WatchCheckpoint> {
        self.checkpoints
            .read()
            .await
            .get(&(content.media_id.clone(), content.episode_id.clone()))
            .cloned()
    }

    /// Number of existence probes served
    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlaybackBackend for MemoryBackend {
    async fn resolve_quality_variant_url(&self, media_id: &str, quality: &str) -> Result<Option<Url>> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);

        let exists = self
            .available
            .read()
            .await
            .get(media_id)
            .is_some_and(|names| names.contains(&quality.to_ascii_lowercase()));

        if !exists {
            return Ok(None);
        }
        let url = variant_url(&self.variant_base, media_id, quality, "m3u8");
        Ok(Some(Url::parse(&url)?))
    }

    async fn fetch_permission_list(&self, content_id: &str) -> Result<Vec<QualityPermission>> {
        if self.fail_permissions.load(Ordering::SeqCst) {
            return Err(Error::BackendStatus {
                status: 503,
                url: format!("memory://permissions/{}", content_id),
            });
        }
        Ok(self
            .permissions
            .read()
            .await
            .get(content_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_last_watch_checkpoint(
        &self,
        media_id: &str,
        episode_id: &str,
    ) -> Result<Option<WatchCheckpoint>> {
        if self.fail_checkpoints.load(Ordering::SeqCst) {
            return Err(Error::BackendStatus {
                status: 503,
                url: format!("memory://checkpoints/{}/{}", media_id, episode_id),
            });
        }
        Ok(self
            .checkpoints
            .read()
            .await
            .get(&(media_id.to_string(), episode_id.to_string()))
            .cloned())
    }

    async fn record_watch_session(&self, session: &WatchSession) -> Result<()> {
        if self.fail_records.load(Ordering::SeqCst) {
            return Err(Error::BackendStatus {
                status: 503,
                url: "memory://watch-sessions".to_string(),
            });
        }

        let key = (session.media_id.clone(), session.episode_id.clone());
        let mut checkpoints = self.checkpoints.write().await;
        let checkpoint = checkpoints.entry(key).or_insert_with(|| WatchCheckpoint {
            media_id: session.media_id.clone(),
            episode_id: session.episode_id.clone(),
            progress_seconds: 0.0,
            duration_seconds: 0.0,
            watch_time_seconds: 0,
            source: session.source.clone(),
            updated_at: None,
        });
        checkpoint.progress_seconds = session.progress_seconds;
        checkpoint.duration_seconds = session.duration_seconds;
        checkpoint.watch_time_seconds += session.watch_time_seconds;
        checkpoint.source = session.source.clone();
        checkpoint.updated_at = Some(chrono::Utc::now());
        drop(checkpoints);

        self.recorded.write().await.push(session.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content() -> ContentRef {
        ContentRef::new("m1", "e1")
    }

    #[tokio::test]
    async fn probe_is_case_insensitive() {
        let backend = MemoryBackend::new().with_available("m1", &["720P"]);

        let found = backend.resolve_quality_variant_url("m1", "720p").await.unwrap();
        assert_eq!(found.unwrap().as_str(), "memory://variants/m1/720p.m3u8");
        assert!(backend.resolve_quality_variant_url("m1", "1080p").await.unwrap().is_none());
        assert_eq!(backend.probe_calls(), 2);
    }

    #[tokio::test]
    async fn recording_advances_checkpoint() {
        let backend = MemoryBackend::new().with_checkpoint(WatchCheckpoint::at(&content(), 30.0));

        backend
            .record_watch_session(&WatchSession {
                media_id: "m1".into(),
                episode_id: "e1".into(),
                watch_time_seconds: 12,
                duration_seconds: 600.0,
                progress_seconds: 42.0,
                source: "web".into(),
            })
            .await
            .unwrap();

        let checkpoint = backend.checkpoint(&content()).await.unwrap();
        assert_eq!(checkpoint.progress_seconds, 42.0);
        assert_eq!(checkpoint.watch_time_seconds, 12);
        assert!(checkpoint.updated_at.is_some());
        assert_eq!(backend.recorded_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_errors() {
        let backend = MemoryBackend::new();
        backend.fail_checkpoints(true);
        backend.fail_permissions(true);

        assert!(backend.fetch_last_watch_checkpoint("m1", "e1").await.is_err());
        assert!(backend.fetch_permission_list("m1").await.is_err());
    }

    #[test]
    fn fixture_deserializes() {
        let fixture: MemoryFixture = serde_json::from_str(
            r#"{
                "permissions": {"m1": [{"qualityName": "360p", "status": "ALLOW"}]},
                "available": {"m2": ["480p"]},
                "checkpoints": [{"mediaId": "m1", "episodeId": "m1", "progressSeconds": 120.0}]
            }"#,
        )
        .unwrap();

        assert_eq!(fixture.permissions["m1"][0].status, PermissionStatus::Allow);
        assert_eq!(fixture.checkpoints[0].progress_seconds, 120.0);
    }
}
