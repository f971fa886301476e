//! Decode engine boundary
//!
//! The engine is opaque: it takes commands and reports back through an
//! event queue owned by the session. Errors it reports are classified here
//! into transient (the engine retries on its own) and fatal.

use crate::{manifest::hls, session::SessionEvent, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

/// What went wrong inside the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    Network,
    SegmentFetch,
    ManifestParse,
    UnsupportedMedia,
    Drm,
    /// Playback start refused by the host (autoplay policy)
    PlaybackBlocked,
    Other,
}

impl std::fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineErrorKind::Network => write!(f, "network"),
            EngineErrorKind::SegmentFetch => write!(f, "segment_fetch"),
            EngineErrorKind::ManifestParse => write!(f, "manifest_parse"),
            EngineErrorKind::UnsupportedMedia => write!(f, "unsupported_media"),
            EngineErrorKind::Drm => write!(f, "drm"),
            EngineErrorKind::PlaybackBlocked => write!(f, "playback_blocked"),
            EngineErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The engine recovers on its own
    Transient,
    /// Playback cannot continue without a new attach
    Fatal,
}

/// Error reported by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineError {
    pub kind: EngineErrorKind,
    /// Engine gave up retrying
    #[serde(default)]
    pub fatal: bool,
    pub reason: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            fatal: false,
            reason: reason.into(),
        }
    }

    pub fn fatal(kind: EngineErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            fatal: true,
            reason: reason.into(),
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.kind {
            EngineErrorKind::ManifestParse | EngineErrorKind::UnsupportedMedia | EngineErrorKind::Drm => {
                ErrorSeverity::Fatal
            }
            EngineErrorKind::Network
            | EngineErrorKind::SegmentFetch
            | EngineErrorKind::PlaybackBlocked
            | EngineErrorKind::Other => {
                if self.fatal {
                    ErrorSeverity::Fatal
                } else {
                    ErrorSeverity::Transient
                }
            }
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

/// A media segment appended to the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentAppend {
    /// Belongs to the primary (main) track
    pub primary: bool,
    /// Initialization segment (no media samples)
    pub init_segment: bool,
    pub has_video: bool,
    /// Position of the segment on the playlist timeline
    pub nominal_start: f64,
    /// First video decode timestamp inside the segment
    pub video_decode_start: Option<f64>,
}

impl SegmentAppend {
    /// Video media segment of the primary track
    pub fn video(nominal_start: f64, video_decode_start: f64) -> Self {
        Self {
            primary: true,
            init_segment: false,
            has_video: true,
            nominal_start,
            video_decode_start: Some(video_decode_start),
        }
    }
}

/// Events reported by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Manifest parsed; levels in manifest order
    ManifestParsed { levels: Vec<String> },
    /// Media metadata available
    MetadataLoaded { duration: f64 },
    SegmentAppended(SegmentAppend),
    TimeUpdate { position: f64 },
    Playing,
    Paused,
    /// Playback stalled on an empty buffer
    Waiting,
    Ended,
    Error(EngineError),
}

/// What the engine is asked to load
#[derive(Debug, Clone)]
pub enum EngineSource {
    /// Synthesized manifest behind a transient handle
    Manifest { uri: String, text: Arc<str> },
    /// Raw absolute URL
    Url(Url),
}

impl EngineSource {
    pub fn uri(&self) -> String {
        match self {
            EngineSource::Manifest { uri, .. } => uri.clone(),
            EngineSource::Url(url) => url.to_string(),
        }
    }
}

/// Sending half of a session's event queue, handed to one engine
#[derive(Debug, Clone)]
pub struct EngineEvents {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EngineEvents {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    /// Queue an event; returns false once the session stopped listening
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.tx.send(SessionEvent::Engine(event)).is_ok()
    }
}

/// Segmented-media decode engine bound to one sink
pub trait DecodeEngine: Send {
    fn load(&mut self, source: EngineSource) -> std::result::Result<(), EngineError>;

    fn play(&mut self) -> std::result::Result<(), EngineError>;

    fn pause(&mut self);

    fn seek(&mut self, position: f64);

    /// Preferred rendition, as an index into the manifest order
    fn set_preferred_level(&mut self, index: usize);

    /// Detach from the sink and release all resources
    fn destroy(&mut self);
}

/// Builds engines for a session
pub trait EngineFactory: Send + Sync {
    fn create(&self, events: EngineEvents) -> Result<Box<dyn DecodeEngine>>;
}

/// Behavior of a [`ScriptedEngine`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineScript {
    /// Levels reported for raw URL sources
    pub levels: Vec<String>,
    /// Duration reported after the manifest parses
    pub duration: Option<f64>,
    /// Segments appended after metadata
    pub segments: Vec<SegmentAppend>,
    /// Refuse the first play request
    pub block_autoplay: bool,
}

/// Command received by a scripted engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Created(u64),
    Load { engine: u64, uri: String },
    Play(u64),
    Pause(u64),
    Seek(u64, f64),
    SetLevel(u64, usize),
    Destroyed(u64),
}

#[derive(Debug, Default)]
struct ScriptState {
    calls: Mutex<Vec<EngineCall>>,
    events: Mutex<Option<EngineEvents>>,
    next_id: AtomicU64,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptState {
    fn record(&self, call: EngineCall) {
        debug!(?call, "Engine call");
        lock(&self.calls).push(call);
    }
}

/// Deterministic engine driven by an [`EngineScript`]
///
/// Synthesized manifests are really parsed, so a malformed playlist
/// surfaces as a fatal manifest-parse error.
pub struct ScriptedEngine {
    id: u64,
    script: EngineScript,
    events: EngineEvents,
    state: Arc<ScriptState>,
    play_requests: u32,
    destroyed: bool,
}

impl ScriptedEngine {
    fn announce_media(&self, levels: Vec<String>) {
        self.events.emit(EngineEvent::ManifestParsed { levels });
        if let Some(duration) = self.script.duration {
            self.events.emit(EngineEvent::MetadataLoaded { duration });
        }
        for segment in &self.script.segments {
            self.events.emit(EngineEvent::SegmentAppended(segment.clone()));
        }
    }
}

impl DecodeEngine for ScriptedEngine {
    fn load(&mut self, source: EngineSource) -> std::result::Result<(), EngineError> {
        self.state.record(EngineCall::Load {
            engine: self.id,
            uri: source.uri(),
        });

        let levels = match &source {
            EngineSource::Manifest { text, .. } => match hls::read_master(text) {
                Ok(entries) => entries.iter().map(|e| e.quality_name().to_string()).collect(),
                Err(e) => {
                    self.events.emit(EngineEvent::Error(EngineError::fatal(
                        EngineErrorKind::ManifestParse,
                        e.to_string(),
                    )));
                    return Ok(());
                }
            },
            EngineSource::Url(_) => self.script.levels.clone(),
        };

        self.announce_media(levels);
        Ok(())
    }

    fn play(&mut self) -> std::result::Result<(), EngineError> {
        self.state.record(EngineCall::Play(self.id));
        self.play_requests += 1;

        if self.script.block_autoplay && self.play_requests == 1 {
            return Err(EngineError::new(
                EngineErrorKind::PlaybackBlocked,
                "autoplay refused",
            ));
        }
        self.events.emit(EngineEvent::Playing);
        Ok(())
    }

    fn pause(&mut self) {
        self.state.record(EngineCall::Pause(self.id));
        self.events.emit(EngineEvent::Paused);
    }

    fn seek(&mut self, position: f64) {
        self.state.record(EngineCall::Seek(self.id, position));
        self.events.emit(EngineEvent::TimeUpdate { position });
    }

    fn set_preferred_level(&mut self, index: usize) {
        self.state.record(EngineCall::SetLevel(self.id, index));
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.state.active.fetch_sub(1, Ordering::SeqCst);
        self.state.record(EngineCall::Destroyed(self.id));
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Factory for [`ScriptedEngine`]s sharing one call log
#[derive(Clone)]
pub struct ScriptedEngineFactory {
    script: EngineScript,
    state: Arc<ScriptState>,
}

impl ScriptedEngineFactory {
    pub fn new(script: EngineScript) -> Self {
        Self {
            script,
            state: Arc::new(ScriptState::default()),
        }
    }

    /// Every command received by every engine, in order
    pub fn calls(&self) -> Vec<EngineCall> {
        lock(&self.state.calls).clone()
    }

    /// Seek positions across all engines
    pub fn seeks(&self) -> Vec<f64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Seek(_, position) => Some(position),
                _ => None,
            })
            .collect()
    }

    /// Engines currently attached
    pub fn active(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously attached engines
    pub fn peak_active(&self) -> usize {
        self.state.peak_active.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> u64 {
        self.state.next_id.load(Ordering::SeqCst)
    }

    /// Emit an event from the most recently created engine
    pub fn emit(&self, event: EngineEvent) -> bool {
        lock(&self.state.events)
            .as_ref()
            .is_some_and(|events| events.emit(event))
    }
}

impl EngineFactory for ScriptedEngineFactory {
    fn create(&self, events: EngineEvents) -> Result<Box<dyn DecodeEngine>> {
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_active.fetch_max(active, Ordering::SeqCst);
        self.state.record(EngineCall::Created(id));
        *lock(&self.state.events) = Some(events.clone());

        Ok(Box::new(ScriptedEngine {
            id,
            script: self.script.clone(),
            events,
            state: Arc::clone(&self.state),
            play_requests: 0,
            destroyed: false,
        }))
    }
}
