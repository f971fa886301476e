//! Playback Session - Main orchestrator for one media sink
//!
//! Coordinates:
//! - Source resolution and manifest synthesis
//! - Decode engine lifecycle (one engine per sink, released on every exit path)
//! - State machine transitions driven by engine events
//! - Timestamp offset correction
//! - One-shot resume seek
//! - Watch-time recording

use crate::{
    backend::PlaybackBackend,
    engine::{DecodeEngine, EngineError, EngineErrorKind, EngineEvent, EngineEvents, EngineFactory, EngineSource, ErrorSeverity},
    error::Error,
    manifest::{ManifestRegistry, ManifestSynthesizer, SynthesizedManifest},
    offset::OffsetCorrector,
    permissions::{QualityResolver, ResolvedLadder, SwitchDecision},
    recorder::WatchRecorder,
    resume::ResumePlanner,
    types::*,
    Result,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// What to attach
#[derive(Debug)]
pub enum MediaSource {
    /// Resolve the quality ladder for the content and synthesize a manifest
    Content { owner_override: bool },
    /// Manifest synthesized by the caller
    Manifest(SynthesizedManifest),
    /// Raw absolute URL, no permission filtering
    Url(Url),
}

/// Queue entry of a session
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Engine(EngineEvent),
    Checkpoint(Option<WatchCheckpoint>),
}

/// Commands accepted by [`PlaybackSession::run`]
#[derive(Debug)]
pub enum SessionCommand {
    Attach {
        content: ContentRef,
        source: MediaSource,
        reply: oneshot::Sender<Result<()>>,
    },
    Play,
    Pause,
    Seek(f64),
    SwitchQuality {
        quality: String,
        reply: oneshot::Sender<Result<()>>,
    },
    RefreshPermissions {
        owner_override: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Dispose,
}

/// Playback session bound to one media sink
pub struct PlaybackSession {
    /// Unique session ID
    id: SessionId,
    config: PlaybackConfig,
    backend: Arc<dyn PlaybackBackend>,
    engines: Arc<dyn EngineFactory>,
    resolver: QualityResolver,
    synthesizer: ManifestSynthesizer,
    state: PlaybackState,
    /// State change broadcaster
    state_tx: watch::Sender<PlaybackState>,
    engine: Option<Box<dyn DecodeEngine>>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    manifest: Option<SynthesizedManifest>,
    content: Option<ContentRef>,
    /// Levels reported by the engine, in manifest order
    levels: Vec<String>,
    current_quality: Option<String>,
    offset: OffsetCorrector,
    resume: ResumePlanner,
    checkpoint_pending: bool,
    /// A play request the engine has not confirmed yet
    play_pending: bool,
    recorder: WatchRecorder,
    flushes: Vec<JoinHandle<()>>,
    raw_duration: Option<f64>,
    position: f64,
}

impl PlaybackSession {
    /// Create a new playback session
    pub fn new(
        config: PlaybackConfig,
        backend: Arc<dyn PlaybackBackend>,
        engines: Arc<dyn EngineFactory>,
    ) -> Result<Self> {
        Self::with_registry(config, backend, engines, ManifestRegistry::new())
    }

    /// Create a session publishing manifests into a shared registry
    pub fn with_registry(
        config: PlaybackConfig,
        backend: Arc<dyn PlaybackBackend>,
        engines: Arc<dyn EngineFactory>,
        registry: ManifestRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let (state_tx, _) = watch::channel(PlaybackState::Idle);

        Ok(Self {
            id: SessionId::new(),
            resolver: QualityResolver::new(config.ladder.clone()),
            synthesizer: ManifestSynthesizer::new(registry, &config),
            recorder: WatchRecorder::new(Arc::clone(&backend), config.source.clone(), config.watch_tick()),
            config,
            backend,
            engines,
            state: PlaybackState::Idle,
            state_tx,
            engine: None,
            events: None,
            manifest: None,
            content: None,
            levels: Vec::new(),
            current_quality: None,
            offset: OffsetCorrector::new(),
            resume: ResumePlanner::new(),
            checkpoint_pending: false,
            play_pending: false,
            flushes: Vec::new(),
            raw_duration: None,
            position: 0.0,
        })
    }

    /// Get session ID
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Get current state
    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    /// Subscribe to state changes
    pub fn subscribe_state(&self) -> watch::Receiver<PlaybackState> {
        self.state_tx.subscribe()
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    /// Duration as reported by the engine
    pub fn raw_duration(&self) -> Option<f64> {
        self.raw_duration
    }

    /// Duration with the timestamp offset removed
    pub fn corrected_duration(&self) -> Option<f64> {
        self.raw_duration.map(|raw| self.offset.corrected_duration(raw))
    }

    pub fn offset(&self) -> f64 {
        self.offset.offset()
    }

    pub fn current_quality(&self) -> Option<&str> {
        self.current_quality.as_deref()
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn ladder(&self) -> Option<&ResolvedLadder> {
        self.manifest.as_ref().map(|m| &m.ladder)
    }

    pub fn manifest(&self) -> Option<&SynthesizedManifest> {
        self.manifest.as_ref()
    }

    pub fn registry(&self) -> &ManifestRegistry {
        self.synthesizer.registry()
    }

    pub fn content(&self) -> Option<&ContentRef> {
        self.content.as_ref()
    }

    /// Watch seconds accumulated since the last flush
    pub fn watch_seconds(&self) -> u64 {
        self.recorder.accumulated_seconds()
    }

    /// Reason of the fatal error, while in the error state
    pub fn error_reason(&self) -> Option<&str> {
        match &self.state {
            PlaybackState::Error { reason } => Some(reason),
            _ => None,
        }
    }

    /// Transition to new state
    fn set_state(&mut self, new_state: PlaybackState) -> Result<()> {
        if !self.state.can_transition_to(&new_state) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: new_state.to_string(),
            });
        }

        let previous = std::mem::replace(&mut self.state, new_state.clone());
        self.state_tx.send_replace(new_state.clone());
        info!(session_id = %self.id, from = %previous, to = %new_state, "State transition");

        if new_state == PlaybackState::Playing {
            self.recorder.start();
        } else if previous == PlaybackState::Playing {
            self.flush_watch();
        }
        Ok(())
    }

    fn transition(&mut self, new_state: PlaybackState) {
        if let Err(e) = self.set_state(new_state) {
            debug!(error = %e, "Transition skipped");
        }
    }

    /// Attach a source, releasing whatever was attached before
    #[instrument(skip(self, content, source), fields(session_id = %self.id, content = %content))]
    pub async fn attach(&mut self, content: ContentRef, source: MediaSource) -> Result<()> {
        if self.state.is_disposed() {
            return Err(Error::SessionDisposed);
        }

        // The previous engine is gone before anything new is built
        self.release();
        self.set_state(PlaybackState::Initializing)?;

        self.offset = OffsetCorrector::new();
        self.resume = ResumePlanner::new();
        self.levels.clear();
        self.current_quality = None;
        self.raw_duration = None;
        self.position = 0.0;
        self.content = Some(content.clone());
        self.recorder.bind(content.clone());

        let engine_source = match source {
            MediaSource::Content { owner_override } => match self.synthesize(&content, owner_override).await {
                Ok(manifest) => self.adopt_manifest(manifest),
                Err(e) => {
                    self.enter_error(e.to_string());
                    return Err(e);
                }
            },
            MediaSource::Manifest(manifest) => self.adopt_manifest(manifest),
            MediaSource::Url(url) => EngineSource::Url(url),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(rx);

        // Installed before the engine exists so no append is missed
        self.offset.install();

        let mut engine = match self.engines.create(EngineEvents::new(tx.clone())) {
            Ok(engine) => engine,
            Err(e) => {
                self.enter_error(e.to_string());
                return Err(e);
            }
        };

        self.spawn_checkpoint_fetch(tx, content);
        self.set_state(PlaybackState::ManifestLoading)?;

        info!(source = %engine_source.uri(), "Loading source");
        let loaded = engine.load(engine_source);
        self.engine = Some(engine);

        if let Err(e) = loaded {
            return self.engine_command_failed(e);
        }
        Ok(())
    }

    async fn synthesize(&mut self, content: &ContentRef, owner_override: bool) -> Result<SynthesizedManifest> {
        let ladder = self
            .resolver
            .resolve(self.backend.as_ref(), content, owner_override)
            .await?;
        self.synthesizer.synthesize(ladder)
    }

    fn adopt_manifest(&mut self, manifest: SynthesizedManifest) -> EngineSource {
        let source = EngineSource::Manifest {
            uri: manifest.handle.uri(),
            text: Arc::from(manifest.document.text.as_str()),
        };
        self.manifest = Some(manifest);
        source
    }

    fn spawn_checkpoint_fetch(&mut self, tx: mpsc::UnboundedSender<SessionEvent>, content: ContentRef) {
        let backend = Arc::clone(&self.backend);
        self.checkpoint_pending = true;

        tokio::spawn(async move {
            let checkpoint = match backend
                .fetch_last_watch_checkpoint(&content.media_id, &content.episode_id)
                .await
            {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    warn!(content = %content, error = %e, "Checkpoint fetch failed, starting from 0");
                    None
                }
            };
            // The session may have moved on to another source
            let _ = tx.send(SessionEvent::Checkpoint(checkpoint));
        });
    }

    /// Re-resolve permissions and reload the manifest on the current engine.
    ///
    /// Resume and offset state are kept, so a reload never seeks again.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn refresh_permissions(&mut self, owner_override: bool) -> Result<()> {
        if self.state.is_disposed() {
            return Err(Error::SessionDisposed);
        }
        let content = match (&self.content, &self.manifest) {
            (Some(content), Some(_)) if self.state.accepts_seek() => content.clone(),
            _ => {
                return Err(Error::InvalidStateTransition {
                    from: self.state.to_string(),
                    to: "manifest_reload".to_string(),
                })
            }
        };

        let manifest = self.synthesize(&content, owner_override).await?;
        let source = self.adopt_manifest(manifest);
        if let Some(engine) = self.engine.as_mut() {
            if let Err(e) = engine.load(source) {
                return self.engine_command_failed(e);
            }
        }

        // Keep the current rendition only if it survived the refresh; its
        // index may differ in the new manifest
        let kept = self.current_quality.as_deref().and_then(|current| {
            self.manifest
                .as_ref()
                .and_then(|m| m.document.variants.iter().position(|v| v.matches_name(current)))
        });
        match kept {
            Some(index) => {
                if let Some(engine) = self.engine.as_mut() {
                    engine.set_preferred_level(index);
                }
                debug!(quality = ?self.current_quality, index, "Rendition kept across reload");
            }
            None => {
                self.current_quality = self
                    .manifest
                    .as_ref()
                    .and_then(|m| m.document.initial_quality())
                    .map(str::to_string);
            }
        }
        Ok(())
    }

    /// Ask the engine to start playback.
    ///
    /// The state follows once the engine confirms with its playing event.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn play(&mut self) -> Result<()> {
        match self.state {
            PlaybackState::Playing => Ok(()),
            PlaybackState::ReadyPaused | PlaybackState::Paused | PlaybackState::Ended => {
                let Some(engine) = self.engine.as_mut() else {
                    return Err(Error::Internal("no engine attached".into()));
                };
                match engine.play() {
                    Ok(()) => {
                        self.play_pending = true;
                        Ok(())
                    }
                    Err(e) => self.engine_command_failed(e),
                }
            }
            PlaybackState::Disposed => Err(Error::SessionDisposed),
            _ => Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: PlaybackState::Playing.to_string(),
            }),
        }
    }

    /// Ask the engine to pause; confirmed by its paused event.
    ///
    /// While paused, a play request the engine has not confirmed yet is
    /// cancelled the same way.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn pause(&mut self) -> Result<()> {
        match self.state {
            PlaybackState::Playing => {
                self.play_pending = false;
                if let Some(engine) = self.engine.as_mut() {
                    engine.pause();
                }
                Ok(())
            }
            PlaybackState::Paused | PlaybackState::ReadyPaused => {
                if std::mem::take(&mut self.play_pending) {
                    if let Some(engine) = self.engine.as_mut() {
                        debug!("Cancelling unconfirmed play request");
                        engine.pause();
                    }
                }
                Ok(())
            }
            PlaybackState::Disposed => Err(Error::SessionDisposed),
            _ => Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: PlaybackState::Paused.to_string(),
            }),
        }
    }

    /// Seek to position
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn seek(&mut self, position: f64) -> Result<()> {
        if self.state.is_disposed() {
            return Err(Error::SessionDisposed);
        }
        if !self.state.accepts_seek() || !position.is_finite() {
            return Err(Error::SeekRejected {
                state: self.state.to_string(),
            });
        }
        let Some(engine) = self.engine.as_mut() else {
            return Err(Error::SeekRejected {
                state: self.state.to_string(),
            });
        };

        let clamped = match self.raw_duration {
            Some(duration) => position.clamp(0.0, duration),
            None => position.max(0.0),
        };
        info!(from = self.position, to = clamped, "Seeking");
        engine.seek(clamped);
        self.position = clamped;
        Ok(())
    }

    /// Change the engine's preferred rendition
    ///
    /// Permission failures leave the current quality untouched and are
    /// reported as permission errors, never as engine errors.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn switch_quality(&mut self, quality: &str) -> Result<()> {
        if self.state.is_disposed() {
            return Err(Error::SessionDisposed);
        }
        if !self.state.accepts_quality_switch() {
            return Err(Error::QualitySwitchRejected {
                state: self.state.to_string(),
            });
        }

        let (index, name) = match &self.manifest {
            Some(manifest) => match manifest.ladder.switch_decision(quality) {
                SwitchDecision::Allowed(_) => {
                    let Some(index) = manifest
                        .document
                        .variants
                        .iter()
                        .position(|v| v.matches_name(quality))
                    else {
                        return Err(Error::UnknownQuality {
                            quality: quality.to_string(),
                        });
                    };
                    (index, manifest.document.variants[index].name.clone())
                }
                SwitchDecision::Denied => {
                    warn!(quality, "Quality switch denied");
                    return Err(Error::PermissionDenied {
                        quality: quality.to_string(),
                    });
                }
                SwitchDecision::LoginRequired => {
                    warn!(quality, "Quality switch requires login");
                    return Err(Error::LoginRequired {
                        quality: quality.to_string(),
                    });
                }
                SwitchDecision::Unknown => {
                    return Err(Error::UnknownQuality {
                        quality: quality.to_string(),
                    })
                }
            },
            // Raw URL sources carry no permission data
            None => match self.levels.iter().position(|l| l.eq_ignore_ascii_case(quality)) {
                Some(index) => (index, self.levels[index].clone()),
                None => {
                    return Err(Error::UnknownQuality {
                        quality: quality.to_string(),
                    })
                }
            },
        };

        if let Some(engine) = self.engine.as_mut() {
            engine.set_preferred_level(index);
        }
        info!(from = ?self.current_quality, to = %name, index, "Quality switched");
        self.current_quality = Some(name);
        Ok(())
    }

    /// Release engine and manifest and enter the terminal state
    pub fn dispose(&mut self) {
        if self.state.is_disposed() {
            return;
        }
        self.release();
        self.transition(PlaybackState::Disposed);
    }

    /// Flush, destroy the engine, revoke the manifest and return to Idle
    fn release(&mut self) {
        self.flush_watch();
        self.recorder.stop();

        if let Some(mut engine) = self.engine.take() {
            engine.destroy();
            info!(session_id = %self.id, "Engine released");
        }
        self.manifest = None;
        self.synthesizer.revoke_current();
        self.events = None;
        self.checkpoint_pending = false;
        self.play_pending = false;

        if !matches!(self.state, PlaybackState::Idle | PlaybackState::Disposed) {
            self.transition(PlaybackState::Idle);
        }
    }

    fn enter_error(&mut self, reason: String) {
        warn!(session_id = %self.id, reason = %reason, "Fatal playback error");
        self.transition(PlaybackState::Error { reason });
    }

    fn engine_command_failed(&mut self, error: EngineError) -> Result<()> {
        match error.severity() {
            ErrorSeverity::Transient => {
                warn!(error = %error, "Engine command failed");
                Err(Error::EngineCommand(error.to_string()))
            }
            ErrorSeverity::Fatal => {
                self.enter_error(error.to_string());
                Err(Error::FatalEngine {
                    kind: error.kind,
                    reason: error.reason,
                })
            }
        }
    }

    fn flush_watch(&mut self) {
        self.flushes.retain(|f| !f.is_finished());
        let duration = self.corrected_duration().unwrap_or(0.0);
        if let Some(send) = self.recorder.flush(self.position, duration) {
            self.flushes.push(send);
        }
    }

    /// Wait until dispatched watch-session sends have completed
    pub async fn wait_for_flushes(&mut self) {
        for send in self.flushes.drain(..) {
            let _ = send.await;
        }
    }

    fn start_playback(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        match engine.play() {
            Ok(()) => {
                self.play_pending = true;
                debug!("Autoplay requested");
            }
            Err(e) if e.kind == EngineErrorKind::PlaybackBlocked => {
                info!(reason = %e.reason, "Autoplay blocked, waiting for play");
            }
            Err(e) => {
                let _ = self.engine_command_failed(e);
            }
        }
    }

    fn try_resume(&mut self) {
        if !self.state.accepts_seek() {
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if let Some(target) = self.resume.take_seek(self.offset.offset()) {
            engine.seek(target);
            self.position = target;
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Checkpoint(checkpoint) => {
                self.checkpoint_pending = false;
                self.resume.checkpoint_settled(checkpoint.as_ref());
                self.try_resume();
            }
            SessionEvent::Engine(event) => self.handle_engine_event(event),
        }
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        if matches!(
            self.state,
            PlaybackState::Idle | PlaybackState::Disposed | PlaybackState::Error { .. }
        ) {
            debug!(?event, state = %self.state, "Event ignored");
            return;
        }

        match event {
            EngineEvent::ManifestParsed { levels } => {
                debug!(?levels, "Manifest parsed");
                self.levels = levels;
                if self.state == PlaybackState::ManifestLoading {
                    self.current_quality = self
                        .manifest
                        .as_ref()
                        .and_then(|m| m.document.initial_quality())
                        .or_else(|| self.levels.first().map(String::as_str))
                        .map(str::to_string);
                    self.transition(PlaybackState::ReadyPaused);
                    self.try_resume();
                    if self.config.autoplay {
                        self.start_playback();
                    }
                }
            }
            EngineEvent::MetadataLoaded { duration } => {
                if duration.is_finite() {
                    debug!(duration, "Metadata loaded");
                    self.raw_duration = Some(duration);
                    self.resume.metadata_ready(duration);
                    self.try_resume();
                }
            }
            EngineEvent::SegmentAppended(segment) => {
                if let Some(offset) = self.offset.observe(&segment) {
                    debug!(offset, corrected = ?self.corrected_duration(), "Duration corrected");
                }
            }
            EngineEvent::TimeUpdate { position } => {
                self.position = position;
            }
            EngineEvent::Playing => {
                self.play_pending = false;
                if matches!(
                    self.state,
                    PlaybackState::ReadyPaused | PlaybackState::Paused | PlaybackState::Ended
                ) {
                    self.transition(PlaybackState::Playing);
                }
            }
            EngineEvent::Paused => {
                if self.state == PlaybackState::Playing {
                    self.transition(PlaybackState::Paused);
                }
            }
            EngineEvent::Waiting => {
                if self.state == PlaybackState::Playing {
                    debug!(position = self.position, "Playback starved");
                    self.transition(PlaybackState::Paused);
                }
            }
            EngineEvent::Ended => {
                if matches!(self.state, PlaybackState::Playing | PlaybackState::Paused) {
                    self.transition(PlaybackState::Ended);
                }
            }
            EngineEvent::Error(error) => match error.severity() {
                ErrorSeverity::Transient => {
                    warn!(error = %error, "Transient engine error, engine retrying");
                }
                ErrorSeverity::Fatal => self.enter_error(error.to_string()),
            },
        }
    }

    /// Handle every event already queued, without waiting
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let event = match self.events.as_mut() {
                Some(events) => match events.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
                None => break,
            };
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Wait for the next event and handle it; false when no source is attached
    pub async fn next_event(&mut self) -> bool {
        let Some(events) = self.events.as_mut() else {
            return false;
        };
        match events.recv().await {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    /// Handle events until nothing is queued and no checkpoint fetch is
    /// outstanding
    pub async fn settle(&mut self) {
        loop {
            self.pump();
            if !self.checkpoint_pending || self.events.is_none() {
                break;
            }
            if !self.next_event().await {
                break;
            }
        }
    }

    /// Execute one command
    pub async fn execute(&mut self, command: SessionCommand) {
        let result = match command {
            SessionCommand::Attach { content, source, reply } => {
                let _ = reply.send(self.attach(content, source).await);
                return;
            }
            SessionCommand::SwitchQuality { quality, reply } => {
                let _ = reply.send(self.switch_quality(&quality));
                return;
            }
            SessionCommand::Play => self.play(),
            SessionCommand::Pause => self.pause(),
            SessionCommand::Seek(position) => self.seek(position),
            SessionCommand::RefreshPermissions { owner_override, reply } => {
                let _ = reply.send(self.refresh_permissions(owner_override).await);
                return;
            }
            SessionCommand::Dispose => {
                self.dispose();
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(error = %e, code = e.error_code(), "Command failed");
        }
    }

    /// Drive the session from a command queue until disposed or the queue
    /// closes
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        enum Next {
            Command(Option<SessionCommand>),
            Event(SessionEvent),
        }

        loop {
            let next = {
                let events = self.events.as_mut();
                tokio::select! {
                    command = commands.recv() => Next::Command(command),
                    Some(event) = next_queued(events) => Next::Event(event),
                }
            };

            match next {
                Next::Command(Some(command)) => self.execute(command).await,
                Next::Command(None) => self.dispose(),
                Next::Event(event) => self.handle_event(event),
            }

            if self.state.is_disposed() {
                break;
            }
        }
        self.wait_for_flushes().await;
    }
}

async fn next_queued(events: Option<&mut mpsc::UnboundedReceiver<SessionEvent>>) -> Option<SessionEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.dispose();
    }
}
