//! Watch session recording
//!
//! Counts real time spent playing, independent of the playhead (which jumps
//! on seeks), and flushes it on pause, end and unload.
//!
//! Flushes are best-effort: the accumulator is reset the moment a flush is
//! dispatched, and a failed send is logged and discarded. Nothing is
//! retried before the next natural flush trigger. This can under-report
//! after a failed send but never counts the same seconds twice.

use crate::{backend::PlaybackBackend, types::*};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Accumulates watch time and sends it to the backend
pub struct WatchRecorder {
    backend: Arc<dyn PlaybackBackend>,
    content: Option<ContentRef>,
    source: String,
    tick: Duration,
    /// Elapsed play time in milliseconds since the last flush
    elapsed_ms: Arc<AtomicU64>,
    ticker: Option<JoinHandle<()>>,
}

impl WatchRecorder {
    pub fn new(backend: Arc<dyn PlaybackBackend>, source: impl Into<String>, tick: Duration) -> Self {
        Self {
            backend,
            content: None,
            source: source.into(),
            tick,
            elapsed_ms: Arc::new(AtomicU64::new(0)),
            ticker: None,
        }
    }

    /// Attribute subsequent flushes to `content`
    pub fn bind(&mut self, content: ContentRef) {
        self.content = Some(content);
    }

    pub fn content(&self) -> Option<&ContentRef> {
        self.content.as_ref()
    }

    /// Start the repeating tick; no-op while already running, or when
    /// called outside a runtime
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Watch ticker not started, no runtime");
            return;
        };

        let elapsed = Arc::clone(&self.elapsed_ms);
        let period = self.tick;
        let step = period.as_millis() as u64;
        self.ticker = Some(runtime.spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let total = elapsed.fetch_add(step, Ordering::SeqCst) + step;
                debug!(elapsed_ms = total, "Watch tick");
            }
        }));
        debug!("Watch ticker started");
    }

    /// Stop the tick, keeping what was accumulated
    pub fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
            debug!("Watch ticker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Whole seconds accumulated since the last flush
    pub fn accumulated_seconds(&self) -> u64 {
        self.elapsed_ms.load(Ordering::SeqCst) / 1000
    }

    /// Stop the tick and dispatch the accumulated time.
    ///
    /// Returns the send task, or `None` when nothing was accumulated (or
    /// nothing is bound). Callers may drop the handle; the send completes
    /// or fails on its own.
    pub fn flush(&mut self, progress_seconds: f64, duration_seconds: f64) -> Option<JoinHandle<()>> {
        self.stop();

        let elapsed_ms = self.elapsed_ms.swap(0, Ordering::SeqCst);
        let watch_time_seconds = (elapsed_ms + 500) / 1000;
        if watch_time_seconds == 0 {
            debug!(elapsed_ms, "Nothing to flush");
            return None;
        }

        let Some(content) = self.content.as_ref() else {
            warn!(watch_time_seconds, "Watch time discarded, no content bound");
            return None;
        };

        let session = WatchSession {
            media_id: content.media_id.clone(),
            episode_id: content.episode_id.clone(),
            watch_time_seconds,
            duration_seconds,
            progress_seconds,
            source: self.source.clone(),
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(watch_time_seconds, "Watch time discarded, no runtime to send on");
            return None;
        };

        info!(
            media_id = %session.media_id,
            episode_id = %session.episode_id,
            watch_time_seconds,
            progress_seconds,
            "Flushing watch session"
        );

        let backend = Arc::clone(&self.backend);
        Some(runtime.spawn(async move {
            if let Err(e) = backend.record_watch_session(&session).await {
                warn!(
                    error = %e,
                    watch_time_seconds = session.watch_time_seconds,
                    "Watch session dropped"
                );
            }
        }))
    }
}

impl Drop for WatchRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn recorder(backend: &Arc<MemoryBackend>) -> WatchRecorder {
        let mut recorder = WatchRecorder::new(backend.clone(), "web", Duration::from_secs(1));
        recorder.bind(ContentRef::new("m1", "e1"));
        recorder
    }

    #[tokio::test(start_paused = true)]
    async fn counts_one_second_per_tick() {
        let backend = Arc::new(MemoryBackend::new());
        let mut recorder = recorder(&backend);

        recorder.start();
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(recorder.accumulated_seconds(), 10);

        recorder.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(recorder.accumulated_seconds(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_resets_and_sends() {
        let backend = Arc::new(MemoryBackend::new());
        let mut recorder = recorder(&backend);

        recorder.start();
        tokio::time::sleep(Duration::from_millis(45_500)).await;

        let send = recorder.flush(130.0, 595.0).unwrap();
        assert_eq!(recorder.accumulated_seconds(), 0);
        assert!(!recorder.is_running());
        send.await.unwrap();

        let sessions = backend.recorded_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].watch_time_seconds, 45);
        assert_eq!(sessions[0].progress_seconds, 130.0);
        assert_eq!(sessions[0].duration_seconds, 595.0);
        assert_eq!(sessions[0].source, "web");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_flush_is_skipped() {
        let backend = Arc::new(MemoryBackend::new());
        let mut recorder = recorder(&backend);

        assert!(recorder.flush(0.0, 10.0).is_none());
        recorder.start();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(recorder.flush(0.0, 10.0).is_none());
        assert!(backend.recorded_sessions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_is_swallowed_and_not_retried() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_records(true);
        let mut recorder = recorder(&backend);

        recorder.start();
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        recorder.flush(3.0, 10.0).unwrap().await.unwrap();

        // Lost on failure, not carried into the next flush
        assert_eq!(recorder.accumulated_seconds(), 0);
        backend.fail_records(false);
        recorder.start();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        recorder.flush(5.0, 10.0).unwrap().await.unwrap();

        let sessions = backend.recorded_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].watch_time_seconds, 2);
    }

    #[test]
    fn start_outside_runtime_is_a_no_op() {
        let backend = Arc::new(MemoryBackend::new());
        let mut recorder = recorder(&backend);

        recorder.start();
        assert!(!recorder.is_running());
        assert!(recorder.flush(0.0, 10.0).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_triggers_do_not_double_count() {
        let backend = Arc::new(MemoryBackend::new());
        let mut recorder = recorder(&backend);

        recorder.start();
        tokio::time::sleep(Duration::from_millis(7_500)).await;
        let pause = recorder.flush(7.0, 60.0);
        let unload = recorder.flush(7.0, 60.0);

        assert!(pause.is_some());
        assert!(unload.is_none());
        pause.unwrap().await.unwrap();
        assert_eq!(backend.recorded_sessions().await[0].watch_time_seconds, 7);
    }
}
