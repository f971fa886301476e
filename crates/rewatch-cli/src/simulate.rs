//! Offline session simulation
//!
//! Runs one playback session against an in-memory backend and a scripted
//! engine, then reports what the session did: resume seek, timestamp
//! offset, quality switches and flushed watch sessions.

use crate::output::{self, OutputFormat};
use anyhow::Context;
use rewatch_core::{
    ContentRef, EngineEvent, EngineScript, MediaSource, MemoryBackend, MemoryFixture, PlaybackConfig,
    PlaybackSession, PlaybackState, ScriptedEngineFactory, WatchSession,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Simulation input
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Simulation {
    #[serde(default)]
    pub fixture: MemoryFixture,
    #[serde(default)]
    pub engine: EngineScript,
    pub content: ContentRef,
    #[serde(default)]
    pub owner_override: bool,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One scripted host action
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Play,
    Pause,
    Seek { position: f64 },
    Switch { quality: String },
    RefreshPermissions,
    /// Let real time pass while playing
    Wait { seconds: f64 },
    /// Inject an engine event
    Emit { event: EngineEvent },
}

/// Outcome of a step that the host would surface
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub step: usize,
    pub action: String,
    pub error: String,
    pub code: &'static str,
}

/// Simulation result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub variants: Vec<String>,
    pub resume_seek: Option<f64>,
    pub offset: f64,
    pub raw_duration: Option<f64>,
    pub corrected_duration: Option<f64>,
    pub final_quality: Option<String>,
    pub final_state: PlaybackState,
    pub failures: Vec<StepOutcome>,
    pub flushed: Vec<WatchSession>,
    pub engines_created: u64,
    pub peak_engines: usize,
}

/// Load and run a simulation file
pub async fn run(config: PlaybackConfig, path: &Path, format: &str) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading simulation {}", path.display()))?;
    let simulation: Simulation = serde_json::from_str(&text)
        .with_context(|| format!("parsing simulation {}", path.display()))?;

    let report = simulate(config, simulation).await?;
    print_report(&report, format)
}

/// Run a simulation to completion
pub async fn simulate(config: PlaybackConfig, simulation: Simulation) -> anyhow::Result<Report> {
    let backend = Arc::new(MemoryBackend::from_fixture(simulation.fixture));
    let engines = ScriptedEngineFactory::new(simulation.engine);
    let mut session = PlaybackSession::new(config, backend.clone(), Arc::new(engines.clone()))?;

    session
        .attach(
            simulation.content,
            MediaSource::Content {
                owner_override: simulation.owner_override,
            },
        )
        .await?;
    session.settle().await;

    let variants = session
        .manifest()
        .map(|m| m.document.variants.iter().map(|v| v.name.clone()).collect())
        .unwrap_or_default();
    let resume_seek = engines.seeks().first().copied();

    let mut failures = Vec::new();
    for (index, step) in simulation.steps.into_iter().enumerate() {
        let action = format!("{:?}", step);
        let result = match step {
            Step::Play => session.play(),
            Step::Pause => session.pause(),
            Step::Seek { position } => session.seek(position),
            Step::Switch { quality } => session.switch_quality(&quality),
            Step::RefreshPermissions => session.refresh_permissions(simulation.owner_override).await,
            Step::Wait { seconds } => {
                tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
                Ok(())
            }
            Step::Emit { event } => {
                engines.emit(event);
                Ok(())
            }
        };
        session.pump();

        if let Err(e) = result {
            tracing::warn!(step = index, error = %e, "Step failed");
            failures.push(StepOutcome {
                step: index,
                action,
                error: e.to_string(),
                code: e.error_code(),
            });
        }
    }

    let offset = session.offset();
    let raw_duration = session.raw_duration();
    let corrected_duration = session.corrected_duration();
    let final_quality = session.current_quality().map(str::to_string);
    let final_state = session.state().clone();

    session.dispose();
    session.wait_for_flushes().await;

    Ok(Report {
        variants,
        resume_seek,
        offset,
        raw_duration,
        corrected_duration,
        final_quality,
        final_state,
        failures,
        flushed: backend.recorded_sessions().await,
        engines_created: engines.created(),
        peak_engines: engines.peak_active(),
    })
}

fn print_report(report: &Report, format: &str) -> anyhow::Result<()> {
    if OutputFormat::from(format) == OutputFormat::Json {
        println!("{}", output::to_json(report)?);
        return Ok(());
    }

    println!("Simulation Report:");
    println!("  Variants:           {}", report.variants.join(", "));
    match report.resume_seek {
        Some(target) => println!("  Resume seek:        {:.2}s", target),
        None => println!("  Resume seek:        none"),
    }
    println!("  Timestamp offset:   {:.3}s", report.offset);
    if let (Some(raw), Some(corrected)) = (report.raw_duration, report.corrected_duration) {
        println!("  Duration:           {:.2}s (raw {:.2}s)", corrected, raw);
    }
    println!(
        "  Final quality:      {}",
        report.final_quality.as_deref().unwrap_or("-")
    );
    println!("  State before close: {}", report.final_state);
    println!("  Engines:            {} created, peak {}", report.engines_created, report.peak_engines);

    if !report.failures.is_empty() {
        println!("\nRejected steps:");
        for failure in &report.failures {
            println!(
                "  #{} {} -> {} [{}]",
                failure.step,
                failure.action,
                failure.error,
                failure.code
            );
        }
    }

    println!("\nFlushed watch sessions:");
    if report.flushed.is_empty() {
        println!("  none");
    }
    for session in &report.flushed {
        println!(
            "  {}s watched, progress {:.1}s of {:.1}s ({})",
            session.watch_time_seconds, session.progress_seconds, session.duration_seconds, session.source
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Simulation {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_reports_resume_and_flushes() {
        let simulation = parse(
            r#"{
                "fixture": {
                    "permissions": {
                        "e1": [
                            {"qualityName": "720p", "status": "ALLOW"},
                            {"qualityName": "1080p", "status": "DENY"}
                        ]
                    },
                    "checkpoints": [
                        {"mediaId": "m1", "episodeId": "e1", "progressSeconds": 120}
                    ]
                },
                "engine": {
                    "duration": 600,
                    "segments": [
                        {"primary": true, "initSegment": false, "hasVideo": true,
                         "nominalStart": 0, "videoDecodeStart": 2.5}
                    ]
                },
                "content": {"mediaId": "m1", "episodeId": "e1"},
                "steps": [
                    {"action": "wait", "seconds": 12.5},
                    {"action": "switch", "quality": "1080p"},
                    {"action": "pause"}
                ]
            }"#,
        );

        let report = simulate(PlaybackConfig::default(), simulation).await.unwrap();

        assert_eq!(report.variants, ["720p"]);
        assert_eq!(report.resume_seek, Some(122.5));
        assert_eq!(report.corrected_duration, Some(597.5));
        assert_eq!(report.final_state, PlaybackState::Paused);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].code, "PERMISSION_DENIED");
        assert_eq!(report.flushed.len(), 1);
        assert_eq!(report.flushed[0].watch_time_seconds, 12);
        assert_eq!(report.peak_engines, 1);
    }

    #[test]
    fn test_steps_parse() {
        let simulation = parse(
            r#"{
                "content": {"mediaId": "m1", "episodeId": "m1"},
                "steps": [
                    {"action": "seek", "position": 30},
                    {"action": "refresh_permissions"},
                    {"action": "emit", "event": {"event": "ended"}}
                ]
            }"#,
        );
        assert_eq!(simulation.steps.len(), 3);
        assert!(matches!(
            simulation.steps[2],
            Step::Emit {
                event: EngineEvent::Ended
            }
        ));
    }
}
