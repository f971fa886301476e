//! Rewatch Core - Permission-aware playback for Rewatch
//!
//! This crate provides the playback and watch-progress subsystem:
//! - Quality permission resolution (owner override, permission list, existence probe)
//! - HLS master manifest synthesis behind transient handles
//! - Playback session state machine over an opaque decode engine
//! - Presentation timestamp offset correction
//! - One-shot resume from the last checkpoint
//! - Watch-time recording with best-effort flushes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Rewatch Core                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Quality    │  │   Manifest   │  │   Backend    │           │
//! │  │   Resolver   │─▶│  Synthesizer │  │ (HTTP / mem) │           │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘           │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │                    ┌──────┴──────┐      ┌──────────────┐        │
//! │                    │  Playback   │◀────▶│    Decode    │        │
//! │                    │   Session   │events│    Engine    │        │
//! │                    └──────┬──────┘      └──────────────┘        │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────┴──────┐  ┌──────────────┐            │
//! │  │   Offset     │  │   Resume    │  │    Watch     │            │
//! │  │  Corrector   │  │   Planner   │  │   Recorder   │            │
//! │  └──────────────┘  └─────────────┘  └──────────────┘            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod backend;
pub mod permissions;
pub mod manifest;
pub mod engine;
pub mod offset;
pub mod resume;
pub mod recorder;
pub mod session;

pub use error::{Error, Result};
pub use types::*;
pub use backend::{HttpBackend, MemoryBackend, MemoryFixture, PlaybackBackend};
pub use permissions::{Decision, QualityResolver, ResolvedLadder, ResolvedQuality, SwitchDecision};
pub use manifest::{ManifestDocument, ManifestHandle, ManifestRegistry, ManifestSynthesizer, SynthesizedManifest};
pub use engine::{
    DecodeEngine, EngineError, EngineErrorKind, EngineEvent, EngineEvents, EngineFactory, EngineScript,
    EngineSource, ScriptedEngineFactory, SegmentAppend,
};
pub use offset::OffsetCorrector;
pub use resume::{clamp_seek, ResumePlanner};
pub use recorder::WatchRecorder;
pub use session::{MediaSource, PlaybackSession, SessionCommand};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the playback library with default configuration
pub fn init() {
    tracing::info!(version = VERSION, "Rewatch Core initialized");
}
