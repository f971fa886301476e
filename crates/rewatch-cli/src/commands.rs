//! CLI command implementations

use crate::output::{self, OutputFormat};
use anyhow::Context;
use rewatch_core::{
    ContentRef, HttpBackend, ManifestRegistry, ManifestSynthesizer, PlaybackBackend, PlaybackConfig,
    QualityResolver, ResolvedLadder,
};
use std::path::Path;
use tabled::Tabled;

/// Load the configuration file, or the defaults without one
pub fn load_config(path: Option<&Path>) -> anyhow::Result<PlaybackConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => PlaybackConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn content_ref(media_id: &str, episode: Option<String>) -> ContentRef {
    match episode {
        Some(episode) => ContentRef::new(media_id, episode),
        None => ContentRef::standalone(media_id),
    }
}

async fn resolve(
    config: &PlaybackConfig,
    backend: &dyn PlaybackBackend,
    content: &ContentRef,
    owner: bool,
) -> anyhow::Result<ResolvedLadder> {
    let resolver = QualityResolver::new(config.ladder.clone());
    Ok(resolver.resolve(backend, content, owner).await?)
}

/// Resolve and print the synthesized manifest
pub async fn manifest(
    config: &PlaybackConfig,
    media_id: &str,
    episode: Option<String>,
    owner: bool,
    format: &str,
) -> anyhow::Result<()> {
    let backend = HttpBackend::new(config)?;
    let content = content_ref(media_id, episode);
    let ladder = resolve(config, &backend, &content, owner).await?;

    let mut synthesizer = ManifestSynthesizer::new(ManifestRegistry::new(), config);
    let manifest = synthesizer.synthesize(ladder)?;

    match OutputFormat::from(format) {
        OutputFormat::Json => {
            let names: Vec<&str> = manifest.document.variants.iter().map(|v| v.name.as_str()).collect();
            let body = serde_json::json!({
                "mediaId": manifest.document.media_id,
                "handle": manifest.handle.uri(),
                "variants": names,
                "manifest": manifest.document.text,
            });
            println!("{}", output::to_json(&body)?);
        }
        OutputFormat::Text | OutputFormat::Table => {
            print!("{}", manifest.document.text);
        }
    }
    Ok(())
}

#[derive(Tabled)]
struct LadderRow {
    #[tabled(rename = "Quality")]
    quality: String,
    #[tabled(rename = "Bandwidth")]
    bandwidth: u64,
    #[tabled(rename = "Resolution")]
    resolution: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Permitted")]
    permitted: bool,
    #[tabled(rename = "Decided by")]
    decision: String,
}

fn ladder_rows(ladder: &ResolvedLadder) -> Vec<LadderRow> {
    ladder
        .qualities
        .iter()
        .map(|q| LadderRow {
            quality: q.variant.name.clone(),
            bandwidth: q.variant.bandwidth,
            resolution: q.variant.resolution.to_string(),
            status: q.variant.permission.to_string(),
            permitted: q.permitted,
            decision: format!("{:?}", q.decision),
        })
        .collect()
}

/// Show per-quality decisions
pub async fn ladder(
    config: &PlaybackConfig,
    media_id: &str,
    episode: Option<String>,
    owner: bool,
    format: &str,
) -> anyhow::Result<()> {
    let backend = HttpBackend::new(config)?;
    let content = content_ref(media_id, episode);
    let ladder = resolve(config, &backend, &content, owner).await?;

    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", output::to_json(&ladder)?),
        OutputFormat::Table => println!("{}", output::to_table(ladder_rows(&ladder))),
        OutputFormat::Text => {
            println!("Quality ladder for {}:", content);
            for row in ladder_rows(&ladder) {
                println!(
                    "  {:<6} {:>9}bps {:<10} {:<13} {} ({})",
                    row.quality,
                    row.bandwidth,
                    row.resolution,
                    row.status,
                    if row.permitted { "permitted" } else { "blocked" },
                    row.decision
                );
            }
            println!("\n{} of {} permitted", ladder.permitted_count(), ladder.qualities.len());
        }
    }
    Ok(())
}

/// Fetch the last watch checkpoint
pub async fn checkpoint(
    config: &PlaybackConfig,
    media_id: &str,
    episode: Option<String>,
    format: &str,
) -> anyhow::Result<()> {
    let backend = HttpBackend::new(config)?;
    let content = content_ref(media_id, episode);
    let checkpoint = backend
        .fetch_last_watch_checkpoint(&content.media_id, &content.episode_id)
        .await?;

    match (OutputFormat::from(format), checkpoint) {
        (OutputFormat::Json, checkpoint) => println!("{}", output::to_json(&checkpoint)?),
        (_, None) => println!("No checkpoint for {}", content),
        (_, Some(checkpoint)) => {
            println!("Checkpoint for {}:", content);
            println!("  Progress:   {:.1}s", checkpoint.progress_seconds);
            println!("  Duration:   {:.1}s", checkpoint.duration_seconds);
            println!("  Watch time: {}s", checkpoint.watch_time_seconds);
            if let Some(updated_at) = checkpoint.updated_at {
                println!("  Updated:    {}", updated_at);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewatch_core::{MemoryBackend, PermissionStatus, QualityPermission};

    #[test]
    fn test_episode_defaults_to_media() {
        assert_eq!(content_ref("m1", None), ContentRef::new("m1", "m1"));
        assert_eq!(content_ref("m1", Some("e2".into())), ContentRef::new("m1", "e2"));
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.ladder.len(), 4);
    }

    #[tokio::test]
    async fn test_ladder_rows_follow_ladder_order() {
        let backend = MemoryBackend::new().with_permissions(
            "m1",
            vec![QualityPermission::new("720p", PermissionStatus::Allow)],
        );
        let config = PlaybackConfig::default();
        let ladder = resolve(&config, &backend, &ContentRef::standalone("m1"), false)
            .await
            .unwrap();

        let rows = ladder_rows(&ladder);
        let names: Vec<_> = rows.iter().map(|r| r.quality.as_str()).collect();
        assert_eq!(names, ["1080p", "720p", "480p", "360p"]);
        assert!(rows[1].permitted);
        assert!(!rows[0].permitted);
    }
}
