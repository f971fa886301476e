//! Quality permission resolution
//!
//! Filters the fixed candidate ladder for one viewer. The backend permission
//! list wins when it has entries; with no list at all every candidate is
//! probed for existence instead. Owners bypass both.

use crate::{backend::PlaybackBackend, error::Error, types::*, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

/// How a candidate's inclusion was decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    OwnerOverride,
    PermissionList,
    ExistenceProbe,
}

/// One candidate after resolution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedQuality {
    /// Candidate with its resolved permission status
    pub variant: QualityVariant,
    pub permitted: bool,
    pub decision: Decision,
}

/// Outcome of a quality switch request against the ladder
#[derive(Debug, Clone, PartialEq)]
pub enum SwitchDecision {
    /// Index into the permitted (manifest) order
    Allowed(usize),
    Denied,
    LoginRequired,
    Unknown,
}

/// The candidate ladder with per-quality decisions, descending by bandwidth
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedLadder {
    pub media_id: String,
    pub owner_override: bool,
    pub qualities: Vec<ResolvedQuality>,
}

impl ResolvedLadder {
    /// Permitted variants in manifest order
    pub fn permitted(&self) -> Vec<QualityVariant> {
        self.qualities
            .iter()
            .filter(|q| q.permitted)
            .map(|q| q.variant.clone())
            .collect()
    }

    pub fn permitted_count(&self) -> usize {
        self.qualities.iter().filter(|q| q.permitted).count()
    }

    /// Decide whether the viewer may switch to `name`
    pub fn switch_decision(&self, name: &str) -> SwitchDecision {
        let Some(quality) = self.qualities.iter().find(|q| q.variant.matches_name(name)) else {
            return SwitchDecision::Unknown;
        };

        if quality.permitted {
            let index = self
                .qualities
                .iter()
                .filter(|q| q.permitted)
                .position(|q| q.variant.matches_name(name))
                .unwrap_or(0);
            return SwitchDecision::Allowed(index);
        }

        match quality.variant.permission {
            // Permitted is false, so an ALLOW here came from a failed probe
            PermissionStatus::Allow | PermissionStatus::Deny | PermissionStatus::Unset => {
                SwitchDecision::Denied
            }
            PermissionStatus::RequireLogin => SwitchDecision::LoginRequired,
        }
    }
}

/// Resolves the candidate ladder against backend permissions
pub struct QualityResolver {
    ladder: Vec<QualityVariant>,
}

impl QualityResolver {
    pub fn new(ladder: Vec<QualityVariant>) -> Self {
        Self { ladder }
    }

    pub fn ladder(&self) -> &[QualityVariant] {
        &self.ladder
    }

    /// Resolve the ladder for `content`, failing when nothing is permitted
    #[instrument(skip(self, backend), fields(media_id = %content.media_id))]
    pub async fn resolve(
        &self,
        backend: &dyn PlaybackBackend,
        content: &ContentRef,
        owner_override: bool,
    ) -> Result<ResolvedLadder> {
        let ladder = if owner_override {
            self.resolve_owner(content)
        } else {
            let list = match backend.fetch_permission_list(&content.episode_id).await {
                Ok(list) => list,
                Err(e) => {
                    warn!(error = %e, "Permission list unavailable, probing variants");
                    Vec::new()
                }
            };

            if list.is_empty() {
                self.resolve_by_probe(backend, content).await
            } else {
                self.resolve_with_list(content, list)
            }
        };

        if ladder.permitted_count() == 0 {
            warn!("No permitted quality");
            return Err(Error::NoPermittedQualities {
                media_id: content.media_id.clone(),
            });
        }

        info!(
            permitted = ladder.permitted_count(),
            candidates = ladder.qualities.len(),
            "Quality ladder resolved"
        );
        Ok(ladder)
    }

    fn resolve_owner(&self, content: &ContentRef) -> ResolvedLadder {
        ResolvedLadder {
            media_id: content.media_id.clone(),
            owner_override: true,
            qualities: self
                .ladder
                .iter()
                .map(|candidate| ResolvedQuality {
                    variant: QualityVariant {
                        permission: PermissionStatus::Allow,
                        ..candidate.clone()
                    },
                    permitted: true,
                    decision: Decision::OwnerOverride,
                })
                .collect(),
        }
    }

    /// Match candidates against the list; each entry is consumed by the
    /// first candidate that matches it.
    pub fn resolve_with_list(&self, content: &ContentRef, list: Vec<QualityPermission>) -> ResolvedLadder {
        let mut remaining = list;
        let qualities = self
            .ladder
            .iter()
            .map(|candidate| {
                let status = remaining
                    .iter()
                    .position(|entry| candidate.matches_name(&entry.quality_name))
                    .map(|index| remaining.remove(index).status)
                    .unwrap_or(PermissionStatus::Unset);

                debug!(quality = %candidate.name, %status, "Permission matched");
                ResolvedQuality {
                    variant: QualityVariant {
                        permission: status,
                        ..candidate.clone()
                    },
                    permitted: status == PermissionStatus::Allow,
                    decision: Decision::PermissionList,
                }
            })
            .collect();

        ResolvedLadder {
            media_id: content.media_id.clone(),
            owner_override: false,
            qualities,
        }
    }

    async fn resolve_by_probe(&self, backend: &dyn PlaybackBackend, content: &ContentRef) -> ResolvedLadder {
        let mut qualities = Vec::with_capacity(self.ladder.len());

        for candidate in &self.ladder {
            let exists = match backend
                .resolve_quality_variant_url(&content.media_id, &candidate.name)
                .await
            {
                Ok(url) => url.is_some(),
                Err(e) => {
                    warn!(quality = %candidate.name, error = %e, "Existence probe failed");
                    false
                }
            };

            debug!(quality = %candidate.name, exists, "Variant probed");
            qualities.push(ResolvedQuality {
                variant: QualityVariant {
                    permission: if exists {
                        PermissionStatus::Allow
                    } else {
                        PermissionStatus::Unset
                    },
                    ..candidate.clone()
                },
                permitted: exists,
                decision: Decision::ExistenceProbe,
            });
        }

        ResolvedLadder {
            media_id: content.media_id.clone(),
            owner_override: false,
            qualities,
        }
    }
}

impl Default for QualityResolver {
    fn default() -> Self {
        Self::new(default_ladder())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use PermissionStatus::*;

    fn content() -> ContentRef {
        ContentRef::standalone("m1")
    }

    fn names(ladder: &ResolvedLadder) -> Vec<String> {
        ladder.permitted().into_iter().map(|q| q.name).collect()
    }

    #[test]
    fn list_keeps_only_allowed_entries() {
        let resolver = QualityResolver::default();
        let ladder = resolver.resolve_with_list(
            &content(),
            vec![
                QualityPermission::new("360p", Allow),
                QualityPermission::new("720p", Deny),
            ],
        );

        assert_eq!(names(&ladder), ["360p"]);
        assert_eq!(ladder.qualities[1].variant.permission, Deny);
        // Missing from the list
        assert_eq!(ladder.qualities[0].variant.permission, Unset);
        assert!(!ladder.qualities[0].permitted);
    }

    #[test]
    fn list_matching_is_case_insensitive() {
        let resolver = QualityResolver::default();
        let ladder = resolver.resolve_with_list(
            &content(),
            vec![
                QualityPermission::new("1080P", Allow),
                QualityPermission::new("480p", RequireLogin),
            ],
        );
        assert_eq!(names(&ladder), ["1080p"]);
        assert_eq!(ladder.switch_decision("480P"), SwitchDecision::LoginRequired);
    }

    #[test]
    fn duplicate_entries_are_consumed_once() {
        let resolver = QualityResolver::new(vec![
            QualityVariant::new("720p", 2_800_000, Resolution::HD_720P),
            QualityVariant::new("720p", 2_000_000, Resolution::HD_720P),
        ]);
        let ladder = resolver.resolve_with_list(
            &content(),
            vec![
                QualityPermission::new("720p", Deny),
                QualityPermission::new("720p", Allow),
            ],
        );

        assert!(!ladder.qualities[0].permitted);
        assert!(ladder.qualities[1].permitted);
    }

    #[test]
    fn switch_decisions_follow_status() {
        let resolver = QualityResolver::default();
        let ladder = resolver.resolve_with_list(
            &content(),
            vec![
                QualityPermission::new("1080p", Allow),
                QualityPermission::new("720p", Deny),
                QualityPermission::new("480p", Allow),
            ],
        );

        assert_eq!(ladder.switch_decision("480p"), SwitchDecision::Allowed(1));
        assert_eq!(ladder.switch_decision("720p"), SwitchDecision::Denied);
        assert_eq!(ladder.switch_decision("360p"), SwitchDecision::Denied);
        assert_eq!(ladder.switch_decision("4k"), SwitchDecision::Unknown);
    }

    #[tokio::test]
    async fn owner_override_permits_everything() {
        let backend = MemoryBackend::new().with_permissions("m1", vec![QualityPermission::new("360p", Deny)]);
        let ladder = QualityResolver::default()
            .resolve(&backend, &content(), true)
            .await
            .unwrap();

        assert_eq!(ladder.permitted_count(), 4);
        assert!(ladder.owner_override);
        assert_eq!(backend.probe_calls(), 0);
    }

    #[tokio::test]
    async fn empty_list_falls_back_to_probe() {
        let backend = MemoryBackend::new().with_available("m1", &["1080p", "480p"]);
        let ladder = QualityResolver::default()
            .resolve(&backend, &content(), false)
            .await
            .unwrap();

        assert_eq!(names(&ladder), ["1080p", "480p"]);
        assert_eq!(backend.probe_calls(), 4);
        assert!(ladder.qualities.iter().all(|q| q.decision == Decision::ExistenceProbe));
    }

    #[tokio::test]
    async fn non_empty_list_skips_probe() {
        let backend = MemoryBackend::new()
            .with_permissions("m1", vec![QualityPermission::new("720p", Allow)])
            .with_available("m1", &["1080p"]);
        let ladder = QualityResolver::default()
            .resolve(&backend, &content(), false)
            .await
            .unwrap();

        assert_eq!(names(&ladder), ["720p"]);
        assert_eq!(backend.probe_calls(), 0);
    }

    #[tokio::test]
    async fn nothing_permitted_is_signaled() {
        let backend = MemoryBackend::new()
            .with_permissions("m1", vec![QualityPermission::new("720p", RequireLogin)]);
        let err = QualityResolver::default()
            .resolve(&backend, &content(), false)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NoPermittedQualities { .. }));
    }

    #[tokio::test]
    async fn list_failure_falls_back_to_probe() {
        let backend = MemoryBackend::new().with_available("m1", &["360p"]);
        backend.fail_permissions(true);

        let ladder = QualityResolver::default()
            .resolve(&backend, &content(), false)
            .await
            .unwrap();
        assert_eq!(names(&ladder), ["360p"]);
    }
}
