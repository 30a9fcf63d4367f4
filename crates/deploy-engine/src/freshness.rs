//! Image freshness resolution
//!
//! Decides whether a running image is behind the registry. Floating tags are
//! compared by digest, versioned tags by the newest pushed tag.

use deckhand_common::{Registry, RepositoryImage, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::image::{is_floating_tag, ImageReference};

/// Outcome of a freshness check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FreshnessResult {
    pub has_update: bool,

    /// Reference the service should run to be current; the input when nothing is newer
    pub latest_reference: ImageReference,
}

impl FreshnessResult {
    fn unchanged(current: &ImageReference) -> Self {
        Self {
            has_update: false,
            latest_reference: current.clone(),
        }
    }
}

/// Compare `current` against the tagged images of its repository.
///
/// `observed_digest` is the digest reported by a live container, if any.
pub fn resolve(
    current: &ImageReference,
    candidates: &[RepositoryImage],
    observed_digest: Option<&str>,
) -> FreshnessResult {
    let mut ordered: Vec<&RepositoryImage> = candidates.iter().collect();
    // Newest first; images without a push time go last and keep their order.
    ordered.sort_by(|a, b| b.pushed_at.cmp(&a.pushed_at));

    let newest = match ordered.first() {
        Some(image) => *image,
        None => {
            debug!(repository = %current.repository, "No tagged images in repository");
            return FreshnessResult::unchanged(current);
        }
    };

    if current.is_floating() {
        let latest_digest = newest.digest.as_deref().filter(|d| !d.is_empty());
        let running_digest = match observed_digest.filter(|d| !d.is_empty()) {
            Some(digest) => Some(digest),
            None => ordered
                .iter()
                .find(|image| image.has_tag(&current.tag))
                .and_then(|image| image.digest.as_deref()),
        };

        let has_update = match (latest_digest, running_digest) {
            (Some(latest), Some(running)) => latest != running,
            _ => {
                warn!(
                    repository = %current.repository,
                    tag = %current.tag,
                    "Digest missing, cannot compare floating tag"
                );
                false
            }
        };

        debug!(
            repository = %current.repository,
            has_update,
            "Resolved floating tag freshness"
        );

        return FreshnessResult {
            has_update,
            latest_reference: current.with_tag(&current.tag),
        };
    }

    if let Some(pin) = &current.pinned_digest {
        let has_update = newest.digest.as_deref().is_some_and(|latest| latest != pin.as_str());
        let latest_tag = newest
            .tags
            .iter()
            .find(|tag| !is_floating_tag(tag))
            .or_else(|| newest.tags.first());
        return match latest_tag {
            Some(latest_tag) if has_update => {
                debug!(
                    repository = %current.repository,
                    latest = %latest_tag,
                    "Pinned digest is behind the newest image"
                );
                FreshnessResult {
                    has_update,
                    latest_reference: current.with_tag(latest_tag),
                }
            }
            _ => FreshnessResult::unchanged(current),
        };
    }

    match newest.tags.first() {
        Some(latest_tag) => {
            let has_update = latest_tag != &current.tag;
            debug!(
                repository = %current.repository,
                current = %current.tag,
                latest = %latest_tag,
                has_update,
                "Resolved versioned tag freshness"
            );
            FreshnessResult {
                has_update,
                latest_reference: current.with_tag(latest_tag),
            }
        }
        None => FreshnessResult::unchanged(current),
    }
}

/// Fetch the repository contents for `current` and resolve against them
pub async fn check(
    registry: &dyn Registry,
    current: &ImageReference,
    observed_digest: Option<&str>,
) -> Result<FreshnessResult> {
    let images = registry
        .list_tagged_images(&current.region, &current.repository)
        .await?;
    Ok(resolve(current, &images, observed_digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(minute: u32) -> Option<chrono::DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap())
    }

    fn image(
        digest: Option<&str>,
        tags: &[&str],
        pushed_at: Option<chrono::DateTime<Utc>>,
    ) -> RepositoryImage {
        RepositoryImage {
            digest: digest.map(str::to_string),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            pushed_at,
        }
    }

    fn reference(tag: &str) -> ImageReference {
        ImageReference::parse(&format!(
            "123456789012.dkr.ecr.us-east-1.example.com/app:{tag}"
        ))
        .unwrap()
    }

    #[test]
    fn test_floating_tag_with_newer_digest() {
        let images = vec![image(Some("sha256:bbb"), &["latest"], at(5))];
        let result = resolve(&reference("latest"), &images, Some("sha256:aaa"));

        assert!(result.has_update);
        assert_eq!(result.latest_reference.tag, "latest");
    }

    #[test]
    fn test_floating_tag_matching_digest() {
        let images = vec![image(Some("sha256:aaa"), &["latest"], at(5))];
        let result = resolve(&reference("latest"), &images, Some("sha256:aaa"));
        assert!(!result.has_update);
    }

    #[test]
    fn test_floating_tag_without_observed_digest_uses_tagged_image() {
        let images = vec![
            image(Some("sha256:new"), &["build-7"], at(9)),
            image(Some("sha256:old"), &["latest"], at(1)),
        ];
        let result = resolve(&reference("latest"), &images, None);
        assert!(result.has_update);

        let result = resolve(&reference("latest"), &images, Some(""));
        assert!(result.has_update);
    }

    #[test]
    fn test_floating_tag_missing_digest_is_not_an_update() {
        let images = vec![image(None, &["latest"], at(1))];
        let result = resolve(&reference("latest"), &images, Some("sha256:aaa"));
        assert!(!result.has_update);
    }

    #[test]
    fn test_versioned_tag_behind() {
        let images = vec![
            image(Some("sha256:1"), &["v1"], at(1)),
            image(Some("sha256:2"), &["v2"], at(2)),
        ];
        let result = resolve(&reference("v1"), &images, None);

        assert!(result.has_update);
        assert_eq!(
            result.latest_reference.uri(),
            "123456789012.dkr.ecr.us-east-1.example.com/app:v2"
        );
    }

    #[test]
    fn test_versioned_tag_current() {
        let images = vec![
            image(Some("sha256:1"), &["v1"], at(1)),
            image(Some("sha256:2"), &["v2"], at(2)),
        ];
        let result = resolve(&reference("v2"), &images, None);
        assert!(!result.has_update);
        assert_eq!(result.latest_reference.tag, "v2");
    }

    #[test]
    fn test_pinned_digest_behind_newest_image() {
        let current = ImageReference::parse(
            "123456789012.dkr.ecr.us-east-1.example.com/app@sha256:1",
        )
        .unwrap();
        let images = vec![
            image(Some("sha256:1"), &["v1"], at(1)),
            image(Some("sha256:2"), &["latest", "v2"], at(2)),
        ];
        let result = resolve(&current, &images, None);

        assert!(result.has_update);
        assert_eq!(
            result.latest_reference.uri(),
            "123456789012.dkr.ecr.us-east-1.example.com/app:v2"
        );
    }

    #[test]
    fn test_pinned_digest_matching_newest_image() {
        let current = ImageReference::parse(
            "123456789012.dkr.ecr.us-east-1.example.com/app@sha256:2",
        )
        .unwrap();
        let images = vec![
            image(Some("sha256:1"), &["v1"], at(1)),
            image(Some("sha256:2"), &["v2"], at(2)),
        ];
        let result = resolve(&current, &images, None);

        assert!(!result.has_update);
        assert_eq!(result.latest_reference, current);
    }

    #[test]
    fn test_empty_repository_has_no_update() {
        let current = reference("v1");
        let result = resolve(&current, &[], None);
        assert!(!result.has_update);
        assert_eq!(result.latest_reference, current);
    }

    #[test]
    fn test_images_without_push_time_sort_last() {
        let images = vec![
            image(Some("sha256:x"), &["v0"], None),
            image(Some("sha256:3"), &["v3"], at(3)),
        ];
        let result = resolve(&reference("v3"), &images, None);
        assert!(!result.has_update);
    }

    #[test]
    fn test_newest_image_without_tags_is_not_an_update() {
        let images = vec![image(Some("sha256:9"), &[], at(9))];
        let result = resolve(&reference("v1"), &images, None);
        assert!(!result.has_update);
    }
}
