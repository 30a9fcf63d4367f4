//! Registry image references
//!
//! Managed images look like
//! `{account}.dkr.ecr.{region}.{domain}/{repository}:{tag}`. Anything else is
//! treated as an unmanaged image and is never checked for freshness.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker separating the account id from the region in a managed registry host
pub const REGISTRY_MARKER: &str = ".dkr.ecr.";

/// Tags whose registry pointer moves on every push
pub const FLOATING_TAGS: &[&str] = &["latest"];

/// Tag assumed when a reference carries none
pub const DEFAULT_TAG: &str = "latest";

/// A parsed managed-registry image reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    /// `{account}.dkr.ecr.{region}.{domain}`
    pub registry_host: String,

    pub account_id: String,

    pub region: String,

    /// Repository path, may contain `/`
    pub repository: String,

    /// Tag named in the reference, `latest` when only a digest pin was given
    pub tag: String,

    /// `sha256:...` pin written into the reference itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_digest: Option<String>,

    /// Digest observed on a live container, never taken from the reference string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image URI, returning `None` for images not hosted on the managed registry
    pub fn parse(uri: &str) -> Option<Self> {
        let uri = uri.trim();
        let (host, path) = uri.split_once('/')?;

        let (account_id, rest) = host.split_once(REGISTRY_MARKER)?;
        let (region, domain) = rest.split_once('.')?;
        if account_id.is_empty() || region.is_empty() || domain.is_empty() {
            return None;
        }

        let (path, pinned_digest) = match path.split_once('@') {
            Some((path, pin)) if !pin.is_empty() => (path, Some(pin.to_string())),
            Some(_) => return None,
            None => (path, None),
        };

        let (repository, tag) = match path.rsplit_once(':') {
            Some((repository, tag)) => (repository, tag),
            None => (path, DEFAULT_TAG),
        };
        if repository.is_empty() || tag.is_empty() {
            return None;
        }

        Some(Self {
            registry_host: host.to_string(),
            account_id: account_id.to_string(),
            region: region.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
            pinned_digest,
            digest: None,
        })
    }

    /// `registry/repository` without the tag
    pub fn base_uri(&self) -> String {
        format!("{}/{}", self.registry_host, self.repository)
    }

    /// Reference as it should be written into a container definition
    pub fn uri(&self) -> String {
        match &self.pinned_digest {
            Some(pin) => format!("{}@{}", self.base_uri(), pin),
            None => format!("{}:{}", self.base_uri(), self.tag),
        }
    }

    /// Same image with a different tag and no pin
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            pinned_digest: None,
            digest: None,
            ..self.clone()
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// True when the tag is reassigned on every push and no digest pins it
    pub fn is_floating(&self) -> bool {
        self.pinned_digest.is_none() && is_floating_tag(&self.tag)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

pub fn is_floating_tag(tag: &str) -> bool {
    FLOATING_TAGS.contains(&tag)
}

/// Tag portion of an arbitrary image URI (the text after the last `:`)
pub fn tag_of(uri: &str) -> &str {
    uri.rsplit(':').next().unwrap_or(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_managed_reference() {
        let reference =
            ImageReference::parse("123456789012.dkr.ecr.us-east-1.amazonaws.com/team/app:v1.2.3")
                .unwrap();

        assert_eq!(reference.account_id, "123456789012");
        assert_eq!(reference.region, "us-east-1");
        assert_eq!(
            reference.registry_host,
            "123456789012.dkr.ecr.us-east-1.amazonaws.com"
        );
        assert_eq!(reference.repository, "team/app");
        assert_eq!(reference.tag, "v1.2.3");
        assert_eq!(reference.digest, None);
        assert_eq!(
            reference.uri(),
            "123456789012.dkr.ecr.us-east-1.amazonaws.com/team/app:v1.2.3"
        );
    }

    #[test]
    fn test_parse_accepts_other_domain_suffixes() {
        let reference =
            ImageReference::parse("123456789012.dkr.ecr.eu-west-2.example.com/app:latest").unwrap();
        assert_eq!(reference.region, "eu-west-2");
        assert!(reference.is_floating());
    }

    #[test]
    fn test_unmanaged_images_are_not_parsed() {
        assert!(ImageReference::parse("nginx:1.25").is_none());
        assert!(ImageReference::parse("docker.io/library/redis:7").is_none());
        assert!(ImageReference::parse("123456789012.dkr.ecr.us-east-1/app:v1").is_none());
        assert!(ImageReference::parse("").is_none());
    }

    #[test]
    fn test_missing_tag_defaults_to_latest() {
        let reference =
            ImageReference::parse("1.dkr.ecr.us-east-1.amazonaws.com/app").unwrap();
        assert_eq!(reference.tag, "latest");
    }

    #[test]
    fn test_tag_with_digest_pin() {
        let reference = ImageReference::parse(
            "1.dkr.ecr.us-east-1.amazonaws.com/app:v3@sha256:abcdef",
        )
        .unwrap();
        assert_eq!(reference.tag, "v3");
        assert_eq!(reference.repository, "app");
        assert_eq!(reference.pinned_digest.as_deref(), Some("sha256:abcdef"));
        assert_eq!(reference.digest, None);
        assert!(!reference.is_floating());
    }

    #[test]
    fn test_digest_only_reference_is_not_floating() {
        let uri = "123456789012.dkr.ecr.us-east-1.amazonaws.com/app@sha256:abc";
        let reference = ImageReference::parse(uri).unwrap();

        assert_eq!(reference.repository, "app");
        assert_eq!(reference.pinned_digest.as_deref(), Some("sha256:abc"));
        assert!(!reference.is_floating());
        assert_eq!(reference.uri(), uri);

        let retagged = reference.with_tag("v4");
        assert_eq!(retagged.pinned_digest, None);
        assert_eq!(
            retagged.uri(),
            "123456789012.dkr.ecr.us-east-1.amazonaws.com/app:v4"
        );
    }

    #[test]
    fn test_empty_digest_pin_is_rejected() {
        assert!(ImageReference::parse("1.dkr.ecr.us-east-1.amazonaws.com/app@").is_none());
    }

    #[test]
    fn test_with_tag_clears_digest() {
        let reference = ImageReference::parse("1.dkr.ecr.us-east-1.amazonaws.com/app:v1")
            .unwrap()
            .with_digest("sha256:aaa");
        let next = reference.with_tag("v2");
        assert_eq!(next.tag, "v2");
        assert_eq!(next.digest, None);
        assert_eq!(next.to_string(), "1.dkr.ecr.us-east-1.amazonaws.com/app:v2");
    }

    #[test]
    fn test_tag_of() {
        assert_eq!(tag_of("repo:v9"), "v9");
        assert_eq!(tag_of("plain"), "plain");
    }
}
