//! Image registry collaborator

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One image in a repository, as reported by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryImage {
    /// Content digest (`sha256:...`)
    #[serde(default)]
    pub digest: Option<String>,

    /// Tags in registry-defined order
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub pushed_at: Option<DateTime<Utc>>,
}

impl RepositoryImage {
    pub fn new(digest: impl Into<String>, tags: &[&str], pushed_at: DateTime<Utc>) -> Self {
        Self {
            digest: Some(digest.into()),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            pushed_at: Some(pushed_at),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Every tagged image of `repository` in the registry of `region`, unordered
    async fn list_tagged_images(&self, region: &str, repository: &str)
        -> Result<Vec<RepositoryImage>>;
}
