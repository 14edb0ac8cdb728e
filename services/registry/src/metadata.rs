//! The metadata collaborator.
//!
//! The registry reports repositories and tagged images to a [`MetadataStore`]
//! so that a dashboard can show them, and consults it to resolve a tag to a
//! digest (or back) when a manifest is missing under the requested name.

use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Errors reported by a metadata store.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// The store could not be reached.
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),

    /// The record was rejected.
    #[error("invalid metadata record: {0}")]
    Invalid(String),
}

/// A repository known to the metadata store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRecord {
    /// Repository name.
    pub name: String,
    /// When the repository was first pushed to.
    pub created: DateTime<Utc>,
}

/// One layer of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRecord {
    /// Layer digest.
    pub digest: String,
    /// Layer media type.
    pub media_type: String,
    /// Compressed size in bytes.
    pub size: u64,
}

/// A tagged image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// Repository name.
    pub repository: String,
    /// Tag the manifest was pushed under.
    pub tag: String,
    /// Manifest digest.
    pub digest: String,
    /// Total size of the layers. For an index, the sum over its platforms.
    pub size: u64,
    /// Layers of a single-platform image. Empty for an index.
    pub layers: Vec<LayerRecord>,
    /// When the tag was pushed.
    pub created: DateTime<Utc>,
}

/// Storage for repository and image records.
#[async_trait::async_trait]
pub trait MetadataStore: fmt::Debug + Send + Sync {
    /// Look up a repository.
    async fn repository(&self, name: &str) -> Result<Option<RepositoryRecord>, MetadataError>;

    /// Create a repository record, returning the existing one if present.
    async fn create_repository(&self, name: &str) -> Result<RepositoryRecord, MetadataError>;

    /// Record an image, replacing any image previously pushed under the same tag.
    async fn record_image(&self, image: ImageRecord) -> Result<(), MetadataError>;

    /// The image currently tagged `tag`.
    async fn image_by_tag(&self, repository: &str, tag: &str) -> Result<Option<ImageRecord>, MetadataError>;

    /// The most recently pushed image with manifest digest `digest`.
    async fn image_by_digest(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<Option<ImageRecord>, MetadataError>;
}

/// An in-process [`MetadataStore`].
#[derive(Debug, Default)]
pub struct MemoryMetadata {
    repositories: DashMap<String, RepositoryRecord>,
    images: DashMap<(String, String), ImageRecord>,
}

impl MemoryMetadata {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every image in `repository`, ordered by tag.
    pub fn images(&self, repository: &str) -> Vec<ImageRecord> {
        let mut images: Vec<_> = self
            .images
            .iter()
            .filter(|entry| entry.key().0 == repository)
            .map(|entry| entry.value().clone())
            .collect();
        images.sort_by(|a, b| a.tag.cmp(&b.tag));
        images
    }
}

#[async_trait::async_trait]
impl MetadataStore for MemoryMetadata {
    async fn repository(&self, name: &str) -> Result<Option<RepositoryRecord>, MetadataError> {
        Ok(self.repositories.get(name).map(|record| record.clone()))
    }

    async fn create_repository(&self, name: &str) -> Result<RepositoryRecord, MetadataError> {
        let record = self
            .repositories
            .entry(name.to_string())
            .or_insert_with(|| RepositoryRecord {
                name: name.to_string(),
                created: Utc::now(),
            });
        Ok(record.clone())
    }

    async fn record_image(&self, image: ImageRecord) -> Result<(), MetadataError> {
        if image.tag.is_empty() {
            return Err(MetadataError::Invalid("image tag is empty".into()));
        }
        self.images
            .insert((image.repository.clone(), image.tag.clone()), image);
        Ok(())
    }

    async fn image_by_tag(&self, repository: &str, tag: &str) -> Result<Option<ImageRecord>, MetadataError> {
        Ok(self
            .images
            .get(&(repository.to_string(), tag.to_string()))
            .map(|image| image.clone()))
    }

    async fn image_by_digest(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<Option<ImageRecord>, MetadataError> {
        Ok(self
            .images
            .iter()
            .filter(|entry| entry.key().0 == repository && entry.value().digest == digest)
            .map(|entry| entry.value().clone())
            .max_by_key(|image| image.created))
    }
}
