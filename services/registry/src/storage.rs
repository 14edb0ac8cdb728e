//! Storage layer for the registry
//!
//! [`RegistryStorage`] drives blobs and manifests from an HTTP request to the
//! remote store: uploads are staged in the local store, verified against
//! their digest, and handed to the [`ReplicationCoordinator`]. In
//! [`ReplicationMode::Sync`] a blob body can also be streamed straight to the
//! remote store, hashing it on the way.
//!
//! Local and remote stores share one layout:
//!
//! ```text
//! <repo>/blobs/<digest>
//! <repo>/blobs/uploads/<session>
//! <repo>/manifests/<tag>
//! <repo>/manifests/<digest>
//! ```

use std::sync::Arc;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};
use tracing::Instrument;

use storage::{FileWriter, Reader, Storage};

use crate::digest::{Algorithm, Digest, HashingWriter};
use crate::document::{ManifestDocument, is_index_media_type};
use crate::error::{RegistryError, RegistryResult};
use crate::metadata::{ImageRecord, LayerRecord, MetadataStore};
use crate::replication::{ReplicationCoordinator, ReplicationGuard, ReplicationMode};
use crate::validate::is_valid_repo_name;

/// Path of a committed blob.
pub fn blob_path(name: &str, digest: &Digest) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{name}/blobs/{digest}"))
}

/// Path of the staging file of an upload session.
pub fn upload_path(name: &str, session: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{name}/blobs/uploads/{session}"))
}

/// Directory holding the staging files of a repository.
pub fn uploads_dir(name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{name}/blobs/uploads"))
}

/// Directory holding the manifests of a repository.
pub fn manifests_dir(name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{name}/manifests"))
}

/// Path of a manifest stored under a tag or a digest.
pub fn manifest_path(name: &str, reference: &str) -> Utf8PathBuf {
    manifests_dir(name).join(reference)
}

fn verify(expected: &Digest, actual: Digest) -> RegistryResult<()> {
    if *expected == actual {
        Ok(())
    } else {
        Err(RegistryError::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

async fn abandon(writer: Box<dyn FileWriter>, path: &Utf8Path) {
    if let Err(error) = writer.cancel().await {
        tracing::warn!(%path, %error, "could not remove abandoned remote object");
    }
}

/// A blob ready to be read from the remote store.
pub struct BlobReader {
    /// Size of the blob in bytes.
    pub size: u64,
    /// The blob contents.
    pub reader: Box<Reader<'static>>,
}

impl std::fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobReader").field("size", &self.size).finish()
    }
}

/// Registry storage backend
#[derive(Debug, Clone)]
pub struct RegistryStorage {
    coordinator: Arc<ReplicationCoordinator>,
    metadata: Arc<dyn MetadataStore>,
    mode: ReplicationMode,
}

impl RegistryStorage {
    /// Create a new registry storage
    pub fn new(
        coordinator: Arc<ReplicationCoordinator>,
        metadata: Arc<dyn MetadataStore>,
        mode: ReplicationMode,
    ) -> Self {
        Self {
            coordinator,
            metadata,
            mode,
        }
    }

    /// The local staging store.
    pub fn local(&self) -> &Storage {
        self.coordinator.local()
    }

    /// The remote store.
    pub fn remote(&self) -> &Storage {
        self.coordinator.remote()
    }

    /// The replication mode.
    pub fn mode(&self) -> ReplicationMode {
        self.mode
    }

    /// The metadata collaborator.
    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Provision a repository the first time it is written to.
    ///
    /// A repository unknown to the metadata store gets its remote directory
    /// created and is then recorded. Failures are logged, not returned: a
    /// write into a repository whose directory is still missing fails on its
    /// own, and the next push tries again.
    #[tracing::instrument(skip(self))]
    pub async fn ensure_repository(&self, name: &str) {
        match self.metadata.repository(name).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(error) => tracing::warn!(%error, "repository lookup failed, provisioning anyway"),
        }

        if let Err(error) = self.remote().create_dir(Utf8Path::new(name)).await {
            tracing::warn!(%error, "could not create remote repository directory");
            return;
        }

        match self.metadata.create_repository(name).await {
            Ok(_) => tracing::info!("created repository"),
            Err(error) => tracing::warn!(%error, "could not record repository"),
        }
    }

    /// Start an upload session and return its identifier.
    #[tracing::instrument(skip(self))]
    pub async fn start_upload(&self, name: &str) -> RegistryResult<String> {
        self.ensure_repository(name).await;
        let session = uuid::Uuid::new_v4().to_string();
        tracing::debug!(%session, "started upload");
        Ok(session)
    }

    /// Append `body` to the staging file of an upload, returning the staged size.
    #[tracing::instrument(skip(self, body))]
    pub async fn append_upload<R>(&self, name: &str, session: &str, body: &mut R) -> RegistryResult<u64>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let path = upload_path(name, session);
        let mut writer = self.local().writer(&path, true).await?;

        // Bytes already appended stay staged when the body is cut off.
        let received = tokio::io::copy(body, &mut writer).await;
        let appended = writer.commit().await?;
        received?;

        let size = self.local().stat(&path).await?.size;
        tracing::debug!(appended, size, "received chunk");
        Ok(size)
    }

    /// Bytes staged so far for an upload.
    pub async fn upload_size(&self, name: &str, session: &str) -> RegistryResult<u64> {
        match self.local().stat(&upload_path(name, session)).await {
            Ok(metadata) => Ok(metadata.size),
            Err(error) if error.is_not_found() => Ok(0),
            Err(error) => Err(error.into()),
        }
    }

    /// Drop the staging file of an upload.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_upload(&self, name: &str, session: &str) -> RegistryResult<()> {
        self.local().delete(&upload_path(name, session)).await?;
        Ok(())
    }

    /// Commit a blob upload.
    ///
    /// `body` is the final request body; `session` names the upload whose
    /// staged chunks are used when the body is empty. The digest is parsed
    /// before anything is read or written.
    #[tracing::instrument(skip(self, body))]
    pub async fn commit_upload<R>(
        &self,
        name: &str,
        session: Option<&str>,
        digest: &str,
        mut body: R,
    ) -> RegistryResult<Digest>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let digest = Digest::parse(digest)?;
        self.ensure_repository(name).await;

        if self.mode == ReplicationMode::Sync && !body.fill_buf().await?.is_empty() {
            self.stream_blob(name, &digest, &mut body).await?;
            if let Some(session) = session {
                self.discard_upload(name, session).await;
            }
            return Ok(digest);
        }

        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;
        self.commit_buffered(name, session, &digest, Bytes::from(data))
            .await?;
        Ok(digest)
    }

    /// Copy a blob body to the remote store while hashing it.
    ///
    /// The remote object is cancelled, and so removed, unless the body hashes
    /// to `digest`. When the blob is already stored remotely the body is only
    /// hashed.
    async fn stream_blob<R>(&self, name: &str, digest: &Digest, body: &mut R) -> RegistryResult<()>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let path = blob_path(name, digest);
        let _guard = self.coordinator.guard(&path).await?;

        if self.remote().exists(&path).await? {
            let mut sink = HashingWriter::new(tokio::io::sink(), digest.algorithm());
            tokio::io::copy_buf(body, &mut sink).await?;
            let (_, computed) = sink.finish();
            verify(digest, computed)?;
            tracing::info!(%path, "blob already stored remotely, body discarded");
            return Ok(());
        }

        let writer = self.remote().writer(&path, false).await?;
        let mut hashing = HashingWriter::new(writer, digest.algorithm());
        let copied = tokio::io::copy_buf(body, &mut hashing).await;
        let size = hashing.written();
        let (writer, computed) = hashing.finish();

        if let Err(error) = copied {
            abandon(writer, &path).await;
            return Err(error.into());
        }

        if let Err(error) = verify(digest, computed) {
            abandon(writer, &path).await;
            return Err(error);
        }

        writer.commit().await?;
        tracing::info!(%path, size, "streamed blob to remote store");
        Ok(())
    }

    /// Commit a blob from a full body or from the staged chunks of `session`.
    ///
    /// The blob path is held from the moment it is written locally until it
    /// has been replicated, so one commit never sees the local copy of another
    /// disappear. Staged chunks are verified before they are moved.
    async fn commit_buffered(
        &self,
        name: &str,
        session: Option<&str>,
        digest: &Digest,
        data: Bytes,
    ) -> RegistryResult<()> {
        let local = self.local();
        let path = blob_path(name, digest);
        let staged = match (data.is_empty(), session) {
            (true, Some(session)) => self.read_staged(name, session).await?,
            _ => None,
        };

        let guard = self.coordinator.guard(&path).await?;
        let data = if !data.is_empty() {
            local.put(&path, &data, None).await?;
            verify(digest, Digest::compute(digest.algorithm(), &data))?;
            if let Some(session) = session {
                self.discard_upload(name, session).await;
            }
            data
        } else if let (Some(staged), Some(session)) = (staged, session) {
            verify(digest, Digest::compute(digest.algorithm(), &staged))?;
            local.rename(&upload_path(name, session), &path).await?;
            staged
        } else if digest.is_empty_content() {
            local.put(&path, &[], None).await?;
            Bytes::new()
        } else if self.remote().exists(&path).await? {
            tracing::info!(%path, "blob already stored remotely, nothing to commit");
            return Ok(());
        } else {
            return Err(RegistryError::BlobUploadUnknown(
                session.unwrap_or(digest.hex()).to_string(),
            ));
        };

        self.replicate_blob(guard, path, data).await
    }

    /// The staged chunks of `session`, or `None` when nothing was staged.
    async fn read_staged(&self, name: &str, session: &str) -> RegistryResult<Option<Bytes>> {
        match self.local().get(&upload_path(name, session)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn discard_upload(&self, name: &str, session: &str) {
        let path = upload_path(name, session);
        if let Err(error) = self.local().delete(&path).await {
            tracing::warn!(%path, %error, "could not remove staged upload");
        }
    }

    async fn replicate_blob(&self, guard: ReplicationGuard, path: Utf8PathBuf, data: Bytes) -> RegistryResult<()> {
        match self.mode {
            ReplicationMode::Sync => {
                self.coordinator.replicate_locked(&guard, &path, data).await?;
            }
            ReplicationMode::Async => {
                let coordinator = self.coordinator.clone();
                tokio::spawn(
                    async move {
                        if let Err(error) = coordinator.replicate_locked(&guard, &path, data).await {
                            tracing::error!(%path, %error, "background replication failed, staged copy kept");
                        }
                    }
                    .in_current_span(),
                );
            }
        }
        Ok(())
    }

    /// The size of a blob stored remotely.
    pub async fn blob_size(&self, name: &str, digest: &Digest) -> RegistryResult<u64> {
        let metadata = self
            .remote()
            .stat(&blob_path(name, digest))
            .await
            .map_err(|error| RegistryError::or_not_found(error, || RegistryError::BlobNotFound(digest.to_string())))?;
        Ok(metadata.size)
    }

    /// Open a blob for reading from the remote store.
    #[tracing::instrument(skip(self))]
    pub async fn get_blob(&self, name: &str, digest: &Digest) -> RegistryResult<BlobReader> {
        let size = self.blob_size(name, digest).await?;
        let reader = self
            .remote()
            .reader(&blob_path(name, digest), 0)
            .await
            .map_err(|error| RegistryError::or_not_found(error, || RegistryError::BlobNotFound(digest.to_string())))?;
        Ok(BlobReader { size, reader })
    }

    /// Store a manifest under `reference` and under its own digest.
    ///
    /// An index is only accepted when every manifest it refers to is already
    /// stored remotely; that check happens before anything is written. The
    /// metadata store learns about the image once both copies are
    /// replicated.
    #[tracing::instrument(skip(self, data), fields(size = data.len()))]
    pub async fn put_manifest(
        &self,
        name: &str,
        reference: &str,
        content_type: Option<&str>,
        data: Bytes,
    ) -> RegistryResult<Digest> {
        let document =
            ManifestDocument::parse(&data).map_err(|error| RegistryError::InvalidManifest(error.to_string()))?;

        let pinned = Digest::parse(reference).ok();
        let algorithm = pinned.as_ref().map_or(Algorithm::Sha256, Digest::algorithm);
        let digest = Digest::compute(algorithm, &data);
        if let Some(pinned) = &pinned {
            verify(pinned, digest.clone())?;
        }

        if document.is_index() || content_type.is_some_and(is_index_media_type) {
            self.check_references(name, &document).await?;
        }

        self.ensure_repository(name).await;

        let digest_path = manifest_path(name, &digest.to_string());
        let tag_path = match pinned {
            Some(_) => None,
            None => Some(manifest_path(name, reference)),
        };

        if let Some(tag_path) = &tag_path {
            self.local().put(tag_path, &data, None).await?;
        }
        self.local().put(&digest_path, &data, None).await?;

        let tag = tag_path.is_some().then(|| reference.to_string());
        match self.mode {
            ReplicationMode::Sync => {
                self.replicate_manifest(tag_path.as_deref(), &digest_path, data.clone())
                    .await?;
                if let Some(tag) = tag {
                    let this = self.clone();
                    let name = name.to_string();
                    let digest = digest.to_string();
                    tokio::spawn(
                        async move { this.record_image(&name, &tag, &digest, &document).await }
                            .in_current_span(),
                    );
                }
            }
            ReplicationMode::Async => {
                let this = self.clone();
                let name = name.to_string();
                let digest_string = digest.to_string();
                tokio::spawn(
                    async move {
                        match this
                            .replicate_manifest(tag_path.as_deref(), &digest_path, data)
                            .await
                        {
                            Ok(()) => {
                                if let Some(tag) = tag {
                                    this.record_image(&name, &tag, &digest_string, &document)
                                        .await;
                                }
                            }
                            Err(error) => {
                                tracing::error!(%error, "background manifest replication failed, staged copies kept");
                            }
                        }
                    }
                    .in_current_span(),
                );
            }
        }

        tracing::info!(%digest, "stored manifest");
        Ok(digest)
    }

    /// Reject an index that refers to manifests missing from the remote store.
    async fn check_references(&self, name: &str, document: &ManifestDocument) -> RegistryResult<()> {
        let mut missing = Vec::new();
        for reference in document.referenced_manifests() {
            let digest = Digest::parse(reference)
                .map_err(|_| RegistryError::InvalidManifest(format!("invalid referenced digest {reference}")))?;
            if !self
                .remote()
                .exists(&manifest_path(name, &digest.to_string()))
                .await?
            {
                missing.push(reference.to_string());
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::MissingManifests(missing))
        }
    }

    /// Replicate the tag copy, then the digest copy. A failed tag copy stops
    /// the digest copy from being attempted.
    async fn replicate_manifest(
        &self,
        tag_path: Option<&Utf8Path>,
        digest_path: &Utf8Path,
        data: Bytes,
    ) -> RegistryResult<()> {
        if let Some(tag_path) = tag_path {
            self.coordinator.replace(tag_path, tag_path, data.clone()).await?;
        }
        self.coordinator
            .replicate(digest_path, digest_path, data)
            .await?;
        Ok(())
    }

    /// Report a tagged image to the metadata store.
    async fn record_image(&self, name: &str, tag: &str, digest: &str, document: &ManifestDocument) {
        let mut size = document.layer_size();
        if size == 0 && document.is_index() {
            for reference in document.referenced_manifests() {
                size = size.saturating_add(self.platform_size(name, reference).await);
            }
        }

        let layers = document
            .layers
            .iter()
            .map(|layer| LayerRecord {
                digest: layer.digest.clone(),
                media_type: layer.media_type.clone().unwrap_or_default(),
                size: layer.size,
            })
            .collect();

        let image = ImageRecord {
            repository: name.to_string(),
            tag: tag.to_string(),
            digest: digest.to_string(),
            size,
            layers,
            created: Utc::now(),
        };

        match self.metadata.record_image(image).await {
            Ok(()) => tracing::debug!(%name, %tag, %digest, size, "recorded image"),
            Err(error) => tracing::warn!(%name, %tag, %error, "could not record image"),
        }
    }

    /// Layer size of one platform manifest of an index, or zero if it cannot be read.
    async fn platform_size(&self, name: &str, reference: &str) -> u64 {
        let data = match self.remote().get(&manifest_path(name, reference)).await {
            Ok(data) => data,
            Err(error) => {
                tracing::debug!(%reference, %error, "could not read platform manifest");
                return 0;
            }
        };
        ManifestDocument::parse(&data)
            .map(|document| document.layer_size())
            .unwrap_or(0)
    }

    /// Read a manifest by tag or digest.
    ///
    /// A manifest missing under `reference` is looked up under its alias (the
    /// digest of a tag, or the tag of a digest) known to the metadata store.
    #[tracing::instrument(skip(self))]
    pub async fn get_manifest(&self, name: &str, reference: &str) -> RegistryResult<Bytes> {
        if let Some(data) = self.read_manifest(name, reference).await? {
            return Ok(data);
        }

        if let Some(alias) = self.manifest_alias(name, reference).await {
            if alias != reference && crate::validate::is_valid_reference(&alias) {
                tracing::debug!(%alias, "trying manifest alias");
                if let Some(data) = self.read_manifest(name, &alias).await? {
                    return Ok(data);
                }
            }
        }

        Err(RegistryError::ManifestNotFound(reference.to_string()))
    }

    async fn read_manifest(&self, name: &str, reference: &str) -> RegistryResult<Option<Bytes>> {
        match self.remote().get(&manifest_path(name, reference)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn manifest_alias(&self, name: &str, reference: &str) -> Option<String> {
        let image = if Digest::is_digest(reference) {
            self.metadata
                .image_by_digest(name, reference)
                .await
                .map(|image| image.map(|image| image.tag))
        } else {
            self.metadata
                .image_by_tag(name, reference)
                .await
                .map(|image| image.map(|image| image.digest))
        };

        image.unwrap_or_else(|error| {
            tracing::warn!(%error, "metadata lookup failed");
            None
        })
    }

    /// Tags of a repository, sorted, without the digest-named copies.
    #[tracing::instrument(skip(self))]
    pub async fn list_tags(&self, name: &str) -> RegistryResult<Vec<String>> {
        let entries = self
            .remote()
            .list(&manifests_dir(name))
            .await
            .map_err(|error| RegistryError::or_not_found(error, || RegistryError::RepositoryNotFound(name.to_string())))?;

        let mut tags: Vec<String> = entries
            .into_iter()
            .filter(|entry| !Digest::is_digest(entry) && !entry.starts_with("sha256:"))
            .collect();
        tags.sort();
        Ok(tags)
    }

    /// Repositories stored remotely, sorted.
    ///
    /// A top-level directory holding `blobs` or `manifests` is a repository;
    /// any other top-level directory is a namespace whose subdirectories are
    /// repositories.
    #[tracing::instrument(skip(self))]
    pub async fn catalog(&self) -> RegistryResult<Vec<String>> {
        let remote = self.remote();
        let top = match remote.list(Utf8Path::new("")).await {
            Ok(entries) => entries,
            Err(error) if error.is_not_found() => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut repositories = Vec::new();
        for entry in top {
            let children = match remote.list(Utf8Path::new(&entry)).await {
                Ok(children) => children,
                Err(error) => {
                    tracing::debug!(%entry, %error, "skipping catalog entry");
                    continue;
                }
            };

            if children.iter().any(|child| child == "blobs" || child == "manifests") {
                repositories.push(entry);
            } else {
                repositories.extend(children.into_iter().map(|child| format!("{entry}/{child}")));
            }
        }

        repositories.retain(|name| is_valid_repo_name(name));
        repositories.sort();
        Ok(repositories)
    }
}
