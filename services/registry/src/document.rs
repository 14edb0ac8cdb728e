//! The parts of manifest documents the registry looks at.

use serde::Deserialize;

/// Docker manifest list media type.
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Docker image manifest media type.
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// OCI image index media type.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// OCI image manifest media type.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// A content descriptor inside a manifest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    #[serde(default)]
    pub media_type: Option<String>,
    /// Digest of the referenced content.
    #[serde(default)]
    pub digest: String,
    /// Size of the referenced content.
    #[serde(default)]
    pub size: u64,
}

/// A manifest or index, reduced to the fields used for routing and metadata.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDocument {
    /// Declared media type, if any.
    #[serde(default)]
    pub media_type: Option<String>,
    /// Image layers.
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    /// Per-platform manifests of an index.
    #[serde(default)]
    pub manifests: Option<Vec<Descriptor>>,
}

impl ManifestDocument {
    /// Parse a manifest body. Anything that is not a JSON object is rejected.
    pub fn parse(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Whether the document is an index, judged by its content.
    pub fn is_index(&self) -> bool {
        self.manifests.is_some()
            || self
                .media_type
                .as_deref()
                .is_some_and(is_index_media_type)
    }

    /// Digests of the manifests an index refers to.
    pub fn referenced_manifests(&self) -> impl Iterator<Item = &str> {
        self.manifests
            .iter()
            .flatten()
            .map(|descriptor| descriptor.digest.as_str())
            .filter(|digest| !digest.is_empty())
    }

    /// Sum of the layer sizes.
    pub fn layer_size(&self) -> u64 {
        self.layers
            .iter()
            .fold(0u64, |total, layer| total.saturating_add(layer.size))
    }

    /// The content type to serve this document with.
    ///
    /// The type is inferred from the presence of a `manifests` array. A
    /// declared OCI media type selects the OCI flavour, otherwise the Docker
    /// types are used.
    pub fn content_type(&self) -> &'static str {
        let oci = self
            .media_type
            .as_deref()
            .is_some_and(|media_type| media_type.starts_with("application/vnd.oci."));
        match (self.manifests.is_some(), oci) {
            (true, true) => OCI_INDEX,
            (true, false) => DOCKER_MANIFEST_LIST,
            (false, true) => OCI_MANIFEST,
            (false, false) => DOCKER_MANIFEST,
        }
    }
}

/// Whether `media_type` names a multi-platform index.
pub fn is_index_media_type(media_type: &str) -> bool {
    let media_type = media_type.split(';').next().unwrap_or_default().trim();
    media_type == DOCKER_MANIFEST_LIST || media_type == OCI_INDEX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_platform_manifest() {
        let document = ManifestDocument::parse(
            br#"{
                "schemaVersion": 2,
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "config": {"digest": "sha256:c", "size": 7},
                "layers": [{"digest": "sha256:a", "size": 10}, {"digest": "sha256:b", "size": 5}]
            }"#,
        )
        .unwrap();

        assert!(!document.is_index());
        assert_eq!(document.layer_size(), 15);
        assert_eq!(document.content_type(), OCI_MANIFEST);
    }

    #[test]
    fn oversized_layers_saturate() {
        let document = ManifestDocument::parse(
            br#"{"layers": [{"digest": "sha256:a", "size": 18446744073709551615}, {"digest": "sha256:b", "size": 2}]}"#,
        )
        .unwrap();

        assert_eq!(document.layer_size(), u64::MAX);
    }

    #[test]
    fn index_is_detected_by_content() {
        let document =
            ManifestDocument::parse(br#"{"manifests": [{"digest": "sha256:a"}, {"size": 3}]}"#).unwrap();

        assert!(document.is_index());
        assert_eq!(document.referenced_manifests().collect::<Vec<_>>(), ["sha256:a"]);
        assert_eq!(document.content_type(), DOCKER_MANIFEST_LIST);
    }

    #[test]
    fn index_media_types() {
        assert!(is_index_media_type(OCI_INDEX));
        assert!(is_index_media_type(
            "application/vnd.docker.distribution.manifest.list.v2+json; charset=utf-8"
        ));
        assert!(!is_index_media_type(DOCKER_MANIFEST));
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(ManifestDocument::parse(b"not json").is_err());
        assert!(ManifestDocument::parse(b"[1, 2]").is_err());
    }
}
