//! Parsing of registry API paths.
//!
//! Repository names may contain a `/`, so the API is matched by looking for
//! the last well-known marker segment (`blobs`, `manifests`, ...) instead of
//! by router patterns.

const UPLOADS: &str = "/blobs/uploads/";
const BLOBS: &str = "/blobs/";
const MANIFESTS: &str = "/manifests/";
const SIGNATURES: &str = "/signatures/";

// Earlier entries win when two markers start at the same position.
const MARKERS: [&str; 4] = [UPLOADS, BLOBS, MANIFESTS, SIGNATURES];

/// A parsed path below `/v2/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryPath {
    /// `_catalog`
    Catalog,

    /// `{name}/tags/list`
    Tags {
        /// Repository name
        name: String,
    },

    /// `{name}/manifests/{reference}`
    Manifest {
        /// Repository name
        name: String,
        /// Tag or digest
        reference: String,
    },

    /// `{name}/blobs/{digest}`
    Blob {
        /// Repository name
        name: String,
        /// Blob digest, unparsed
        digest: String,
    },

    /// `{name}/blobs/uploads/`
    Uploads {
        /// Repository name
        name: String,
    },

    /// `{name}/blobs/uploads/{session}`
    Upload {
        /// Repository name
        name: String,
        /// Upload session identifier
        session: String,
    },

    /// `{name}/signatures/{digest}`
    Signature {
        /// Repository name
        name: String,
        /// Signed digest
        digest: String,
    },
}

impl RegistryPath {
    /// Parse the part of a request path that follows `/v2/`.
    ///
    /// Names and references are returned as written; validating them is up
    /// to the handler.
    pub fn parse(path: &str) -> Option<Self> {
        let path = path.trim_start_matches('/');

        if path == "_catalog" {
            return Some(RegistryPath::Catalog);
        }

        if let Some(name) = path.strip_suffix("/tags/list") {
            return Some(RegistryPath::Tags { name: name.into() });
        }

        if let Some(name) = path
            .strip_suffix("/blobs/uploads/")
            .or_else(|| path.strip_suffix("/blobs/uploads"))
        {
            return Some(RegistryPath::Uploads { name: name.into() });
        }

        let (at, marker) = MARKERS
            .iter()
            .filter_map(|marker| path.rfind(marker).map(|at| (at, *marker)))
            .fold(None, |best: Option<(usize, &str)>, candidate| match best {
                Some(best) if best.0 >= candidate.0 => Some(best),
                _ => Some(candidate),
            })?;
        let name = path[..at].to_string();
        let rest = path[at + marker.len()..].to_string();

        Some(match marker {
            UPLOADS => RegistryPath::Upload { name, session: rest },
            BLOBS => RegistryPath::Blob { name, digest: rest },
            MANIFESTS => RegistryPath::Manifest {
                name,
                reference: rest,
            },
            _ => RegistryPath::Signature { name, digest: rest },
        })
    }

    /// The repository named by this path, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            RegistryPath::Catalog => None,
            RegistryPath::Tags { name }
            | RegistryPath::Manifest { name, .. }
            | RegistryPath::Blob { name, .. }
            | RegistryPath::Uploads { name }
            | RegistryPath::Upload { name, .. }
            | RegistryPath::Signature { name, .. } => Some(name),
        }
    }
}
