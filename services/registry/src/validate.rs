//! Validation of names and references taken from request paths.
//!
//! Everything here runs before the request touches storage, so a rejected
//! name never produces a filesystem or network call.

use crate::error::{RegistryError, RegistryResult};

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Whether `name` is an acceptable repository name.
///
/// A name is one segment, or two separated by `/`. Segments use
/// `[A-Za-z0-9._-]` and the name may not contain `..` anywhere.
pub fn is_valid_repo_name(name: &str) -> bool {
    if name.is_empty() || name.contains("..") {
        return false;
    }

    let mut segments = name.split('/');
    let first = segments.next().is_some_and(valid_segment);
    let rest: Vec<&str> = segments.collect();
    first && rest.len() <= 1 && rest.iter().all(|segment| valid_segment(segment))
}

/// Whether `reference` can name a single stored manifest (a tag or a digest).
pub fn is_valid_reference(reference: &str) -> bool {
    !reference.is_empty()
        && !reference.contains('/')
        && !reference.contains('\\')
        && !reference.contains("..")
}

/// Reject invalid repository names with `NAME_INVALID`.
pub fn validate_repo_name(name: &str) -> RegistryResult<()> {
    if is_valid_repo_name(name) {
        Ok(())
    } else {
        Err(RegistryError::InvalidRepository(name.to_string()))
    }
}

/// Reject references that could escape their directory.
pub fn validate_reference(reference: &str) -> RegistryResult<()> {
    if is_valid_reference(reference) {
        Ok(())
    } else {
        Err(RegistryError::InvalidReference(reference.to_string()))
    }
}
