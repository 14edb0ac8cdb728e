//! Signature endpoints.
//!
//! Clients that sign images query these paths. Signatures are accepted and
//! discarded, and listing always returns an empty set.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::RegistryResult;
use crate::validate::validate_reference;

/// Respond to a signature request for `digest`.
pub(crate) fn signatures(method: &str, digest: &str) -> RegistryResult<Response> {
    validate_reference(digest)?;

    Ok(match method {
        "GET" | "HEAD" => Json(json!({ "signatures": [] })).into_response(),
        "POST" | "PUT" => StatusCode::CREATED.into_response(),
        "DELETE" => StatusCode::NO_CONTENT.into_response(),
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    })
}
