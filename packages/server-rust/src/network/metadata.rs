//! Transport metadata carried in HTTP headers.

use std::time::Duration;

use axum::http::HeaderMap;
use keel_core::{DomainError, Principal};

use crate::service::operation::TransportMetadata;

pub const REQUEST_ID: &str = "x-request-id";
pub const TRACE_ID: &str = "x-trace-id";
pub const PRINCIPAL_ID: &str = "x-principal-id";
pub const PRINCIPAL_ROLES: &str = "x-principal-roles";
pub const TIMEOUT_MS: &str = "x-timeout-ms";

/// Reads operation metadata from request headers.
///
/// `x-principal-roles` is a comma-separated list and is ignored without
/// `x-principal-id`. Empty values count as absent.
///
/// # Errors
///
/// Returns `Validation` for a non-UTF-8 header value, or an `x-timeout-ms`
/// that is malformed or longer than `max_timeout`.
pub fn metadata_from_headers(
    headers: &HeaderMap,
    max_timeout: Duration,
) -> Result<TransportMetadata, DomainError> {
    let identity = header(headers, PRINCIPAL_ID)?.map(|id| {
        let roles = header(headers, PRINCIPAL_ROLES)
            .ok()
            .flatten()
            .unwrap_or_default();
        roles
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .fold(Principal::new(id), |p, role| p.with_role(role))
    });
    let timeout_ms = header(headers, TIMEOUT_MS)?
        .map(|raw| {
            raw.parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .ok_or_else(|| {
                    DomainError::validation(format!(
                        "{TIMEOUT_MS} must be a positive integer, got {raw:?}"
                    ))
                })
        })
        .transpose()?;
    if let Some(ms) = timeout_ms {
        let max_ms = u64::try_from(max_timeout.as_millis()).unwrap_or(u64::MAX);
        if ms > max_ms {
            return Err(DomainError::validation(format!(
                "{TIMEOUT_MS} must be at most {max_ms}, got {ms}"
            )));
        }
    }

    Ok(TransportMetadata {
        identity,
        request_id: header(headers, REQUEST_ID)?,
        trace_id: header(headers, TRACE_ID)?,
        timeout_ms,
    })
}

/// Just the request id, for answering a request whose other headers are unusable.
#[must_use]
pub fn request_id_only(headers: &HeaderMap) -> TransportMetadata {
    TransportMetadata {
        request_id: header(headers, REQUEST_ID).ok().flatten(),
        ..TransportMetadata::default()
    }
}

fn header(headers: &HeaderMap, name: &str) -> Result<Option<String>, DomainError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| DomainError::validation(format!("{name} is not valid UTF-8")))?
                .trim();
            Ok((!value.is_empty()).then(|| value.to_string()))
        }
    }
}
