//! `POST /v1/operations/{name}`: runs one operation through the wrapper.
//!
//! The request body is the operation input as JSON (an empty body is
//! `null`). The response status is the envelope's status and the body is the
//! envelope body; `x-request-id` echoes the request id used.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use keel_core::DomainError;
use serde_json::Value;

use super::AppState;
use crate::network::metadata::{metadata_from_headers, request_id_only, REQUEST_ID};
use crate::service::operation::{OperationError, OperationRequest, ResponseEnvelope};

pub async fn operation_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    into_response(dispatch(&state, name, &headers, &body).await)
}

async fn dispatch(state: &AppState, name: String, headers: &HeaderMap, body: &[u8]) -> ResponseEnvelope {
    let Some(_in_flight) = state.drain.admit() else {
        return state
            .wrapper
            .reject(&name, &request_id_only(headers), OperationError::Draining.into());
    };

    let metadata = match metadata_from_headers(headers, state.config.max_operation_timeout()) {
        Ok(metadata) => metadata,
        Err(err) => return state.wrapper.reject(&name, &request_id_only(headers), err.into()),
    };

    let input = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(body) {
            Ok(input) => input,
            Err(err) => {
                let err = DomainError::validation(format!("request body is not valid JSON: {err}"));
                return state.wrapper.reject(&name, &metadata, err.into());
            }
        }
    };

    state
        .wrapper
        .handle(OperationRequest {
            operation: name,
            input,
            metadata,
        })
        .await
}

fn into_response(envelope: ResponseEnvelope) -> Response {
    let status = StatusCode::from_u16(envelope.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(envelope.body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&envelope.request_id) {
        response.headers_mut().insert(REQUEST_ID, value);
    }
    response
}
