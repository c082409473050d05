//! Operation types flowing between the transport layer, the wrapper, and the pipeline.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use keel_core::{Classify, ErrorEnvelope, ErrorKind, Principal, RequestContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound metadata supplied by the transport layer.
///
/// Every field is optional: missing request ids are generated, a missing
/// trace id defaults to the request id, and a missing timeout falls back to
/// `ServerConfig::default_operation_timeout_ms`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMetadata {
    pub identity: Option<Principal>,
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// A call as it arrives at the operation wrapper.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    /// Registered operation name, e.g. `"ledger.transfer"`.
    pub operation: String,
    pub input: Value,
    pub metadata: TransportMetadata,
}

impl OperationRequest {
    #[must_use]
    pub fn new(operation: impl Into<String>, input: Value) -> Self {
        Self {
            operation: operation.into(),
            input,
            metadata: TransportMetadata::default(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: TransportMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Boxed future returned by every service in the operation pipeline.
pub type OperationFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// An operation inside the pipeline: the established context plus the call.
#[derive(Debug, Clone)]
pub struct Operation {
    pub ctx: Arc<RequestContext>,
    pub name: String,
    pub input: Value,
}

impl Operation {
    #[must_use]
    pub fn ctx(&self) -> &RequestContext {
        &self.ctx
    }
}

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

/// Uniform response returned to the transport layer for every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: u16,
    pub body: ResponseBody,
    /// Echoed to the transport (e.g. as a header), not part of the body.
    #[serde(skip)]
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn success(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            status: 200,
            body: ResponseBody {
                success: true,
                data: Some(data),
                error: None,
            },
            request_id: request_id.into(),
        }
    }

    #[must_use]
    pub fn failure(request_id: impl Into<String>, envelope: &ErrorEnvelope) -> Self {
        Self {
            status: envelope.status_code,
            body: ResponseBody {
                success: false,
                data: None,
                error: Some(ErrorBody {
                    kind: envelope.kind,
                    message: envelope.message.clone(),
                }),
            },
            request_id: request_id.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationError
// ---------------------------------------------------------------------------

/// Failures raised by the pipeline itself rather than by domain handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("unknown operation: {name}")]
    UnknownOperation { name: String },
    #[error("server overloaded, try again later")]
    Overloaded,
    #[error("server is draining, try again later")]
    Draining,
}

impl Classify for OperationError {
    fn kind(&self) -> ErrorKind {
        match self {
            OperationError::UnknownOperation { .. } => ErrorKind::NotFound,
            OperationError::Overloaded | OperationError::Draining => ErrorKind::Dependency,
        }
    }
}
