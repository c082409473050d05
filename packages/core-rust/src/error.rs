//! Error taxonomy: the closed set of failure kinds and their classification.
//!
//! Domain code raises typed errors ([`DomainError`], [`TimeoutError`],
//! [`CircuitOpen`], or any type implementing [`Classify`]) and propagates them
//! unchanged through `anyhow`. Exactly one boundary -- the operation wrapper,
//! or the resilient executor when deciding on a retry -- turns a raw failure
//! into an [`ErrorEnvelope`] via a [`Classifier`].

use std::error::Error as StdError;
use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Public message returned in place of the detail of an `Internal` failure.
pub const INTERNAL_PUBLIC_MESSAGE: &str = "internal server error";

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Closed enumeration of externally visible failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller-supplied input violates a precondition.
    Validation,
    /// Identity or permission failure.
    Unauthorized,
    /// Referenced entity is absent.
    NotFound,
    /// State precondition violated (e.g., concurrent modification).
    Conflict,
    /// A downstream call failed transiently.
    Dependency,
    /// Unclassified failure or programmer error.
    Internal,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::Validation,
        ErrorKind::Unauthorized,
        ErrorKind::NotFound,
        ErrorKind::Conflict,
        ErrorKind::Dependency,
        ErrorKind::Internal,
    ];

    /// HTTP-style status code for this kind. The only place status codes are defined.
    #[must_use]
    pub const fn status_code(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Dependency => 502,
            ErrorKind::Internal => 500,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Dependency)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ErrorEnvelope
// ---------------------------------------------------------------------------

/// Classified, externally safe representation of a failure.
///
/// `detail` holds the full cause chain and is never serialized; it is meant
/// for the observability sink only. For `Internal` failures `message` is the
/// generic [`INTERNAL_PUBLIC_MESSAGE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub status_code: u16,
    #[serde(skip)]
    pub detail: String,
}

impl ErrorEnvelope {
    fn new(kind: ErrorKind, message: String, detail: String) -> Self {
        let message = if kind == ErrorKind::Internal {
            INTERNAL_PUBLIC_MESSAGE.to_string()
        } else {
            message
        };
        Self {
            kind,
            message,
            retryable: kind.is_retryable(),
            status_code: kind.status_code(),
            detail,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw error types
// ---------------------------------------------------------------------------

/// Maps a concrete error type onto the taxonomy.
///
/// Implement this for any error type a [`Classifier`] should recognize, then
/// register it with [`Classifier::with`].
pub trait Classify: StdError + Send + Sync + 'static {
    fn kind(&self) -> ErrorKind;
}

/// Typed failures raised by domain operations.
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },
    #[error("{0}")]
    Conflict(String),
    #[error("dependency {service} failed: {message}")]
    Dependency { service: String, message: String },
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn dependency(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dependency {
            service: service.into(),
            message: message.into(),
        }
    }
}

impl Classify for DomainError {
    fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Validation(_) => ErrorKind::Validation,
            DomainError::Unauthorized(_) => ErrorKind::Unauthorized,
            DomainError::NotFound { .. } => ErrorKind::NotFound,
            DomainError::Conflict(_) => ErrorKind::Conflict,
            DomainError::Dependency { .. } => ErrorKind::Dependency,
        }
    }
}

/// Time-budget failures produced by the executor and the deadline middleware.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutError {
    /// A single attempt ran out of time while the operation still had budget.
    #[error("attempt timed out after {timeout_ms}ms")]
    AttemptTimedOut { timeout_ms: u64 },
    /// The operation's deadline passed; no further attempts are possible.
    #[error("operation deadline exceeded")]
    DeadlineExceeded,
}

impl Classify for TimeoutError {
    fn kind(&self) -> ErrorKind {
        match self {
            TimeoutError::AttemptTimedOut { .. } => ErrorKind::Dependency,
            TimeoutError::DeadlineExceeded => ErrorKind::Internal,
        }
    }
}

/// Call rejected because the dependency's circuit breaker is open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit open for dependency {dependency}")]
pub struct CircuitOpen {
    pub dependency: String,
}

impl Classify for CircuitOpen {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Dependency
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

type Rule = Box<dyn Fn(&(dyn StdError + 'static)) -> Option<ErrorKind> + Send + Sync>;

/// Total classification of `anyhow` errors into [`ErrorEnvelope`]s.
///
/// The cause chain is walked outermost-first and, for each cause, the rules
/// are tried in registration order. The first match wins; an error no rule
/// recognizes is `Internal`. Given the same rules, the same error always
/// yields the same envelope.
pub struct Classifier {
    rules: Vec<Rule>,
}

impl Classifier {
    /// A classifier with no rules: everything is `Internal`.
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Registers a raw error type.
    #[must_use]
    pub fn with<T: Classify>(mut self) -> Self {
        self.rules
            .push(Box::new(|cause: &(dyn StdError + 'static)| {
                cause.downcast_ref::<T>().map(T::kind)
            }));
        self
    }

    /// Kind of the first recognized cause, or `Internal`.
    #[must_use]
    pub fn kind_of(&self, err: &anyhow::Error) -> ErrorKind {
        self.matched(err).map_or(ErrorKind::Internal, |(kind, _)| kind)
    }

    #[must_use]
    pub fn classify(&self, err: &anyhow::Error) -> ErrorEnvelope {
        let detail = format!("{err:#}");
        match self.matched(err) {
            Some((kind, cause)) => ErrorEnvelope::new(kind, cause.to_string(), detail),
            None => ErrorEnvelope::new(ErrorKind::Internal, String::new(), detail),
        }
    }

    fn matched<'a>(
        &self,
        err: &'a anyhow::Error,
    ) -> Option<(ErrorKind, &'a (dyn StdError + 'static))> {
        err.chain().find_map(|cause| {
            self.rules
                .iter()
                .find_map(|rule| rule(cause))
                .map(|kind| (kind, cause))
        })
    }
}

impl Default for Classifier {
    /// Recognizes [`DomainError`], [`TimeoutError`] and [`CircuitOpen`].
    fn default() -> Self {
        Self::empty()
            .with::<DomainError>()
            .with::<TimeoutError>()
            .with::<CircuitOpen>()
    }
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("rules", &self.rules.len())
            .finish()
    }
}

/// Classifies with the default rule set.
#[must_use]
pub fn classify(err: &anyhow::Error) -> ErrorEnvelope {
    static DEFAULT: OnceLock<Classifier> = OnceLock::new();
    DEFAULT.get_or_init(Classifier::default).classify(err)
}
