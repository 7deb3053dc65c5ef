//! Error kinds for the pitboss control plane.
//!
//! Every fallible operation in the workspace returns `PitbossResult<T>`.
//! Kinds originate at the layer that detects them and survive every hop:
//! a kind raised by a local instance reaches the admin caller unchanged,
//! carried across the wire as an `ErrorBody`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Stable, machine-readable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    NotFound,
    InvalidArgument,
    NotPending,
    NoProvider,
    UpstreamUnavailable,
    DeadlineExceeded,
    Cancelled,
    Conflict,
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotPending => "not_pending",
            ErrorKind::NoProvider => "no_provider",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        }
    }

    /// Parse a wire code. Unknown codes yield `None`; callers fold them
    /// into `Internal`.
    pub fn from_code(code: &str) -> Option<Self> {
        let kind = match code {
            "unauthenticated" => ErrorKind::Unauthenticated,
            "forbidden" => ErrorKind::Forbidden,
            "not_found" => ErrorKind::NotFound,
            "invalid_argument" => ErrorKind::InvalidArgument,
            "not_pending" => ErrorKind::NotPending,
            "no_provider" => ErrorKind::NoProvider,
            "upstream_unavailable" => ErrorKind::UpstreamUnavailable,
            "deadline_exceeded" => ErrorKind::DeadlineExceeded,
            "cancelled" => ErrorKind::Cancelled,
            "conflict" => ErrorKind::Conflict,
            "internal" => ErrorKind::Internal,
            _ => return None,
        };
        Some(kind)
    }

    /// HTTP status used by every HTTP surface in the workspace.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Unauthenticated => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidArgument | ErrorKind::Conflict => 400,
            ErrorKind::NotPending => 409,
            ErrorKind::NoProvider | ErrorKind::UpstreamUnavailable => 503,
            ErrorKind::DeadlineExceeded => 504,
            ErrorKind::Cancelled => 499,
            ErrorKind::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Which guard produced a `Forbidden`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForbiddenReason {
    Rbac,
    ScopeGame,
    ScopeEnv,
}

impl ForbiddenReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ForbiddenReason::Rbac => "rbac",
            ForbiddenReason::ScopeGame => "scope_game",
            ForbiddenReason::ScopeEnv => "scope_env",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "scope_game" => ForbiddenReason::ScopeGame,
            "scope_env" => ForbiddenReason::ScopeEnv,
            _ => ForbiddenReason::Rbac,
        }
    }
}

/// The unified error type for pitboss.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PitbossError {
    /// Missing, malformed, or expired caller credential.
    #[error("unauthenticated: {reason}")]
    Unauthenticated { reason: String },

    /// RBAC or tenant scope denial.
    #[error("forbidden ({}): {message}", reason.as_str())]
    Forbidden { reason: ForbiddenReason, message: String },

    /// Unknown function, agent, job, or approval.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// The payload or a request field failed validation.
    #[error("invalid argument at '{field}': {reason}")]
    InvalidArgument { field: String, reason: String },

    /// An approval transition was attempted on a settled approval.
    #[error("approval '{id}' is not pending")]
    NotPending { id: String },

    /// No live agent or local instance serves the function.
    #[error("no provider for function '{function_id}'")]
    NoProvider { function_id: String },

    /// The next hop could not be reached, even after retry.
    #[error("upstream unavailable: {reason}")]
    UpstreamUnavailable { reason: String },

    #[error("deadline exceeded: {reason}")]
    DeadlineExceeded { reason: String },

    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    /// Duplicate approval id, or an idempotency key replayed with a
    /// different payload.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// Anything else, including configuration and storage failures.
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

/// Convenience alias used throughout the pitboss crates.
pub type PitbossResult<T> = Result<T, PitbossError>;

/// JSON error body shared by every HTTP surface: `{code, message, details?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl PitbossError {
    pub fn internal(reason: impl Into<String>) -> Self {
        PitbossError::Internal { reason: reason.into() }
    }

    pub fn config(reason: impl std::fmt::Display) -> Self {
        PitbossError::Internal { reason: format!("configuration error: {reason}") }
    }

    pub fn forbidden(reason: ForbiddenReason, message: impl Into<String>) -> Self {
        PitbossError::Forbidden { reason, message: message.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        PitbossError::NotFound { what: what.into() }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        PitbossError::InvalidArgument { field: field.into(), reason: reason.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PitbossError::Unauthenticated { .. } => ErrorKind::Unauthenticated,
            PitbossError::Forbidden { .. } => ErrorKind::Forbidden,
            PitbossError::NotFound { .. } => ErrorKind::NotFound,
            PitbossError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            PitbossError::NotPending { .. } => ErrorKind::NotPending,
            PitbossError::NoProvider { .. } => ErrorKind::NoProvider,
            PitbossError::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            PitbossError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            PitbossError::Cancelled { .. } => ErrorKind::Cancelled,
            PitbossError::Conflict { .. } => ErrorKind::Conflict,
            PitbossError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// The human-readable part of the error, without the kind prefix that
    /// `Display` adds.
    pub fn message(&self) -> String {
        match self {
            PitbossError::Unauthenticated { reason }
            | PitbossError::UpstreamUnavailable { reason }
            | PitbossError::DeadlineExceeded { reason }
            | PitbossError::Cancelled { reason }
            | PitbossError::Conflict { reason }
            | PitbossError::Internal { reason } => reason.clone(),
            PitbossError::Forbidden { message, .. } => message.clone(),
            PitbossError::NotFound { what } => what.clone(),
            PitbossError::InvalidArgument { reason, .. } => reason.clone(),
            PitbossError::NotPending { .. } | PitbossError::NoProvider { .. } => self.to_string(),
        }
    }

    /// Structured details carried next to the code on the wire.
    pub fn details(&self) -> Option<Value> {
        match self {
            PitbossError::Forbidden { reason, .. } => Some(json!({ "reason": reason.as_str() })),
            PitbossError::InvalidArgument { field, .. } => Some(json!({ "field": field })),
            PitbossError::NotPending { id } => Some(json!({ "id": id })),
            PitbossError::NoProvider { function_id } => {
                Some(json!({ "function_id": function_id }))
            }
            _ => None,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.message(),
            details: self.details(),
        }
    }

    /// Rebuild an error from a wire body. The kind always survives; unknown
    /// codes become `Internal`.
    pub fn from_body(body: ErrorBody) -> Self {
        let detail = |key: &str| -> Option<String> {
            body.details
                .as_ref()
                .and_then(|d| d.get(key))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let message = body.message.clone();

        match ErrorKind::from_code(&body.code) {
            Some(ErrorKind::Unauthenticated) => PitbossError::Unauthenticated { reason: message },
            Some(ErrorKind::Forbidden) => PitbossError::Forbidden {
                reason: ForbiddenReason::parse(detail("reason").as_deref().unwrap_or("rbac")),
                message,
            },
            Some(ErrorKind::NotFound) => PitbossError::NotFound { what: message },
            Some(ErrorKind::InvalidArgument) => PitbossError::InvalidArgument {
                field: detail("field").unwrap_or_else(|| "$".to_string()),
                reason: message,
            },
            Some(ErrorKind::NotPending) => PitbossError::NotPending {
                id: detail("id").unwrap_or_default(),
            },
            Some(ErrorKind::NoProvider) => PitbossError::NoProvider {
                function_id: detail("function_id").unwrap_or_default(),
            },
            Some(ErrorKind::UpstreamUnavailable) => {
                PitbossError::UpstreamUnavailable { reason: message }
            }
            Some(ErrorKind::DeadlineExceeded) => PitbossError::DeadlineExceeded { reason: message },
            Some(ErrorKind::Cancelled) => PitbossError::Cancelled { reason: message },
            Some(ErrorKind::Conflict) => PitbossError::Conflict { reason: message },
            Some(ErrorKind::Internal) => PitbossError::Internal { reason: message },
            None => PitbossError::Internal {
                reason: format!("unrecognised error code '{}': {}", body.code, message),
            },
        }
    }

    /// Prefix the free-text part of the error with `context`. The kind and
    /// any structured fields are left untouched.
    pub fn with_context(self, context: impl std::fmt::Display) -> Self {
        let wrap = |s: String| format!("{context}: {s}");
        match self {
            PitbossError::Unauthenticated { reason } => {
                PitbossError::Unauthenticated { reason: wrap(reason) }
            }
            PitbossError::Forbidden { reason, message } => {
                PitbossError::Forbidden { reason, message: wrap(message) }
            }
            PitbossError::NotFound { what } => PitbossError::NotFound { what: wrap(what) },
            PitbossError::InvalidArgument { field, reason } => {
                PitbossError::InvalidArgument { field, reason: wrap(reason) }
            }
            PitbossError::UpstreamUnavailable { reason } => {
                PitbossError::UpstreamUnavailable { reason: wrap(reason) }
            }
            PitbossError::DeadlineExceeded { reason } => {
                PitbossError::DeadlineExceeded { reason: wrap(reason) }
            }
            PitbossError::Cancelled { reason } => PitbossError::Cancelled { reason: wrap(reason) },
            PitbossError::Conflict { reason } => PitbossError::Conflict { reason: wrap(reason) },
            PitbossError::Internal { reason } => PitbossError::Internal { reason: wrap(reason) },
            other @ (PitbossError::NotPending { .. } | PitbossError::NoProvider { .. }) => other,
        }
    }
}

/// Failure of a call to the next hop, split by where it happened.
///
/// Only `Transport` failures are eligible for a retry against another
/// agent; a `Remote` error is an answer from the far side and is final.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// Connect failure, reset, or deadline: the request may not have arrived.
    Transport(PitbossError),
    /// The far side answered with an error body.
    Remote(PitbossError),
}

impl CallError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CallError::Transport(_))
    }

    pub fn into_inner(self) -> PitbossError {
        match self {
            CallError::Transport(e) | CallError::Remote(e) => e,
        }
    }
}

impl From<CallError> for PitbossError {
    fn from(e: CallError) -> Self {
        e.into_inner()
    }
}
