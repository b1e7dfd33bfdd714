use crate::ResourceVersion;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by store operations.
///
/// None of these are retried by the store; they are surfaced to the caller as-is.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("{kind} {key:?} not found")]
    NotFound { kind: String, key: String },

    #[error("{kind} {key:?} already exists")]
    AlreadyExists { kind: String, key: String },

    #[error(
        "operation cannot be fulfilled on {kind} {key:?}: resource version {expected} does not match {current}"
    )]
    Conflict {
        kind: String,
        key: String,
        expected: ResourceVersion,
        current: ResourceVersion,
    },

    #[error("too old resource version: {requested} ({oldest})")]
    Gone {
        kind: String,
        requested: ResourceVersion,
        oldest: ResourceVersion,
    },

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unknown resource kind {0:?}")]
    UnknownKind(String),

    #[error("server is shutting down")]
    ShuttingDown,
}

/// Terminal conditions of a watch that was closed by the server.
///
/// A watch stopped by its own consumer ends without one of these.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Closed {
    /// The watch reached its maximum lifetime.
    #[error("watch expired")]
    Expired,

    /// The watch's queue filled up because its consumer fell behind.
    #[error("watch queue overflowed")]
    Overflowed,

    #[error("server is shutting down")]
    ShuttingDown,
}

// === impl Error ===

impl Error {
    /// The HTTP status code a transport should respond with.
    pub fn code(&self) -> u16 {
        match self {
            Self::NotFound { .. } | Self::UnknownKind(_) => 404,
            Self::AlreadyExists { .. } | Self::Conflict { .. } => 409,
            Self::Invalid(_) => 422,
            Self::InvalidPatch(_) | Self::InvalidSelector(_) => 400,
            Self::Gone { .. } => 410,
            Self::Forbidden(_) => 403,
            Self::ShuttingDown => 503,
        }
    }

    /// The `metav1.Status` reason for this error.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound { .. } | Self::UnknownKind(_) => "NotFound",
            Self::AlreadyExists { .. } => "AlreadyExists",
            Self::Conflict { .. } => "Conflict",
            Self::Gone { .. } => "Expired",
            Self::Invalid(_) => "Invalid",
            Self::InvalidPatch(_) | Self::InvalidSelector(_) => "BadRequest",
            Self::Forbidden(_) => "Forbidden",
            Self::ShuttingDown => "ServiceUnavailable",
        }
    }

    /// Renders this error as the `Status` object an API server responds with.
    pub fn status(&self) -> metav1::Status {
        let details = match self {
            Self::NotFound { kind, key }
            | Self::AlreadyExists { kind, key }
            | Self::Conflict { kind, key, .. } => Some(metav1::StatusDetails {
                kind: Some(kind.clone()),
                name: Some(key.rsplit('/').next().unwrap_or(key).to_string()),
                ..Default::default()
            }),
            _ => None,
        };
        metav1::Status {
            code: Some(self.code().into()),
            details,
            message: Some(self.to_string()),
            reason: Some(self.reason().to_string()),
            status: Some("Failure".to_string()),
            ..Default::default()
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether a watch asked to resume from a version that is no longer retained.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone { .. })
    }
}

// === impl Closed ===

impl Closed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Overflowed => "overflowed",
            Self::ShuttingDown => "shutdown",
        }
    }
}
