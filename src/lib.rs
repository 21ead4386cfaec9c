use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[from] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Invalid spec ({reason}): {message}")]
    InvalidSpec { reason: String, message: String },

    #[error("Not yet Ready: {message}")]
    NotReady {
        message: String,
        reason: String,
        requeue_after: Option<Duration>,
    },

    #[error("The {kind} {name} already exists and is not controlled by this resource")]
    NameConflict { kind: String, name: String },

    #[error("The object is missing its {0}")]
    MissingObjectKey(&'static str),

    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn invalid_spec(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidSpec {
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::FinalizerError(_) => "FinalizerError",
            Error::InvalidSpec { .. } => "InvalidSpec",
            Error::NotReady { .. } => "NotReady",
            Error::NameConflict { .. } => "NameConflict",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::InvalidUrl(_) => "InvalidUrl",
        }
    }

    /// The reconciler error underneath any finalizer wrapping
    pub fn root(&self) -> &Error {
        use kube::runtime::finalizer::Error as FinalizerError;

        match self {
            Error::FinalizerError(err) => match err.as_ref() {
                FinalizerError::ApplyFailed(inner) | FinalizerError::CleanupFailed(inner) => {
                    inner.root()
                }
                _ => self,
            },
            _ => self,
        }
    }

    /// Whether another attempt without a spec change could succeed
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::KubeError(kube::Error::Api(resp)) => {
                // bad requests and invalid objects need a spec change
                !matches!(resp.code, 400 | 422)
            }
            Error::KubeError(_) => true,
            Error::FinalizerError(_) => true,
            Error::NotReady { .. } => true,
            Error::SerializationError(_)
            | Error::InvalidSpec { .. }
            | Error::NameConflict { .. }
            | Error::MissingObjectKey(_)
            | Error::InvalidUrl(_) => false,
        }
    }

    /// An optimistic write lost against a concurrent mutation
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::KubeError(kube::Error::Api(resp)) if resp.code == 409)
    }
}

pub mod controllers;

pub use controllers::{RetryPolicy, Settings, State};

/// Allow-list projection of user supplied container specs
pub mod fieldmask;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// Serving CRDs
pub mod resources;
