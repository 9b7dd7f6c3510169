use crate::{credentials::ProviderError, record::RecordError};
use http::StatusCode;
use thiserror::Error;

/// The OSB error code reported for conflicting concurrent operations.
pub const CONCURRENCY_ERROR: &str = "ConcurrencyError";

/// Errors returned by the broker's verbs.
///
/// Each kind maps onto the HTTP status the OSB surface reports via [`Error::status`].
#[derive(Debug, Error)]
pub enum Error {
    /// The request is malformed or refers to an unknown service or plan.
    #[error("{0}")]
    Validation(String),

    /// The instance already exists, or a polled operation has been superseded.
    #[error("concurrent modification not supported")]
    Conflict,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Gone(String),

    /// A collaborator (chart repository, deployer, cluster, or record store) failed.
    #[error("{context}: {source:#}")]
    Upstream {
        context: String,
        source: anyhow::Error,
    },

    /// A credential provider's expectations about the deployed chart were not met.
    #[error("failed to bind instance {instance:?}: {source}")]
    Provider {
        instance: String,
        source: ProviderError,
    },

    #[error("invalid record for instance {instance:?}: {source}")]
    Record {
        instance: String,
        source: RecordError,
    },

    /// An operation stopped because a newer operation on the instance replaced it.
    #[error("operation {0} was superseded")]
    Superseded(String),
}

// === impl Error ===

impl Error {
    pub(crate) fn upstream(context: impl ToString, source: impl Into<anyhow::Error>) -> Self {
        Self::Upstream {
            context: context.to_string(),
            source: source.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict | Self::Superseded(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Gone(_) => StatusCode::GONE,
            Self::Upstream { .. }
            | Self::Provider { .. }
            | Self::Record { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The machine-readable OSB error code, if the error kind has one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Conflict | Self::Superseded(_) => Some(CONCURRENCY_ERROR),
            _ => None,
        }
    }

    /// Renders the error as a single-line description suitable for an operation record.
    pub fn description(&self) -> String {
        self.to_string()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_hints() {
        assert_eq!(
            Error::Validation("empty namespace".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::Conflict.status(), StatusCode::CONFLICT);
        assert_eq!(Error::Conflict.code(), Some(CONCURRENCY_ERROR));
        assert_eq!(
            Error::Superseded("provision-1".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::Gone("x".into()).status(), StatusCode::GONE);
        assert_eq!(
            Error::upstream("failed to deploy", anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn description_is_single_line() {
        let error = Error::upstream(
            "failed to install chart redis@10.5.7 for instance \"i1\"",
            anyhow::anyhow!("Error: INSTALLATION FAILED:\n  timed out\n"),
        );
        assert_eq!(
            error.description(),
            "failed to install chart redis@10.5.7 for instance \"i1\": Error: INSTALLATION FAILED: timed out"
        );
    }
}
