//! Errors at the HTTP boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use stellar_ops::LifecycleError;
use stellar_policy::PolicyError;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    /// Kubernetes or OCM refused or could not be reached.
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

pub type ConsoleResult<T> = Result<T, ConsoleError>;

impl ConsoleError {
    pub fn status(&self) -> StatusCode {
        match self {
            ConsoleError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ConsoleError::NotFound(_) => StatusCode::NOT_FOUND,
            ConsoleError::Conflict(_) => StatusCode::CONFLICT,
            ConsoleError::Upstream(_) | ConsoleError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn upstream(err: anyhow::Error) -> Self {
        ConsoleError::Upstream(format!("{err:#}"))
    }
}

impl IntoResponse for ConsoleError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "api: request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<LifecycleError> for ConsoleError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::InvalidKubeconfig(_) | LifecycleError::InvalidName(_) => ConsoleError::BadRequest(e.to_string()),
            LifecycleError::NotFound(_) => ConsoleError::NotFound(e.to_string()),
            LifecycleError::InProgress { .. } => ConsoleError::Conflict(e.to_string()),
            LifecycleError::Hub(_) => ConsoleError::Upstream(e.to_string()),
        }
    }
}

impl From<PolicyError> for ConsoleError {
    fn from(e: PolicyError) -> Self {
        ConsoleError::BadRequest(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_errors_map_to_status_codes() {
        let cases = [
            (LifecycleError::NotFound("ghost".into()), StatusCode::NOT_FOUND),
            (LifecycleError::InvalidName("a/b".into()), StatusCode::BAD_REQUEST),
            (
                LifecycleError::InProgress { name: "c1".into(), status: stellar_core::ClusterStatus::Pending },
                StatusCode::CONFLICT,
            ),
            (LifecycleError::Hub(anyhow::anyhow!("hub context not configured")), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, want) in cases {
            assert_eq!(ConsoleError::from(err).status(), want);
        }
    }

    #[test]
    fn upstream_keeps_the_whole_chain() {
        let err = anyhow::anyhow!("connection refused").context("deleting managed cluster c1");
        assert_eq!(ConsoleError::upstream(err).to_string(), "deleting managed cluster c1: connection refused");
    }
}
