//! HTTP mapping for relying-party failures

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

/// Request-level failures surfaced to the browser.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Oidc(#[from] oidc_client::Error),

    #[error("no authenticated session")]
    NotAuthenticated,
}

impl Error {
    pub fn status(&self) -> StatusCode {
        use oidc_client::Error as Oidc;
        match self {
            Error::NotAuthenticated => StatusCode::UNAUTHORIZED,
            Error::Oidc(Oidc::Transport(_) | Oidc::Discovery(_)) => StatusCode::BAD_GATEWAY,
            Error::Oidc(Oidc::Configuration(_) | Oidc::Storage(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Error::Oidc(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Label for `oidc_errors_total`.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Oidc(e) => e.kind(),
            Error::NotAuthenticated => "not_authenticated",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.kind(), error = %self, "request failed");
        }
        // Server-side details stay in the logs
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal error".to_string()
        } else {
            self.to_string()
        };
        let body = serde_json::json!({
            "error": self.kind(),
            "message": message,
        });
        (status, axum::Json(body)).into_response()
    }
}

/// Result alias for handlers
pub type Result<T> = std::result::Result<T, Error>;
