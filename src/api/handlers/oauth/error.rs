//! RFC 6749 error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// The closed set of errors the token and authorization endpoints emit.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum OAuthError {
    #[error("invalid_request")]
    InvalidRequest,
    #[error("invalid_client")]
    InvalidClient,
    #[error("invalid_grant")]
    InvalidGrant,
    #[error("invalid_scope")]
    InvalidScope,
    #[error("access_denied")]
    AccessDenied,
    #[error("unsupported_grant_type")]
    UnsupportedGrantType,
}

impl OAuthError {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::InvalidScope => "invalid_scope",
            Self::AccessDenied => "access_denied",
            Self::UnsupportedGrantType => "unsupported_grant_type",
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::InvalidRequest => "The request is missing a parameter or is otherwise malformed",
            Self::InvalidClient => "Client authentication failed",
            Self::InvalidGrant => "The authorization code is invalid, expired, or already used",
            Self::InvalidScope => "The requested scope is not allowed for this client",
            Self::AccessDenied => "The resource owner denied the request",
            Self::UnsupportedGrantType => "Only authorization_code is supported",
        }
    }

    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Self::InvalidClient => StatusCode::UNAUTHORIZED,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct OAuthErrorBody {
    pub error: String,
    pub error_description: String,
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        (
            self.status(),
            axum::Json(OAuthErrorBody {
                error: self.code().to_string(),
                error_description: self.description().to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::OAuthError;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[test]
    fn invalid_client_is_401() {
        assert_eq!(
            OAuthError::InvalidClient.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn other_errors_are_400() {
        for error in [
            OAuthError::InvalidRequest,
            OAuthError::InvalidGrant,
            OAuthError::InvalidScope,
            OAuthError::AccessDenied,
            OAuthError::UnsupportedGrantType,
        ] {
            assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn codes_are_registry_names() {
        assert_eq!(OAuthError::InvalidGrant.code(), "invalid_grant");
        assert_eq!(
            OAuthError::UnsupportedGrantType.code(),
            "unsupported_grant_type"
        );
    }
}
