//! Resolving a request to an authenticated principal.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

use super::session::extract_session_token;
use super::session_kind::SessionKind;
use super::storage;
use super::utils::hash_token;

/// Early-return error type for handler helpers: a ready-to-send response.
pub(crate) type HandlerError = Box<Response>;

/// The authenticated owner of a presented session token.
pub(crate) struct Principal {
    pub(crate) user_id: Uuid,
    pub(crate) username: String,
    pub(crate) email: Option<String>,
    /// Hash of the token the request presented, for current-session queries.
    pub(crate) token_hash: Vec<u8>,
}

async fn resolve(
    pool: &PgPool,
    headers: &HeaderMap,
    expected: SessionKind,
) -> Result<Principal, HandlerError> {
    let Some(token) = extract_session_token(headers) else {
        return Err(Box::new(StatusCode::UNAUTHORIZED.into_response()));
    };

    let token_hash = hash_token(&token);

    let record = match storage::lookup_session(pool, &token_hash).await {
        Ok(Some(record)) => record,
        Ok(None) => return Err(Box::new(StatusCode::UNAUTHORIZED.into_response())),
        Err(err) => {
            error!("Failed to resolve session: {err}");
            return Err(Box::new(StatusCode::INTERNAL_SERVER_ERROR.into_response()));
        }
    };

    // A challenge token is not a session and a session is not a challenge.
    if record.kind != expected {
        return Err(Box::new(StatusCode::UNAUTHORIZED.into_response()));
    }

    Ok(Principal {
        user_id: record.user_id,
        username: record.username,
        email: record.email,
        token_hash,
    })
}

/// Require a full session. MFA challenge tokens are rejected.
pub(crate) async fn require_auth(
    pool: &PgPool,
    headers: &HeaderMap,
) -> Result<Principal, HandlerError> {
    resolve(pool, headers, SessionKind::Full).await
}

/// Require an MFA challenge session, the only context in which the second
/// factor may be presented.
pub(crate) async fn require_mfa_challenge(
    pool: &PgPool,
    headers: &HeaderMap,
) -> Result<Principal, HandlerError> {
    resolve(pool, headers, SessionKind::MfaChallenge).await
}
