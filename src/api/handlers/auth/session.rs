//! Session introspection and lifecycle endpoints.
//!
//! Tokens are opaque and presented either as a `Bearer` header or the session
//! cookie; the store only ever sees their hash. Revocation flips `active`
//! rather than deleting rows, so a revoked token can never resolve again but
//! the record remains for audit.

use std::sync::Arc;

use axum::Extension;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

use crate::api::handlers::auth::principal::require_auth;
use crate::api::handlers::auth::state::AuthState;
use crate::api::handlers::auth::storage;
use crate::api::handlers::auth::types::{
    RevokeSessionRequest, SessionInfo, SessionListResponse, SessionResponse,
};
use crate::api::handlers::auth::utils::{extract_client_ip, extract_user_agent, hash_token};
use crate::audit::{AuditEvent, AuditOutcome};

pub(crate) const SESSION_COOKIE_NAME: &str = "atesti_session";

/// Pull the session token from the `Authorization` header or, failing that,
/// the session cookie.
pub(crate) fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if bearer.is_some() {
        return bearer.map(str::to_string);
    }

    headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|cookie| {
                cookie
                    .trim()
                    .strip_prefix(SESSION_COOKIE_NAME)
                    .and_then(|rest| rest.strip_prefix('='))
            })
        })
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Build the session cookie value for a freshly minted token.
pub(crate) fn session_cookie(token: &str, max_age_seconds: i64, secure: bool) -> String {
    let mut cookie =
        format!("{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_seconds}");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Build an expired session cookie to clear the browser copy.
pub(crate) fn clear_session_cookie(secure: bool) -> String {
    session_cookie("", 0, secure)
}

/// Current session introspection.
#[utoipa::path(
    get,
    path = "/v1/auth/session",
    tag = "auth",
    responses(
        (status = 200, description = "Session is valid", body = SessionResponse),
        (status = 401, description = "Missing, expired, or revoked session"),
    ),
    security(("session" = []))
)]
pub async fn session(headers: HeaderMap, Extension(pool): Extension<PgPool>) -> Response {
    let principal = match require_auth(&pool, &headers).await {
        Ok(principal) => principal,
        Err(response) => return *response,
    };

    axum::Json(SessionResponse {
        user_id: principal.user_id.to_string(),
        username: principal.username,
        email: principal.email,
    })
    .into_response()
}

/// Revoke the presented session and clear the cookie.
///
/// Responds 204 whether or not the token resolved, so logout is idempotent.
#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    tag = "auth",
    responses(
        (status = 204, description = "Session revoked"),
    ),
    security(("session" = []))
)]
pub async fn logout(
    headers: HeaderMap,
    Extension(pool): Extension<PgPool>,
    Extension(auth_state): Extension<Arc<AuthState>>,
) -> Response {
    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);

    let actor = match require_auth(&pool, &headers).await {
        Ok(principal) => Some(principal.user_id),
        Err(_) => None,
    };

    if let Some(token) = extract_session_token(&headers) {
        let token_hash = hash_token(&token);
        if let Err(err) = storage::revoke_session_by_hash(&pool, &token_hash).await {
            error!("Failed to revoke session on logout: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    crate::audit::record(
        &pool,
        AuditEvent {
            actor,
            action: "session.logout",
            resource: "session",
            outcome: AuditOutcome::Success,
            ip: ip.as_deref(),
            user_agent: user_agent.as_deref(),
        },
    )
    .await;

    let cookie = clear_session_cookie(auth_state.config().session_cookie_secure());
    (
        StatusCode::NO_CONTENT,
        [(header::SET_COOKIE, cookie)],
    )
        .into_response()
}

/// List the caller's active sessions.
#[utoipa::path(
    get,
    path = "/v1/auth/sessions",
    tag = "auth",
    responses(
        (status = 200, description = "Active sessions", body = SessionListResponse),
        (status = 401, description = "Missing, expired, or revoked session"),
    ),
    security(("session" = []))
)]
pub async fn list_sessions(headers: HeaderMap, Extension(pool): Extension<PgPool>) -> Response {
    let principal = match require_auth(&pool, &headers).await {
        Ok(principal) => principal,
        Err(response) => return *response,
    };

    let rows =
        match storage::list_sessions(&pool, principal.user_id, &principal.token_hash).await {
            Ok(rows) => rows,
            Err(err) => {
                error!("Failed to list sessions: {err}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

    let sessions = rows
        .into_iter()
        .map(|row| SessionInfo {
            id: row.id.to_string(),
            os: row.os,
            browser: row.browser,
            ip: row.ip,
            created_at: row.created_at.to_rfc3339(),
            expires_at: row.expires_at.to_rfc3339(),
            last_seen_at: row.last_seen_at.map(|at| at.to_rfc3339()),
            current: row.current,
        })
        .collect();

    axum::Json(SessionListResponse { sessions }).into_response()
}

/// Revoke one of the caller's sessions by id.
#[utoipa::path(
    post,
    path = "/v1/auth/sessions/revoke",
    tag = "auth",
    request_body = RevokeSessionRequest,
    responses(
        (status = 204, description = "Session revoked"),
        (status = 400, description = "Malformed request"),
        (status = 401, description = "Missing, expired, or revoked session"),
        (status = 404, description = "No such active session for this user"),
    ),
    security(("session" = []))
)]
pub async fn revoke_session(
    headers: HeaderMap,
    Extension(pool): Extension<PgPool>,
    payload: Option<axum::Json<RevokeSessionRequest>>,
) -> Response {
    let principal = match require_auth(&pool, &headers).await {
        Ok(principal) => principal,
        Err(response) => return *response,
    };

    let Some(axum::Json(payload)) = payload else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let Ok(session_id) = Uuid::parse_str(&payload.session_id) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match storage::revoke_session_by_id(&pool, principal.user_id, session_id).await {
        Ok(true) => {
            let ip = extract_client_ip(&headers);
            let user_agent = extract_user_agent(&headers);
            crate::audit::record(
                &pool,
                AuditEvent {
                    actor: Some(principal.user_id),
                    action: "session.revoke",
                    resource: "session",
                    outcome: AuditOutcome::Success,
                    ip: ip.as_deref(),
                    user_agent: user_agent.as_deref(),
                },
            )
            .await;
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!("Failed to revoke session: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Revoke every session of the caller except the one making the request.
#[utoipa::path(
    post,
    path = "/v1/auth/sessions/revoke-others",
    tag = "auth",
    responses(
        (status = 204, description = "Other sessions revoked"),
        (status = 401, description = "Missing, expired, or revoked session"),
    ),
    security(("session" = []))
)]
pub async fn revoke_other_sessions(
    headers: HeaderMap,
    Extension(pool): Extension<PgPool>,
) -> Response {
    let principal = match require_auth(&pool, &headers).await {
        Ok(principal) => principal,
        Err(response) => return *response,
    };

    match storage::revoke_other_sessions(&pool, principal.user_id, &principal.token_hash).await {
        Ok(_) => {
            let ip = extract_client_ip(&headers);
            let user_agent = extract_user_agent(&headers);
            crate::audit::record(
                &pool,
                AuditEvent {
                    actor: Some(principal.user_id),
                    action: "session.revoke_others",
                    resource: "session",
                    outcome: AuditOutcome::Success,
                    ip: ip.as_deref(),
                    user_agent: user_agent.as_deref(),
                },
            )
            .await;
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            error!("Failed to revoke other sessions: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{clear_session_cookie, extract_session_token, session_cookie};
    use axum::http::{HeaderMap, HeaderValue, header};

    #[test]
    fn extract_prefers_bearer_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-a"),
        );
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("atesti_session=token-b"),
        );
        assert_eq!(extract_session_token(&headers), Some("token-a".to_string()));
    }

    #[test]
    fn extract_finds_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; atesti_session=token-c; lang=en"),
        );
        assert_eq!(extract_session_token(&headers), Some("token-c".to_string()));
    }

    #[test]
    fn extract_none_when_absent() {
        assert_eq!(extract_session_token(&HeaderMap::new()), None);

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark"));
        assert_eq!(extract_session_token(&headers), None);
    }

    #[test]
    fn session_cookie_flags() {
        let cookie = session_cookie("tok", 3600, true);
        assert!(cookie.starts_with("atesti_session=tok;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Max-Age=3600"));
        assert!(cookie.ends_with("Secure"));

        let cookie = session_cookie("tok", 3600, false);
        assert!(!cookie.contains("Secure"));
    }

    #[test]
    fn clear_cookie_expires_immediately() {
        let cookie = clear_session_cookie(false);
        assert!(cookie.starts_with("atesti_session=;"));
        assert!(cookie.contains("Max-Age=0"));
    }
}
