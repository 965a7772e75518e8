//! Token endpoint: redeems authorization codes for signed tokens.

use std::sync::Arc;

use axum::Extension;
use axum::extract::Form;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use sqlx::PgPool;
use tracing::error;

use super::error::OAuthError;
use super::pkce;
use super::storage;
use super::types::{TokenRequest, TokenResponse};
use crate::api::handlers::auth::password::verify_password;
use crate::api::handlers::auth::rate_limit::{RateLimitAction, RateLimitDecision};
use crate::api::handlers::auth::state::AuthState;
use crate::api::handlers::auth::utils::{extract_client_ip, extract_user_agent, hash_token};
use crate::audit::{AuditEvent, AuditOutcome};
use crate::token::TokenSigner;

const ACCESS_TOKEN_TTL_SECONDS: i64 = 3600;
const ID_TOKEN_TTL_SECONDS: i64 = 3600;

/// Redeem an authorization code.
///
/// The code is consumed atomically before anything else is checked, so even a
/// request that fails later (bad verifier, wrong client) burns it. PKCE is
/// verified when a challenge was recorded; otherwise the client must present
/// its secret.
#[utoipa::path(
    post,
    path = "/oauth/token",
    tag = "oauth",
    request_body(content = TokenRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "Invalid grant, scope, or request"),
        (status = 401, description = "Client authentication failed"),
        (status = 429, description = "Too many requests"),
    )
)]
pub async fn token(
    headers: HeaderMap,
    Extension(pool): Extension<PgPool>,
    Extension(auth_state): Extension<Arc<AuthState>>,
    Extension(signer): Extension<Arc<TokenSigner>>,
    payload: Result<Form<TokenRequest>, axum::extract::rejection::FormRejection>,
) -> Response {
    let Ok(Form(payload)) = payload else {
        return OAuthError::InvalidRequest.into_response();
    };

    let ip = extract_client_ip(&headers);
    if auth_state
        .rate_limiter()
        .check_ip(ip.as_deref(), RateLimitAction::TokenExchange)
        == RateLimitDecision::Limited
    {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    if payload.grant_type != "authorization_code" {
        return OAuthError::UnsupportedGrantType.into_response();
    }

    let application = match storage::lookup_application(&pool, &payload.client_id).await {
        Ok(Some(application)) if application.enabled => application,
        Ok(_) => return OAuthError::InvalidClient.into_response(),
        Err(err) => {
            error!("Failed to lookup application: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let consumed = match storage::consume_authorization_code(&pool, &hash_token(&payload.code))
        .await
    {
        Ok(Some(consumed)) => consumed,
        Ok(None) => return OAuthError::InvalidGrant.into_response(),
        Err(err) => {
            error!("Failed to consume authorization code: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // The code is bound to the client and redirect URI it was issued for.
    if consumed.client_id != payload.client_id || consumed.redirect_uri != payload.redirect_uri {
        return OAuthError::InvalidGrant.into_response();
    }

    match consumed.code_challenge.as_deref() {
        Some(challenge) => {
            if consumed.code_challenge_method.as_deref() != Some(pkce::CODE_CHALLENGE_METHOD_S256)
            {
                return OAuthError::InvalidGrant.into_response();
            }
            let verified = payload
                .code_verifier
                .as_deref()
                .is_some_and(|verifier| pkce::verify_s256(verifier, challenge));
            if !verified {
                return OAuthError::InvalidGrant.into_response();
            }
        }
        None => {
            let authenticated = match (
                application.client_secret_hash.as_deref(),
                payload.client_secret.as_deref(),
            ) {
                (Some(stored), Some(presented)) => verify_password(presented, stored),
                _ => false,
            };
            if !authenticated {
                return OAuthError::InvalidClient.into_response();
            }
        }
    }

    let profile = match storage::lookup_user_profile(&pool, consumed.user_id).await {
        Ok(Some(profile)) => profile,
        Ok(None) => return OAuthError::InvalidGrant.into_response(),
        Err(err) => {
            error!("Failed to lookup user profile: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let access_token = match signer.sign_access_token(
        consumed.user_id,
        &consumed.client_id,
        &consumed.scope,
        ACCESS_TOKEN_TTL_SECONDS,
    ) {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to sign access token: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let id_token = if consumed.scope.split_whitespace().any(|scope| scope == "openid") {
        match signer.sign_id_token(
            consumed.user_id,
            &consumed.client_id,
            &consumed.scope,
            &profile,
            ID_TOKEN_TTL_SECONDS,
        ) {
            Ok(token) => Some(token),
            Err(err) => {
                error!("Failed to sign ID token: {err}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    } else {
        None
    };

    let user_agent = extract_user_agent(&headers);
    crate::audit::record(
        &pool,
        AuditEvent {
            actor: Some(consumed.user_id),
            action: "oauth.token",
            resource: &consumed.client_id,
            outcome: AuditOutcome::Success,
            ip: ip.as_deref(),
            user_agent: user_agent.as_deref(),
        },
    )
    .await;

    (
        StatusCode::OK,
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        axum::Json(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: ACCESS_TOKEN_TTL_SECONDS,
            scope: consumed.scope,
            id_token,
        }),
    )
        .into_response()
}
