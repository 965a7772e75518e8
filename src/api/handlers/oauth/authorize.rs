//! Authorization endpoint and consent decision.
//!
//! Flow Overview
//!
//! 1. The frontend sends the authorization request here; the response is the
//!    consent screen data, not a redirect, so unknown clients and bad
//!    redirect URIs never bounce the browser anywhere.
//! 2. The consent decision comes back as a POST; both approval and denial
//!    answer with a 303 redirect to the validated redirect URI, carrying the
//!    client's `state` through untouched.
//!
//! Only `response_type=code` with S256 PKCE is spoken here. Public clients
//! must send a code challenge; confidential clients may.

use axum::Extension;
use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use sqlx::PgPool;
use tracing::error;
use url::Url;

use super::error::OAuthError;
use super::pkce::CODE_CHALLENGE_METHOD_S256;
use super::storage::{self, ApplicationRecord};
use super::types::{
    AuthorizeQuery, ConsentInfoResponse, ConsentRequest, ScopeInfo, describe_scope,
};
use crate::api::handlers::auth::principal::require_auth;
use crate::api::handlers::auth::utils::{extract_client_ip, extract_user_agent, hash_token};
use crate::api::handlers::auth::utils::generate_token;
use crate::audit::{AuditEvent, AuditOutcome};

fn split_scopes(scope: &str) -> Vec<&str> {
    scope.split_whitespace().collect()
}

/// Validate the authorization parameters against the client registration.
/// Nothing here redirects; a failure is reported to the caller directly.
fn validate_authorize(
    application: &ApplicationRecord,
    redirect_uri: &str,
    scope: &str,
    code_challenge: Option<&str>,
    code_challenge_method: Option<&str>,
) -> Result<(), OAuthError> {
    if !application.enabled {
        return Err(OAuthError::InvalidClient);
    }

    // Exact string match, no prefix or wildcard logic.
    if !application
        .redirect_uris
        .iter()
        .any(|registered| registered == redirect_uri)
    {
        return Err(OAuthError::InvalidRequest);
    }

    let scopes = split_scopes(scope);
    if scopes.is_empty()
        || !scopes
            .iter()
            .all(|scope| application.allowed_scopes.iter().any(|allowed| allowed == scope))
    {
        return Err(OAuthError::InvalidScope);
    }

    match (code_challenge, code_challenge_method) {
        (Some(challenge), Some(CODE_CHALLENGE_METHOD_S256)) if !challenge.is_empty() => Ok(()),
        (None, None) if !application.is_public() => Ok(()),
        _ => Err(OAuthError::InvalidRequest),
    }
}

/// Authorization request: returns what the consent screen should show.
#[utoipa::path(
    get,
    path = "/oauth/authorize",
    tag = "oauth",
    params(AuthorizeQuery),
    responses(
        (status = 200, description = "Consent screen data", body = ConsentInfoResponse),
        (status = 400, description = "Invalid request or scope"),
        (status = 401, description = "Not authenticated or unknown client"),
    ),
    security(("session" = []))
)]
pub async fn authorize(
    headers: HeaderMap,
    Extension(pool): Extension<PgPool>,
    query: Result<Query<AuthorizeQuery>, axum::extract::rejection::QueryRejection>,
) -> Response {
    if let Err(response) = require_auth(&pool, &headers).await {
        return *response;
    }

    let Ok(Query(query)) = query else {
        return OAuthError::InvalidRequest.into_response();
    };

    if query.response_type != "code" {
        return OAuthError::InvalidRequest.into_response();
    }

    let application = match storage::lookup_application(&pool, &query.client_id).await {
        Ok(Some(application)) => application,
        Ok(None) => return OAuthError::InvalidClient.into_response(),
        Err(err) => {
            error!("Failed to lookup application: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if let Err(error) = validate_authorize(
        &application,
        &query.redirect_uri,
        &query.scope,
        query.code_challenge.as_deref(),
        query.code_challenge_method.as_deref(),
    ) {
        return error.into_response();
    }

    axum::Json(ConsentInfoResponse {
        client_name: application.name,
        client_description: application.description,
        logo_url: application.logo_url,
        scopes: split_scopes(&query.scope)
            .into_iter()
            .map(|scope| ScopeInfo {
                name: scope.to_string(),
                description: describe_scope(scope),
            })
            .collect(),
    })
    .into_response()
}

fn redirect_to(url: Url) -> Response {
    (
        StatusCode::SEE_OTHER,
        [(header::LOCATION, url.to_string())],
    )
        .into_response()
}

/// Consent decision: mints the authorization code or reports denial, always
/// by redirecting back to the client.
#[utoipa::path(
    post,
    path = "/oauth/consent",
    tag = "oauth",
    request_body = ConsentRequest,
    responses(
        (status = 303, description = "Redirect back to the client"),
        (status = 400, description = "Invalid request or scope"),
        (status = 401, description = "Not authenticated or unknown client"),
    ),
    security(("session" = []))
)]
pub async fn consent(
    headers: HeaderMap,
    Extension(pool): Extension<PgPool>,
    payload: Option<axum::Json<ConsentRequest>>,
) -> Response {
    let principal = match require_auth(&pool, &headers).await {
        Ok(principal) => principal,
        Err(response) => return *response,
    };

    let Some(axum::Json(payload)) = payload else {
        return OAuthError::InvalidRequest.into_response();
    };

    let application = match storage::lookup_application(&pool, &payload.client_id).await {
        Ok(Some(application)) => application,
        Ok(None) => return OAuthError::InvalidClient.into_response(),
        Err(err) => {
            error!("Failed to lookup application: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // Re-validated here: the decision must stand on its own, not trust the
    // earlier GET.
    if let Err(error) = validate_authorize(
        &application,
        &payload.redirect_uri,
        &payload.scope,
        payload.code_challenge.as_deref(),
        payload.code_challenge_method.as_deref(),
    ) {
        return error.into_response();
    }

    let Ok(mut url) = Url::parse(&payload.redirect_uri) else {
        return OAuthError::InvalidRequest.into_response();
    };

    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);

    if !payload.approved {
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("error", OAuthError::AccessDenied.code());
            if let Some(state) = payload.state.as_deref() {
                pairs.append_pair("state", state);
            }
        }
        crate::audit::record(
            &pool,
            AuditEvent {
                actor: Some(principal.user_id),
                action: "oauth.consent",
                resource: &payload.client_id,
                outcome: AuditOutcome::Failure,
                ip: ip.as_deref(),
                user_agent: user_agent.as_deref(),
            },
        )
        .await;
        return redirect_to(url);
    }

    let code = match generate_token() {
        Ok(code) => code,
        Err(err) => {
            error!("Failed to generate authorization code: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if let Err(err) = storage::insert_authorization_code(
        &pool,
        &hash_token(&code),
        &payload.client_id,
        principal.user_id,
        &payload.redirect_uri,
        &payload.scope,
        payload.code_challenge.as_deref(),
        payload.code_challenge_method.as_deref(),
    )
    .await
    {
        error!("Failed to store authorization code: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("code", &code);
        if let Some(state) = payload.state.as_deref() {
            pairs.append_pair("state", state);
        }
    }

    crate::audit::record(
        &pool,
        AuditEvent {
            actor: Some(principal.user_id),
            action: "oauth.consent",
            resource: &payload.client_id,
            outcome: AuditOutcome::Success,
            ip: ip.as_deref(),
            user_agent: user_agent.as_deref(),
        },
    )
    .await;

    redirect_to(url)
}
