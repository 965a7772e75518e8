//! TOTP enrollment and second-factor verification endpoints.
//!
//! Flow Overview
//!
//! 1. `setup` stages a secret and returns the provisioning URI; nothing is
//!    enforced yet.
//! 2. `enable` proves possession with a current code, flips enforcement on,
//!    and hands out the one-time backup code batch.
//! 3. `verify` upgrades an MFA challenge session to a full session with either
//!    a TOTP code or an unused backup code.
//! 4. `disable` requires the account password and drops secret and backup
//!    codes together.

use std::sync::Arc;

use axum::Extension;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use sqlx::PgPool;
use tracing::error;

use crate::api::handlers::auth::backup_codes::{self, BackupCodeBatch};
use crate::api::handlers::auth::devices::classify_user_agent;
use crate::api::handlers::auth::password::verify_password;
use crate::api::handlers::auth::principal::{Principal, require_auth, require_mfa_challenge};
use crate::api::handlers::auth::rate_limit::{RateLimitAction, RateLimitDecision};
use crate::api::handlers::auth::session::session_cookie;
use crate::api::handlers::auth::session_kind::SessionKind;
use crate::api::handlers::auth::state::AuthState;
use crate::api::handlers::auth::storage::{self, DeviceSnapshot};
use crate::api::handlers::auth::types::{
    LoginResponse, MfaVerifyRequest, TotpDisableRequest, TotpEnableRequest, TotpEnableResponse,
    TotpSetupResponse,
};
use crate::api::handlers::auth::utils::{extract_client_ip, extract_user_agent};
use crate::audit::{AuditEvent, AuditOutcome};
use crate::totp::{TotpService, repo};

fn totp_account(principal: &Principal) -> String {
    principal
        .email
        .clone()
        .unwrap_or_else(|| principal.username.clone())
}

/// Stage a new TOTP secret for the caller.
///
/// The secret is returned once, with its `otpauth://` URI, for the
/// authenticator app. Enforcement only starts after `enable`.
#[utoipa::path(
    post,
    path = "/v1/auth/totp/setup",
    tag = "mfa",
    responses(
        (status = 200, description = "Secret staged", body = TotpSetupResponse),
        (status = 401, description = "Missing, expired, or revoked session"),
        (status = 409, description = "TOTP already enabled"),
    ),
    security(("session" = []))
)]
pub async fn totp_setup(
    headers: HeaderMap,
    Extension(pool): Extension<PgPool>,
    Extension(totp): Extension<TotpService>,
) -> Response {
    let principal = match require_auth(&pool, &headers).await {
        Ok(principal) => principal,
        Err(response) => return *response,
    };

    match repo::get_totp_state(&pool, principal.user_id).await {
        Ok(Some(state)) if state.enabled => return StatusCode::CONFLICT.into_response(),
        Ok(_) => {}
        Err(err) => {
            error!("Failed to read TOTP state: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let secret = totp.generate_secret();
    let otpauth_url = match totp.otpauth_url(&secret, &totp_account(&principal)) {
        Ok(url) => url,
        Err(err) => {
            error!("Failed to build otpauth URL: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if let Err(err) = repo::set_pending_secret(&pool, principal.user_id, &secret).await {
        error!("Failed to stage TOTP secret: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    axum::Json(TotpSetupResponse {
        secret,
        otpauth_url,
    })
    .into_response()
}

/// Turn TOTP enforcement on after proving possession of the secret.
///
/// Returns the backup code batch exactly once; only hashes are kept.
#[utoipa::path(
    post,
    path = "/v1/auth/totp/enable",
    tag = "mfa",
    request_body = TotpEnableRequest,
    responses(
        (status = 200, description = "TOTP enabled", body = TotpEnableResponse),
        (status = 400, description = "No staged secret or malformed request"),
        (status = 401, description = "Invalid code or session"),
        (status = 409, description = "TOTP already enabled"),
    ),
    security(("session" = []))
)]
pub async fn totp_enable(
    headers: HeaderMap,
    Extension(pool): Extension<PgPool>,
    Extension(totp): Extension<TotpService>,
    payload: Option<axum::Json<TotpEnableRequest>>,
) -> Response {
    let principal = match require_auth(&pool, &headers).await {
        Ok(principal) => principal,
        Err(response) => return *response,
    };

    let Some(axum::Json(payload)) = payload else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let state = match repo::get_totp_state(&pool, principal.user_id).await {
        Ok(Some(state)) => state,
        Ok(None) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(err) => {
            error!("Failed to read TOTP state: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if state.enabled {
        return StatusCode::CONFLICT.into_response();
    }

    let Some(secret) = state.secret else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    if !totp.verify(&secret, &totp_account(&principal), &payload.code) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    if let Err(err) = repo::enable_totp(&pool, principal.user_id).await {
        error!("Failed to enable TOTP: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let batch = match BackupCodeBatch::generate() {
        Ok(batch) => batch,
        Err(err) => {
            error!("Failed to generate backup codes: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if let Err(err) =
        repo::replace_backup_codes(&pool, principal.user_id, batch.batch_id, &batch.code_hashes)
            .await
    {
        error!("Failed to store backup codes: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    crate::audit::record(
        &pool,
        AuditEvent {
            actor: Some(principal.user_id),
            action: "totp.enable",
            resource: "totp",
            outcome: AuditOutcome::Success,
            ip: ip.as_deref(),
            user_agent: user_agent.as_deref(),
        },
    )
    .await;

    axum::Json(TotpEnableResponse {
        backup_codes: batch.codes,
    })
    .into_response()
}

/// Turn TOTP off. Requires the account password, not just a session.
#[utoipa::path(
    post,
    path = "/v1/auth/totp/disable",
    tag = "mfa",
    request_body = TotpDisableRequest,
    responses(
        (status = 204, description = "TOTP disabled"),
        (status = 400, description = "Malformed request"),
        (status = 401, description = "Invalid password or session"),
    ),
    security(("session" = []))
)]
pub async fn totp_disable(
    headers: HeaderMap,
    Extension(pool): Extension<PgPool>,
    payload: Option<axum::Json<TotpDisableRequest>>,
) -> Response {
    let principal = match require_auth(&pool, &headers).await {
        Ok(principal) => principal,
        Err(response) => return *response,
    };

    let Some(axum::Json(payload)) = payload else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let password_ok = match storage::lookup_password_hash(&pool, principal.user_id).await {
        Ok(hash) => hash
            .as_deref()
            .is_some_and(|hash| verify_password(&payload.password, hash)),
        Err(err) => {
            error!("Failed to lookup password hash: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);

    if !password_ok {
        crate::audit::record(
            &pool,
            AuditEvent {
                actor: Some(principal.user_id),
                action: "totp.disable",
                resource: "totp",
                outcome: AuditOutcome::Failure,
                ip: ip.as_deref(),
                user_agent: user_agent.as_deref(),
            },
        )
        .await;
        return StatusCode::UNAUTHORIZED.into_response();
    }

    if let Err(err) = repo::disable_totp(&pool, principal.user_id).await {
        error!("Failed to disable TOTP: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    crate::audit::record(
        &pool,
        AuditEvent {
            actor: Some(principal.user_id),
            action: "totp.disable",
            resource: "totp",
            outcome: AuditOutcome::Success,
            ip: ip.as_deref(),
            user_agent: user_agent.as_deref(),
        },
    )
    .await;

    StatusCode::NO_CONTENT.into_response()
}

/// Try an unused backup code, burning it on success.
async fn try_backup_code(pool: &PgPool, user_id: uuid::Uuid, code: &str) -> Result<bool, ()> {
    if backup_codes::normalize_backup_code(code).is_err() {
        return Ok(false);
    }

    let candidates = match repo::list_unused_backup_codes(pool, user_id).await {
        Ok(candidates) => candidates,
        Err(err) => {
            error!("Failed to list backup codes: {err}");
            return Err(());
        }
    };

    for (code_id, code_hash) in candidates {
        if backup_codes::verify_backup_code(code, &code_hash).unwrap_or(false) {
            // The used_at guard wins the race if two requests present the
            // same code.
            return match repo::consume_backup_code(pool, code_id).await {
                Ok(consumed) => Ok(consumed),
                Err(err) => {
                    error!("Failed to consume backup code: {err}");
                    Err(())
                }
            };
        }
    }

    Ok(false)
}

/// Upgrade an MFA challenge session by presenting the second factor.
#[utoipa::path(
    post,
    path = "/v1/auth/mfa/verify",
    tag = "mfa",
    request_body = MfaVerifyRequest,
    responses(
        (status = 200, description = "Second factor accepted", body = LoginResponse),
        (status = 400, description = "Malformed request"),
        (status = 401, description = "Invalid code or challenge"),
        (status = 429, description = "Too many requests"),
    ),
    security(("session" = []))
)]
pub async fn mfa_verify(
    headers: HeaderMap,
    Extension(pool): Extension<PgPool>,
    Extension(auth_state): Extension<Arc<AuthState>>,
    Extension(totp): Extension<TotpService>,
    payload: Option<axum::Json<MfaVerifyRequest>>,
) -> Response {
    let principal = match require_mfa_challenge(&pool, &headers).await {
        Ok(principal) => principal,
        Err(response) => return *response,
    };

    let Some(axum::Json(payload)) = payload else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);

    if auth_state
        .rate_limiter()
        .check_ip(ip.as_deref(), RateLimitAction::MfaVerify)
        == RateLimitDecision::Limited
    {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let state = match repo::get_totp_state(&pool, principal.user_id).await {
        Ok(Some(state)) if state.enabled => state,
        Ok(_) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(err) => {
            error!("Failed to read TOTP state: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let totp_ok = state
        .secret
        .as_deref()
        .is_some_and(|secret| totp.verify(secret, &totp_account(&principal), &payload.code));

    let factor_ok = if totp_ok {
        true
    } else {
        match try_backup_code(&pool, principal.user_id, &payload.code).await {
            Ok(consumed) => consumed,
            Err(()) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    };

    if !factor_ok {
        crate::audit::record(
            &pool,
            AuditEvent {
                actor: Some(principal.user_id),
                action: "mfa.verify",
                resource: "session",
                outcome: AuditOutcome::Failure,
                ip: ip.as_deref(),
                user_agent: user_agent.as_deref(),
            },
        )
        .await;
        return StatusCode::UNAUTHORIZED.into_response();
    }

    // The challenge token is spent; drop it before minting the full session.
    if let Err(err) = storage::revoke_mfa_challenge_sessions(&pool, principal.user_id).await {
        error!("Failed to revoke challenge sessions: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let (os, browser) = user_agent
        .as_deref()
        .map_or((None, None), classify_user_agent);
    let snapshot = DeviceSnapshot {
        os,
        browser,
        ip: ip.clone(),
    };

    let config = auth_state.config();
    let ttl = config.session_ttl_seconds();
    let token = match storage::insert_session(
        &pool,
        principal.user_id,
        SessionKind::Full,
        ttl,
        &snapshot,
    )
    .await
    {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to create session: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    crate::audit::record(
        &pool,
        AuditEvent {
            actor: Some(principal.user_id),
            action: "mfa.verify",
            resource: "session",
            outcome: AuditOutcome::Success,
            ip: ip.as_deref(),
            user_agent: user_agent.as_deref(),
        },
    )
    .await;

    let cookie = session_cookie(&token, ttl, config.session_cookie_secure());
    (
        StatusCode::OK,
        [
            (header::SET_COOKIE, cookie),
            (header::AUTHORIZATION, format!("Bearer {token}")),
        ],
        axum::Json(LoginResponse {
            user_id: principal.user_id.to_string(),
            username: principal.username,
            mfa_required: false,
        }),
    )
        .into_response()
}
