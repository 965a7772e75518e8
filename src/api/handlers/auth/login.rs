//! Password login with lockout, device tracking, and MFA gating.
//!
//! Flow Overview
//!
//! 1. Normalize the identifier and look up the account.
//! 2. Locked accounts answer 423 with the minutes left; every other failure
//!    answers an identical 401 so responses never reveal whether the account
//!    exists.
//! 3. A wrong password counts toward lockout in a single atomic update.
//! 4. On success the failure counter resets, the device is recorded, and the
//!    session minted is either a full session or a short-lived MFA challenge
//!    depending on TOTP enrollment and device trust.

use std::sync::Arc;

use axum::Extension;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use sqlx::PgPool;
use tracing::error;

use crate::api::handlers::auth::devices::classify_user_agent;
use crate::api::handlers::auth::password::verify_password;
use crate::api::handlers::auth::rate_limit::{RateLimitAction, RateLimitDecision};
use crate::api::handlers::auth::session::session_cookie;
use crate::api::handlers::auth::session_kind::SessionKind;
use crate::api::handlers::auth::state::AuthState;
use crate::api::handlers::auth::storage::{self, DeviceSnapshot};
use crate::api::handlers::auth::types::{LockedResponse, LoginRequest, LoginResponse};
use crate::api::handlers::auth::utils::{
    extract_client_ip, extract_user_agent, fingerprint_device, normalize_identifier,
};
use crate::audit::{AuditEvent, AuditOutcome};

fn locked_response(locked_until: chrono::DateTime<Utc>) -> Response {
    let remaining = locked_until - Utc::now();
    // Round up so "under a minute left" still reads as 1.
    let minutes = (remaining.num_seconds() + 59) / 60;
    (
        StatusCode::LOCKED,
        axum::Json(LockedResponse {
            error: "account_locked".to_string(),
            retry_after_minutes: minutes.max(1),
        }),
    )
        .into_response()
}

/// Password login.
#[utoipa::path(
    post,
    path = "/v1/auth/login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Credentials accepted", body = LoginResponse),
        (status = 400, description = "Malformed request"),
        (status = 401, description = "Invalid credentials"),
        (status = 423, description = "Account locked", body = LockedResponse),
        (status = 429, description = "Too many requests"),
    )
)]
pub async fn login(
    headers: HeaderMap,
    Extension(pool): Extension<PgPool>,
    Extension(auth_state): Extension<Arc<AuthState>>,
    payload: Option<axum::Json<LoginRequest>>,
) -> Response {
    let Some(axum::Json(payload)) = payload else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let identifier = normalize_identifier(&payload.identifier);
    if identifier.is_empty() || payload.password.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);

    let limiter = auth_state.rate_limiter();
    if limiter.check_ip(ip.as_deref(), RateLimitAction::Login) == RateLimitDecision::Limited
        || limiter.check_identifier(&identifier, RateLimitAction::Login)
            == RateLimitDecision::Limited
    {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let audit_failure = |actor| AuditEvent {
        actor,
        action: "login.password",
        resource: "session",
        outcome: AuditOutcome::Failure,
        ip: ip.as_deref(),
        user_agent: user_agent.as_deref(),
    };

    let record = match storage::lookup_login_record(&pool, &identifier).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            crate::audit::record(&pool, audit_failure(None)).await;
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(err) => {
            error!("Failed to lookup account: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if let Some(locked_until) = record.locked_until {
        if locked_until > Utc::now() {
            crate::audit::record(&pool, audit_failure(Some(record.user_id))).await;
            return locked_response(locked_until);
        }
    }

    let password_ok = record
        .password_hash
        .as_deref()
        .is_some_and(|hash| verify_password(&payload.password, hash));

    if !password_ok {
        let locked_until = match storage::register_failed_login(&pool, record.user_id).await {
            Ok(locked_until) => locked_until,
            Err(err) => {
                error!("Failed to register failed login: {err}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        crate::audit::record(&pool, audit_failure(Some(record.user_id))).await;

        if let Some(locked_until) = locked_until {
            if locked_until > Utc::now() {
                return locked_response(locked_until);
            }
        }
        return StatusCode::UNAUTHORIZED.into_response();
    }

    if let Err(err) = storage::reset_failed_logins(&pool, record.user_id).await {
        error!("Failed to reset failed logins: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let (os, browser) = user_agent
        .as_deref()
        .map_or((None, None), classify_user_agent);

    // Device trust only comes from the explicit trust endpoint; a login can
    // refresh a device record but never promote it.
    let device_trusted = match user_agent.as_deref() {
        Some(ua) => {
            let fingerprint = fingerprint_device(ua);
            match storage::upsert_device(
                &pool,
                record.user_id,
                &fingerprint,
                None,
                os.as_deref(),
                browser.as_deref(),
                ip.as_deref(),
            )
            .await
            {
                Ok(device) => device.trusted,
                Err(err) => {
                    error!("Failed to record device: {err}");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            }
        }
        None => false,
    };

    let mfa_required = record.totp_enabled && !device_trusted;

    let config = auth_state.config();
    let (kind, ttl) = if mfa_required {
        (SessionKind::MfaChallenge, config.mfa_challenge_ttl_seconds())
    } else {
        (SessionKind::Full, config.session_ttl_seconds())
    };

    let snapshot = DeviceSnapshot {
        os,
        browser,
        ip: ip.clone(),
    };

    let token = match storage::insert_session(&pool, record.user_id, kind, ttl, &snapshot).await {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to create session: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    crate::audit::record(
        &pool,
        AuditEvent {
            actor: Some(record.user_id),
            action: "login.password",
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
            user_id: record.user_id.to_string(),
            username: record.username,
            mfa_required,
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::locked_response;
    use axum::http::StatusCode;
    use chrono::{Duration, Utc};

    #[test]
    fn locked_response_is_423() {
        let response = locked_response(Utc::now() + Duration::minutes(30));
        assert_eq!(response.status(), StatusCode::LOCKED);
    }

    #[test]
    fn locked_response_rounds_up_to_a_minute() {
        let response = locked_response(Utc::now() + Duration::seconds(10));
        assert_eq!(response.status(), StatusCode::LOCKED);
    }
}
