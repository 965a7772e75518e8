//! Passkey registration and discoverable login endpoints.
//!
//! Flow Overview
//!
//! Registration (authenticated):
//! 1. `register/start` creates a ceremony for the caller, excluding already
//!    registered credentials, and returns the creation options.
//! 2. `register/finish` verifies the attestation and stores the credential.
//!
//! Login (anonymous, discoverable):
//! 1. `login/start` creates a ceremony keyed by a random nonce and sets the
//!    nonce in a short-lived HttpOnly cookie.
//! 2. `login/finish` consumes the nonce and ceremony state, verifies the
//!    assertion, enforces the sign-count check, and mints a full session. The
//!    challenge cookie is cleared whether or not the assertion verifies.

use std::sync::Arc;

use axum::Extension;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use sqlx::PgPool;
use tracing::{error, warn};
use webauthn_rs::prelude::{
    CredentialID, DiscoverableKey, PublicKeyCredential, RegisterPublicKeyCredential,
};

use crate::api::handlers::auth::devices::classify_user_agent;
use crate::api::handlers::auth::principal::require_auth;
use crate::api::handlers::auth::rate_limit::{RateLimitAction, RateLimitDecision};
use crate::api::handlers::auth::session::session_cookie;
use crate::api::handlers::auth::session_kind::SessionKind;
use crate::api::handlers::auth::state::AuthState;
use crate::api::handlers::auth::storage::{self, DeviceSnapshot};
use crate::api::handlers::auth::types::{
    LoginResponse, PasskeyChallengeResponse, PasskeyFinishRequest, PasskeyRegisterStartRequest,
};
use crate::api::handlers::auth::utils::{extract_client_ip, extract_user_agent};
use crate::audit::{AuditEvent, AuditOutcome};
use crate::webauthn::repo::{self, CounterCheck};
use crate::webauthn::service::{PasskeyService, deserialize_passkey, serialize_passkey};

const CHALLENGE_COOKIE_NAME: &str = "atesti_passkey_challenge";
const CHALLENGE_COOKIE_MAX_AGE_SECONDS: i64 = 300;

fn challenge_cookie(nonce: &str, max_age_seconds: i64, secure: bool) -> String {
    let mut cookie = format!(
        "{CHALLENGE_COOKIE_NAME}={nonce}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_seconds}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn read_challenge_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|cookie| {
                cookie
                    .trim()
                    .strip_prefix(CHALLENGE_COOKIE_NAME)
                    .and_then(|rest| rest.strip_prefix('='))
            })
        })
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn stored_sign_count(passkey_data: &serde_json::Value) -> i64 {
    passkey_data
        .pointer("/cred/counter")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0)
}

fn stored_backup_eligible(passkey_data: &serde_json::Value) -> bool {
    passkey_data
        .pointer("/cred/backup_eligible")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

/// Start a passkey registration ceremony for the caller.
#[utoipa::path(
    post,
    path = "/v1/auth/passkeys/register/start",
    tag = "passkeys",
    request_body = PasskeyRegisterStartRequest,
    responses(
        (status = 200, description = "Creation options", body = PasskeyChallengeResponse),
        (status = 401, description = "Missing, expired, or revoked session"),
    ),
    security(("session" = []))
)]
pub async fn register_start(
    headers: HeaderMap,
    Extension(pool): Extension<PgPool>,
    Extension(passkeys): Extension<Arc<PasskeyService>>,
    payload: Option<axum::Json<PasskeyRegisterStartRequest>>,
) -> Response {
    let principal = match require_auth(&pool, &headers).await {
        Ok(principal) => principal,
        Err(response) => return *response,
    };

    let label = payload.and_then(|axum::Json(payload)| payload.label);

    // Exclude registered credentials so the browser offers a new authenticator.
    let existing = match repo::list_user_credentials(&pool, principal.user_id).await {
        Ok(credentials) => credentials,
        Err(err) => {
            error!("Failed to list passkey credentials: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let exclude: Vec<CredentialID> = existing
        .iter()
        .map(|credential| CredentialID::from(credential.credential_id.clone()))
        .collect();
    let exclude = if exclude.is_empty() {
        None
    } else {
        Some(exclude)
    };

    let challenge = match passkeys.register_begin(
        principal.user_id,
        &principal.username,
        &principal.username,
        exclude,
        label,
    ) {
        Ok(challenge) => challenge,
        Err(err) => {
            error!("Failed to start passkey registration: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let challenge = match serde_json::to_value(&challenge) {
        Ok(value) => value,
        Err(err) => {
            error!("Failed to serialize creation options: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    axum::Json(PasskeyChallengeResponse { challenge }).into_response()
}

/// Verify the attestation and store the new credential.
#[utoipa::path(
    post,
    path = "/v1/auth/passkeys/register/finish",
    tag = "passkeys",
    request_body = PasskeyFinishRequest,
    responses(
        (status = 201, description = "Credential stored"),
        (status = 400, description = "Malformed attestation or no pending ceremony"),
        (status = 401, description = "Missing, expired, or revoked session"),
    ),
    security(("session" = []))
)]
pub async fn register_finish(
    headers: HeaderMap,
    Extension(pool): Extension<PgPool>,
    Extension(passkeys): Extension<Arc<PasskeyService>>,
    payload: Option<axum::Json<PasskeyFinishRequest>>,
) -> Response {
    let principal = match require_auth(&pool, &headers).await {
        Ok(principal) => principal,
        Err(response) => return *response,
    };

    let Some(axum::Json(payload)) = payload else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let Ok(response) =
        serde_json::from_value::<RegisterPublicKeyCredential>(payload.response)
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let Some((state, label)) = passkeys.take_registration(principal.user_id) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);

    let passkey = match passkeys.register_finish(&response, &state) {
        Ok(passkey) => passkey,
        Err(err) => {
            error!("Passkey attestation failed: {err}");
            crate::audit::record(
                &pool,
                AuditEvent {
                    actor: Some(principal.user_id),
                    action: "passkey.register",
                    resource: "passkey",
                    outcome: AuditOutcome::Failure,
                    ip: ip.as_deref(),
                    user_agent: user_agent.as_deref(),
                },
            )
            .await;
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let passkey_data = match serialize_passkey(&passkey) {
        Ok(value) => value,
        Err(err) => {
            error!("Failed to serialize passkey: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let credential_id = passkey.cred_id().as_ref().to_vec();
    if let Err(err) = repo::create_credential(
        &pool,
        principal.user_id,
        &credential_id,
        label.as_deref(),
        &passkey_data,
        stored_sign_count(&passkey_data),
        stored_backup_eligible(&passkey_data),
    )
    .await
    {
        error!("Failed to store passkey credential: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    crate::audit::record(
        &pool,
        AuditEvent {
            actor: Some(principal.user_id),
            action: "passkey.register",
            resource: "passkey",
            outcome: AuditOutcome::Success,
            ip: ip.as_deref(),
            user_agent: user_agent.as_deref(),
        },
    )
    .await;

    StatusCode::CREATED.into_response()
}

/// Start an anonymous discoverable login ceremony.
#[utoipa::path(
    post,
    path = "/v1/auth/passkeys/login/start",
    tag = "passkeys",
    responses(
        (status = 200, description = "Request options", body = PasskeyChallengeResponse),
        (status = 429, description = "Too many requests"),
    )
)]
pub async fn login_start(
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
    Extension(passkeys): Extension<Arc<PasskeyService>>,
) -> Response {
    let ip = extract_client_ip(&headers);
    if auth_state
        .rate_limiter()
        .check_ip(ip.as_deref(), RateLimitAction::PasskeyLogin)
        == RateLimitDecision::Limited
    {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let (challenge, nonce) = match passkeys.auth_begin() {
        Ok(pair) => pair,
        Err(err) => {
            error!("Failed to start passkey authentication: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let challenge = match serde_json::to_value(&challenge) {
        Ok(value) => value,
        Err(err) => {
            error!("Failed to serialize request options: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let cookie = challenge_cookie(
        &nonce,
        CHALLENGE_COOKIE_MAX_AGE_SECONDS,
        auth_state.config().session_cookie_secure(),
    );
    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        axum::Json(PasskeyChallengeResponse { challenge }),
    )
        .into_response()
}

/// Verify a discoverable assertion and mint a full session.
#[utoipa::path(
    post,
    path = "/v1/auth/passkeys/login/finish",
    tag = "passkeys",
    request_body = PasskeyFinishRequest,
    responses(
        (status = 200, description = "Assertion accepted", body = LoginResponse),
        (status = 400, description = "Malformed assertion"),
        (status = 401, description = "Assertion rejected"),
    )
)]
pub async fn login_finish(
    headers: HeaderMap,
    Extension(pool): Extension<PgPool>,
    Extension(auth_state): Extension<Arc<AuthState>>,
    Extension(passkeys): Extension<Arc<PasskeyService>>,
    payload: Option<axum::Json<PasskeyFinishRequest>>,
) -> Response {
    let secure = auth_state.config().session_cookie_secure();
    // Cleared on every path: the nonce is spent as soon as it is presented.
    let clear_cookie = challenge_cookie("", 0, secure);
    let reject = |status: StatusCode| {
        (status, [(header::SET_COOKIE, clear_cookie.clone())]).into_response()
    };

    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);

    if auth_state
        .rate_limiter()
        .check_ip(ip.as_deref(), RateLimitAction::PasskeyLogin)
        == RateLimitDecision::Limited
    {
        return reject(StatusCode::TOO_MANY_REQUESTS);
    }

    let Some(axum::Json(payload)) = payload else {
        return reject(StatusCode::BAD_REQUEST);
    };

    let Ok(response) = serde_json::from_value::<PublicKeyCredential>(payload.response) else {
        return reject(StatusCode::BAD_REQUEST);
    };

    let Some(nonce) = read_challenge_cookie(&headers) else {
        return reject(StatusCode::UNAUTHORIZED);
    };

    let Some(state) = passkeys.take_authentication(&nonce) else {
        return reject(StatusCode::UNAUTHORIZED);
    };

    let audit_failure = |actor, action| AuditEvent {
        actor,
        action,
        resource: "passkey",
        outcome: AuditOutcome::Failure,
        ip: ip.as_deref(),
        user_agent: user_agent.as_deref(),
    };

    let (claimed_user_id, credential_id) = match passkeys.identify(&response) {
        Ok(identity) => identity,
        Err(err) => {
            error!("Failed to identify passkey assertion: {err}");
            crate::audit::record(&pool, audit_failure(None, "login.passkey")).await;
            return reject(StatusCode::UNAUTHORIZED);
        }
    };

    let credential = match repo::find_by_credential_id(&pool, &credential_id).await {
        Ok(Some(credential)) if credential.user_id == claimed_user_id => credential,
        Ok(_) => {
            crate::audit::record(&pool, audit_failure(None, "login.passkey")).await;
            return reject(StatusCode::UNAUTHORIZED);
        }
        Err(err) => {
            error!("Failed to load passkey credential: {err}");
            return reject(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let mut passkey = match deserialize_passkey(&credential.passkey_data) {
        Ok(passkey) => passkey,
        Err(err) => {
            error!("Stored passkey is unreadable: {err}");
            return reject(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let keys = [DiscoverableKey::from(&passkey)];
    let result = match passkeys.auth_finish(&response, state, &keys) {
        Ok(result) => result,
        Err(err) => {
            error!("Passkey assertion failed: {err}");
            crate::audit::record(
                &pool,
                audit_failure(Some(claimed_user_id), "login.passkey"),
            )
            .await;
            return reject(StatusCode::UNAUTHORIZED);
        }
    };

    // Strictly-greater counter check. A stuck counter on a cloned
    // authenticator fails here even though the signature verified.
    match repo::update_counter_checked(&pool, &credential_id, i64::from(result.counter())).await {
        Ok(CounterCheck::Updated) => {
            if result.counter() == 0 {
                // A zero counter carries no clone signal; keep these
                // assertions visible in the logs.
                warn!(
                    user_id = %claimed_user_id,
                    "Passkey assertion accepted without a sign counter"
                );
            }
        }
        Ok(CounterCheck::Replay) => {
            crate::audit::record(
                &pool,
                audit_failure(Some(claimed_user_id), "passkey.counter_replay"),
            )
            .await;
            return reject(StatusCode::UNAUTHORIZED);
        }
        Err(err) => {
            error!("Failed to check sign count: {err}");
            return reject(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    if result.needs_update() && passkey.update_credential(&result).is_some() {
        match serialize_passkey(&passkey) {
            Ok(passkey_data) => {
                if let Err(err) =
                    repo::update_credential_data(&pool, &credential_id, &passkey_data).await
                {
                    error!("Failed to persist passkey update: {err}");
                }
            }
            Err(err) => error!("Failed to serialize passkey update: {err}"),
        }
    }

    let username = match storage::lookup_username(&pool, claimed_user_id).await {
        Ok(Some(username)) => username,
        Ok(None) => {
            crate::audit::record(
                &pool,
                audit_failure(Some(claimed_user_id), "login.passkey"),
            )
            .await;
            return reject(StatusCode::UNAUTHORIZED);
        }
        Err(err) => {
            error!("Failed to load account: {err}");
            return reject(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

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
        claimed_user_id,
        SessionKind::Full,
        ttl,
        &snapshot,
    )
    .await
    {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to create session: {err}");
            return reject(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    crate::audit::record(
        &pool,
        AuditEvent {
            actor: Some(claimed_user_id),
            action: "login.passkey",
            resource: "session",
            outcome: AuditOutcome::Success,
            ip: ip.as_deref(),
            user_agent: user_agent.as_deref(),
        },
    )
    .await;

    let session = session_cookie(&token, ttl, secure);
    (
        StatusCode::OK,
        axum::response::AppendHeaders([
            (header::SET_COOKIE, clear_cookie),
            (header::SET_COOKIE, session),
            (header::AUTHORIZATION, format!("Bearer {token}")),
        ]),
        axum::Json(LoginResponse {
            user_id: claimed_user_id.to_string(),
            username,
            mfa_required: false,
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::{challenge_cookie, read_challenge_cookie, stored_backup_eligible, stored_sign_count};
    use axum::http::{HeaderMap, HeaderValue, header};

    #[test]
    fn challenge_cookie_flags() {
        let cookie = challenge_cookie("nonce", 300, true);
        assert!(cookie.starts_with("atesti_passkey_challenge=nonce;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Max-Age=300"));
        assert!(cookie.ends_with("Secure"));
    }

    #[test]
    fn reads_challenge_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("atesti_session=tok; atesti_passkey_challenge=abc"),
        );
        assert_eq!(read_challenge_cookie(&headers), Some("abc".to_string()));
    }

    #[test]
    fn missing_challenge_cookie_is_none() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("atesti_session=tok"),
        );
        assert_eq!(read_challenge_cookie(&headers), None);
    }

    #[test]
    fn sign_count_and_backup_flag_from_stored_data() {
        let data = serde_json::json!({
            "cred": { "counter": 7, "backup_eligible": true }
        });
        assert_eq!(stored_sign_count(&data), 7);
        assert!(stored_backup_eligible(&data));

        let empty = serde_json::json!({});
        assert_eq!(stored_sign_count(&empty), 0);
        assert!(!stored_backup_eligible(&empty));
    }
}
