//! Device tracking and trust endpoints.
//!
//! Devices are keyed by a fingerprint of the client signature. They start out
//! untrusted; only the explicit trust endpoint promotes one, and that action
//! is audited. A trusted device skips the TOTP challenge at login.

use axum::Extension;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

use crate::api::handlers::auth::principal::require_auth;
use crate::api::handlers::auth::storage;
use crate::api::handlers::auth::types::{DeviceListResponse, DeviceResponse};
use crate::api::handlers::auth::utils::{extract_client_ip, extract_user_agent};
use crate::audit::{AuditEvent, AuditOutcome};

/// Best-effort OS and browser names out of a user agent string.
pub(crate) fn classify_user_agent(user_agent: &str) -> (Option<String>, Option<String>) {
    let ua = user_agent.to_lowercase();

    let os = if ua.contains("windows") {
        Some("Windows")
    } else if ua.contains("android") {
        Some("Android")
    } else if ua.contains("iphone") || ua.contains("ipad") {
        Some("iOS")
    } else if ua.contains("mac os") || ua.contains("macintosh") {
        Some("macOS")
    } else if ua.contains("linux") {
        Some("Linux")
    } else {
        None
    };

    // Order matters: Chrome ships "safari" in its UA, Edge ships "chrome".
    let browser = if ua.contains("edg/") {
        Some("Edge")
    } else if ua.contains("firefox") {
        Some("Firefox")
    } else if ua.contains("chrome") || ua.contains("chromium") {
        Some("Chrome")
    } else if ua.contains("safari") {
        Some("Safari")
    } else if ua.contains("curl") {
        Some("curl")
    } else {
        None
    };

    (
        os.map(str::to_string),
        browser.map(str::to_string),
    )
}

fn device_response(record: storage::DeviceRecord) -> DeviceResponse {
    DeviceResponse {
        id: record.id.to_string(),
        name: record.name,
        os: record.os,
        browser: record.browser,
        ip: record.ip,
        trusted: record.trusted,
        last_seen_at: record.last_seen_at.map(|at| at.to_rfc3339()),
    }
}

/// List the caller's known devices.
#[utoipa::path(
    get,
    path = "/v1/auth/devices",
    tag = "auth",
    responses(
        (status = 200, description = "Known devices", body = DeviceListResponse),
        (status = 401, description = "Missing, expired, or revoked session"),
    ),
    security(("session" = []))
)]
pub async fn list_devices(headers: HeaderMap, Extension(pool): Extension<PgPool>) -> Response {
    let principal = match require_auth(&pool, &headers).await {
        Ok(principal) => principal,
        Err(response) => return *response,
    };

    match storage::list_devices(&pool, principal.user_id).await {
        Ok(records) => axum::Json(DeviceListResponse {
            devices: records.into_iter().map(device_response).collect(),
        })
        .into_response(),
        Err(err) => {
            error!("Failed to list devices: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Mark one of the caller's devices as trusted.
#[utoipa::path(
    post,
    path = "/v1/auth/devices/{id}/trust",
    tag = "auth",
    params(("id" = String, Path, description = "Device id")),
    responses(
        (status = 204, description = "Device trusted"),
        (status = 400, description = "Malformed device id"),
        (status = 401, description = "Missing, expired, or revoked session"),
        (status = 404, description = "No such device for this user"),
    ),
    security(("session" = []))
)]
pub async fn trust_device(
    headers: HeaderMap,
    Path(id): Path<String>,
    Extension(pool): Extension<PgPool>,
) -> Response {
    let principal = match require_auth(&pool, &headers).await {
        Ok(principal) => principal,
        Err(response) => return *response,
    };

    let Ok(device_id) = Uuid::parse_str(&id) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match storage::set_device_trusted(&pool, principal.user_id, device_id).await {
        Ok(true) => {
            let ip = extract_client_ip(&headers);
            let user_agent = extract_user_agent(&headers);
            crate::audit::record(
                &pool,
                AuditEvent {
                    actor: Some(principal.user_id),
                    action: "device.trust",
                    resource: "device",
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
            error!("Failed to trust device: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Forget one of the caller's devices. Its trust goes with it.
#[utoipa::path(
    delete,
    path = "/v1/auth/devices/{id}",
    tag = "auth",
    params(("id" = String, Path, description = "Device id")),
    responses(
        (status = 204, description = "Device removed"),
        (status = 400, description = "Malformed device id"),
        (status = 401, description = "Missing, expired, or revoked session"),
        (status = 404, description = "No such device for this user"),
    ),
    security(("session" = []))
)]
pub async fn delete_device(
    headers: HeaderMap,
    Path(id): Path<String>,
    Extension(pool): Extension<PgPool>,
) -> Response {
    let principal = match require_auth(&pool, &headers).await {
        Ok(principal) => principal,
        Err(response) => return *response,
    };

    let Ok(device_id) = Uuid::parse_str(&id) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match storage::delete_device(&pool, principal.user_id, device_id).await {
        Ok(true) => {
            let ip = extract_client_ip(&headers);
            let user_agent = extract_user_agent(&headers);
            crate::audit::record(
                &pool,
                AuditEvent {
                    actor: Some(principal.user_id),
                    action: "device.delete",
                    resource: "device",
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
            error!("Failed to delete device: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::classify_user_agent;

    #[test]
    fn classifies_desktop_chrome() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                  (KHTML, like Gecko) Chrome/120.0 Safari/537.36";
        let (os, browser) = classify_user_agent(ua);
        assert_eq!(os.as_deref(), Some("Windows"));
        assert_eq!(browser.as_deref(), Some("Chrome"));
    }

    #[test]
    fn classifies_edge_before_chrome() {
        let ua = "Mozilla/5.0 (Windows NT 10.0) AppleWebKit/537.36 Chrome/120.0 \
                  Safari/537.36 Edg/120.0";
        let (_, browser) = classify_user_agent(ua);
        assert_eq!(browser.as_deref(), Some("Edge"));
    }

    #[test]
    fn classifies_ios_safari() {
        let ua = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) \
                  AppleWebKit/605.1.15 Version/17.0 Safari/604.1";
        let (os, browser) = classify_user_agent(ua);
        assert_eq!(os.as_deref(), Some("iOS"));
        assert_eq!(browser.as_deref(), Some("Safari"));
    }

    #[test]
    fn unknown_agent_yields_none() {
        let (os, browser) = classify_user_agent("SomethingElse/1.0");
        assert!(os.is_none());
        assert!(browser.is_none());
    }
}
