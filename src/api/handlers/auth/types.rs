//! Request/response types for auth endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    /// Email or phone number.
    pub identifier: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginResponse {
    pub user_id: String,
    pub username: String,
    /// When true, the session is an MFA challenge and must be upgraded via
    /// `/v1/auth/mfa/verify` before any other endpoint accepts it.
    pub mfa_required: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LockedResponse {
    pub error: String,
    /// Minutes until the lockout window elapses.
    pub retry_after_minutes: i64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MfaVerifyRequest {
    /// A TOTP code or a backup code.
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TotpSetupResponse {
    pub secret: String,
    pub otpauth_url: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TotpEnableRequest {
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TotpEnableResponse {
    /// Displayed exactly once; only hashes are retained.
    pub backup_codes: Vec<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TotpDisableRequest {
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionResponse {
    pub user_id: String,
    pub username: String,
    pub email: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionInfo {
    pub id: String,
    pub os: Option<String>,
    pub browser: Option<String>,
    pub ip: Option<String>,
    pub created_at: String,
    pub expires_at: String,
    pub last_seen_at: Option<String>,
    pub current: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RevokeSessionRequest {
    pub session_id: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct DeviceResponse {
    pub id: String,
    pub name: Option<String>,
    pub os: Option<String>,
    pub browser: Option<String>,
    pub ip: Option<String>,
    pub trusted: bool,
    pub last_seen_at: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceResponse>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct PasskeyRegisterStartRequest {
    /// Optional display label for the new credential.
    pub label: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct PasskeyChallengeResponse {
    /// The WebAuthn creation/request options, passed verbatim to the browser.
    pub challenge: serde_json::Value,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct PasskeyFinishRequest {
    /// The authenticator response, passed verbatim from the browser.
    pub response: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    #[test]
    fn login_request_round_trips() -> Result<()> {
        let request = LoginRequest {
            identifier: "alice@example.com".to_string(),
            password: "Aa1!aaaa".to_string(),
        };
        let value = serde_json::to_value(&request)?;
        let identifier = value
            .get("identifier")
            .and_then(serde_json::Value::as_str)
            .context("missing identifier")?;
        assert_eq!(identifier, "alice@example.com");
        let decoded: LoginRequest = serde_json::from_value(value)?;
        assert_eq!(decoded.password, "Aa1!aaaa");
        Ok(())
    }

    #[test]
    fn login_response_carries_mfa_flag() -> Result<()> {
        let response = LoginResponse {
            user_id: uuid::Uuid::nil().to_string(),
            username: "alice".to_string(),
            mfa_required: true,
        };
        let value = serde_json::to_value(&response)?;
        assert_eq!(
            value.get("mfa_required").and_then(serde_json::Value::as_bool),
            Some(true)
        );
        Ok(())
    }
}
