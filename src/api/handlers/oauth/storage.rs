//! Persistence for OAuth clients and authorization codes.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use crate::token::UserProfile;

/// Authorization codes are short-lived by design.
pub(crate) const AUTH_CODE_TTL_MINUTES: i64 = 10;

/// A registered OAuth client.
pub(crate) struct ApplicationRecord {
    pub(crate) client_id: String,
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) logo_url: Option<String>,
    pub(crate) client_secret_hash: Option<String>,
    pub(crate) redirect_uris: Vec<String>,
    pub(crate) allowed_scopes: Vec<String>,
    pub(crate) enabled: bool,
}

impl ApplicationRecord {
    /// Public clients have no secret and must use PKCE.
    pub(crate) fn is_public(&self) -> bool {
        self.client_secret_hash.is_none()
    }
}

/// The payload recovered when an authorization code is redeemed.
pub(crate) struct ConsumedCode {
    pub(crate) client_id: String,
    pub(crate) user_id: Uuid,
    pub(crate) redirect_uri: String,
    pub(crate) scope: String,
    pub(crate) code_challenge: Option<String>,
    pub(crate) code_challenge_method: Option<String>,
}

pub(crate) async fn lookup_application(
    pool: &PgPool,
    client_id: &str,
) -> Result<Option<ApplicationRecord>> {
    let query = r"
        SELECT client_id, name, description, logo_url, client_secret_hash,
               redirect_uris, allowed_scopes, enabled
        FROM applications
        WHERE client_id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(client_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup application")?;

    Ok(row.map(|row| ApplicationRecord {
        client_id: row.get("client_id"),
        name: row.get("name"),
        description: row.get("description"),
        logo_url: row.get("logo_url"),
        client_secret_hash: row.get("client_secret_hash"),
        redirect_uris: row.get("redirect_uris"),
        allowed_scopes: row.get("allowed_scopes"),
        enabled: row.get("enabled"),
    }))
}

/// Store a freshly issued authorization code. Only the hash is stored; the
/// raw code travels in the redirect.
pub(crate) async fn insert_authorization_code(
    pool: &PgPool,
    code_hash: &[u8],
    client_id: &str,
    user_id: Uuid,
    redirect_uri: &str,
    scope: &str,
    code_challenge: Option<&str>,
    code_challenge_method: Option<&str>,
) -> Result<()> {
    let query = r"
        INSERT INTO authorization_codes
            (code_hash, client_id, user_id, redirect_uri, scope,
             code_challenge, code_challenge_method, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, NOW() + ($8 * INTERVAL '1 minute'))
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(code_hash)
        .bind(client_id)
        .bind(user_id)
        .bind(redirect_uri)
        .bind(scope)
        .bind(code_challenge)
        .bind(code_challenge_method)
        .bind(AUTH_CODE_TTL_MINUTES)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to insert authorization code")?;
    Ok(())
}

/// Redeem an authorization code exactly once.
///
/// The consumed-at guard lives in the UPDATE, so a code presented twice loses
/// the second race inside the database rather than in application code.
/// Expired or already-used codes return `None`.
pub(crate) async fn consume_authorization_code(
    pool: &PgPool,
    code_hash: &[u8],
) -> Result<Option<ConsumedCode>> {
    let query = r"
        UPDATE authorization_codes
        SET consumed_at = NOW()
        WHERE code_hash = $1
          AND consumed_at IS NULL
          AND expires_at > NOW()
        RETURNING client_id, user_id, redirect_uri, scope,
                  code_challenge, code_challenge_method
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(code_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to consume authorization code")?;

    Ok(row.map(|row| ConsumedCode {
        client_id: row.get("client_id"),
        user_id: row.get("user_id"),
        redirect_uri: row.get("redirect_uri"),
        scope: row.get("scope"),
        code_challenge: row.get("code_challenge"),
        code_challenge_method: row.get("code_challenge_method"),
    }))
}

/// Identity fields for ID token claims.
pub(crate) async fn lookup_user_profile(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Option<UserProfile>> {
    let query = "SELECT username, email, phone FROM users WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup user profile")?;

    Ok(row.map(|row| UserProfile {
        username: row.get("username"),
        email: row.get("email"),
        phone: row.get("phone"),
    }))
}

#[cfg(test)]
mod tests {
    use super::ApplicationRecord;

    fn application(secret: Option<&str>) -> ApplicationRecord {
        ApplicationRecord {
            client_id: "client-1".to_string(),
            name: "Example".to_string(),
            description: None,
            logo_url: None,
            client_secret_hash: secret.map(str::to_string),
            redirect_uris: vec!["https://app.example.com/callback".to_string()],
            allowed_scopes: vec!["openid".to_string(), "email".to_string()],
            enabled: true,
        }
    }

    #[test]
    fn clients_without_secret_are_public() {
        assert!(application(None).is_public());
        assert!(!application(Some("$argon2id$...")).is_public());
    }
}
